//! permit-core: Path and method authorization for HTTP requests
//!
//! Requests are checked against an ordered chain of permission backends.
//! A backend can identify users, hold per-user, default and public permits,
//! answer anonymous requests with a login challenge and inject credentials
//! into granted requests.
//!
//! # Features
//!
//! - **Permits**: Ordered path-prefix rules with method sets, aliases and blacklists
//! - **WebDAV aware**: MOVE/COPY check both the source and the destination
//! - **Backends**: Client certificates, static basic-auth users, and a remote HTTP API
//! - **Cache**: TTL-based identity and permit cache for the remote API
//!
//! # Example
//!
//! ```rust,ignore
//! use permit_core::{AccessRequest, BackendRegistry, Config, Decision};
//! use http::Method;
//!
//! let config = Config::parse(
//!     "basic {\n  user greg qwerty1\n  rw /tmp/\n  public\n  ro /static/\n}\n",
//!     &BackendRegistry::with_builtin(),
//! )?;
//! let resolver = config.into_resolver();
//!
//! let req = AccessRequest::new(Method::GET, "/static/logo.png");
//! match resolver.authorize(&req).await {
//!     Decision::Allow { identity, .. } => println!("granted to {identity:?}"),
//!     Decision::Deny { status, reason, .. } => println!("{status}: {reason}"),
//!     Decision::Challenge(challenge) => println!("login via {:?}", challenge.header()),
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod forward;
pub mod methods;
pub mod permit;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod rule;

// Re-export public types
pub use backend::{Backend, BackendError, Challenge};
pub use cache::{sha256_hex, IdentityCache};
pub use config::{Config, ConfigError};
pub use forward::ForwardCredentials;
pub use permit::{Permit, PermitBuilder, Tier};
pub use registry::{BackendRegistry, BuildContext};
pub use request::AccessRequest;
pub use resolver::{AuthzMetrics, Decision, Identity, NoopMetrics, Resolver, Settings, Verdict};
pub use rule::{Rule, RuleError};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{Backend, BackendError, Challenge};
    pub use crate::config::{Config, ConfigError};
    pub use crate::registry::BackendRegistry;
    pub use crate::request::AccessRequest;
    pub use crate::resolver::{AuthzMetrics, Decision, NoopMetrics, Resolver};
}
