//! HTTP glue for permit-core
//!
//! Loads a permission config into a shared [`Resolver`], enforces its
//! decisions as axum middleware and sets up logging.
//!
//! ```rust,ignore
//! permit_gateway::telemetry::init()?;
//! let resolver = permit_gateway::config::load_from_env(None)?;
//! let app = permit_gateway::protect(Router::new().fallback(upstream), resolver);
//! ```

pub mod config;
pub mod middleware;
pub mod telemetry;

pub use middleware::{ConnectionInfo, access_request, authorize, protect};
pub use permit_core::{Decision, Resolver};
