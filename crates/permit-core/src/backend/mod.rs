//! Pluggable identity and permission sources

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::header::{LOCATION, WWW_AUTHENTICATE};
use http::{HeaderName, StatusCode};
use thiserror::Error;

use crate::forward::ForwardCredentials;
use crate::permit::Permit;
use crate::request::AccessRequest;
use crate::rule::RuleError;

pub mod api;
pub mod basic;
pub mod tls;

pub use api::{ApiBackend, ApiConfig};
pub use basic::StaticBackend;
pub use tls::CertificateBackend;

/// Realm announced in basic-auth challenges when none is configured
pub const DEFAULT_REALM: &str = "Restricted";

/// Reserved permit identifiers of the default and public tiers
pub const DEFAULT_IDENTIFIER: &str = "default";
pub const PUBLIC_IDENTIFIER: &str = "public";

/// Errors from a single backend call
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("server error from {url}")]
    ServerError { url: String },

    #[error("unexpected status code {status} from {url}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("could not parse permission: {0}")]
    Permission(#[from] RuleError),
}

/// Response that asks an anonymous client to log in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// `401` with a basic-auth `WWW-Authenticate` header
    Unauthorized { realm: String },
    /// `302` to a login page
    Redirect { location: String },
}

impl Challenge {
    pub fn basic(realm: &str) -> Self {
        let realm = if realm.is_empty() { DEFAULT_REALM } else { realm };
        Challenge::Unauthorized {
            realm: realm.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Challenge::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Challenge::Redirect { .. } => StatusCode::FOUND,
        }
    }

    /// Header carrying the challenge, with its value
    pub fn header(&self) -> (HeaderName, String) {
        match self {
            Challenge::Unauthorized { realm } => {
                (WWW_AUTHENTICATE, format!("Basic realm=\"{realm}\""))
            }
            Challenge::Redirect { location } => (LOCATION, location.clone()),
        }
    }
}

/// A source of identities and permits.
///
/// Absence is not an error: `Ok(None)` means the backend has nothing to say
/// and the resolver moves on to the next one.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Name used for attribution and logging
    fn name(&self) -> &str;

    /// Authenticate the request, returning the username on success.
    async fn resolve_identity(&self, req: &AccessRequest) -> Result<Option<String>, BackendError>;

    async fn user_permit(&self, username: &str) -> Result<Option<Arc<Permit>>, BackendError>;

    /// Permit for every identified user without a matching user permit
    async fn default_permit(&self) -> Result<Option<Arc<Permit>>, BackendError>;

    /// Permit for everyone, identified or not
    async fn public_permit(&self) -> Result<Option<Arc<Permit>>, BackendError>;

    /// Login responder for denied anonymous requests.
    fn login(&self, _req: &AccessRequest, _realm: &str) -> Option<Challenge> {
        None
    }

    /// Credentials injected into requests whose user this backend identified
    fn pass_through(&self) -> Option<&ForwardCredentials> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_challenge() {
        let challenge = Challenge::basic("");
        assert_eq!(challenge.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            challenge.header(),
            (WWW_AUTHENTICATE, "Basic realm=\"Restricted\"".to_string())
        );

        let challenge = Challenge::basic("Restricted Site");
        assert_eq!(challenge.header().1, "Basic realm=\"Restricted Site\"");
    }

    #[test]
    fn test_redirect_challenge() {
        let challenge = Challenge::Redirect {
            location: "/login".to_string(),
        };
        assert_eq!(challenge.status(), StatusCode::FOUND);
        assert_eq!(challenge.header(), (LOCATION, "/login".to_string()));
    }
}
