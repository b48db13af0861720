//! Client certificate identities

use std::sync::Arc;

use async_trait::async_trait;

use super::{Backend, BackendError};
use crate::config::{ConfigError, Directive};
use crate::forward::ForwardCredentials;
use crate::permit::Permit;
use crate::registry::BuildContext;
use crate::request::AccessRequest;

pub const NAME: &str = "tls";

/// Identifies users by the common name of their client certificate.
///
/// Certificate validation is left to the TLS terminator; this backend has no
/// permits and no login responder.
#[derive(Debug, Clone, Default)]
pub struct CertificateBackend {
    credentials: ForwardCredentials,
}

impl CertificateBackend {
    pub fn new(credentials: ForwardCredentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Backend for CertificateBackend {
    fn name(&self) -> &str {
        NAME
    }

    async fn resolve_identity(&self, req: &AccessRequest) -> Result<Option<String>, BackendError> {
        if !req.tls {
            return Ok(None);
        }
        Ok(req
            .peer_common_name
            .as_deref()
            .filter(|cn| !cn.is_empty())
            .map(str::to_string))
    }

    async fn user_permit(&self, _username: &str) -> Result<Option<Arc<Permit>>, BackendError> {
        Ok(None)
    }

    async fn default_permit(&self) -> Result<Option<Arc<Permit>>, BackendError> {
        Ok(None)
    }

    async fn public_permit(&self) -> Result<Option<Arc<Permit>>, BackendError> {
        Ok(None)
    }

    fn pass_through(&self) -> Option<&ForwardCredentials> {
        (!self.credentials.is_empty()).then_some(&self.credentials)
    }
}

pub(crate) fn factory(
    directive: &Directive,
    _ctx: &BuildContext,
) -> Result<Arc<dyn Backend>, ConfigError> {
    directive.no_args()?;

    let mut credentials = ForwardCredentials::default();
    for option in &directive.block {
        option.no_block()?;
        match option.name.as_str() {
            "set_basicauth" => {
                let args = option.exact_args(2, "a user and a password")?;
                credentials.set_basic_auth(&args[0], &args[1]);
            }
            "set_cookie" => {
                let args = option.exact_args(2, "a cookie name and value")?;
                credentials.add_cookie(args[0].as_str(), args[1].as_str());
            }
            _ => return Err(option.unexpected("tls block")),
        }
    }

    Ok(Arc::new(CertificateBackend::new(credentials)))
}
