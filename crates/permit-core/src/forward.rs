//! Headers added to granted requests before they are forwarded
//!
//! Attribution headers tell the upstream who was identified and which permit
//! granted access. Pass-through credentials let the gateway front a service
//! with its own static basic-auth or cookie login.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::header::{AUTHORIZATION, COOKIE};
use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

pub const X_AUTH_USER: HeaderName = HeaderName::from_static("x-auth-user");
pub const X_AUTH_SOURCE: HeaderName = HeaderName::from_static("x-auth-source");
pub const X_AUTH_PERMIT: HeaderName = HeaderName::from_static("x-auth-permit");

/// base64 of `user:password`, as carried by a `Basic` authorization header
pub fn basic_credentials(user: &str, password: &str) -> String {
    STANDARD.encode(format!("{user}:{password}"))
}

/// Credentials injected into forwarded requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardCredentials {
    /// Encoded `user:password`
    pub basic_auth: Option<String>,
    pub cookies: Vec<(String, String)>,
}

impl ForwardCredentials {
    pub fn set_basic_auth(&mut self, user: &str, password: &str) {
        self.basic_auth = Some(basic_credentials(user, password));
    }

    pub fn add_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.push((name.into(), value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.basic_auth.is_none() && self.cookies.is_empty()
    }

    /// Replace `Authorization` and append cookies to `Cookie`.
    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Some(token) = &self.basic_auth {
            set_header(headers, AUTHORIZATION, &format!("Basic {token}"));
        }
        if self.cookies.is_empty() {
            return;
        }

        let mut pairs: Vec<String> = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|v| v.trim().trim_end_matches(';').to_string())
            .filter(|v| !v.is_empty())
            .collect();
        pairs.extend(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}")),
        );
        set_header(headers, COOKIE, &pairs.join("; "));
    }
}

fn set_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, "dropping invalid forwarded header value"),
    }
}

fn set_or_remove(headers: &mut HeaderMap, name: HeaderName, value: Option<&str>) {
    match value {
        Some(value) => set_header(headers, name, value),
        None => {
            headers.remove(name);
        }
    }
}

/// Set the attribution headers, removing any the client sent itself.
///
/// `identity` is `(username, source backend)`, `permit` the label of the
/// deciding permit.
pub fn annotate(headers: &mut HeaderMap, identity: Option<(&str, &str)>, permit: Option<&str>) {
    set_or_remove(headers, X_AUTH_USER, identity.map(|(user, _)| user));
    set_or_remove(headers, X_AUTH_SOURCE, identity.map(|(_, source)| source));
    set_or_remove(headers, X_AUTH_PERMIT, permit);
}
