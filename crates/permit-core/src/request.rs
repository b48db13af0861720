//! Request model consumed by the resolver and the backends

use std::net::SocketAddr;

use http::header::{AUTHORIZATION, COOKIE, HOST};
use http::{HeaderMap, HeaderName, HeaderValue, Method};

/// Everything the authorization engine needs to know about an incoming request.
///
/// Built by the HTTP glue from the request head and connection metadata.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub method: Method,
    /// Request URI as sent by the client (path and query).
    pub uri: String,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
    /// Whether the request arrived over TLS.
    pub tls: bool,
    /// Common name of the validated client certificate, if any.
    pub peer_common_name: Option<String>,
}

impl AccessRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: HeaderMap::new(),
            remote_addr: None,
            tls: false,
            peer_common_name: None,
        }
    }

    /// Add a header. Invalid values are ignored.
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_peer_common_name(mut self, cn: impl Into<String>) -> Self {
        self.tls = true;
        self.peer_common_name = Some(cn.into());
        self
    }

    pub fn header(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn host(&self) -> Option<&str> {
        self.header(HOST)
    }

    /// Raw `Authorization` header value, empty when absent.
    pub fn authorization(&self) -> &str {
        self.header(AUTHORIZATION).unwrap_or_default()
    }

    /// Credential part of a `Basic` authorization header.
    pub fn basic_token(&self) -> Option<&str> {
        let auth = self.authorization();
        let token = auth.strip_prefix("Basic ").unwrap_or(auth).trim();
        (!token.is_empty()).then_some(token)
    }

    /// All cookies sent with the request, in header order.
    pub fn cookies(&self) -> Vec<(&str, &str)> {
        self.headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|line| line.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                let name = name.trim();
                (!name.is_empty()).then(|| (name, value.trim().trim_matches('"')))
            })
            .collect()
    }

    pub fn remote_ip(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.ip().to_string())
    }
}
