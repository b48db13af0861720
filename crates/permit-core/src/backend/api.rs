//! Remote user and permit API
//!
//! Identities are resolved by forwarding the client's credentials to a user
//! endpoint; permits are fetched per username from a permit endpoint. Both are
//! cached in an [`IdentityCache`] and swept periodically.
//!
//! Both endpoints answer with the same JSON document:
//!
//! ```json
//! {
//!   "BasicAuth": true,
//!   "Cookie": "session=abc",
//!   "Username": "alice",
//!   "Permissions": { "/home/alice/": "rw", "/shared/": "ro" }
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use http::header::{AUTHORIZATION, COOKIE, HOST};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::debug;

use super::{Backend, BackendError, Challenge, DEFAULT_IDENTIFIER, PUBLIC_IDENTIFIER};
use crate::cache::{auth_fingerprint, cookie_fingerprint, unix_now, IdentityCache, Sweeper, User};
use crate::config::{ConfigError, Directive};
use crate::permit::{Permit, PermitBuilder};
use crate::registry::BuildContext;
use crate::request::AccessRequest;

pub const NAME: &str = "api";

const USERNAME_PLACEHOLDER: &str = "{{username}}";
const RESOURCE_PLACEHOLDER: &str = "{{resource}}";

pub mod defaults {
    use std::time::Duration;

    pub const CACHE_SECS: u64 = 600;
    pub const CLEANUP_SECS: u64 = 3600;
    /// Lower bound for configured `cache` and `cleanup` values
    pub const MIN_SECS: u64 = 60;
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Settings of an [`ApiBackend`]
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Suffix of the backend name (`api:<name>`)
    pub name: Option<String>,
    pub user_url: String,
    /// Must contain `{{username}}`
    pub permit_url: Option<String>,
    /// `{{resource}}` is replaced by the original request URI
    pub login_url: Option<String>,
    pub add_prefixes: Vec<String>,
    pub add_without_prefix: bool,
    pub cache_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl ApiConfig {
    pub fn new(user_url: impl Into<String>) -> Self {
        Self {
            name: None,
            user_url: user_url.into(),
            permit_url: None,
            login_url: None,
            add_prefixes: Vec::new(),
            add_without_prefix: false,
            cache_ttl: Duration::from_secs(defaults::CACHE_SECS),
            cleanup_interval: Duration::from_secs(defaults::CLEANUP_SECS),
        }
    }
}

/// Response of the user and permit endpoints
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiResponse {
    #[serde(rename = "BasicAuth", alias = "basicAuth", alias = "basic_auth", alias = "basicauth")]
    basic_auth: Option<bool>,
    #[serde(rename = "Cookie", alias = "cookie")]
    cookie: Option<String>,
    #[serde(rename = "Username", alias = "username")]
    username: Option<String>,
    #[serde(rename = "Permissions", alias = "permissions")]
    permissions: Option<BTreeMap<String, String>>,
}

/// Backend resolving users and permits through an HTTP API
#[derive(Debug)]
pub struct ApiBackend {
    name: String,
    config: ApiConfig,
    http: Client,
    cache: Arc<IdentityCache>,
    /// Started on the first runtime the backend is used on
    sweeper: OnceLock<Sweeper>,
}

impl ApiBackend {
    /// Create the backend; TTLs below [`defaults::MIN_SECS`] are raised to it.
    ///
    /// The cache sweeper starts right away inside a tokio runtime, otherwise
    /// on the first request.
    pub fn new(mut config: ApiConfig) -> Result<Self, reqwest::Error> {
        let min = Duration::from_secs(defaults::MIN_SECS);
        config.cache_ttl = config.cache_ttl.max(min);
        config.cleanup_interval = config.cleanup_interval.max(min);

        let http = Client::builder().timeout(defaults::REQUEST_TIMEOUT).build()?;
        let name = match &config.name {
            Some(custom) => format!("{NAME}:{custom}"),
            None => NAME.to_string(),
        };

        let backend = Self {
            name,
            config,
            http,
            cache: Arc::new(IdentityCache::new()),
            sweeper: OnceLock::new(),
        };
        backend.ensure_sweeper();
        Ok(backend)
    }

    fn ensure_sweeper(&self) {
        if self.sweeper.get().is_some() {
            return;
        }
        let Some(sweeper) = Sweeper::spawn(&self.cache, self.config.cleanup_interval) else {
            debug!(backend = %self.name, "no tokio runtime yet, sweeper deferred");
            return;
        };
        // a concurrent caller may have won; the spare sweeper aborts on drop
        if self.sweeper.set(sweeper).is_ok() {
            debug!(
                backend = %self.name,
                period_secs = self.config.cleanup_interval.as_secs(),
                "cache sweeper started"
            );
        }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    fn ttl_secs(&self) -> i64 {
        i64::try_from(self.config.cache_ttl.as_secs()).unwrap_or(i64::MAX)
    }

    /// Send a request; `Ok(None)` for 403/404.
    async fn fetch(&self, url: &str, request: RequestBuilder) -> Result<Option<ApiResponse>, BackendError> {
        let response = request.send().await.map_err(|source| BackendError::Transport {
            url: url.to_string(),
            source,
        })?;

        match response.status().as_u16() {
            200 => response
                .json::<ApiResponse>()
                .await
                .map(Some)
                .map_err(|e| BackendError::InvalidResponse {
                    url: url.to_string(),
                    reason: e.to_string(),
                }),
            403 | 404 => Ok(None),
            500 => Err(BackendError::ServerError {
                url: url.to_string(),
            }),
            status => Err(BackendError::UnexpectedStatus {
                url: url.to_string(),
                status,
            }),
        }
    }

    /// Ask the user endpoint who sent `req`, caching the answer.
    async fn authenticate(&self, req: &AccessRequest) -> Result<Option<String>, BackendError> {
        let url = self.config.user_url.as_str();
        let proto = if req.tls { "https" } else { "http" };

        let mut request = self.http.get(url).header("X-Forwarded-Proto", proto);
        if let Some(host) = req.host() {
            request = request.header(HOST, host);
        }
        if let Some(ip) = req.remote_ip() {
            request = request
                .header("X-Real-IP", ip.as_str())
                .header("X-Forwarded-For", ip.as_str());
        }
        if !req.authorization().is_empty() {
            request = request.header(AUTHORIZATION, req.authorization());
        }
        for cookie in req.headers.get_all(COOKIE) {
            request = request.header(COOKIE, cookie.clone());
        }

        let Some(response) = self.fetch(url, request).await? else {
            debug!(backend = %self.name, "user endpoint did not recognize the request");
            return Ok(None);
        };

        let invalid = |reason: &str| BackendError::InvalidResponse {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let username = response
            .username
            .filter(|u| !u.is_empty())
            .ok_or_else(|| invalid("missing \"Username\""))?;

        let fingerprint = match (response.basic_auth.unwrap_or(false), response.cookie) {
            (true, _) if req.authorization().is_empty() => {
                return Err(invalid("\"BasicAuth\" identification without an Authorization header"))
            }
            (true, _) => auth_fingerprint(req.authorization()),
            (false, Some(cookie)) if !cookie.is_empty() => cookie,
            _ => {
                return Err(invalid(
                    "missing either \"BasicAuth\" or \"Cookie\" for user identification",
                ))
            }
        };

        let now = unix_now();
        self.cache
            .put_user(&fingerprint, User::new(username.as_str(), self.ttl_secs(), now));

        if let Some(permissions) = response.permissions.filter(|p| !p.is_empty()) {
            let permit = self.build_permit(&permissions, now)?;
            self.cache.put_permit(&username, Arc::new(permit));
        }

        debug!(backend = %self.name, %username, "authenticated through user endpoint");
        Ok(Some(username))
    }

    /// Fetch the permit of `id`; 403/404 yield an empty permit.
    async fn fetch_permit(&self, template: &str, id: &str) -> Result<Arc<Permit>, BackendError> {
        let url = template.replace(USERNAME_PLACEHOLDER, id);
        let now = unix_now();
        let permit = match self.fetch(&url, self.http.get(&url)).await? {
            Some(response) => {
                self.build_permit(&response.permissions.unwrap_or_default(), now)?
            }
            None => Permit::empty(now + self.ttl_secs()),
        };
        debug!(backend = %self.name, id, rules = permit.rules().len(), "fetched permit");
        Ok(Arc::new(permit))
    }

    /// Turn remote permissions into a permit, applying the configured prefixes.
    fn build_permit(
        &self,
        permissions: &BTreeMap<String, String>,
        now: i64,
    ) -> Result<Permit, BackendError> {
        let prefixes = &self.config.add_prefixes;
        let mut builder = PermitBuilder::new(now + self.ttl_secs());

        for (path, methods) in permissions {
            if prefixes.is_empty() || self.config.add_without_prefix {
                builder.add_rule(methods, path)?;
            }
            for prefix in prefixes {
                builder.add_rule(methods, &format!("{prefix}{path}"))?;
            }
        }

        Ok(builder.finalize())
    }
}

#[async_trait]
impl Backend for ApiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve_identity(&self, req: &AccessRequest) -> Result<Option<String>, BackendError> {
        self.ensure_sweeper();
        let auth = req.authorization();
        let auth = (!auth.is_empty()).then(|| auth_fingerprint(auth));
        let cookies: Vec<String> = req
            .cookies()
            .into_iter()
            .map(|(name, value)| cookie_fingerprint(name, value))
            .collect();
        let fingerprints = auth.iter().chain(cookies.iter()).map(String::as_str);

        if let Some(user) = self.cache.user(fingerprints, unix_now()) {
            return Ok(Some(user.username));
        }
        self.authenticate(req).await
    }

    async fn user_permit(&self, username: &str) -> Result<Option<Arc<Permit>>, BackendError> {
        self.ensure_sweeper();
        if let Some(permit) = self.cache.permit(username, unix_now()) {
            return Ok(Some(permit));
        }
        let Some(template) = &self.config.permit_url else {
            return Ok(None);
        };
        let permit = self.fetch_permit(template, username).await?;
        self.cache.put_permit(username, Arc::clone(&permit));
        Ok(Some(permit))
    }

    async fn default_permit(&self) -> Result<Option<Arc<Permit>>, BackendError> {
        let Some(template) = &self.config.permit_url else {
            return Ok(None);
        };
        if let Some(permit) = self.cache.default_permit(unix_now()) {
            return Ok(Some(permit));
        }
        let permit = self.fetch_permit(template, DEFAULT_IDENTIFIER).await?;
        self.cache.set_default_permit(Arc::clone(&permit));
        Ok(Some(permit))
    }

    async fn public_permit(&self) -> Result<Option<Arc<Permit>>, BackendError> {
        let Some(template) = &self.config.permit_url else {
            return Ok(None);
        };
        if let Some(permit) = self.cache.public_permit(unix_now()) {
            return Ok(Some(permit));
        }
        let permit = self.fetch_permit(template, PUBLIC_IDENTIFIER).await?;
        self.cache.set_public_permit(Arc::clone(&permit));
        Ok(Some(permit))
    }

    fn login(&self, req: &AccessRequest, _realm: &str) -> Option<Challenge> {
        self.config.login_url.as_ref().map(|url| Challenge::Redirect {
            location: url.replace(RESOURCE_PLACEHOLDER, &req.uri),
        })
    }
}

fn parse_secs(option: &Directive) -> Result<Duration, ConfigError> {
    let raw = option.single_arg()?;
    let secs: i64 = raw.parse().map_err(|_| ConfigError::InvalidNumber {
        value: raw.to_string(),
        line: option.line,
    })?;
    let secs = u64::try_from(secs).unwrap_or(0).max(defaults::MIN_SECS);
    Ok(Duration::from_secs(secs))
}

pub(crate) fn factory(
    directive: &Directive,
    _ctx: &BuildContext,
) -> Result<Arc<dyn Backend>, ConfigError> {
    directive.no_args()?;

    let mut config = ApiConfig::new(String::new());
    for option in &directive.block {
        option.no_block()?;
        match option.name.as_str() {
            "name" => config.name = Some(option.single_arg()?.to_string()),
            "user" => config.user_url = option.single_arg()?.to_string(),
            "permit" => {
                let url = option.single_arg()?;
                if !url.contains(USERNAME_PLACEHOLDER) {
                    return Err(ConfigError::MissingPlaceholder {
                        directive: "api > permit".to_string(),
                        placeholder: USERNAME_PLACEHOLDER,
                        line: option.line,
                    });
                }
                config.permit_url = Some(url.to_string());
            }
            "login" => config.login_url = Some(option.single_arg()?.to_string()),
            "add_prefix" => {
                if option.args.is_empty() {
                    return Err(ConfigError::WrongArgs {
                        directive: option.name.clone(),
                        expected: "at least one prefix",
                        got: 0,
                        line: option.line,
                    });
                }
                config.add_prefixes.extend(option.args.iter().cloned());
            }
            "add_without_prefix" => {
                option.no_args()?;
                config.add_without_prefix = true;
            }
            "cache" => config.cache_ttl = parse_secs(option)?,
            "cleanup" => config.cleanup_interval = parse_secs(option)?,
            _ => return Err(option.unexpected("api block")),
        }
    }

    if config.user_url.is_empty() {
        return Err(ConfigError::MissingOption {
            directive: directive.name.clone(),
            option: "user",
            line: directive.line,
        });
    }

    let backend = ApiBackend::new(config).map_err(|e| ConfigError::Backend {
        directive: directive.name.clone(),
        reason: e.to_string(),
        line: directive.line,
    })?;
    Ok(Arc::new(backend))
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
