//! Authorization decisions over a chain of backends
//!
//! For every request the resolver:
//! 1. Classifies the method into one or two method/path checks
//! 2. Identifies the user with the first backend that recognizes the request
//! 3. Walks user, default and public permits across the backends per check
//! 4. Challenges anonymous clients that were denied, if a backend can log them in
//!
//! The first permit with a rule for the path decides, including explicit denies.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use http::{HeaderMap, Method, StatusCode};
use tracing::{debug, warn};

use crate::backend::{Backend, BackendError, Challenge};
use crate::forward::{self, ForwardCredentials};
use crate::methods::{classify_with, Check};
use crate::permit::{Permit, Tier};
use crate::request::AccessRequest;

/// Global resolver options
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Let read-only requests see the directories leading to permitted paths
    pub allow_parent_paths: bool,
    /// Stripped from request paths and destinations before checking
    pub remove_prefix: Option<String>,
    /// Realm of basic-auth challenges
    pub realm: Option<String>,
    /// Injected into every granted request
    pub credentials: ForwardCredentials,
}

/// Identified user and the backend that identified it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub source: String,
}

/// Outcome of the permit walk for one check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    /// A permit had a rule for the path
    pub matched: bool,
    /// Backend whose permit decided
    pub backend: Option<String>,
    pub tier: Tier,
}

impl Verdict {
    /// Label of the deciding permit: `backend`, `backend:default` or `backend:public`.
    pub fn permit_label(&self) -> Option<String> {
        let backend = self.backend.as_deref()?;
        Some(match self.tier {
            Tier::Default => format!("{backend}:default"),
            Tier::Public => format!("{backend}:public"),
            Tier::User | Tier::None => backend.to_string(),
        })
    }
}

/// Authorization decision result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Forward the request
    Allow {
        identity: Option<Identity>,
        verdict: Verdict,
        /// Pass-through credentials to inject, in order
        credentials: Vec<ForwardCredentials>,
    },
    /// Reject the request
    Deny {
        identity: Option<Identity>,
        verdict: Verdict,
        status: StatusCode,
        reason: String,
    },
    /// Ask an anonymous client to log in
    Challenge(Challenge),
}

impl Decision {
    /// Check if the decision allows the request
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    /// HTTP status to answer with; `200` for forwarded requests.
    pub fn status(&self) -> StatusCode {
        match self {
            Decision::Allow { .. } => StatusCode::OK,
            Decision::Deny { status, .. } => *status,
            Decision::Challenge(challenge) => challenge.status(),
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Decision::Allow { identity, .. } | Decision::Deny { identity, .. } => identity.as_ref(),
            Decision::Challenge(_) => None,
        }
    }

    /// Add attribution headers and credentials to a granted request.
    ///
    /// Does nothing unless the decision is [`Decision::Allow`].
    pub fn annotate(&self, headers: &mut HeaderMap) {
        let Decision::Allow {
            identity,
            verdict,
            credentials,
        } = self
        else {
            return;
        };
        let label = verdict.permit_label();
        forward::annotate(
            headers,
            identity
                .as_ref()
                .map(|i| (i.username.as_str(), i.source.as_str())),
            label.as_deref(),
        );
        for creds in credentials {
            creds.apply(headers);
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            Decision::Allow { verdict, .. } => match verdict.tier {
                Tier::User => "allow_user",
                Tier::Default => "allow_default",
                Tier::Public => "allow_public",
                Tier::None => "allow",
            },
            Decision::Deny { verdict, .. } if verdict.matched => "deny",
            Decision::Deny { .. } => "deny_unmatched",
            Decision::Challenge(_) => "challenge",
        }
    }
}

/// Metrics callback trait for recording authorization decisions
///
/// Implement this to integrate with your metrics system (Prometheus, etc.)
pub trait AuthzMetrics: Send + Sync {
    /// Record a decision outcome
    fn record_decision(&self, outcome: &str);
    /// Record decision latency
    fn record_latency(&self, seconds: f64);
    /// Record a failed backend call
    fn record_backend_error(&self, backend: &str);
}

/// No-op metrics implementation for testing
pub struct NoopMetrics;

impl AuthzMetrics for NoopMetrics {
    fn record_decision(&self, _outcome: &str) {}
    fn record_latency(&self, _seconds: f64) {}
    fn record_backend_error(&self, _backend: &str) {}
}

/// Decides requests against an ordered chain of backends
pub struct Resolver {
    backends: Vec<Arc<dyn Backend>>,
    settings: Settings,
    metrics: Arc<dyn AuthzMetrics>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("backends", &self.backends)
            .field("settings", &self.settings)
            .finish()
    }
}

impl Resolver {
    pub fn new(backends: Vec<Arc<dyn Backend>>, settings: Settings) -> Self {
        Self {
            backends,
            settings,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn AuthzMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Decide whether `req` may pass.
    pub async fn authorize(&self, req: &AccessRequest) -> Decision {
        let start = Instant::now();
        let decision = self.decide(req).await;
        self.metrics.record_decision(decision.outcome());
        self.metrics.record_latency(start.elapsed().as_secs_f64());
        decision
    }

    async fn decide(&self, req: &AccessRequest) -> Decision {
        let method = req.method.as_str();
        let path = self.strip_prefix(&req.uri);
        let plan = classify_with(method, &path, &req.headers, |dest| {
            self.normalize_destination(dest)
        });

        let identified = self.identify(req).await;
        let identity = identified.as_ref().map(|(identity, _)| identity.clone());
        let username = identity.as_ref().map(|i| i.username.as_str());

        let mut verdict = Verdict::default();
        for check in &plan.checks {
            verdict = self.check_permits(username, check, plan.read_only).await;
            if !verdict.allowed {
                break;
            }
        }

        if verdict.allowed {
            if let Some(err) = plan.destination_error() {
                let reason = err.to_string();
                debug!(method, uri = %req.uri, %reason, "rejected request");
                return Decision::Deny {
                    identity,
                    verdict,
                    status: StatusCode::FORBIDDEN,
                    reason,
                };
            }

            debug!(
                user = username.unwrap_or_default(),
                source = identity.as_ref().map(|i| i.source.as_str()).unwrap_or_default(),
                backend = verdict.backend.as_deref().unwrap_or_default(),
                tier = %verdict.tier,
                method,
                uri = %req.uri,
                "{}",
                describe(identity.as_ref(), &verdict, "granted", method, &req.uri)
            );

            let mut credentials = Vec::new();
            if req.method != Method::TRACE {
                if !self.settings.credentials.is_empty() {
                    credentials.push(self.settings.credentials.clone());
                }
                if let Some(creds) = identified.as_ref().and_then(|(_, b)| b.pass_through()) {
                    credentials.push(creds.clone());
                }
            }
            return Decision::Allow {
                identity,
                verdict,
                credentials,
            };
        }

        if identity.is_none() {
            let realm = self.settings.realm.as_deref().unwrap_or_default();
            if let Some((backend, challenge)) = self
                .backends
                .iter()
                .find_map(|b| b.login(req, realm).map(|c| (b, c)))
            {
                debug!(
                    backend = backend.name(),
                    method,
                    uri = %req.uri,
                    status = challenge.status().as_u16(),
                    "challenging anonymous request"
                );
                return Decision::Challenge(challenge);
            }
        }

        let reason = describe(identity.as_ref(), &verdict, "denied", method, &req.uri);
        debug!(
            user = username.unwrap_or_default(),
            backend = verdict.backend.as_deref().unwrap_or_default(),
            tier = %verdict.tier,
            matched = verdict.matched,
            "{reason}"
        );
        Decision::Deny {
            identity,
            verdict,
            status: StatusCode::FORBIDDEN,
            reason,
        }
    }

    /// First backend to recognize the request wins.
    async fn identify(&self, req: &AccessRequest) -> Option<(Identity, &Arc<dyn Backend>)> {
        for backend in &self.backends {
            match backend.resolve_identity(req).await {
                Ok(Some(username)) if !username.is_empty() => {
                    let identity = Identity {
                        username,
                        source: backend.name().to_string(),
                    };
                    return Some((identity, backend));
                }
                Ok(_) => {}
                Err(err) => self.backend_failed(backend.as_ref(), "identity", &err),
            }
        }
        None
    }

    /// Walk user and default permits (identified users only), then public permits.
    async fn check_permits(&self, username: Option<&str>, check: &Check, read_only: bool) -> Verdict {
        if let Some(username) = username {
            for backend in &self.backends {
                let permit = backend.user_permit(username).await;
                if let Some(verdict) = self.evaluate(backend.as_ref(), Tier::User, permit, check, read_only) {
                    return verdict;
                }
                let permit = backend.default_permit().await;
                if let Some(verdict) = self.evaluate(backend.as_ref(), Tier::Default, permit, check, read_only) {
                    return verdict;
                }
            }
        }

        for backend in &self.backends {
            let permit = backend.public_permit().await;
            if let Some(verdict) = self.evaluate(backend.as_ref(), Tier::Public, permit, check, read_only) {
                return verdict;
            }
        }

        Verdict::default()
    }

    /// Check one permit; `None` unless it has a rule for the path.
    fn evaluate(
        &self,
        backend: &dyn Backend,
        tier: Tier,
        permit: Result<Option<Arc<Permit>>, BackendError>,
        check: &Check,
        read_only: bool,
    ) -> Option<Verdict> {
        let permit = match permit {
            Ok(permit) => permit?,
            Err(err) => {
                self.backend_failed(backend, "permit", &err);
                return None;
            }
        };
        let outcome = permit.check(
            &check.method,
            &check.path,
            read_only,
            self.settings.allow_parent_paths,
        );
        outcome.matched.then(|| Verdict {
            allowed: outcome.allowed,
            matched: true,
            backend: Some(backend.name().to_string()),
            tier,
        })
    }

    fn backend_failed(&self, backend: &dyn Backend, call: &str, err: &BackendError) {
        warn!(backend = backend.name(), call, error = %err, "backend call failed");
        self.metrics.record_backend_error(backend.name());
    }

    fn strip_prefix(&self, uri: &str) -> String {
        let prefix = self
            .settings
            .remove_prefix
            .as_deref()
            .map(|p| p.trim_end_matches('/'))
            .filter(|p| !p.is_empty());
        match prefix.and_then(|p| uri.strip_prefix(p)) {
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            Some(rest) if rest.is_empty() || rest.starts_with('?') => format!("/{rest}"),
            _ => uri.to_string(),
        }
    }

    /// Reduce absolute destination URLs to their path, then strip the prefix.
    fn normalize_destination(&self, dest: &str) -> String {
        let path = match dest.parse::<http::Uri>() {
            Ok(uri) if uri.scheme().is_some() => uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            _ => dest.to_string(),
        };
        self.strip_prefix(&path)
    }
}

fn describe(
    identity: Option<&Identity>,
    verdict: &Verdict,
    outcome: &str,
    method: &str,
    uri: &str,
) -> String {
    let mut out = String::new();
    if let Some(identity) = identity {
        let _ = write!(out, "[{}: {}] ", identity.source, identity.username);
    }
    if let Some(label) = verdict.permit_label() {
        let _ = write!(out, "{label} ");
    }
    let _ = write!(out, "{outcome} access: {method} {uri}");
    out
}

#[cfg(test)]
#[path = "resolver_test.rs"]
mod tests;
