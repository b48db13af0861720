use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use http::header::{AUTHORIZATION, COOKIE, LOCATION};
use http::HeaderValue;
use parking_lot::Mutex;

use super::*;
use crate::backend::CertificateBackend;
use crate::forward::{X_AUTH_PERMIT, X_AUTH_SOURCE, X_AUTH_USER};
use crate::permit::PermitBuilder;

/// Backend with canned answers; identifies `Authorization: Token <user>`.
#[derive(Debug, Default)]
struct FakeBackend {
    name: String,
    users: Vec<String>,
    permits: HashMap<String, Arc<Permit>>,
    default: Option<Arc<Permit>>,
    public: Option<Arc<Permit>>,
    login: Option<Challenge>,
    failing: bool,
}

fn permit(rules: &[(&str, &str)]) -> Arc<Permit> {
    let mut builder = PermitBuilder::new(0);
    for (methods, path) in rules {
        builder.add_rule(methods, path).unwrap();
    }
    Arc::new(builder.finalize())
}

impl FakeBackend {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn user(mut self, name: &str, rules: &[(&str, &str)]) -> Self {
        self.users.push(name.to_string());
        if !rules.is_empty() {
            self.permits.insert(name.to_string(), permit(rules));
        }
        self
    }

    fn default_rules(mut self, rules: &[(&str, &str)]) -> Self {
        self.default = Some(permit(rules));
        self
    }

    fn public_rules(mut self, rules: &[(&str, &str)]) -> Self {
        self.public = Some(permit(rules));
        self
    }

    fn with_login(mut self, challenge: Challenge) -> Self {
        self.login = Some(challenge);
        self
    }

    fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    fn fail<T>(&self) -> Result<T, BackendError> {
        Err(BackendError::ServerError {
            url: format!("http://{}", self.name),
        })
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve_identity(&self, req: &AccessRequest) -> Result<Option<String>, BackendError> {
        if self.failing {
            return self.fail();
        }
        let token = req.authorization().strip_prefix("Token ");
        Ok(token
            .filter(|t| self.users.iter().any(|u| u == t))
            .map(str::to_string))
    }

    async fn user_permit(&self, username: &str) -> Result<Option<Arc<Permit>>, BackendError> {
        if self.failing {
            return self.fail();
        }
        Ok(self.permits.get(username).cloned())
    }

    async fn default_permit(&self) -> Result<Option<Arc<Permit>>, BackendError> {
        if self.failing {
            return self.fail();
        }
        Ok(self.default.clone())
    }

    async fn public_permit(&self) -> Result<Option<Arc<Permit>>, BackendError> {
        if self.failing {
            return self.fail();
        }
        Ok(self.public.clone())
    }

    fn login(&self, _req: &AccessRequest, realm: &str) -> Option<Challenge> {
        match &self.login {
            Some(Challenge::Unauthorized { .. }) => Some(Challenge::basic(realm)),
            other => other.clone(),
        }
    }
}

fn resolver(backends: Vec<FakeBackend>) -> Resolver {
    resolver_with(backends, Settings::default())
}

fn resolver_with(backends: Vec<FakeBackend>, settings: Settings) -> Resolver {
    let backends = backends
        .into_iter()
        .map(|b| Arc::new(b) as Arc<dyn Backend>)
        .collect();
    Resolver::new(backends, settings)
}

fn anonymous(method: Method, uri: &str) -> AccessRequest {
    AccessRequest::new(method, uri)
}

fn as_user(method: Method, uri: &str, user: &str) -> AccessRequest {
    AccessRequest::new(method, uri).with_header(AUTHORIZATION, &format!("Token {user}"))
}

fn verdict_of(decision: &Decision) -> &Verdict {
    match decision {
        Decision::Allow { verdict, .. } | Decision::Deny { verdict, .. } => verdict,
        Decision::Challenge(c) => panic!("unexpected challenge {c:?}"),
    }
}

#[tokio::test]
async fn test_user_deny_beats_later_public_allow() {
    let resolver = resolver(vec![
        FakeBackend::named("a").user("alice", &[("none", "/x/")]),
        FakeBackend::named("b").public_rules(&[("any", "/")]),
    ]);

    let decision = resolver.authorize(&as_user(Method::GET, "/x/file", "alice")).await;
    assert_eq!(decision.status(), StatusCode::FORBIDDEN);
    let verdict = verdict_of(&decision);
    assert!(verdict.matched);
    assert_eq!(verdict.backend.as_deref(), Some("a"));
    assert_eq!(verdict.tier, Tier::User);

    // anonymous requests only see the public permit
    let decision = resolver.authorize(&anonymous(Method::GET, "/x/file")).await;
    assert!(decision.is_allowed());
    assert_eq!(verdict_of(&decision).permit_label().as_deref(), Some("b:public"));
}

#[tokio::test]
async fn test_default_permit_checked_before_next_backend() {
    let resolver = resolver(vec![
        FakeBackend::named("a")
            .user("alice", &[("ro", "/other/")])
            .default_rules(&[("none", "/docs/")]),
        FakeBackend::named("b").user("alice", &[("rw", "/docs/")]),
    ]);

    let decision = resolver.authorize(&as_user(Method::GET, "/docs/a", "alice")).await;
    assert!(!decision.is_allowed());
    assert_eq!(verdict_of(&decision).permit_label().as_deref(), Some("a:default"));
}

#[tokio::test]
async fn test_default_permit_without_user_permit() {
    let resolver = resolver(vec![
        FakeBackend::named("a").user("bob", &[]).default_rules(&[("ro", "/members/")]),
    ]);

    let decision = resolver.authorize(&as_user(Method::GET, "/members/list", "bob")).await;
    assert!(decision.is_allowed());
    assert_eq!(verdict_of(&decision).tier, Tier::Default);

    let decision = resolver.authorize(&anonymous(Method::GET, "/members/list")).await;
    assert!(!decision.is_allowed());
    assert!(!verdict_of(&decision).matched);
}

#[tokio::test]
async fn test_identity_from_later_backend() {
    let resolver = resolver(vec![
        FakeBackend::named("a").user("alice", &[("ro", "/a/")]),
        FakeBackend::named("b").user("bob", &[]),
        FakeBackend::named("c").user("alice", &[]).user("bob", &[]),
    ]);

    let decision = resolver.authorize(&as_user(Method::GET, "/x", "bob")).await;
    assert_eq!(
        decision.identity(),
        Some(&Identity {
            username: "bob".to_string(),
            source: "b".to_string()
        })
    );
}

#[tokio::test]
async fn test_permits_from_any_backend_apply_to_identity() {
    let mut permits = FakeBackend::named("permits");
    permits
        .permits
        .insert("alice".to_string(), permit(&[("rw", "/home/alice/")]));
    let resolver = resolver(vec![
        FakeBackend::named("tls").user("alice", &[]),
        FakeBackend::named("basic").user("other", &[]).default_rules(&[]),
        permits,
    ]);

    let decision = resolver
        .authorize(&as_user(Method::PUT, "/home/alice/f", "alice"))
        .await;
    assert!(decision.is_allowed());
    assert_eq!(decision.identity().unwrap().source, "tls");
    assert_eq!(verdict_of(&decision).backend.as_deref(), Some("permits"));
}

#[tokio::test]
async fn test_challenge_only_for_anonymous() {
    let resolver = resolver_with(
        vec![
            FakeBackend::named("a").user("alice", &[("ro", "/a/")]),
            FakeBackend::named("b").with_login(Challenge::basic("")),
        ],
        Settings {
            realm: Some("Files".to_string()),
            ..Default::default()
        },
    );

    let decision = resolver.authorize(&anonymous(Method::GET, "/secret")).await;
    assert_eq!(
        decision,
        Decision::Challenge(Challenge::Unauthorized {
            realm: "Files".to_string()
        })
    );
    assert_eq!(decision.status(), StatusCode::UNAUTHORIZED);

    let decision = resolver.authorize(&as_user(Method::GET, "/secret", "alice")).await;
    assert_eq!(decision.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_first_login_responder_wins() {
    let resolver = resolver(vec![
        FakeBackend::named("tls"),
        FakeBackend::named("api").with_login(Challenge::Redirect {
            location: "/login".to_string(),
        }),
        FakeBackend::named("basic").with_login(Challenge::basic("")),
    ]);

    let decision = resolver.authorize(&anonymous(Method::GET, "/")).await;
    assert_eq!(decision.status(), StatusCode::FOUND);
}

#[tokio::test]
async fn test_deny_without_login_responder() {
    let resolver = resolver(vec![FakeBackend::named("tls")]);
    match resolver.authorize(&anonymous(Method::POST, "/x")).await {
        Decision::Deny { status, reason, .. } => {
            assert_eq!(status, StatusCode::FORBIDDEN);
            assert_eq!(reason, "denied access: POST /x");
        }
        other => panic!("expected deny, got {other:?}"),
    }
}

#[tokio::test]
async fn test_deny_reason_names_user_and_permit() {
    let resolver = resolver(vec![FakeBackend::named("basic")
        .user("alice", &[])
        .default_rules(&[("ro", "/docs/")])]);

    match resolver.authorize(&as_user(Method::PUT, "/docs/a", "alice")).await {
        Decision::Deny { reason, .. } => {
            assert_eq!(reason, "[basic: alice] basic:default denied access: PUT /docs/a");
        }
        other => panic!("expected deny, got {other:?}"),
    }
}

#[tokio::test]
async fn test_move_needs_both_checks() {
    let resolver = resolver(vec![FakeBackend::named("a").public_rules(&[
        ("DELETE", "/src/"),
        ("PUT", "/dst/"),
        ("GET", "/readonly/"),
    ])]);

    let req = anonymous(Method::from_bytes(b"MOVE").unwrap(), "/src/f")
        .with_header(LOCATION, "/dst/f");
    assert!(resolver.authorize(&req).await.is_allowed());

    let req = anonymous(Method::from_bytes(b"MOVE").unwrap(), "/src/f")
        .with_header(LOCATION, "/readonly/f");
    assert!(!resolver.authorize(&req).await.is_allowed());

    // source denied: destination never matters
    let req = anonymous(Method::from_bytes(b"MOVE").unwrap(), "/readonly/f")
        .with_header(LOCATION, "/dst/f");
    let decision = resolver.authorize(&req).await;
    assert!(!decision.is_allowed());
    assert_eq!(verdict_of(&decision).backend.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_copy_with_absolute_destination() {
    let resolver = resolver_with(
        vec![FakeBackend::named("a").public_rules(&[("GET", "/src/"), ("PUT", "/dst/")])],
        Settings {
            remove_prefix: Some("/files".to_string()),
            ..Default::default()
        },
    );

    let req = anonymous(Method::from_bytes(b"COPY").unwrap(), "/files/src/f")
        .with_header(LOCATION, "https://example.com/files/dst/f");
    assert!(resolver.authorize(&req).await.is_allowed());
}

#[tokio::test]
async fn test_missing_location_is_forbidden_without_challenge() {
    let resolver = resolver(vec![FakeBackend::named("a")
        .public_rules(&[("any", "/")])
        .with_login(Challenge::basic(""))]);

    let req = anonymous(Method::from_bytes(b"MOVE").unwrap(), "/src/f");
    match resolver.authorize(&req).await {
        Decision::Deny { status, reason, .. } => {
            assert_eq!(status, StatusCode::FORBIDDEN);
            assert_eq!(reason, "cannot MOVE without Location header");
        }
        other => panic!("expected deny, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_location_after_denied_source_is_plain_denial() {
    let resolver = resolver(vec![FakeBackend::named("a")
        .public_rules(&[("ro", "/")])
        .with_login(Challenge::basic(""))]);

    let req = anonymous(Method::from_bytes(b"COPY").unwrap(), "/src/f");
    assert_eq!(resolver.authorize(&req).await.status(), StatusCode::FORBIDDEN);
    let req = anonymous(Method::from_bytes(b"MOVE").unwrap(), "/src/f");
    assert_eq!(
        resolver.authorize(&req).await.status(),
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn test_websocket_upgrade() {
    let resolver = resolver(vec![FakeBackend::named("a").public_rules(&[("ws", "/live/")])]);

    let upgrade = anonymous(Method::GET, "/live/feed").with_header(http::header::UPGRADE, "websocket");
    assert!(resolver.authorize(&upgrade).await.is_allowed());

    let plain = anonymous(Method::GET, "/live/feed");
    assert!(!resolver.authorize(&plain).await.is_allowed());
}

#[tokio::test]
async fn test_parent_path_disclosure_setting() {
    let backends = || vec![FakeBackend::named("a").public_rules(&[("ro", "/a/b/")])];

    let closed = resolver(backends());
    assert!(!closed.authorize(&anonymous(Method::GET, "/a/")).await.is_allowed());

    let open = resolver_with(
        backends(),
        Settings {
            allow_parent_paths: true,
            ..Default::default()
        },
    );
    assert!(open.authorize(&anonymous(Method::from_bytes(b"PROPFIND").unwrap(), "/a/")).await.is_allowed());
    assert!(!open.authorize(&anonymous(Method::DELETE, "/a/")).await.is_allowed());
}

#[tokio::test]
async fn test_remove_prefix() {
    let resolver = resolver_with(
        vec![FakeBackend::named("a").public_rules(&[("ro", "/docs/"), ("ro", "/index")])],
        Settings {
            remove_prefix: Some("/files/".to_string()),
            ..Default::default()
        },
    );

    assert!(resolver.authorize(&anonymous(Method::GET, "/files/docs/a")).await.is_allowed());
    assert!(!resolver.authorize(&anonymous(Method::GET, "/filesdocs/a")).await.is_allowed());
    assert_eq!(resolver.strip_prefix("/files"), "/");
    assert_eq!(resolver.strip_prefix("/files?x=1"), "/?x=1");
    assert_eq!(resolver.strip_prefix("/other/files"), "/other/files");
}

#[tokio::test]
async fn test_failing_backend_is_skipped() {
    let resolver = resolver(vec![
        FakeBackend::named("down").failing(),
        FakeBackend::named("up").user("alice", &[("rw", "/")]),
    ]);

    let decision = resolver.authorize(&as_user(Method::PUT, "/f", "alice")).await;
    assert!(decision.is_allowed());
    assert_eq!(decision.identity().unwrap().source, "up");
}

#[tokio::test]
async fn test_annotate_granted_request() {
    let mut global = ForwardCredentials::default();
    global.add_cookie("token", "secret");
    let mut tls_creds = ForwardCredentials::default();
    tls_creds.set_basic_auth("admin", "admin");

    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::new(CertificateBackend::new(tls_creds)),
        Arc::new(FakeBackend::named("basic").default_rules(&[("any", "/")])),
    ];
    let resolver = Resolver::new(
        backends,
        Settings {
            credentials: global,
            ..Default::default()
        },
    );

    let req = anonymous(Method::GET, "/app").with_peer_common_name("alice");
    let decision = resolver.authorize(&req).await;
    assert!(decision.is_allowed());

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer client"));
    decision.annotate(&mut headers);
    assert_eq!(headers[X_AUTH_USER], "alice");
    assert_eq!(headers[X_AUTH_SOURCE], "tls");
    assert_eq!(headers[X_AUTH_PERMIT], "basic:default");
    assert_eq!(headers[AUTHORIZATION], "Basic YWRtaW46YWRtaW4=");
    assert_eq!(headers[COOKIE], "token=secret");
}

#[tokio::test]
async fn test_trace_skips_credentials() {
    let mut global = ForwardCredentials::default();
    global.set_basic_auth("svc", "pw");
    let resolver = resolver_with(
        vec![FakeBackend::named("a").public_rules(&[("any", "/")])],
        Settings {
            credentials: global,
            ..Default::default()
        },
    );

    let decision = resolver.authorize(&anonymous(Method::TRACE, "/")).await;
    let Decision::Allow { credentials, .. } = &decision else {
        panic!("expected allow, got {decision:?}");
    };
    assert!(credentials.is_empty());

    let mut headers = HeaderMap::new();
    decision.annotate(&mut headers);
    assert!(headers.get(AUTHORIZATION).is_none());
    assert!(headers.get(X_AUTH_USER).is_none());
    assert_eq!(headers[X_AUTH_PERMIT], "a:public");

    let decision = resolver.authorize(&anonymous(Method::GET, "/")).await;
    let mut headers = HeaderMap::new();
    decision.annotate(&mut headers);
    assert!(headers.get(AUTHORIZATION).is_some());
}

#[derive(Default)]
struct CountingMetrics {
    decisions: Mutex<Vec<String>>,
    errors: AtomicUsize,
}

impl AuthzMetrics for CountingMetrics {
    fn record_decision(&self, outcome: &str) {
        self.decisions.lock().push(outcome.to_string());
    }
    fn record_latency(&self, _seconds: f64) {}
    fn record_backend_error(&self, _backend: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[tokio::test]
async fn test_metrics() {
    let metrics = Arc::new(CountingMetrics::default());
    let resolver = resolver(vec![
        FakeBackend::named("down").failing(),
        FakeBackend::named("a").public_rules(&[("ro", "/pub/"), ("none", "/priv/")]),
    ])
    .with_metrics(metrics.clone());

    resolver.authorize(&anonymous(Method::GET, "/pub/x")).await;
    resolver.authorize(&anonymous(Method::GET, "/priv/x")).await;
    resolver.authorize(&anonymous(Method::GET, "/nowhere")).await;

    assert_eq!(
        *metrics.decisions.lock(),
        vec!["allow_public", "deny", "deny_unmatched"]
    );
    // one identity and one public permit failure per request
    assert_eq!(metrics.errors.load(Ordering::Relaxed), 6);
}
