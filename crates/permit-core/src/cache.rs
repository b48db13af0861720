//! Identity and permit cache for remote backends
//!
//! Keeps resolved users keyed by a hashed credential fingerprint and permits
//! keyed by username, each with an absolute expiry. A background sweeper
//! removes expired entries periodically.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::permit::Permit;

/// Current time as unix seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Cached identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    /// Unix timestamp after which the identity must be re-authenticated
    pub valid_until: i64,
}

impl User {
    pub fn new(username: impl Into<String>, ttl_secs: i64, now: i64) -> Self {
        Self {
            username: username.into(),
            valid_until: now + ttl_secs,
        }
    }

    /// Users are only reused strictly before their expiry.
    pub fn is_fresh(&self, now: i64) -> bool {
        self.valid_until > now
    }
}

/// Permits stay usable through their expiry second, one second longer than users.
fn permit_is_fresh(permit: &Permit, now: i64) -> bool {
    permit.valid_until >= now
}

/// Fingerprint of a raw `Authorization` header value
pub fn auth_fingerprint(authorization: &str) -> String {
    format!("auth={authorization}")
}

/// Fingerprint of a session cookie
pub fn cookie_fingerprint(name: &str, value: &str) -> String {
    format!("{name}={value}")
}

/// Thread-safe TTL cache of users and permits
#[derive(Default)]
pub struct IdentityCache {
    users: RwLock<HashMap<String, User>>,
    permits: RwLock<HashMap<String, Arc<Permit>>>,
    default_permit: RwLock<Option<Arc<Permit>>>,
    public_permit: RwLock<Option<Arc<Permit>>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// First fingerprint with a fresh user; stale entries are skipped.
    ///
    /// Fingerprints are hashed before lookup, raw credentials never become keys.
    pub fn user<'a, I>(&self, fingerprints: I, now: i64) -> Option<User>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let users = self.users.read();
        let user = fingerprints
            .into_iter()
            .filter_map(|fp| users.get(&sha256_hex(fp)))
            .find(|user| user.is_fresh(now))?;
        debug!(username = %user.username, "identity cache hit");
        Some(user.clone())
    }

    pub fn put_user(&self, fingerprint: &str, user: User) {
        self.users.write().insert(sha256_hex(fingerprint), user);
    }

    pub fn permit(&self, username: &str, now: i64) -> Option<Arc<Permit>> {
        let permits = self.permits.read();
        let permit = permits.get(username)?;
        permit_is_fresh(permit, now).then(|| Arc::clone(permit))
    }

    pub fn put_permit(&self, username: &str, permit: Arc<Permit>) {
        self.permits.write().insert(username.to_string(), permit);
    }

    pub fn default_permit(&self, now: i64) -> Option<Arc<Permit>> {
        Self::fresh_slot(&self.default_permit, now)
    }

    pub fn set_default_permit(&self, permit: Arc<Permit>) {
        *self.default_permit.write() = Some(permit);
    }

    pub fn public_permit(&self, now: i64) -> Option<Arc<Permit>> {
        Self::fresh_slot(&self.public_permit, now)
    }

    pub fn set_public_permit(&self, permit: Arc<Permit>) {
        *self.public_permit.write() = Some(permit);
    }

    fn fresh_slot(slot: &RwLock<Option<Arc<Permit>>>, now: i64) -> Option<Arc<Permit>> {
        slot.read()
            .as_ref()
            .filter(|p| permit_is_fresh(p, now))
            .cloned()
    }

    /// Remove every user and permit that expired before `now`.
    ///
    /// Returns the number of removed users and permits.
    pub fn sweep(&self, now: i64) -> (usize, usize) {
        let removed_users = {
            let mut users = self.users.write();
            let before = users.len();
            users.retain(|_, user| user.valid_until >= now);
            before - users.len()
        };
        let removed_permits = {
            let mut permits = self.permits.write();
            let before = permits.len();
            permits.retain(|_, permit| permit.valid_until >= now);
            before - permits.len()
        };
        (removed_users, removed_permits)
    }

    /// Number of cached users and permits (for metrics)
    pub fn len(&self) -> (usize, usize) {
        (self.users.read().len(), self.permits.read().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == (0, 0)
    }
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (users, permits) = self.len();
        f.debug_struct("IdentityCache")
            .field("users", &users)
            .field("permits", &permits)
            .finish()
    }
}

/// Background task sweeping an [`IdentityCache`]; aborted on drop.
#[derive(Debug)]
pub struct Sweeper {
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn the sweeper on the current tokio runtime.
    ///
    /// The task only holds a weak reference and exits once the cache is gone.
    /// Returns `None` outside of a runtime.
    pub fn spawn(cache: &Arc<IdentityCache>, period: Duration) -> Option<Self> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let cache: Weak<IdentityCache> = Arc::downgrade(cache);
        let handle = runtime.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let (users, permits) = cache.sweep(unix_now());
                debug!(users, permits, "swept expired cache entries");
            }
        });
        Some(Self { handle })
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Compute SHA-256 hash of input string, returned as lowercase hex
pub fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let out = hasher.finalize();
    base16ct::lower::encode_string(&out)
}
