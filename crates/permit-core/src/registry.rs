//! Backend factory table used by the config loader

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::{api, basic, tls, Backend};
use crate::cache::unix_now;
use crate::config::{ConfigError, Directive};

/// Values shared by all factories of one configuration load
#[derive(Debug, Clone, Copy)]
pub struct BuildContext {
    /// Load time; static permits carry it as their `valid_until`
    pub now: i64,
}

impl BuildContext {
    pub fn new() -> Self {
        Self { now: unix_now() }
    }

    pub fn at(now: i64) -> Self {
        Self { now }
    }
}

impl Default for BuildContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a backend from its directive (arguments and block)
pub type BackendFactory = fn(&Directive, &BuildContext) -> Result<Arc<dyn Backend>, ConfigError>;

/// Maps directive names to backend factories.
///
/// Passed explicitly to [`crate::config::Config::parse`]; there is no global table.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

impl BackendRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `basic`, `api` and `tls`
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(basic::NAME, basic::factory);
        registry.register(api::NAME, api::factory);
        registry.register(tls::NAME, tls::factory);
        registry
    }

    /// Register a factory, replacing any previous one of the same name.
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) -> &mut Self {
        self.factories.insert(name.into(), factory);
        self
    }

    pub fn get(&self, name: &str) -> Option<BackendFactory> {
        self.factories.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
