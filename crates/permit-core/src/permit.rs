//! Ordered rule sets
//!
//! A [`Permit`] is the complete authorization of one entity: a user, the
//! authenticated-default of a backend, or its public tier. Rules are collected
//! in a [`PermitBuilder`] and sorted once by [`PermitBuilder::finalize`], so the
//! longest matching path always decides.

use std::cmp::Reverse;
use std::fmt;

use tracing::debug;

use crate::rule::{Rule, RuleError};

/// Which kind of permit decided a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Tier {
    /// No permit matched
    #[default]
    None,
    /// The identified user's own permit
    User,
    /// A backend's permit for any identified user
    Default,
    /// A backend's permit for everyone
    Public,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::None => "none",
            Tier::User => "user",
            Tier::Default => "default",
            Tier::Public => "public",
        };
        f.write_str(name)
    }
}

/// Result of checking one method/path pair against a permit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    pub allowed: bool,
    /// A rule applied to the path. An unmatched outcome falls through to the next permit.
    pub matched: bool,
}

impl Outcome {
    pub const UNMATCHED: Outcome = Outcome {
        allowed: false,
        matched: false,
    };

    pub fn matched(allowed: bool) -> Self {
        Outcome {
            allowed,
            matched: true,
        }
    }
}

/// Collects rules for a [`Permit`].
#[derive(Debug, Clone, Default)]
pub struct PermitBuilder {
    rules: Vec<Rule>,
    valid_until: i64,
}

impl PermitBuilder {
    pub fn new(valid_until: i64) -> Self {
        Self {
            rules: Vec::new(),
            valid_until,
        }
    }

    /// Parse and add a rule. A rule for an already present path replaces it.
    pub fn add_rule(&mut self, methods: &str, path: &str) -> Result<&mut Self, RuleError> {
        let rule = Rule::new(methods, path)?;
        self.push(rule);
        Ok(self)
    }

    pub fn push(&mut self, rule: Rule) -> &mut Self {
        match self.rules.iter_mut().find(|r| r.path == rule.path) {
            Some(existing) => {
                debug!(path = %rule.path, "replacing earlier rule for the same path");
                *existing = rule;
            }
            None => self.rules.push(rule),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Sort rules longest path first and freeze them.
    pub fn finalize(mut self) -> Permit {
        self.rules.sort_by_key(|r| Reverse(r.path.len()));
        Permit {
            rules: self.rules,
            valid_until: self.valid_until,
        }
    }
}

/// Finalized set of rules with a cache expiry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permit {
    rules: Vec<Rule>,
    /// Unix timestamp until which a cached copy may be reused.
    pub valid_until: i64,
}

impl Permit {
    /// A permit without rules; it never matches.
    pub fn empty(valid_until: i64) -> Self {
        Permit {
            rules: Vec::new(),
            valid_until,
        }
    }

    pub fn builder(valid_until: i64) -> PermitBuilder {
        PermitBuilder::new(valid_until)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Check a request against the rules.
    ///
    /// The first rule whose path is a prefix of `path` decides. When none
    /// matches and the request is read-only, a rule below `path` grants
    /// access so clients can list the directories leading to it.
    pub fn check(
        &self,
        method: &str,
        path: &str,
        read_only: bool,
        allow_parent_paths: bool,
    ) -> Outcome {
        if let Some(rule) = self.rules.iter().find(|r| r.matches_path(path)) {
            return Outcome::matched(rule.matches_method(method));
        }
        if read_only
            && allow_parent_paths
            && self.rules.iter().any(|r| r.matches_parent_path(path))
        {
            return Outcome::matched(true);
        }
        Outcome::UNMATCHED
    }
}
