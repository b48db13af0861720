//! A single path/method authorization clause

use std::collections::BTreeSet;

use thiserror::Error;

use crate::methods::expand_alias;

const BLACKLIST_CHAR: char = '~';

/// Error for a permission line that cannot be turned into a [`Rule`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("permission for \"{methods}\" has an empty path")]
    EmptyPath { methods: String },

    #[error("empty method in \"{methods}\" for path {path}")]
    EmptyMethod { methods: String, path: String },
}

/// Permission for one path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub path: String,
    pub methods: BTreeSet<String>,
    pub methods_are_blacklist: bool,
}

impl Rule {
    /// Parse a rule from a method token list and a path.
    ///
    /// | methods     | result                                   |
    /// |-------------|------------------------------------------|
    /// | `~`, `none` | nothing is allowed                       |
    /// | `any`       | everything is allowed                    |
    /// | `~GET,rw`   | everything except the listed methods     |
    /// | `GET,ro`    | only the listed methods                  |
    pub fn new(methods: &str, path: &str) -> Result<Self, RuleError> {
        let methods = methods.trim();
        if path.is_empty() {
            return Err(RuleError::EmptyPath {
                methods: methods.to_string(),
            });
        }

        let mut rule = Rule {
            path: path.to_string(),
            methods: BTreeSet::new(),
            methods_are_blacklist: false,
        };

        if methods == "~" || methods == "none" {
            return Ok(rule);
        }
        if methods == "any" {
            rule.methods_are_blacklist = true;
            return Ok(rule);
        }

        let list = match methods.strip_prefix(BLACKLIST_CHAR) {
            Some(rest) => {
                rule.methods_are_blacklist = true;
                rest
            }
            None => methods,
        };

        for token in list.split(',').map(str::trim) {
            if token.is_empty() {
                return Err(RuleError::EmptyMethod {
                    methods: methods.to_string(),
                    path: path.to_string(),
                });
            }
            rule.methods.extend(expand_alias(token));
        }

        Ok(rule)
    }

    /// Whether the rule allows `method`.
    pub fn matches_method(&self, method: &str) -> bool {
        self.methods.contains(method) != self.methods_are_blacklist
    }

    /// Whether `path` lies at or below the rule path.
    pub fn matches_path(&self, path: &str) -> bool {
        path.len() >= self.path.len() && path.as_bytes().starts_with(self.path.as_bytes())
    }

    /// Whether `path` is a strict ancestor of the rule path.
    pub fn matches_parent_path(&self, path: &str) -> bool {
        path.len() < self.path.len() && self.path.as_bytes().starts_with(path.as_bytes())
    }
}
