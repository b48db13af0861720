//! Directive file parser
//!
//! The format is line based: one directive per line, split into words with
//! shell quoting rules (`#` comments, single or double quotes, backslash
//! escapes). A trailing `{` opens a block of nested directives that is closed
//! by a lone `}`.
//!
//! ```text
//! allow_reading_parent_paths
//! realm "Restricted Site"
//! tls
//! basic {
//!     user greg qwerty1   # static credentials
//!     rw /tmp/
//!     public
//!     ro /static
//! }
//! ```
//!
//! Global directives configure the [`Resolver`]; every other directive names a
//! backend that is built by the factory registered under that name.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::registry::{BackendRegistry, BuildContext};
use crate::resolver::{Resolver, Settings};
use crate::rule::RuleError;

/// Error while loading a configuration; every variant knows its line.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: unknown permission backend \"{name}\"")]
    UnknownBackend { name: String, line: usize },

    #[error("line {line}: {directive} expects {expected}, got {got}")]
    WrongArgs {
        directive: String,
        expected: &'static str,
        got: usize,
        line: usize,
    },

    #[error("line {line}: unexpected \"{name}\" in {context}")]
    UnexpectedDirective {
        name: String,
        context: String,
        line: usize,
    },

    #[error("line {line}: {directive} does not take a block")]
    UnexpectedBlock { directive: String, line: usize },

    #[error("line {line}: {directive} is missing required option \"{option}\"")]
    MissingOption {
        directive: String,
        option: &'static str,
        line: usize,
    },

    #[error("line {line}: {directive} must contain the placeholder \"{placeholder}\"")]
    MissingPlaceholder {
        directive: String,
        placeholder: &'static str,
        line: usize,
    },

    #[error("line {line}: invalid number \"{value}\"")]
    InvalidNumber { value: String, line: usize },

    #[error("line {line}: {source}")]
    Permission {
        line: usize,
        #[source]
        source: RuleError,
    },

    #[error("line {line}: could not set up {directive}: {reason}")]
    Backend {
        directive: String,
        reason: String,
        line: usize,
    },
}

/// One parsed directive with its arguments and optional block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    pub args: Vec<String>,
    pub block: Vec<Directive>,
    pub line: usize,
}

impl Directive {
    /// Arguments, requiring exactly `n` of them.
    pub fn exact_args(&self, n: usize, expected: &'static str) -> Result<&[String], ConfigError> {
        if self.args.len() == n {
            Ok(&self.args)
        } else {
            Err(ConfigError::WrongArgs {
                directive: self.name.clone(),
                expected,
                got: self.args.len(),
                line: self.line,
            })
        }
    }

    pub fn single_arg(&self) -> Result<&str, ConfigError> {
        Ok(self.exact_args(1, "one argument")?[0].as_str())
    }

    pub fn no_args(&self) -> Result<(), ConfigError> {
        self.exact_args(0, "no arguments").map(|_| ())
    }

    pub fn no_block(&self) -> Result<(), ConfigError> {
        if self.block.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::UnexpectedBlock {
                directive: self.name.clone(),
                line: self.line,
            })
        }
    }

    pub fn unexpected(&self, context: &str) -> ConfigError {
        ConfigError::UnexpectedDirective {
            name: self.name.clone(),
            context: context.to_string(),
            line: self.line,
        }
    }
}

struct Line {
    number: usize,
    words: Vec<String>,
}

/// Split every line into shell-style words, dropping blank and comment lines.
fn tokenize(input: &str) -> Result<Vec<Line>, ConfigError> {
    let mut lines = Vec::new();
    for (idx, raw) in input.lines().enumerate() {
        let number = idx + 1;
        let words = shell_words::split(raw).map_err(|err| ConfigError::Syntax {
            line: number,
            message: err.to_string(),
        })?;
        if !words.is_empty() {
            lines.push(Line { number, words });
        }
    }
    Ok(lines)
}

fn parse_directives(
    lines: &mut std::vec::IntoIter<Line>,
    opened_at: Option<usize>,
) -> Result<Vec<Directive>, ConfigError> {
    let mut directives = Vec::new();

    while let Some(line) = lines.next() {
        let mut words = line.words;

        if words.len() == 1 && words[0] == "}" {
            return match opened_at {
                Some(_) => Ok(directives),
                None => Err(ConfigError::Syntax {
                    line: line.number,
                    message: "unexpected '}'".to_string(),
                }),
            };
        }

        let opens_block = words.last().is_some_and(|w| w == "{");
        if opens_block {
            words.pop();
        }
        if words.iter().any(|w| w == "{" || w == "}") {
            return Err(ConfigError::Syntax {
                line: line.number,
                message: "braces must close a line ('{') or stand alone ('}')".to_string(),
            });
        }

        let mut words = words.into_iter();
        let Some(name) = words.next() else {
            return Err(ConfigError::Syntax {
                line: line.number,
                message: "block without a directive".to_string(),
            });
        };
        let args = words.collect();
        let block = if opens_block {
            parse_directives(lines, Some(line.number))?
        } else {
            Vec::new()
        };

        directives.push(Directive {
            name,
            args,
            block,
            line: line.number,
        });
    }

    match opened_at {
        Some(line) => Err(ConfigError::Syntax {
            line,
            message: "block is never closed".to_string(),
        }),
        None => Ok(directives),
    }
}

/// Parse `input` into its top-level directives.
pub fn parse_directive_tree(input: &str) -> Result<Vec<Directive>, ConfigError> {
    let mut lines = tokenize(input)?.into_iter();
    parse_directives(&mut lines, None)
}

/// A loaded configuration
#[derive(Debug, Default)]
pub struct Config {
    pub settings: Settings,
    pub backends: Vec<Arc<dyn Backend>>,
}

impl Config {
    /// Parse a configuration, building backends through `registry`.
    pub fn parse(input: &str, registry: &BackendRegistry) -> Result<Self, ConfigError> {
        Self::parse_with(input, registry, &BuildContext::new())
    }

    pub fn parse_with(
        input: &str,
        registry: &BackendRegistry,
        ctx: &BuildContext,
    ) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        for directive in parse_directive_tree(input)? {
            match directive.name.as_str() {
                "allow_reading_parent_paths" => {
                    directive.no_args()?;
                    directive.no_block()?;
                    config.settings.allow_parent_paths = true;
                }
                "remove_prefix" => {
                    directive.no_block()?;
                    config.settings.remove_prefix = Some(directive.single_arg()?.to_string());
                }
                "realm" => {
                    directive.no_block()?;
                    config.settings.realm = Some(directive.single_arg()?.to_string());
                }
                "set_basicauth" => {
                    directive.no_block()?;
                    let args = directive.exact_args(2, "a user and a password")?;
                    config.settings.credentials.set_basic_auth(&args[0], &args[1]);
                }
                "set_cookie" => {
                    directive.no_block()?;
                    let args = directive.exact_args(2, "a cookie name and value")?;
                    config
                        .settings
                        .credentials
                        .add_cookie(args[0].as_str(), args[1].as_str());
                }
                name => {
                    let factory =
                        registry
                            .get(name)
                            .ok_or_else(|| ConfigError::UnknownBackend {
                                name: name.to_string(),
                                line: directive.line,
                            })?;
                    let backend = factory(&directive, ctx)?;
                    debug!(backend = backend.name(), line = directive.line, "configured backend");
                    config.backends.push(backend);
                }
            }
        }

        info!(
            backends = config.backends.len(),
            parent_paths = config.settings.allow_parent_paths,
            "loaded permission configuration"
        );
        Ok(config)
    }

    pub fn into_resolver(self) -> Resolver {
        Resolver::new(self.backends, self.settings)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
