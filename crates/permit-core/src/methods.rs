//! HTTP method classification
//!
//! Expands method aliases used in permission lines and turns an incoming
//! request into the list of `(method, path)` checks it has to pass.

use std::collections::BTreeSet;

use http::HeaderMap;
use thiserror::Error;

/// Synthetic method checked for websocket upgrades.
pub const WEBSOCKET: &str = "WEBSOCKET";

const READ_ONLY: &[&str] = &["GET", "HEAD", "PROPFIND", "OPTIONS", "LOCK", "UNLOCK"];
const READ_WRITE: &[&str] = &["POST", "PUT", "DELETE", "MKCOL", "PROPPATCH"];

/// Expand a method token into the set of method names it stands for.
///
/// `ro`, `rw`, `ws` and `any` are aliases; every other token is taken
/// literally so custom verbs can be permitted.
pub fn expand_alias(token: &str) -> BTreeSet<String> {
    let methods: Vec<&str> = match token {
        "ro" => READ_ONLY.to_vec(),
        "rw" => READ_ONLY.iter().chain(READ_WRITE).copied().collect(),
        "ws" => vec![WEBSOCKET],
        "any" => READ_ONLY
            .iter()
            .chain(READ_WRITE)
            .copied()
            .chain(std::iter::once(WEBSOCKET))
            .collect(),
        other => vec![other],
    };
    methods.into_iter().map(str::to_string).collect()
}

/// Methods that never modify a resource and may therefore see parent paths.
pub fn is_read_only(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "PROPFIND" | "OPTIONS")
}

/// A single method/path pair to check against the permit chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub method: String,
    pub path: String,
}

impl Check {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
        }
    }
}

/// The checks a request must pass, in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Checks that all have to be allowed. Evaluation stops at the first failure.
    pub checks: Vec<Check>,
    /// Whether the request may be granted through parent-path disclosure.
    pub read_only: bool,
    /// Set when a MOVE/COPY has no destination; reported once the source check passed.
    pub missing_destination: Option<String>,
}

impl Plan {
    /// Error for a compound request whose destination is missing.
    pub fn destination_error(&self) -> Option<RequestError> {
        self.missing_destination
            .as_ref()
            .map(|method| RequestError::MissingDestination {
                method: method.clone(),
            })
    }

    fn single(method: impl Into<String>, path: &str, read_only: bool) -> Self {
        Plan {
            checks: vec![Check::new(method, path)],
            read_only,
            missing_destination: None,
        }
    }

    fn transfer(source: Check, destination: Option<String>, method: &str) -> Self {
        match destination {
            Some(dest) => Plan {
                checks: vec![source, Check::new("PUT", dest)],
                read_only: false,
                missing_destination: None,
            },
            None => Plan {
                checks: vec![source],
                read_only: false,
                missing_destination: Some(method.to_string()),
            },
        }
    }
}

/// Errors caused by a malformed client request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("cannot {method} without Location header")]
    MissingDestination { method: String },
}

/// Build the plan for a request.
///
/// `path` is the (already prefix-stripped) request URI. Destination headers
/// are used verbatim, see [`classify_with`] to rewrite them.
pub fn classify(method: &str, path: &str, headers: &HeaderMap) -> Plan {
    classify_with(method, path, headers, |dest| dest.to_string())
}

/// Like [`classify`], mapping `Location`/`Destination` values through `normalize`.
pub fn classify_with(
    method: &str,
    path: &str,
    headers: &HeaderMap,
    normalize: impl Fn(&str) -> String,
) -> Plan {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    match method {
        "MOVE" => Plan::transfer(
            Check::new("DELETE", path),
            header("location").map(&normalize),
            method,
        ),
        "COPY" => Plan::transfer(
            Check::new("GET", path),
            header("location").map(&normalize),
            method,
        ),
        "PATCH" if header("destination").is_some() => {
            let dest = header("destination").map(&normalize);
            let copy = header("action").is_some_and(|a| a.eq_ignore_ascii_case("copy"));
            let source = if copy {
                Check::new("GET", path)
            } else {
                Check::new("DELETE", path)
            };
            Plan::transfer(source, dest, method)
        }
        _ if header("upgrade").is_some_and(|u| u.eq_ignore_ascii_case("websocket")) => {
            Plan::single(WEBSOCKET, path, false)
        }
        _ => Plan::single(method, path, is_read_only(method)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, v.parse().unwrap());
        }
        map
    }

    #[test]
    fn test_expand_aliases() {
        let ro = expand_alias("ro");
        assert_eq!(ro.len(), 6);
        assert!(ro.contains("OPTIONS"));
        assert!(!ro.contains("POST"));

        let rw = expand_alias("rw");
        assert!(rw.is_superset(&ro));
        assert!(rw.contains("MKCOL"));
        assert!(!rw.contains(WEBSOCKET));

        let any = expand_alias("any");
        assert!(any.is_superset(&rw));
        assert!(any.contains(WEBSOCKET));

        assert_eq!(expand_alias("ws").into_iter().collect::<Vec<_>>(), vec![WEBSOCKET]);
        assert_eq!(expand_alias("rw"), expand_alias("rw"));
    }

    #[test]
    fn test_unknown_token_is_literal() {
        let crazy = expand_alias("CRAZY");
        assert_eq!(crazy.len(), 1);
        assert!(crazy.contains("CRAZY"));
    }

    #[test]
    fn test_read_only() {
        for m in ["GET", "HEAD", "PROPFIND", "OPTIONS"] {
            assert!(is_read_only(m), "{m} should be read-only");
        }
        for m in ["LOCK", "POST", "PUT", "DELETE", "WEBSOCKET"] {
            assert!(!is_read_only(m), "{m} should not be read-only");
        }
    }

    #[test]
    fn test_classify_plain() {
        let plan = classify("GET", "/a/b", &HeaderMap::new());
        assert_eq!(plan.checks, vec![Check::new("GET", "/a/b")]);
        assert!(plan.read_only);

        let plan = classify("POST", "/a/b", &HeaderMap::new());
        assert!(!plan.read_only);
    }

    #[test]
    fn test_classify_move_and_copy() {
        let plan = classify("MOVE", "/src", &headers(&[("location", "/dst")]));
        assert_eq!(
            plan.checks,
            vec![Check::new("DELETE", "/src"), Check::new("PUT", "/dst")]
        );
        assert!(plan.destination_error().is_none());

        let plan = classify("COPY", "/src", &headers(&[("location", "/dst")]));
        assert_eq!(
            plan.checks,
            vec![Check::new("GET", "/src"), Check::new("PUT", "/dst")]
        );
        assert!(!plan.read_only);
    }

    #[test]
    fn test_classify_move_without_location() {
        let plan = classify("MOVE", "/src", &HeaderMap::new());
        assert_eq!(plan.checks, vec![Check::new("DELETE", "/src")]);
        assert_eq!(
            plan.destination_error(),
            Some(RequestError::MissingDestination {
                method: "MOVE".to_string()
            })
        );
    }

    #[test]
    fn test_classify_patch() {
        let plan = classify("PATCH", "/src", &HeaderMap::new());
        assert_eq!(plan.checks, vec![Check::new("PATCH", "/src")]);

        let plan = classify(
            "PATCH",
            "/src",
            &headers(&[("destination", "/dst"), ("action", "COPY")]),
        );
        assert_eq!(
            plan.checks,
            vec![Check::new("GET", "/src"), Check::new("PUT", "/dst")]
        );

        let plan = classify("PATCH", "/src", &headers(&[("destination", "/dst")]));
        assert_eq!(
            plan.checks,
            vec![Check::new("DELETE", "/src"), Check::new("PUT", "/dst")]
        );
    }

    #[test]
    fn test_classify_websocket() {
        let plan = classify("GET", "/ws", &headers(&[("upgrade", "WebSocket")]));
        assert_eq!(plan.checks, vec![Check::new(WEBSOCKET, "/ws")]);
        assert!(!plan.read_only);
    }

    #[test]
    fn test_classify_normalizes_destination() {
        let plan = classify_with(
            "COPY",
            "/src",
            &headers(&[("location", "https://example.com/dst")]),
            |d| d.trim_start_matches("https://example.com").to_string(),
        );
        assert_eq!(plan.checks[1], Check::new("PUT", "/dst"));
    }
}
