//! Route key normalization and path prefix matching.
//!
//! # Responsibilities
//! - Normalize registration paths into route keys
//! - Match request paths against prefixes on segment boundaries
//! - Enumerate the candidate prefixes of a path, longest first
//!
//! # Design Decisions
//! - Path matching is case-sensitive
//! - `/a` covers `/a` and `/a/...` but never `/ab`
//! - The literal `*` is its own key and never a prefix of anything

/// Path addressing "no specific resource" (`OPTIONS * HTTP/1.1`).
pub const WILDCARD_PATH: &str = "*";

/// Normalized registration path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    /// No path: used when no registered prefix covers a request.
    CatchAll,
    /// The literal `*` request target.
    Wildcard,
    /// A path prefix, always starting with `/` and without a trailing `/`
    /// (except the root itself).
    Prefix(String),
}

impl RouteKey {
    /// Normalize a registration path.
    pub fn parse(path: Option<&str>) -> Self {
        let path = match path {
            None => return RouteKey::CatchAll,
            Some(p) if p.is_empty() => return RouteKey::CatchAll,
            Some(p) => p,
        };
        if path == WILDCARD_PATH {
            return RouteKey::Wildcard;
        }

        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            RouteKey::Prefix("/".to_string())
        } else if trimmed.starts_with('/') {
            RouteKey::Prefix(trimmed.to_string())
        } else {
            RouteKey::Prefix(format!("/{trimmed}"))
        }
    }

    /// String form used as the table key; `None` for the catch-all.
    pub fn as_path(&self) -> Option<&str> {
        match self {
            RouteKey::CatchAll => None,
            RouteKey::Wildcard => Some(WILDCARD_PATH),
            RouteKey::Prefix(p) => Some(p),
        }
    }

    /// Whether a request for `path` falls under this key.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            RouteKey::CatchAll => path != WILDCARD_PATH,
            RouteKey::Wildcard => path == WILDCARD_PATH,
            RouteKey::Prefix(prefix) => prefix_matches(prefix, path),
        }
    }
}

/// Segment-aligned prefix test.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    path.len() == prefix.len() || prefix.ends_with('/') || path.as_bytes()[prefix.len()] == b'/'
}

/// Prefixes of `path` that could be registration keys, longest first.
///
/// `/a/b/` yields `/a/b/`, `/a/b`, `/a`, `/`.
pub fn candidate_prefixes(path: &str) -> Vec<&str> {
    let mut candidates = Vec::new();
    let mut current = path;
    loop {
        candidates.push(current);
        match current.rfind('/') {
            Some(0) | None => {
                if current != "/" && current.starts_with('/') {
                    candidates.push("/");
                }
                break;
            }
            Some(idx) => current = &current[..idx],
        }
    }
    candidates
}
