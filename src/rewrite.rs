//! Mapping of public registry paths onto the upstream layout
//!
//! Artifact Registry serves Docker repositories as
//! `/v2/<project>/<repository>/...` while clients of the proxy address them as
//! `/<project>/<repository>/v2/...`, which lets the proxy be configured as a
//! plain registry mirror.

/// API version marker inserted in front of the repository prefix
const API_MARKER: &str = "v2";

/// How a request path should be handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Registry API call: rewrite to the upstream path and authenticate
    Registry { upstream_path: String },
    /// Answered with a 301: the cleaned form of an unclean path, or the
    /// subtree root `<prefix>v2/` for exactly `<prefix>v2`
    Redirect { location: String },
    /// Anything else is forwarded without authentication
    PassThrough,
}

/// Matches paths under `<prefix>v2/` and rewrites them for the upstream
#[derive(Debug, Clone)]
pub struct PathRewriter {
    prefix: String,
    pattern: String,
}

impl PathRewriter {
    /// Create a rewriter for a prefix ending in `/`
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            pattern: format!("{prefix}{API_MARKER}/"),
        }
    }

    /// The path pattern authenticated requests are registered under
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Decide how a request path is handled
    ///
    /// Paths with dot segments or repeated slashes are first redirected to
    /// their cleaned form, so a matched path can never leave the prefix.
    pub fn route(&self, path: &str, query: Option<&str>) -> Route {
        if !path.starts_with('/') {
            return Route::PassThrough;
        }

        let cleaned = clean_path(path);
        if cleaned != path {
            return Route::Redirect {
                location: with_query(cleaned, query),
            };
        }

        if let Some(rest) = path.strip_prefix(&self.pattern) {
            return Route::Registry {
                upstream_path: format!("/{API_MARKER}{}{rest}", self.prefix),
            };
        }

        if path.len() + 1 == self.pattern.len() && self.pattern.starts_with(path) {
            return Route::Redirect {
                location: with_query(self.pattern.clone(), query),
            };
        }

        Route::PassThrough
    }
}

fn with_query(path: String, query: Option<&str>) -> String {
    match query {
        Some(q) => format!("{path}?{q}"),
        None => path,
    }
}

/// A `.` segment, literal or percent-encoded
fn is_dot(segment: &str) -> bool {
    segment == "." || segment.eq_ignore_ascii_case("%2e")
}

/// A `..` segment, in any mix of literal and percent-encoded dots
fn is_dot_dot(segment: &str) -> bool {
    (1..segment.len()).any(|split| {
        segment.is_char_boundary(split) && is_dot(&segment[..split]) && is_dot(&segment[split..])
    })
}

/// Canonical form of a rooted path
///
/// Empty and `.` segments are dropped and `..` removes the preceding segment,
/// never climbing above `/`. A trailing slash is kept.
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        if segment.is_empty() || is_dot(segment) {
            continue;
        }
        if is_dot_dot(segment) {
            segments.pop();
            continue;
        }
        segments.push(segment);
    }

    let mut cleaned = format!("/{}", segments.join("/"));
    if path.ends_with('/') && cleaned != "/" {
        cleaned.push('/');
    }
    cleaned
}
