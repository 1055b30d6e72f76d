//! Longest-prefix + method-disambiguating route matcher.
//!
//! Grounded in `original_source/.../proxy/engine.py::match_route`. The
//! outcome shape (`Option<&Route>`, `has_path_match: bool`) mirrors the
//! Python tuple return:
//!   - `(None, false)` — no prefix matched at all -> caller emits 404
//!   - `(None, true)`  — prefix matched, no method did -> caller emits 405
//!   - `(Some(route), true)` — a route was selected

use crate::config::Route;

/// A route's `path` matches `request_path` only at a segment boundary:
/// `/api` matches `/api` and `/api/x` but not `/apix`.
fn path_matches(route_path: &str, request_path: &str) -> bool {
    if route_path == "/" {
        return true;
    }
    request_path == route_path
        || request_path
            .as_bytes()
            .get(route_path.len())
            .is_some_and(|&b| b == b'/' && request_path.starts_with(route_path))
}

pub fn match_route<'a>(path: &str, method: &str, routes: &'a [Route]) -> (Option<&'a Route>, bool) {
    let candidates: Vec<&Route> = routes.iter().filter(|r| path_matches(&r.path, path)).collect();
    if candidates.is_empty() {
        return (None, false);
    }

    let max_len = candidates.iter().map(|r| r.path.len()).max().unwrap();
    let tied: Vec<&Route> = candidates
        .into_iter()
        .filter(|r| r.path.len() == max_len)
        .collect();

    let method_upper = method.to_ascii_uppercase();
    if let Some(route) = tied.iter().find(|r| r.method != "*" && r.method == method_upper) {
        return (Some(route), true);
    }
    if let Some(route) = tied.iter().find(|r| r.method == "*") {
        return (Some(route), true);
    }
    (None, true)
}
