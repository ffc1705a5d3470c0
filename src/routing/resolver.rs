//! Route Resolver (C6, §4.1): URI → best matching route.

use crate::registry::{Registry, Route};
use std::sync::Arc;

/// Resolves the unique best-matching route for `path` against every route
/// currently installed in `registry`.
///
/// Selection among matches: ascending by `order`; on a tie, the route whose
/// `uri` is longer wins (more specific). Returns `None` when nothing
/// matches — the caller maps that to `PATH_NO_MATCHED`.
pub fn resolve_route(registry: &Registry, path: &str) -> Option<Arc<Route>> {
    let mut matches: Vec<Arc<Route>> = registry
        .all_routes()
        .into_iter()
        .filter(|r| r.pattern.is_match(path))
        .collect();

    matches.sort_by(|a, b| {
        a.definition
            .order
            .cmp(&b.definition.order)
            .then_with(|| b.definition.uri.len().cmp(&a.definition.uri.len()))
    });

    matches.into_iter().next()
}
