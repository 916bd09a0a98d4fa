//! Inbound path rewriting.
//!
//! Strip the mount prefix, prepend the backend prefix, and guarantee a
//! leading `/`. The query string is never touched; it is reattached
//! verbatim.

use crate::config::ProxyConfig;

/// Rewrite an inbound request path for the backend.
pub(crate) fn rewrite(cfg: &ProxyConfig, path: &str) -> String {
    let mut remainder = path;
    if let Some(strip) = &cfg.strip_path {
        if let Some(rest) = remainder.strip_prefix(strip.as_str()) {
            remainder = rest;
        }
    }

    let joined = match &cfg.path_prefix {
        Some(prefix) if remainder.is_empty() => prefix.clone(),
        Some(prefix) if remainder.starts_with('/') => format!("{prefix}{remainder}"),
        Some(prefix) => format!("{prefix}/{remainder}"),
        None => remainder.to_string(),
    };

    if joined.starts_with('/') {
        joined
    } else {
        format!("/{joined}")
    }
}

/// Reattach the verbatim query string, if any.
pub(crate) fn with_query(path: String, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path,
    }
}
