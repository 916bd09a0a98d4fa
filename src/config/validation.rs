//! Backend URL parsing and option validation.
//!
//! Splits syntactic parsing (the `url` crate) from the semantic checks the
//! proxy needs: a usable scheme, a host, a port in range, a non-empty
//! protocol set, and header names that actually parse. The first violation
//! wins; nothing is served on a bad config.

use crate::config::schema::{Protocol, Protocols, ProxyConfig, ProxyOptions, Scheme};
use crate::pool::BackendPool;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration failures at mount time.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("backend URL is required")]
    MissingBackend,

    #[error("backend URL has no scheme: {0}")]
    MissingScheme(String),

    #[error("unsupported backend scheme: {0}")]
    UnsupportedScheme(String),

    #[error("backend URL has no host")]
    MissingHost,

    #[error("backend port must be between 1 and 65535")]
    InvalidPort,

    #[error("invalid backend URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("protocols must name at least one of http1, http2")]
    EmptyProtocols,

    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("error_response status {0} is not a valid HTTP status")]
    InvalidErrorStatus(u16),
}

/// Resolve an options bag into an immutable [`ProxyConfig`].
pub(crate) fn resolve(
    pool: Arc<dyn BackendPool>,
    options: ProxyOptions,
) -> Result<ProxyConfig, ConfigError> {
    let backend = options.backend.trim();
    if backend.is_empty() {
        return Err(ConfigError::MissingBackend);
    }
    if !backend.contains("://") {
        return Err(ConfigError::MissingScheme(backend.to_string()));
    }

    let url = url::Url::parse(backend).map_err(|source| ConfigError::InvalidUrl {
        url: backend.to_string(),
        source,
    })?;

    let scheme = match url.scheme() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        "ws" => Scheme::Ws,
        "wss" => Scheme::Wss,
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or(ConfigError::MissingHost)?
        .to_string();

    let port = match url.port() {
        Some(0) => return Err(ConfigError::InvalidPort),
        Some(p) => p,
        None => scheme.default_port(),
    };

    let path_prefix = normalize_prefix(url.path());
    let strip_path = options.strip_path.as_deref().and_then(normalize_prefix);

    let protocols = resolve_protocols(&options.protocols)?;

    let add_headers = options
        .add_headers
        .iter()
        .map(|(name, value)| parse_header(name, value))
        .collect::<Result<Vec<_>, _>>()?;

    let remove_headers = options
        .remove_headers
        .iter()
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let (status, reason) = options.error_response;
    let status = StatusCode::from_u16(status).map_err(|_| ConfigError::InvalidErrorStatus(status))?;

    Ok(ProxyConfig {
        pool,
        scheme,
        host,
        port,
        path_prefix,
        strip_path,
        timeout: Duration::from_millis(options.timeout_ms),
        connect_timeout: Duration::from_millis(options.connect_timeout_ms),
        protocols,
        verify_tls: options.verify_tls,
        add_headers,
        remove_headers,
        max_body_size: options.max_body_size.map(|n| n as usize),
        error_response: (status, reason),
    })
}

/// Normalize a path prefix: trim whitespace, drop a single trailing `/`,
/// absent when nothing remains.
fn normalize_prefix(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn resolve_protocols(list: &[Protocol]) -> Result<Protocols, ConfigError> {
    if list.is_empty() {
        return Err(ConfigError::EmptyProtocols);
    }
    Ok(Protocols {
        http1: list.contains(&Protocol::Http1),
        http2: list.contains(&Protocol::Http2),
    })
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), ConfigError> {
    let header_name = HeaderName::try_from(name.trim().to_ascii_lowercase()).map_err(|e| {
        ConfigError::InvalidHeader {
            name: name.to_string(),
            reason: e.to_string(),
        }
    })?;
    let header_value = HeaderValue::try_from(value).map_err(|e| ConfigError::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    Ok((header_name, header_value))
}
