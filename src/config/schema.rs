//! Configuration schema definitions.
//!
//! `ProxyOptions` is the serde-deserializable options bag a host supplies
//! per mount. `ProxyConfig` is the resolved, immutable form the proxy runs
//! on: every behavior downstream is a pure function of it plus the inbound
//! request.

use crate::config::validation::{self, ConfigError};
use crate::pool::BackendPool;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Backend URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    /// The port implied by the scheme when the backend URL names none.
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http | Scheme::Ws => 80,
            Scheme::Https | Scheme::Wss => 443,
        }
    }

    /// Whether dialing this backend requires TLS.
    pub fn is_tls(self) -> bool {
        matches!(self, Scheme::Https | Scheme::Wss)
    }

    /// Scheme to use when re-originating plain HTTP calls.
    pub(crate) fn http_scheme(self) -> &'static str {
        if self.is_tls() {
            "https"
        } else {
            "http"
        }
    }

    /// Scheme to use when upgrading a WebSocket toward the backend.
    pub(crate) fn ws_scheme(self) -> &'static str {
        if self.is_tls() {
            "wss"
        } else {
            "ws"
        }
    }
}

/// HTTP protocol versions the proxy may negotiate with the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http1,
    Http2,
}

/// Resolved protocol set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocols {
    pub http1: bool,
    pub http2: bool,
}

impl Protocols {
    /// True when only HTTP/2 is allowed (prior-knowledge h2 on one-shot
    /// connections, `h2` ALPN over TLS).
    pub fn http2_only(self) -> bool {
        self.http2 && !self.http1
    }
}

impl Default for Protocols {
    fn default() -> Self {
        Self { http1: true, http2: true }
    }
}

/// Per-mount options, as supplied by the host.
///
/// Everything except `backend` has a default, so a minimal mount is just a
/// backend URL. The pool handle is not part of the bag; it is passed
/// alongside to [`ProxyConfig::build`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyOptions {
    /// Backend origin URL, e.g. `http://127.0.0.1:4001/api`. A path in the
    /// URL becomes the outbound path prefix.
    pub backend: String,

    /// Prefix stripped from inbound request paths before re-origination.
    pub strip_path: Option<String>,

    /// End-to-end request timeout in milliseconds.
    pub timeout_ms: u64,

    /// Transport establishment timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Allowed backend protocol versions.
    pub protocols: Vec<Protocol>,

    /// Verify backend TLS certificates.
    pub verify_tls: bool,

    /// Headers appended to every outbound request, in order. May duplicate.
    pub add_headers: Vec<(String, String)>,

    /// Inbound header names dropped from outbound requests (case-insensitive).
    pub remove_headers: Vec<String>,

    /// Request-body bytes buffered before the engine switches to the
    /// streaming path. `None` means unlimited.
    pub max_body_size: Option<u64>,

    /// Status and reason phrase emitted on generic upstream failure.
    pub error_response: (u16, String),
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            backend: String::new(),
            strip_path: None,
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            protocols: vec![Protocol::Http1, Protocol::Http2],
            verify_tls: true,
            add_headers: Vec::new(),
            remove_headers: Vec::new(),
            max_body_size: Some(default_max_body_size()),
            error_response: (502, "Bad Gateway".to_string()),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_max_body_size() -> u64 {
    10 * 1024 * 1024
}

/// Resolved, immutable proxy configuration. Built once at mount time and
/// shared read-only across requests.
#[derive(Clone)]
pub struct ProxyConfig {
    pub(crate) pool: Arc<dyn BackendPool>,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path_prefix: Option<String>,
    pub strip_path: Option<String>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub protocols: Protocols,
    pub verify_tls: bool,
    pub add_headers: Vec<(HeaderName, HeaderValue)>,
    /// Lowercased at build time.
    pub remove_headers: Vec<String>,
    pub max_body_size: Option<usize>,
    pub error_response: (StatusCode, String),
}

impl ProxyConfig {
    /// Parse and validate the options bag against the supplied pool handle.
    ///
    /// Fails with the first violation; failures are fatal at mount time.
    pub fn build(pool: Arc<dyn BackendPool>, options: ProxyOptions) -> Result<Self, ConfigError> {
        validation::resolve(pool, options)
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path_prefix", &self.path_prefix)
            .field("strip_path", &self.strip_path)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("protocols", &self.protocols)
            .field("verify_tls", &self.verify_tls)
            .field("add_headers", &self.add_headers)
            .field("remove_headers", &self.remove_headers)
            .field("max_body_size", &self.max_body_size)
            .field("error_response", &self.error_response)
            .finish_non_exhaustive()
    }
}
