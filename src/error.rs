//! Error types for the proxy core.

use thiserror::Error;

/// Errors raised while re-originating a request or brokering a tunnel.
///
/// These are internal: the dispatcher and engine map them onto plain-text
/// HTTP responses (or a tunnel teardown) at the boundary. Upstream 4xx/5xx
/// statuses are not errors and pass through untouched.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to read client request body: {0}")]
    ClientBodyRead(axum::Error),

    #[error("backend connect failed: {0}")]
    BackendConnect(String),

    #[error("backend request failed: {0}")]
    BackendRequest(#[from] hyper::Error),

    #[error("backend response failed: {0}")]
    BackendResponse(String),

    #[error("request timed out")]
    Timeout,

    #[error("backend rejected WebSocket upgrade with status {0}")]
    UpgradeRejected(u16),

    #[error("tunnel I/O error: {0}")]
    TunnelIo(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
