//! Protocol dispatch and the embeddable mount surface.
//!
//! Every inbound request takes exactly one of two paths: WebSocket
//! upgrades hand the connection to the tunnel, everything else runs the
//! HTTP engine synchronously within the request. The response returned
//! here is final; no later proxy stage touches it.

use crate::config::ProxyConfig;
use crate::http::websocket::{self, TunnelParams};
use crate::http::engine;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, State};
use axum::http::header::{CONNECTION, UPGRADE};
use axum::http::{HeaderMap, Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// An embeddable reverse proxy for one backend origin.
///
/// Build once at mount time with [`ProxyConfig::build`], then either mount
/// [`into_router`](Self::into_router) inside a larger axum application
/// (typically via `Router::nest`) or call [`handle`](Self::handle) from an
/// existing handler.
#[derive(Clone)]
pub struct ReverseProxy {
    config: Arc<ProxyConfig>,
}

impl ReverseProxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Dispatch one inbound request.
    ///
    /// The remote address is read from the request's
    /// [`ConnectInfo`] extension when present; without it the
    /// `x-forwarded-for` header is not injected.
    pub async fn handle(&self, request: Request<Body>) -> Response<Body> {
        dispatch(self.config.clone(), request).await
    }

    /// A catch-all router around [`handle`](Self::handle), ready to nest
    /// under a path prefix. Serve with
    /// `into_make_service_with_connect_info::<SocketAddr>()` to supply
    /// remote addresses.
    pub fn into_router(self) -> Router {
        Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .with_state(self.config)
    }
}

async fn proxy_handler(
    State(config): State<Arc<ProxyConfig>>,
    request: Request<Body>,
) -> Response<Body> {
    dispatch(config, request).await
}

/// A request is a WebSocket upgrade iff some `connection` value contains
/// the token `upgrade` and some `upgrade` value equals `websocket`, both
/// case-insensitive.
pub(crate) fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });

    let upgrade_websocket = headers
        .get_all(UPGRADE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.trim().eq_ignore_ascii_case("websocket"));

    connection_upgrade && upgrade_websocket
}

async fn dispatch(config: Arc<ProxyConfig>, request: Request<Body>) -> Response<Body> {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    if is_websocket_upgrade(request.headers()) {
        let (mut parts, _body) = request.into_parts();
        let client_headers = parts.headers.clone();
        let request_path = parts.uri.path().to_string();
        let query = parts.uri.query().map(str::to_string);

        match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => {
                debug!(path = %request_path, "dispatching WebSocket upgrade");
                let params = TunnelParams {
                    config,
                    headers: client_headers,
                    path: request_path,
                    query,
                };
                upgrade.on_upgrade(move |socket| websocket::run(socket, params))
            }
            Err(rejection) => {
                warn!(path = %request_path, error = %rejection, "client-side WebSocket upgrade failed");
                (
                    StatusCode::BAD_GATEWAY,
                    "Bad Gateway: WebSocket upgrade failed".to_string(),
                )
                    .into_response()
            }
        }
    } else {
        engine::proxy(config, remote, request).await
    }
}
