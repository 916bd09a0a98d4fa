//! Shared backends and proxy harness for integration tests.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use reorigin::{default_pool, ProxyConfig, ProxyOptions, ReverseProxy};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;

/// Start the echo backend on an ephemeral port.
pub async fn start_backend() -> SocketAddr {
    let app = Router::new()
        .route("/hello", get(|| async { "Hello from backend!" }))
        .route("/echo", post(echo))
        .route("/headers", get(reflect_headers))
        .route("/api/status", get(|| async { Json(json!({"status": "ok"})) }))
        .route("/slow", get(slow))
        .route("/ws", any(ws_upgrade));
    serve(app).await
}

/// Build a resolved config and serve the proxy on an ephemeral port.
pub async fn start_proxy(options: ProxyOptions) -> SocketAddr {
    let config = ProxyConfig::build(default_pool(), options).unwrap();
    serve(ReverseProxy::new(config).into_router()).await
}

/// Minimal options pointing at a test backend.
pub fn options_for(backend: SocketAddr) -> ProxyOptions {
    ProxyOptions {
        backend: format!("http://{backend}"),
        ..ProxyOptions::default()
    }
}

/// HTTP client that ignores any ambient proxy configuration.
#[allow(dead_code)]
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn echo(body: String) -> Json<Value> {
    Json(json!({ "echo": body }))
}

async fn reflect_headers(headers: HeaderMap) -> Json<Value> {
    let mut map = serde_json::Map::new();
    for (name, value) in &headers {
        map.insert(name.to_string(), json!(value.to_str().unwrap_or("")));
    }
    Json(json!({ "headers": map }))
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(2)).await;
    "late"
}

async fn ws_upgrade(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(ws_echo)
}

/// Echo server matching the proxy's contract tests: text frames come back
/// prefixed, binary frames come back verbatim.
async fn ws_echo(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        let reply = match message {
            Message::Text(text) => Message::Text(format!("Backend echo: {text}").into()),
            Message::Binary(data) => Message::Binary(data),
            Message::Close(_) => break,
            _ => continue,
        };
        if socket.send(reply).await.is_err() {
            break;
        }
    }
}
