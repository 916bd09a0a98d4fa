//! WebSocket tunnelling.
//!
//! One task owns both ends of a tunnel. The client side is already
//! upgraded when the task starts (the host framework accepted the upgrade
//! before any backend I/O), so the backend upgrade runs opportunistically:
//! client frames that arrive before the backend's 101 are parked in a FIFO
//! and replayed on activation. After that the task brokers frames in both
//! directions until either side closes or errors.
//!
//! State machine per tunnel:
//!
//! ```text
//! INIT ─connect backend──► AWAITING_101 ─101──► OPEN ─close/error──► CLOSED
//!                                       └non-101 / timeout──► FAILED
//! ```

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::http::{headers, path};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::http::HeaderMap;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message as TgMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Options handed to the tunnel by the dispatcher.
pub(crate) struct TunnelParams {
    pub config: Arc<ProxyConfig>,
    /// The client's request headers, pre-filtering.
    pub headers: HeaderMap,
    pub path: String,
    pub query: Option<String>,
}

type BackendWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Drive one tunnel to completion. Runs inside the host framework's
/// post-upgrade task; when it returns, both sockets are released.
pub(crate) async fn run(client: WebSocket, params: TunnelParams) {
    let cfg = params.config.clone();
    let (mut c_sink, mut c_stream) = client.split();

    let request = match upgrade_request(&params) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "failed to build backend upgrade request");
            let _ = c_sink.send(Message::Close(None)).await;
            return;
        }
    };

    // AWAITING_101: the backend upgrade races the client's first frames.
    let connect = connect_backend(cfg.clone(), request);
    tokio::pin!(connect);
    let mut pending: VecDeque<TgMessage> = VecDeque::new();

    let backend = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok(backend) => break backend,
                Err(e) => {
                    warn!(backend = %cfg.host, error = %e, "backend WebSocket upgrade failed");
                    let _ = c_sink.send(Message::Close(None)).await;
                    return;
                }
            },
            frame = c_stream.next() => match frame {
                Some(Ok(Message::Close(_))) => {
                    debug!("client closed before backend upgrade completed");
                    return;
                }
                // Control frames are not worth parking; the codec on the
                // open tunnel answers pings itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(message)) => pending.push_back(client_to_backend(message)),
                Some(Err(e)) => {
                    debug!(error = %e, "client socket error before activation");
                    return;
                }
                None => {
                    debug!("client disconnected before activation");
                    return;
                }
            },
        }
    };

    let (mut b_sink, mut b_stream) = backend.split();

    // Activation: replay parked frames, oldest first, before anything live.
    for message in pending {
        if let Err(e) = b_sink.send(message).await {
            warn!(error = %e, "failed to flush pending frames to backend");
            let _ = c_sink.send(Message::Close(None)).await;
            return;
        }
    }

    debug!(backend = %cfg.host, "WebSocket tunnel open");

    loop {
        tokio::select! {
            frame = c_stream.next() => match frame {
                Some(Ok(message)) => {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(e) = b_sink.send(client_to_backend(message)).await {
                        debug!(error = %e, "error forwarding frame to backend");
                        break;
                    }
                    // Close is forwarded; the backend's reply is not awaited.
                    if closing {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "client socket error");
                    let _ = b_sink.send(TgMessage::Close(None)).await;
                    break;
                }
                None => {
                    let _ = b_sink.send(TgMessage::Close(None)).await;
                    break;
                }
            },
            frame = b_stream.next() => match frame {
                Some(Ok(message)) => {
                    let closing = matches!(message, TgMessage::Close(_));
                    if let Some(forward) = backend_to_client(message) {
                        if c_sink.send(forward).await.is_err() {
                            break;
                        }
                    }
                    if closing {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "backend socket error");
                    let _ = c_sink.send(Message::Close(None)).await;
                    break;
                }
                None => {
                    let _ = c_sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    // Release the dedicated backend connection exactly once.
    let _ = b_sink.close().await;
    info!(backend = %cfg.host, "WebSocket tunnel closed");
}

/// Build the upgrade request toward the backend.
///
/// Carried headers are the client's after hop-by-hop and `sec-websocket-*`
/// filtering; the WebSocket client generates its own key and version and
/// validates the accept header. Host comes from the URI authority.
fn upgrade_request(params: &TunnelParams) -> Result<tungstenite::handshake::client::Request, ProxyError> {
    let cfg = &params.config;
    let rewritten = path::rewrite(cfg, &params.path);
    let target = path::with_query(rewritten, params.query.as_deref());
    let uri = format!(
        "{}://{}{}",
        cfg.scheme.ws_scheme(),
        headers::authority(cfg),
        target
    );
    let mut request = uri.into_client_request()?;
    let carried = headers::prepare_upgrade(cfg, &params.headers);
    request.headers_mut().extend(carried);
    Ok(request)
}

async fn connect_backend(
    cfg: Arc<ProxyConfig>,
    request: tungstenite::handshake::client::Request,
) -> Result<BackendWs, ProxyError> {
    match tokio::time::timeout(cfg.timeout, connect_async(request)).await {
        Ok(Ok((backend, response))) => {
            debug!(status = %response.status(), "backend accepted WebSocket upgrade");
            Ok(backend)
        }
        Ok(Err(tungstenite::Error::Http(response))) => {
            Err(ProxyError::UpgradeRejected(response.status().as_u16()))
        }
        Ok(Err(e)) => Err(ProxyError::TunnelIo(e)),
        Err(_) => Err(ProxyError::Timeout),
    }
}

fn client_to_backend(message: Message) -> TgMessage {
    match message {
        Message::Text(text) => TgMessage::Text(text.to_string().into()),
        Message::Binary(data) => TgMessage::Binary(data),
        Message::Ping(data) => TgMessage::Ping(data),
        Message::Pong(data) => TgMessage::Pong(data),
        Message::Close(frame) => TgMessage::Close(frame.map(close_to_backend)),
    }
}

fn backend_to_client(message: TgMessage) -> Option<Message> {
    match message {
        TgMessage::Text(text) => Some(Message::Text(text.to_string().into())),
        TgMessage::Binary(data) => Some(Message::Binary(data)),
        TgMessage::Ping(data) => Some(Message::Ping(data)),
        TgMessage::Pong(data) => Some(Message::Pong(data)),
        TgMessage::Close(frame) => Some(Message::Close(frame.map(close_to_client))),
        TgMessage::Frame(_) => None,
    }
}

fn close_to_backend(frame: CloseFrame) -> tungstenite::protocol::CloseFrame {
    tungstenite::protocol::CloseFrame {
        code: frame.code.into(),
        reason: frame.reason.to_string().into(),
    }
}

fn close_to_client(frame: tungstenite::protocol::CloseFrame) -> CloseFrame {
    CloseFrame {
        code: frame.code.into(),
        reason: frame.reason.to_string().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, ProxyOptions};
    use crate::pool::default_pool;
    use axum::http::header::{HeaderName, HeaderValue};

    fn params(backend: &str, pairs: &[(&str, &str)]) -> TunnelParams {
        let options = ProxyOptions {
            backend: backend.to_string(),
            ..ProxyOptions::default()
        };
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                HeaderName::try_from(*name).unwrap(),
                HeaderValue::try_from(*value).unwrap(),
            );
        }
        TunnelParams {
            config: Arc::new(ProxyConfig::build(default_pool(), options).unwrap()),
            headers,
            path: "/ws".to_string(),
            query: None,
        }
    }

    #[test]
    fn upgrade_request_targets_ws_scheme_and_rewritten_path() {
        let p = params("http://127.0.0.1:4001/base", &[]);
        let request = upgrade_request(&p).unwrap();
        assert_eq!(request.uri().to_string(), "ws://127.0.0.1:4001/base/ws");
    }

    #[test]
    fn upgrade_request_carries_query_verbatim() {
        let mut p = params("http://127.0.0.1:4001", &[]);
        p.query = Some("room=7&x=%20".to_string());
        let request = upgrade_request(&p).unwrap();
        assert_eq!(
            request.uri().to_string(),
            "ws://127.0.0.1:4001/ws?room=7&x=%20"
        );
    }

    #[test]
    fn upgrade_request_filters_handshake_headers() {
        let p = params(
            "https://backend.example",
            &[
                ("sec-websocket-key", "abc=="),
                ("sec-websocket-version", "13"),
                ("connection", "Upgrade"),
                ("upgrade", "websocket"),
                ("cookie", "sid=1"),
            ],
        );
        let request = upgrade_request(&p).unwrap();
        assert_eq!(request.uri().scheme_str(), Some("wss"));
        assert!(request.headers().get("sec-websocket-key").is_none());
        assert!(request.headers().get("connection").is_none());
        assert_eq!(request.headers().get("cookie").unwrap(), "sid=1");
    }

    #[test]
    fn text_frames_convert_both_ways() {
        let tg = client_to_backend(Message::Text("hi".into()));
        assert!(matches!(&tg, TgMessage::Text(t) if t.as_str() == "hi"));
        let back = backend_to_client(tg).unwrap();
        assert!(matches!(back, Message::Text(t) if t.as_str() == "hi"));
    }

    #[test]
    fn close_frames_keep_code_and_reason() {
        let close = Message::Close(Some(CloseFrame {
            code: 1001,
            reason: "going away".into(),
        }));
        match client_to_backend(close) {
            TgMessage::Close(Some(frame)) => {
                let code: u16 = frame.code.into();
                assert_eq!(code, 1001);
                assert_eq!(frame.reason.as_str(), "going away");
            }
            other => panic!("unexpected conversion: {other:?}"),
        }
    }

    #[test]
    fn control_frames_are_forwarded() {
        let ping = backend_to_client(TgMessage::Ping(vec![1u8].into()));
        assert!(matches!(ping, Some(Message::Ping(_))));
        let pong = client_to_backend(Message::Pong(vec![2u8].into()));
        assert!(matches!(pong, TgMessage::Pong(_)));
    }
}
