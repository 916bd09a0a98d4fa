//! HTTP re-origination engine.
//!
//! # Phases
//! - **A**: read the inbound body up to `max_body_size`. Fits → buffered
//!   fast path. Overflows → streaming path, with the already-read bytes as
//!   the first relayed chunk. Read error → 400.
//! - **B (buffered)**: one pooled call bounded by `timeout`, response
//!   passed back as a single send with hop-by-hop headers filtered.
//! - **C (streaming)**: a dedicated one-shot connection; request and
//!   response bodies are relayed in bounded chunks under one wall-clock
//!   budget for the whole phase.
//!
//! Backend statuses are never rewritten; only transport failures produce
//! the configured error response.

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::http::upstream::{self, BoxError, ConnGuard, RelayBody};
use crate::http::{headers, path};
use axum::body::{Body, BodyDataStream};
use axum::http::header::CONTENT_LENGTH;
use axum::http::uri::Scheme;
use axum::http::{HeaderMap, Method, Request, Response, StatusCode};
use axum::response::IntoResponse;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream, StreamExt};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Chunk size for the streaming relay in both directions.
const STREAM_CHUNK: usize = 64 * 1024;

/// Re-originate one inbound HTTP request against the backend.
pub(crate) async fn proxy(
    cfg: Arc<ProxyConfig>,
    remote: Option<SocketAddr>,
    request: Request<Body>,
) -> Response<Body> {
    let (parts, body) = request.into_parts();
    let inbound_https = parts.uri.scheme() == Some(&Scheme::HTTPS);
    let out_headers = headers::prepare_outbound(
        &cfg,
        &parts.headers,
        remote.map(|addr| addr.ip()),
        inbound_https,
    );
    let rewritten = path::rewrite(&cfg, parts.uri.path());
    let target = path::with_query(rewritten, parts.uri.query());

    // Phase A: buffer the request body until it ends or crosses the limit.
    let mut body_stream = body.into_data_stream();
    let mut buffered = BytesMut::new();
    let mut spill: Option<Bytes> = None;
    loop {
        match body_stream.next().await {
            None => break,
            Some(Err(e)) => {
                let err = ProxyError::ClientBodyRead(e);
                debug!(error = %err, "rejecting request");
                return (StatusCode::BAD_REQUEST, "Bad Request".to_string()).into_response();
            }
            Some(Ok(chunk)) => match cfg.max_body_size {
                Some(limit) if buffered.len() + chunk.len() > limit => {
                    spill = Some(chunk);
                    break;
                }
                _ => buffered.extend_from_slice(&chunk),
            },
        }
    }

    match spill {
        None => buffered_proxy(&cfg, parts.method, &target, out_headers, buffered.freeze()).await,
        Some(chunk) => {
            streaming_proxy(
                &cfg,
                parts.method,
                &target,
                out_headers,
                buffered.freeze(),
                chunk,
                body_stream,
            )
            .await
        }
    }
}

/// Phase B: submit the fully buffered request through the pool.
async fn buffered_proxy(
    cfg: &ProxyConfig,
    method: Method,
    target: &str,
    out_headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    let deadline = tokio::time::Instant::now() + cfg.timeout;
    let uri = upstream::backend_uri(cfg, target);

    let mut builder = Request::builder().method(method).uri(uri.as_str());
    if let Some(h) = builder.headers_mut() {
        *h = out_headers;
    }
    let outbound = match builder.body(Body::from(body)) {
        Ok(request) => request,
        Err(e) => {
            warn!(uri = %uri, error = %e, "failed to assemble backend request");
            return failure_response(cfg);
        }
    };

    let response = match tokio::time::timeout_at(deadline, cfg.pool.issue(outbound)).await {
        Err(_) => {
            warn!(uri = %uri, "backend call timed out");
            return failure_response(cfg);
        }
        Ok(Err(e)) => {
            warn!(uri = %uri, error = %e, "backend call failed");
            return failure_response(cfg);
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    let response_headers = headers::filter_response(response.headers());

    let collected = match tokio::time::timeout_at(deadline, response.into_body().collect()).await {
        Err(_) => {
            warn!(uri = %uri, "backend response timed out");
            return failure_response(cfg);
        }
        Ok(Err(e)) => {
            let err = ProxyError::BackendResponse(e.to_string());
            warn!(uri = %uri, error = %err, "failed to read backend response");
            return failure_response(cfg);
        }
        Ok(Ok(collected)) => collected.to_bytes(),
    };

    assemble(status, response_headers, Body::from(collected))
}

/// Phase C: relay an oversized request body over a dedicated connection and
/// stream the response back chunk-by-chunk.
async fn streaming_proxy(
    cfg: &ProxyConfig,
    method: Method,
    target: &str,
    mut out_headers: HeaderMap,
    head: Bytes,
    spill: Bytes,
    rest: BodyDataStream,
) -> Response<Body> {
    let deadline = tokio::time::Instant::now() + cfg.timeout;
    let uri = upstream::backend_uri(cfg, target);
    debug!(uri = %uri, buffered = head.len(), "request body over limit, switching to streaming path");

    // The relayed body is re-chunked; the original length no longer applies.
    out_headers.remove(CONTENT_LENGTH);

    let mut builder = Request::builder().method(method).uri(uri.as_str());
    if let Some(h) = builder.headers_mut() {
        *h = out_headers;
    }
    let outbound = match builder.body(relay_body(head, spill, rest)) {
        Ok(request) => request,
        Err(e) => {
            warn!(uri = %uri, error = %e, "failed to assemble streaming request");
            return failure_response(cfg);
        }
    };

    match upstream::send_oneshot(cfg, outbound, deadline).await {
        Err(e) => {
            warn!(uri = %uri, error = %e, "streaming backend call failed");
            failure_response(cfg)
        }
        Ok((response, guard)) => {
            let status = response.status();
            let response_headers = headers::filter_response(response.headers());
            let body = Body::from_stream(forward_body(response.into_body(), guard, deadline));
            assemble(status, response_headers, body)
        }
    }
}

/// Request body for the streaming path: buffered head, the chunk that
/// crossed the limit, then the rest of the inbound stream. No data loss,
/// and nothing is read from the client before the previous write completed.
fn relay_body(head: Bytes, spill: Bytes, rest: BodyDataStream) -> RelayBody {
    let lead: Vec<Result<Frame<Bytes>, BoxError>> = split_chunks(head)
        .chain(split_chunks(spill))
        .map(|chunk| Ok(Frame::data(chunk)))
        .collect();

    let tail = rest.flat_map(|item| {
        let frames: Vec<Result<Frame<Bytes>, BoxError>> = match item {
            Ok(chunk) => split_chunks(chunk).map(|c| Ok(Frame::data(c))).collect(),
            Err(e) => vec![Err(BoxError::from(e))],
        };
        stream::iter(frames)
    });

    StreamBody::new(stream::iter(lead).chain(tail).boxed())
}

fn split_chunks(mut bytes: Bytes) -> impl Iterator<Item = Bytes> {
    std::iter::from_fn(move || {
        if bytes.is_empty() {
            None
        } else {
            Some(bytes.split_to(bytes.len().min(STREAM_CHUNK)))
        }
    })
}

/// Forward the backend response body to the client under the phase
/// deadline. Dropping the stream drops the guard, which closes the
/// one-shot connection.
fn forward_body(
    incoming: Incoming,
    guard: ConnGuard,
    deadline: tokio::time::Instant,
) -> impl Stream<Item = Result<Bytes, BoxError>> {
    stream::unfold(Some((incoming, guard)), move |state| async move {
        let (mut incoming, guard) = state?;
        loop {
            match tokio::time::timeout_at(deadline, incoming.frame()).await {
                Err(_) => {
                    warn!("streaming phase exceeded its time budget, aborting relay");
                    return Some((Err(BoxError::from(ProxyError::Timeout)), None));
                }
                Ok(None) => return None,
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "backend response ended mid-stream");
                    return Some((Err(BoxError::from(e)), None));
                }
                Ok(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => return Some((Ok(data), Some((incoming, guard)))),
                    // Trailers are not forwarded.
                    Err(_) => continue,
                },
            }
        }
    })
}

fn assemble(status: StatusCode, response_headers: HeaderMap, body: Body) -> Response<Body> {
    let mut builder = Response::builder().status(status);
    if let Some(h) = builder.headers_mut() {
        *h = response_headers;
    }
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// The configured response for a backend-origin failure.
fn failure_response(cfg: &ProxyConfig) -> Response<Body> {
    let (status, reason) = &cfg.error_response;
    (*status, format!("{reason}: Request failed")).into_response()
}
