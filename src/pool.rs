//! Connection-pool seam for buffered HTTP re-origination.
//!
//! The pool is an external collaborator: the proxy borrows one pooled
//! connection per buffered call and never manages keep-alive or HTTP/2
//! multiplexing itself. `BackendPool` is the contract the engine consumes;
//! any hyper-util legacy `Client` satisfies it, so hosts can hand in a
//! client they already share with the rest of their application.

use axum::body::Body;
use axum::http::Request;
use futures_util::future::BoxFuture;
use hyper::body::Incoming;
use hyper::Response;
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;

/// Error produced by a pool submission.
pub type PoolError = Box<dyn std::error::Error + Send + Sync>;

/// A handle to a pooled HTTP client.
///
/// One `issue` call submits one request and resolves with the backend's
/// response head plus its (still streaming) body. The lease on the
/// underlying connection is returned to the pool when the response body
/// is dropped or fully read.
pub trait BackendPool: Send + Sync + 'static {
    fn issue(&self, request: Request<Body>) -> BoxFuture<'static, Result<Response<Incoming>, PoolError>>;
}

impl<C> BackendPool for Client<C, Body>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    fn issue(&self, request: Request<Body>) -> BoxFuture<'static, Result<Response<Incoming>, PoolError>> {
        let fut = self.request(request);
        Box::pin(async move { fut.await.map_err(PoolError::from) })
    }
}

/// Build a plain-HTTP pooled client suitable for `ProxyConfig::build`.
///
/// Hosts that proxy to an `https` backend should construct their own
/// client over a TLS-capable connector instead.
pub fn default_pool() -> Arc<dyn BackendPool> {
    let client: Client<HttpConnector, Body> =
        Client::builder(TokioExecutor::new()).build(HttpConnector::new());
    Arc::new(client)
}
