//! One-shot backend connections for the streaming path.
//!
//! Unlike the buffered path, which borrows from the shared pool, streaming
//! requests get a dedicated connection: TCP dial bounded by the connect
//! timeout, optional TLS, then a hyper `client::conn` handshake. The
//! connection is driven by a background task whose guard aborts it when
//! the response relay is dropped, so the socket is released on every exit
//! path including client cancellation.

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::http::headers;
use axum::http::Request;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use http_body_util::StreamBody;
use hyper::body::{Frame, Incoming};
use hyper::client::conn::{http1, http2};
use hyper::Response;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::debug;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request body for the streaming path: the buffered head plus the relayed
/// inbound chunks, re-cut to the engine's chunk size.
pub(crate) type RelayBody = StreamBody<BoxStream<'static, Result<Frame<Bytes>, BoxError>>>;

/// Keeps the background connection task alive for as long as the response
/// is being relayed; aborting on drop closes the one-shot connection.
pub(crate) struct ConnGuard(JoinHandle<()>);

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Sender {
    H1(http1::SendRequest<RelayBody>),
    H2(http2::SendRequest<RelayBody>),
}

impl Sender {
    async fn send(&mut self, request: Request<RelayBody>) -> hyper::Result<Response<Incoming>> {
        match self {
            Sender::H1(sender) => sender.send_request(request).await,
            Sender::H2(sender) => sender.send_request(request).await,
        }
    }
}

/// Open a fresh connection, submit the streaming request, and return the
/// response head together with the connection guard. The deadline is the
/// wall clock for the whole streaming phase.
pub(crate) async fn send_oneshot(
    cfg: &ProxyConfig,
    request: Request<RelayBody>,
    deadline: tokio::time::Instant,
) -> Result<(Response<Incoming>, ConnGuard), ProxyError> {
    let tcp = dial(cfg).await?;

    let (mut sender, guard) = if cfg.scheme.is_tls() {
        let connector = tls_connector(cfg)?;
        let server_name = ServerName::try_from(cfg.host.clone())
            .map_err(|_| ProxyError::BackendConnect(format!("invalid TLS server name {:?}", cfg.host)))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::BackendConnect(format!("TLS handshake failed: {e}")))?;
        handshake(cfg, tls).await?
    } else {
        handshake(cfg, tcp).await?
    };

    let response = tokio::time::timeout_at(deadline, sender.send(request))
        .await
        .map_err(|_| ProxyError::Timeout)?
        .map_err(ProxyError::BackendRequest)?;

    Ok((response, guard))
}

async fn dial(cfg: &ProxyConfig) -> Result<TcpStream, ProxyError> {
    let addr = (cfg.host.as_str(), cfg.port);
    match tokio::time::timeout(cfg.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::BackendConnect(e.to_string())),
        Err(_) => Err(ProxyError::BackendConnect("connect timed out".to_string())),
    }
}

async fn handshake<S>(cfg: &ProxyConfig, io: S) -> Result<(Sender, ConnGuard), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(io);
    if cfg.protocols.http2_only() {
        let (sender, conn) = http2::handshake(TokioExecutor::new(), io)
            .await
            .map_err(|e| ProxyError::BackendConnect(e.to_string()))?;
        let handle = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "one-shot backend connection ended");
            }
        });
        Ok((Sender::H2(sender), ConnGuard(handle)))
    } else {
        let (sender, conn) = http1::handshake(io)
            .await
            .map_err(|e| ProxyError::BackendConnect(e.to_string()))?;
        let handle = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "one-shot backend connection ended");
            }
        });
        Ok((Sender::H1(sender), ConnGuard(handle)))
    }
}

fn tls_connector(cfg: &ProxyConfig) -> Result<TlsConnector, ProxyError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    if !cfg.verify_tls {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    config.alpn_protocols = if cfg.protocols.http2_only() {
        vec![b"h2".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts everything. Installed only when the
/// mount sets `verify_tls = false`.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Absolute URI for a backend request.
pub(crate) fn backend_uri(cfg: &ProxyConfig, path_and_query: &str) -> String {
    format!(
        "{}://{}{}",
        cfg.scheme.http_scheme(),
        headers::authority(cfg),
        path_and_query
    )
}
