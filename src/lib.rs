//! Embeddable HTTP/1.1, HTTP/2 and WebSocket reverse proxy.
//!
//! Terminates inbound requests and re-originates them against a single
//! configured backend origin. Mountable inside a larger axum application
//! rather than run as a standalone binary.
//!
//! ```no_run
//! use reorigin::{default_pool, ProxyConfig, ProxyOptions, ReverseProxy};
//!
//! # async fn mount() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ProxyOptions {
//!     backend: "http://127.0.0.1:4001".to_string(),
//!     strip_path: Some("/app".to_string()),
//!     ..ProxyOptions::default()
//! };
//! let config = ProxyConfig::build(default_pool(), options)?;
//! let app = axum::Router::new().merge(ReverseProxy::new(config).into_router());
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:4000").await?;
//! axum::serve(
//!     listener,
//!     app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod pool;

pub use config::{ConfigError, ProxyConfig, ProxyOptions};
pub use error::ProxyError;
pub use http::ReverseProxy;
pub use pool::{default_pool, BackendPool};
