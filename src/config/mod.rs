//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! options bag (host-supplied, serde-friendly)
//!     → validation.rs (parse backend URL, semantic checks)
//!     → ProxyConfig (resolved, immutable)
//!     → shared via Arc to the dispatcher, engine and tunnel
//! ```
//!
//! Config is immutable once built; remounting is the only way to change it.

pub mod schema;
pub mod validation;

pub use schema::{Protocol, Protocols, ProxyConfig, ProxyOptions, Scheme};
pub use validation::ConfigError;
