//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! inbound request (host framework)
//!     → dispatch.rs (upgrade detection, route to engine or tunnel)
//!     → engine.rs (buffered or streaming re-origination)
//!       or websocket.rs (backend upgrade + frame broker)
//!     → headers.rs / path.rs (pure rewrite policy, used by both)
//!     → response sealed back to the host
//! ```

pub mod dispatch;
pub mod engine;
pub mod headers;
pub mod path;
pub mod upstream;
pub mod websocket;

pub use dispatch::ReverseProxy;
