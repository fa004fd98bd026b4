//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request id, tracing span)
//!     → request.rs (request context)
//!     → [routing + rate limiting + backend selection]
//!     → proxy.rs (forward with retry)
//!     → response.rs (stream back, strip hop-by-hop)
//!     → Send to client
//! ```

pub mod proxy;
pub mod request;
pub mod response;
pub mod server;

pub use request::{RequestContext, RequestOutcome, X_REQUEST_ID};
pub use server::{AppState, HttpServer};
