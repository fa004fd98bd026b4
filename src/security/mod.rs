//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (per-client token bucket, before any backend work)
//!     → limits.rs (bounded body read)
//!     → headers.rs (strip hop-by-hop, add X-Forwarded-*)
//!     → Forward
//!
//! Outgoing response:
//!     → headers.rs (strip hop-by-hop, add security headers)
//! ```
//!
//! # Design Decisions
//! - Rate limiting never depends on backend state
//! - Fail closed: reject on any limit violation

pub mod headers;
pub mod limits;
pub mod rate_limit;

pub use rate_limit::{Admission, BucketParams, RateLimiter};
