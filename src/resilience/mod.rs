//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Attempt against a backend:
//!     → timeouts.rs (connect, send and receive deadlines)
//!     → On failure: retries.rs (retryable? next backend after backoff.rs delay)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every backend call has a deadline
//! - Retries target the next backend in rotation, never the same one twice in a row

pub mod backoff;
pub mod retries;
pub mod timeouts;

pub use retries::RetryPolicy;
pub use timeouts::{AttemptPhase, PhaseTimeouts};
