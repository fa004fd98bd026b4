//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind)
//!     → Axum serves HTTP/1.1 and HTTP/2 on it
//!     → connection.rs (in-flight tracking for drain on shutdown)
//! ```

pub mod connection;
pub mod listener;

pub use connection::{InFlightGuard, InFlightTracker};
pub use listener::{bind, ListenerError};
