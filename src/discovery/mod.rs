//! Dynamic backend discovery.
//!
//! # Data Flow
//! ```text
//! [[discovery]] entry
//!     → dns.rs (resolve host every refresh_secs)
//!     → pool.set_members(Discovery(name), specs)
//!     → membership watch → health monitor reconciles probes
//! ```
//!
//! # Design Decisions
//! - Each entry owns its own membership source; static backends are never touched
//! - A failed resolution keeps the previous members

pub mod dns;

pub use dns::{resolve, DiscoveryError, DnsDiscovery};
