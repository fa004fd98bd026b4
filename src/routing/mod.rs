//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path)
//!     → router.rs (route lookup)
//!     → matcher.rs (evaluate match conditions)
//!     → Return: matched Route (group + limiter) or no match (404)
//!
//! Route Compilation (at startup):
//!     RouteConfig[]
//!     → Sort by priority, then prefix length
//!     → Attach shared or per-route rate limiter
//!     → Freeze as immutable RouteTable
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - No regex in hot path (prefix matching only)
//! - First match wins

pub mod matcher;
pub mod router;

pub use router::{Route, RouteTable};
