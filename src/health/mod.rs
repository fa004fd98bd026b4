//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     One timer per backend
//!     → Probe the kind's health path
//!     → pool.apply_health_update()
//!
//! Passive health checks (passive.rs):
//!     Request attempt failed
//!     → HealthReporter message
//!     → monitor applies pool.apply_health_update()
//!
//! State machine (state.rs):
//!     Healthy → Suspect → Unhealthy → Recovering → Healthy
//!     With thresholds to prevent flapping
//! ```
//!
//! # Design Decisions
//! - Probes never block request handling
//! - Health state is per-backend and lives only in pool snapshots
//! - Probe tasks follow membership: spawned on add, aborted on remove

pub mod active;
pub mod passive;
pub mod state;

pub use active::{HealthMonitor, HealthProfiles};
pub use passive::{HealthReport, HealthReporter};
pub use state::{HealthOutcome, HealthStatus, HealthThresholds};
