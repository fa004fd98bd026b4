//! Backend health state machine.
//!
//! # State Transitions
//! ```text
//! Healthy    --failure, count < F-->   Suspect
//! Healthy    --failures >= F-->        Unhealthy
//! Suspect    --success-->              Healthy
//! Suspect    --failures reach F-->     Unhealthy
//! Unhealthy  --probe succeeds-->       Recovering
//! Recovering --successes >= S-->       Healthy
//! Recovering --probe fails-->          Unhealthy
//! ```
//!
//! The success that lifts a backend out of Unhealthy is the first of the S successes,
//! so a backend needs exactly S consecutive successes to return to Healthy.

use serde::{Deserialize, Serialize};

/// Health of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Suspect,
    Unhealthy,
    Recovering,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Suspect => "suspect",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Recovering => "recovering",
        }
    }

    /// Healthy and Suspect backends receive traffic.
    pub fn is_routable(self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Suspect)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// F and S.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// Consecutive failures before Unhealthy.
    pub unhealthy: u32,
    /// Consecutive successes before Recovering becomes Healthy.
    pub healthy: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            unhealthy: 5,
            healthy: 5,
        }
    }
}

/// What happened to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    ProbeSucceeded,
    ProbeFailed,
    /// A proxied request attempt failed (connect, send or receive).
    RequestFailed,
}

impl HealthOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, HealthOutcome::ProbeSucceeded)
    }

    pub fn is_probe(self) -> bool {
        !matches!(self, HealthOutcome::RequestFailed)
    }
}

/// Status plus the consecutive counters that drive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

impl HealthRecord {
    /// Apply one outcome and return the next record.
    pub fn apply(self, outcome: HealthOutcome, thresholds: HealthThresholds) -> Self {
        if outcome.is_success() {
            self.on_success(thresholds)
        } else {
            self.on_failure(thresholds)
        }
    }

    fn on_success(self, thresholds: HealthThresholds) -> Self {
        let successes = self.consecutive_successes.saturating_add(1);
        let status = match self.status {
            HealthStatus::Healthy | HealthStatus::Suspect => HealthStatus::Healthy,
            HealthStatus::Unhealthy | HealthStatus::Recovering => {
                if successes >= thresholds.healthy {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Recovering
                }
            }
        };
        Self {
            status,
            consecutive_failures: 0,
            consecutive_successes: successes,
        }
    }

    fn on_failure(self, thresholds: HealthThresholds) -> Self {
        let failures = self.consecutive_failures.saturating_add(1);
        let status = match self.status {
            HealthStatus::Healthy | HealthStatus::Suspect => {
                if failures >= thresholds.unhealthy {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Suspect
                }
            }
            HealthStatus::Recovering | HealthStatus::Unhealthy => HealthStatus::Unhealthy,
        };
        Self {
            status,
            consecutive_failures: failures,
            consecutive_successes: 0,
        }
    }
}
