//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → backend_group identified
//!     → pool.rs (current snapshot, wait-free)
//!     → BackendSelector (routable backends of the group, or the no-healthy policy)
//!     → round_robin.rs (rotation order for this request)
//!     → Forwarder walks the rotation, one backend per attempt
//! ```
//!
//! # Design Decisions
//! - The pool owns all state; selectors only hold a rotation counter
//! - One rotation counter per backend group
//! - Unhealthy backends are never selected
//! - Fail-open vs fail-closed is configuration, never inferred

pub mod backend;
pub mod pool;
pub mod round_robin;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::NoHealthyPolicy;
use crate::health::state::HealthStatus;

pub use backend::{Backend, BackendSpec};
pub use pool::{BackendPool, MembershipSource, PoolError, PoolSnapshot};

use self::round_robin::RoundRobin;

/// A backend ordering strategy.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    /// Order the candidates for one request. Attempt `n` uses entry `n % len`.
    fn plan(&self, candidates: &[Arc<Backend>]) -> Vec<Arc<Backend>>;
}

/// Backends chosen for one request.
#[derive(Debug)]
pub enum Selection {
    /// Healthy (or Suspect) backends in rotation order.
    Routable(Vec<Arc<Backend>>),
    /// Fail-open fallback: Recovering backends in rotation order.
    Degraded(Vec<Arc<Backend>>),
    /// Nothing eligible under the configured policy.
    Unavailable,
}

/// Applies the selection policy to a pool snapshot.
#[derive(Debug)]
pub struct BackendSelector {
    policy: NoHealthyPolicy,
    balancers: HashMap<String, Box<dyn LoadBalancer>>,
}

impl BackendSelector {
    /// Create a selector with one rotation per backend group.
    pub fn new<'a>(policy: NoHealthyPolicy, groups: impl IntoIterator<Item = &'a str>) -> Self {
        let balancers = groups
            .into_iter()
            .map(|g| (g.to_string(), Box::new(RoundRobin::new()) as Box<dyn LoadBalancer>))
            .collect();
        Self { policy, balancers }
    }

    pub fn policy(&self) -> NoHealthyPolicy {
        self.policy
    }

    pub fn select(&self, snapshot: &PoolSnapshot, group: &str) -> Selection {
        let Some(balancer) = self.balancers.get(group) else {
            tracing::debug!(group = %group, "Group not found in selector");
            return Selection::Unavailable;
        };

        let routable = snapshot.group_where(group, HealthStatus::is_routable);
        if !routable.is_empty() {
            return Selection::Routable(balancer.plan(&routable));
        }

        if self.policy == NoHealthyPolicy::FailOpen {
            let recovering = snapshot.group_where(group, |s| s == HealthStatus::Recovering);
            if !recovering.is_empty() {
                return Selection::Degraded(balancer.plan(&recovering));
            }
        }
        Selection::Unavailable
    }
}
