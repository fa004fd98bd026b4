//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Round-robin selector.
/// Stores an internal counter to rotate through backends.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn plan(&self, candidates: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
        if candidates.is_empty() {
            return Vec::new();
        }

        // One counter step per request; retries walk the rest of the rotation.
        let start = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[start..]
            .iter()
            .chain(candidates[..start].iter())
            .cloned()
            .collect()
    }
}
