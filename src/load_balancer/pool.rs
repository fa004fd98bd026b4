//! Backend pool management.
//!
//! # Responsibilities
//! - Single source of truth for membership and health of every replica
//! - Publish immutable, versioned snapshots (copy-on-write behind `ArcSwap`)
//! - Apply health updates and membership changes by building a new snapshot
//!
//! Readers call [`BackendPool::current_snapshot`], which never blocks. Writers are
//! serialized by a mutex that is held only while building the next snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::watch;

use crate::health::state::{HealthOutcome, HealthStatus};
use crate::load_balancer::backend::{Backend, BackendSpec};
use crate::observability::metrics;

/// Errors raised by pool writers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("backend pool would be empty")]
    Empty,

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("backend '{id}' has an invalid address '{address}'")]
    InvalidAddress { id: String, address: String },
}

/// Where a group of members came from. Each source replaces only its own members.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MembershipSource {
    /// The `backends` list of the configuration file.
    Static,
    /// A named DNS discovery entry.
    Discovery(String),
}

/// Immutable view of the pool at one point in time.
#[derive(Debug, Default)]
pub struct PoolSnapshot {
    version: u64,
    backends: Vec<Arc<Backend>>,
}

impl PoolSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.id == id)
    }

    /// Backends of one group with the given status predicate, in pool order.
    pub fn group_where(
        &self,
        group: &str,
        predicate: impl Fn(HealthStatus) -> bool,
    ) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|b| b.group == group && predicate(b.status()))
            .cloned()
            .collect()
    }

    /// Backends that currently receive traffic, across all groups.
    pub fn routable_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_routable()).count()
    }
}

/// Result of a health update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthChange {
    pub previous: HealthStatus,
    pub current: HealthStatus,
}

impl HealthChange {
    pub fn is_transition(&self) -> bool {
        self.previous != self.current
    }
}

#[derive(Debug, Default)]
struct Membership {
    sources: BTreeMap<MembershipSource, Vec<BackendSpec>>,
}

/// Manages pool membership and health, publishing snapshots to readers.
#[derive(Debug)]
pub struct BackendPool {
    snapshot: ArcSwap<PoolSnapshot>,
    writer: Mutex<Membership>,
    membership_tx: watch::Sender<u64>,
}

impl BackendPool {
    /// Create a pool from the static member list.
    pub fn new(members: Vec<BackendSpec>) -> Result<Self, PoolError> {
        Self::from_sources([(MembershipSource::Static, members)])
    }

    /// Create a pool from several membership sources at once.
    pub fn from_sources(
        sources: impl IntoIterator<Item = (MembershipSource, Vec<BackendSpec>)>,
    ) -> Result<Self, PoolError> {
        let membership = Membership {
            sources: sources.into_iter().collect(),
        };
        let backends = build_backends(&membership, &PoolSnapshot::default())?;
        let snapshot = PoolSnapshot {
            version: 1,
            backends,
        };
        metrics::record_pool(&snapshot);
        let (membership_tx, _) = watch::channel(1);

        Ok(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            writer: Mutex::new(membership),
            membership_tx,
        })
    }

    /// The latest snapshot. Wait-free; the returned view never changes.
    pub fn current_snapshot(&self) -> Arc<PoolSnapshot> {
        self.snapshot.load_full()
    }

    /// Subscribe to membership changes. The value is a change counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.membership_tx.subscribe()
    }

    /// Apply one health outcome to a backend and publish the result.
    pub fn apply_health_update(
        &self,
        backend_id: &str,
        outcome: HealthOutcome,
    ) -> Result<HealthChange, PoolError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot.load_full();

        let index = current
            .backends
            .iter()
            .position(|b| b.id == backend_id)
            .ok_or_else(|| PoolError::UnknownBackend(backend_id.to_string()))?;

        let before = &current.backends[index];
        let after = Arc::new(before.with_outcome(outcome, Instant::now()));
        let change = HealthChange {
            previous: before.status(),
            current: after.status(),
        };

        let mut backends = current.backends.clone();
        backends[index] = after;
        self.publish(&current, backends);

        if change.is_transition() {
            metrics::record_transition(backend_id, change.previous, change.current);
        }
        Ok(change)
    }

    /// Replace the members contributed by one source.
    ///
    /// Backends that survive (same id and address) keep their health state.
    pub fn set_members(
        &self,
        source: MembershipSource,
        members: Vec<BackendSpec>,
    ) -> Result<Arc<PoolSnapshot>, PoolError> {
        let mut membership = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot.load_full();

        let previous = membership.sources.insert(source.clone(), members);
        let backends = match build_backends(&membership, &current) {
            Ok(backends) => backends,
            Err(e) => {
                match previous {
                    Some(previous) => membership.sources.insert(source, previous),
                    None => membership.sources.remove(&source),
                };
                return Err(e);
            }
        };

        let old_ids: HashSet<&str> = current.backends.iter().map(|b| b.id.as_str()).collect();
        let new_ids: HashSet<&str> = backends.iter().map(|b| b.id.as_str()).collect();
        let added: Vec<&str> = new_ids.difference(&old_ids).copied().collect();
        let removed: Vec<&str> = old_ids.difference(&new_ids).copied().collect();
        if !added.is_empty() || !removed.is_empty() {
            tracing::info!(?source, ?added, ?removed, "Backend membership changed");
        }

        let snapshot = self.publish(&current, backends);
        self.membership_tx.send_modify(|v| *v += 1);
        Ok(snapshot)
    }

    fn publish(&self, current: &PoolSnapshot, backends: Vec<Arc<Backend>>) -> Arc<PoolSnapshot> {
        let next = Arc::new(PoolSnapshot {
            version: current.version + 1,
            backends,
        });
        self.snapshot.store(next.clone());
        metrics::record_pool(&next);
        next
    }
}

/// Union of all sources in source order, reusing health from `current`.
fn build_backends(
    membership: &Membership,
    current: &PoolSnapshot,
) -> Result<Vec<Arc<Backend>>, PoolError> {
    let existing: HashMap<&str, &Arc<Backend>> =
        current.backends.iter().map(|b| (b.id.as_str(), b)).collect();
    let mut seen = HashSet::new();
    let mut backends = Vec::new();

    for (source, specs) in &membership.sources {
        for spec in specs {
            if !seen.insert(spec.id.clone()) {
                tracing::warn!(id = %spec.id, ?source, "Duplicate backend id, keeping the first");
                continue;
            }
            let backend = match existing.get(spec.id.as_str()) {
                Some(old) if old.address == spec.address => Arc::new(old.respecified(spec.clone())),
                _ => Arc::new(Backend::new(spec.clone()).map_err(|_| PoolError::InvalidAddress {
                    id: spec.id.clone(),
                    address: spec.address.clone(),
                })?),
            };
            backends.push(backend);
        }
    }

    if backends.is_empty() {
        return Err(PoolError::Empty);
    }
    Ok(backends)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::state::HealthThresholds;

    fn spec(id: &str, address: &str) -> BackendSpec {
        BackendSpec {
            id: id.to_string(),
            address: address.to_string(),
            group: "web".to_string(),
            kind: "default".to_string(),
            thresholds: HealthThresholds::default(),
        }
    }

    fn pool() -> BackendPool {
        BackendPool::new(vec![
            spec("b1", "127.0.0.1:8001"),
            spec("b2", "127.0.0.1:8002"),
            spec("b3", "127.0.0.1:8003"),
        ])
        .unwrap()
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert_eq!(BackendPool::new(vec![]).unwrap_err(), PoolError::Empty);
    }

    #[test]
    fn health_update_publishes_new_snapshot() {
        let pool = pool();
        let before = pool.current_snapshot();

        let change = pool.apply_health_update("b2", HealthOutcome::ProbeFailed).unwrap();
        assert_eq!(change.previous, HealthStatus::Healthy);
        assert_eq!(change.current, HealthStatus::Suspect);

        let after = pool.current_snapshot();
        assert_eq!(after.version(), before.version() + 1);
        assert_eq!(after.get("b2").unwrap().status(), HealthStatus::Suspect);
        // readers holding the old snapshot see the old state
        assert_eq!(before.get("b2").unwrap().status(), HealthStatus::Healthy);
        // untouched backends are shared, not copied
        assert!(Arc::ptr_eq(before.get("b1").unwrap(), after.get("b1").unwrap()));
    }

    #[test]
    fn unknown_backend_update_fails() {
        let pool = pool();
        assert_eq!(
            pool.apply_health_update("nope", HealthOutcome::ProbeFailed),
            Err(PoolError::UnknownBackend("nope".into()))
        );
    }

    #[test]
    fn probes_at_ten_second_cadence_mark_unhealthy_on_fifth() {
        let pool = pool();
        for probe in 1..=5 {
            let change = pool.apply_health_update("b1", HealthOutcome::ProbeFailed).unwrap();
            let expected = if probe < 5 { HealthStatus::Suspect } else { HealthStatus::Unhealthy };
            assert_eq!(change.current, expected, "after probe at t={}s", probe * 10);
        }
        let snapshot = pool.current_snapshot();
        let routable = snapshot.group_where("web", HealthStatus::is_routable);
        assert!(routable.iter().all(|b| b.id != "b1"));

        for probe in 1..=5 {
            let change = pool.apply_health_update("b1", HealthOutcome::ProbeSucceeded).unwrap();
            let expected = if probe < 5 { HealthStatus::Recovering } else { HealthStatus::Healthy };
            assert_eq!(change.current, expected);
        }
    }

    #[test]
    fn membership_change_keeps_surviving_health() {
        let pool = pool();
        let mut changes = pool.subscribe();
        pool.apply_health_update("b1", HealthOutcome::ProbeFailed).unwrap();
        let in_flight = pool.current_snapshot();

        let snapshot = pool
            .set_members(
                MembershipSource::Static,
                vec![spec("b1", "127.0.0.1:8001"), spec("b4", "127.0.0.1:8004")],
            )
            .unwrap();

        assert!(changes.has_changed().unwrap());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("b1").unwrap().status(), HealthStatus::Suspect);
        assert!(snapshot.get("b2").is_none());
        assert_eq!(snapshot.get("b4").unwrap().status(), HealthStatus::Healthy);
        // a request that already holds the old snapshot still sees b2
        assert!(in_flight.get("b2").is_some());
    }

    #[test]
    fn address_change_resets_health() {
        let pool = pool();
        pool.apply_health_update("b1", HealthOutcome::ProbeFailed).unwrap();
        let snapshot = pool
            .set_members(MembershipSource::Static, vec![spec("b1", "127.0.0.1:9001")])
            .unwrap();
        assert_eq!(snapshot.get("b1").unwrap().status(), HealthStatus::Healthy);
    }

    #[test]
    fn sources_are_merged_and_empty_union_rejected() {
        let pool = pool();
        pool.set_members(
            MembershipSource::Discovery("app".into()),
            vec![spec("app-10.0.0.1:80", "10.0.0.1:80")],
        )
        .unwrap();
        assert_eq!(pool.current_snapshot().len(), 4);

        pool.set_members(MembershipSource::Static, vec![]).unwrap();
        assert_eq!(pool.current_snapshot().len(), 1);

        let version = pool.current_snapshot().version();
        assert_eq!(
            pool.set_members(MembershipSource::Discovery("app".into()), vec![]).unwrap_err(),
            PoolError::Empty
        );
        // a rejected change publishes nothing
        assert_eq!(pool.current_snapshot().version(), version);
        assert_eq!(pool.current_snapshot().len(), 1);
    }
}
