//! Backend abstraction.
//!
//! # Responsibilities
//! - Describe a backend replica (`BackendSpec`) as configured or discovered
//! - Hold the immutable per-snapshot view of a replica (`Backend`)
//! - Carry the health record driven by the health monitor

use std::time::Instant;

use url::Url;

use crate::config::ProxyConfig;
use crate::health::state::{HealthOutcome, HealthRecord, HealthStatus, HealthThresholds};

/// Membership description of one backend replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    /// Unique backend identifier.
    pub id: String,
    /// `host:port` the backend listens on.
    pub address: String,
    /// Pool (backend group) this replica serves.
    pub group: String,
    /// Probe profile name.
    pub kind: String,
    pub thresholds: HealthThresholds,
}

impl BackendSpec {
    /// Build the static member list from configuration.
    pub fn from_config(config: &ProxyConfig) -> Vec<BackendSpec> {
        config
            .backends
            .iter()
            .map(|b| BackendSpec {
                id: b.name.clone(),
                address: b.address.clone(),
                group: b.group.clone(),
                kind: b.kind.clone(),
                thresholds: config.health_profile(&b.kind).thresholds(),
            })
            .collect()
    }
}

/// A backend as seen in one pool snapshot. Never mutated in place: health updates
/// produce a new `Backend` inside a new snapshot.
#[derive(Debug, Clone)]
pub struct Backend {
    pub id: String,
    pub address: String,
    pub group: String,
    pub kind: String,
    /// Pre-calculated base URL for probes.
    pub base_url: Url,
    pub thresholds: HealthThresholds,
    pub health: HealthRecord,
    /// When the last active probe completed.
    pub last_probe: Option<Instant>,
}

impl Backend {
    /// Create a fresh backend in the Healthy state.
    pub fn new(spec: BackendSpec) -> Result<Self, url::ParseError> {
        let base_url = Url::parse(&format!("http://{}", spec.address))?;
        Ok(Self {
            id: spec.id,
            address: spec.address,
            group: spec.group,
            kind: spec.kind,
            base_url,
            thresholds: spec.thresholds,
            health: HealthRecord::default(),
            last_probe: None,
        })
    }

    /// Same replica under a possibly updated spec; health is carried over.
    pub fn respecified(&self, spec: BackendSpec) -> Self {
        Self {
            group: spec.group,
            kind: spec.kind,
            thresholds: spec.thresholds,
            ..self.clone()
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.health.status
    }

    pub fn is_routable(&self) -> bool {
        self.health.status.is_routable()
    }

    /// Copy of this backend with one outcome applied.
    pub fn with_outcome(&self, outcome: HealthOutcome, at: Instant) -> Self {
        let mut next = self.clone();
        next.health = self.health.apply(outcome, self.thresholds);
        if outcome.is_probe() {
            next.last_probe = Some(at);
        }
        next
    }

    /// URL for the active health probe.
    pub fn probe_url(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base_url.join(path)
    }
}
