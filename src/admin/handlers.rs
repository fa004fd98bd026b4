use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::admin::AdminState;
use crate::health::HealthStatus;

#[derive(Debug, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    pub status: String,
    pub uptime_secs: u64,
    pub snapshot_version: u64,
    pub backends: usize,
    pub routable_backends: usize,
    pub in_flight: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackendStatus {
    pub id: String,
    pub group: String,
    pub kind: String,
    pub address: String,
    pub status: HealthStatus,
    pub routable: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Seconds since the last probe, if one has run.
    pub last_probe_secs_ago: Option<u64>,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let snapshot = state.pool.current_snapshot();
    let routable = snapshot.routable_count();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: if routable > 0 { "operational" } else { "degraded" }.to_string(),
        uptime_secs: state.started.elapsed().as_secs(),
        snapshot_version: snapshot.version(),
        backends: snapshot.len(),
        routable_backends: routable,
        in_flight: state.in_flight.count(),
    })
}

pub async fn get_backends(State(state): State<AdminState>) -> Json<Vec<BackendStatus>> {
    let snapshot = state.pool.current_snapshot();
    let statuses = snapshot
        .backends()
        .iter()
        .map(|b| BackendStatus {
            id: b.id.clone(),
            group: b.group.clone(),
            kind: b.kind.clone(),
            address: b.address.clone(),
            status: b.status(),
            routable: b.is_routable(),
            consecutive_failures: b.health.consecutive_failures,
            consecutive_successes: b.health.consecutive_successes,
            last_probe_secs_ago: b.last_probe.map(|at| at.elapsed().as_secs()),
        })
        .collect();
    Json(statuses)
}
