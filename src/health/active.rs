//! Active health checking.
//!
//! # Responsibilities
//! - Run one probe task per backend on its kind's interval
//! - Reconcile probe tasks when pool membership changes
//! - Apply probe outcomes and passive failure reports to the pool
//! - Abort every probe task immediately on shutdown

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use url::Url;

use crate::config::{HealthCheckConfig, ProxyConfig};
use crate::health::passive::HealthReport;
use crate::health::state::{HealthOutcome, HealthStatus};
use crate::load_balancer::backend::Backend;
use crate::load_balancer::pool::{BackendPool, HealthChange, PoolError};
use crate::observability::metrics;

const PROBE_USER_AGENT: &str = "edge-router-health-check";

type HealthClient = Client<HttpConnector, Body>;

/// Probe profiles keyed by backend kind.
#[derive(Debug, Clone, Default)]
pub struct HealthProfiles {
    default: HealthCheckConfig,
    kinds: BTreeMap<String, HealthCheckConfig>,
}

impl HealthProfiles {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            default: config.health_check.clone(),
            kinds: config.health_kinds.clone(),
        }
    }

    pub fn get(&self, kind: &str) -> &HealthCheckConfig {
        self.kinds.get(kind).unwrap_or(&self.default)
    }
}

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Passed,
    UnexpectedStatus(StatusCode),
    Failed(String),
    TimedOut,
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeResult::Passed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProbeResult::Passed => "success",
            ProbeResult::UnexpectedStatus(_) => "bad_status",
            ProbeResult::Failed(_) => "error",
            ProbeResult::TimedOut => "timeout",
        }
    }
}

impl std::fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeResult::Passed => write!(f, "passed"),
            ProbeResult::UnexpectedStatus(status) => write!(f, "unexpected status {status}"),
            ProbeResult::Failed(e) => write!(f, "connection error: {e}"),
            ProbeResult::TimedOut => write!(f, "timeout"),
        }
    }
}

/// Send one probe request to `url`.
pub async fn probe(
    client: &HealthClient,
    url: &Url,
    timeout: Duration,
    expected_status: Option<u16>,
) -> ProbeResult {
    let request = match Request::builder()
        .method(Method::GET)
        .uri(url.as_str())
        .header(header::USER_AGENT, PROBE_USER_AGENT)
        .body(Body::empty())
    {
        Ok(req) => req,
        Err(e) => return ProbeResult::Failed(e.to_string()),
    };

    match time::timeout(timeout, client.request(request)).await {
        Ok(Ok(response)) => {
            let status = response.status();
            let ok = match expected_status {
                Some(code) => status.as_u16() == code,
                None => status.is_success(),
            };
            if ok {
                ProbeResult::Passed
            } else {
                ProbeResult::UnexpectedStatus(status)
            }
        }
        Ok(Err(e)) => ProbeResult::Failed(e.to_string()),
        Err(_) => ProbeResult::TimedOut,
    }
}

/// Keeps backend health current by probing and by applying passive reports.
pub struct HealthMonitor {
    pool: Arc<BackendPool>,
    profiles: HealthProfiles,
    client: HealthClient,
    reports: mpsc::UnboundedReceiver<HealthReport>,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<BackendPool>,
        profiles: HealthProfiles,
        reports: mpsc::UnboundedReceiver<HealthReport>,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Self {
            pool,
            profiles,
            client,
            reports,
        }
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let HealthMonitor {
            pool,
            profiles,
            client,
            mut reports,
        } = self;
        let supervisor = Supervisor {
            pool,
            profiles: Arc::new(profiles),
            client,
        };
        let mut membership = supervisor.pool.subscribe();
        let mut probes = ProbeTasks::default();

        supervisor.reconcile(&mut probes);
        tracing::info!(probes = probes.len(), "Health monitor started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
                changed = membership.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    supervisor.reconcile(&mut probes);
                }
                Some(report) = reports.recv() => supervisor.apply_report(report),
            }
        }

        probes.shutdown().await;
    }
}

/// Probe tasks keyed by (backend id, address).
///
/// Tasks live in a `JoinSet`, so dropping this (including when the monitor task itself
/// is aborted) aborts every probe.
#[derive(Default)]
struct ProbeTasks {
    tasks: JoinSet<()>,
    handles: HashMap<(String, String), AbortHandle>,
}

impl ProbeTasks {
    fn len(&self) -> usize {
        self.handles.len()
    }

    async fn shutdown(&mut self) {
        self.handles.clear();
        self.tasks.shutdown().await;
    }
}

struct Supervisor {
    pool: Arc<BackendPool>,
    profiles: Arc<HealthProfiles>,
    client: HealthClient,
}

impl Supervisor {
    /// Start probes for new backends and stop probes for removed ones.
    fn reconcile(&self, probes: &mut ProbeTasks) {
        while probes.tasks.try_join_next().is_some() {}

        let snapshot = self.pool.current_snapshot();
        let wanted: HashMap<(String, String), &Arc<Backend>> = snapshot
            .backends()
            .iter()
            .filter(|b| self.profiles.get(&b.kind).enabled)
            .map(|b| ((b.id.clone(), b.address.clone()), b))
            .collect();

        probes.handles.retain(|key, handle| {
            let keep = wanted.contains_key(key) && !handle.is_finished();
            if !keep {
                handle.abort();
                tracing::debug!(backend = %key.0, address = %key.1, "Stopped health probe");
            }
            keep
        });

        for (key, backend) in wanted {
            if probes.handles.contains_key(&key) {
                continue;
            }
            if let Some(handle) = self.spawn_probe(&mut probes.tasks, backend) {
                probes.handles.insert(key, handle);
            }
        }
    }

    fn spawn_probe(&self, tasks: &mut JoinSet<()>, backend: &Backend) -> Option<AbortHandle> {
        let profile = self.profiles.get(&backend.kind).clone();
        let url = match backend.probe_url(&profile.path) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(backend = %backend.id, error = %e, "Invalid health probe URL");
                return None;
            }
        };
        tracing::debug!(
            backend = %backend.id,
            url = %url,
            interval_secs = profile.interval_secs,
            "Starting health probe"
        );
        Some(tasks.spawn(probe_loop(
            self.pool.clone(),
            self.client.clone(),
            backend.id.clone(),
            url,
            profile,
        )))
    }

    /// Apply a passive failure report.
    ///
    /// Only probes can bring a backend back, so reports for a kind with probing disabled
    /// are dropped.
    fn apply_report(&self, report: HealthReport) {
        let snapshot = self.pool.current_snapshot();
        let Some(backend) = snapshot.get(&report.backend_id) else {
            tracing::debug!(backend = %report.backend_id, "Failure report for a backend no longer in the pool");
            return;
        };
        if !self.profiles.get(&backend.kind).enabled {
            tracing::debug!(
                backend = %report.backend_id,
                kind = %backend.kind,
                "Probing disabled for this kind, ignoring failure report"
            );
            return;
        }

        match self.pool.apply_health_update(&report.backend_id, report.outcome) {
            Ok(change) => log_change(&report.backend_id, change, "request failure"),
            Err(PoolError::UnknownBackend(id)) => {
                tracing::debug!(backend = %id, "Failure report for a backend no longer in the pool");
            }
            Err(e) => tracing::warn!(error = %e, "Failed to apply failure report"),
        }
    }
}

async fn probe_loop(
    pool: Arc<BackendPool>,
    client: HealthClient,
    backend_id: String,
    url: Url,
    profile: HealthCheckConfig,
) {
    let period = Duration::from_secs(profile.interval_secs);
    let timeout = Duration::from_secs(profile.timeout_secs);
    // First probe one full interval after start.
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let result = probe(&client, &url, timeout, profile.expected_status).await;
        metrics::record_probe(&backend_id, result.label());
        let outcome = if result.is_success() {
            HealthOutcome::ProbeSucceeded
        } else {
            tracing::debug!(backend = %backend_id, url = %url, reason = %result, "Health probe failed");
            HealthOutcome::ProbeFailed
        };

        match pool.apply_health_update(&backend_id, outcome) {
            Ok(change) => log_change(&backend_id, change, "probe"),
            Err(PoolError::UnknownBackend(_)) => {
                tracing::debug!(backend = %backend_id, "Backend left the pool, stopping probes");
                break;
            }
            Err(e) => tracing::warn!(backend = %backend_id, error = %e, "Failed to apply probe result"),
        }
    }
}

fn log_change(backend_id: &str, change: HealthChange, cause: &str) {
    if !change.is_transition() {
        return;
    }
    if change.current == HealthStatus::Unhealthy {
        tracing::warn!(
            backend = %backend_id,
            from = %change.previous,
            to = %change.current,
            cause,
            "Backend marked unhealthy"
        );
    } else {
        tracing::info!(
            backend = %backend_id,
            from = %change.previous,
            to = %change.current,
            cause,
            "Backend health changed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::passive::HealthReporter;
    use crate::health::state::HealthThresholds;
    use crate::load_balancer::backend::BackendSpec;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn responder(status_line: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!("HTTP/1.1 {status_line}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    async fn closed_port() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn client() -> HealthClient {
        Client::builder(TokioExecutor::new()).build(HttpConnector::new())
    }

    fn url(addr: std::net::SocketAddr) -> Url {
        Url::parse(&format!("http://{addr}/health")).unwrap()
    }

    #[tokio::test]
    async fn probe_classifies_responses() {
        let ok = responder("200 OK").await;
        let bad = responder("503 Service Unavailable").await;
        let timeout = Duration::from_secs(2);

        assert_eq!(probe(&client(), &url(ok), timeout, None).await, ProbeResult::Passed);
        assert_eq!(
            probe(&client(), &url(bad), timeout, None).await,
            ProbeResult::UnexpectedStatus(StatusCode::SERVICE_UNAVAILABLE)
        );
        assert_eq!(
            probe(&client(), &url(bad), timeout, Some(503)).await,
            ProbeResult::Passed
        );
        assert!(matches!(
            probe(&client(), &url(closed_port().await), timeout, None).await,
            ProbeResult::Failed(_)
        ));
    }

    #[tokio::test]
    async fn probe_times_out_on_silent_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let result = probe(&client(), &url(addr), Duration::from_millis(200), None).await;
        assert_eq!(result, ProbeResult::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn five_failed_probes_at_ten_seconds_mark_unhealthy_at_fifty() {
        let dead = closed_port().await;
        let pool = Arc::new(
            BackendPool::new(vec![BackendSpec {
                id: "dead".into(),
                address: dead.to_string(),
                group: "web".into(),
                kind: "default".into(),
                thresholds: HealthThresholds::default(),
            }])
            .unwrap(),
        );
        let mut config = ProxyConfig::default();
        config.health_check.interval_secs = 10;
        config.health_check.timeout_secs = 1;

        let (_reporter, reports) = HealthReporter::channel();
        let monitor = HealthMonitor::new(pool.clone(), HealthProfiles::from_config(&config), reports);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = monitor.spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_secs(49)).await;
        let backend = pool.current_snapshot().get("dead").cloned().unwrap();
        assert_eq!(backend.status(), HealthStatus::Suspect);
        assert_eq!(backend.health.consecutive_failures, 4);
        assert!(backend.last_probe.is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            pool.current_snapshot().get("dead").unwrap().status(),
            HealthStatus::Unhealthy
        );

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn monitor_applies_passive_reports() {
        let pool = Arc::new(
            BackendPool::new(vec![BackendSpec {
                id: "b1".into(),
                address: "127.0.0.1:1".into(),
                group: "web".into(),
                kind: "default".into(),
                thresholds: HealthThresholds::default(),
            }])
            .unwrap(),
        );
        let mut config = ProxyConfig::default();
        config.health_check.interval_secs = 3600;

        let (reporter, reports) = HealthReporter::channel();
        let monitor = HealthMonitor::new(pool.clone(), HealthProfiles::from_config(&config), reports);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = monitor.spawn(shutdown_rx);

        reporter.report_failure("b1");
        reporter.report_failure("removed");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(pool.current_snapshot().get("b1").unwrap().status(), HealthStatus::Suspect);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn reports_are_ignored_when_kind_is_not_probed() {
        let spec = |id: &str, kind: &str| BackendSpec {
            id: id.into(),
            address: "127.0.0.1:1".into(),
            group: "web".into(),
            kind: kind.into(),
            thresholds: HealthThresholds { unhealthy: 1, healthy: 1 },
        };
        let pool = Arc::new(BackendPool::new(vec![spec("plain", "default"), spec("batch", "batch")]).unwrap());
        let mut config = ProxyConfig::default();
        config.health_check.enabled = false;
        let mut batch = config.health_check.clone();
        batch.enabled = true;
        batch.interval_secs = 3600;
        config.health_kinds.insert("batch".into(), batch);

        let (reporter, reports) = HealthReporter::channel();
        let monitor = HealthMonitor::new(pool.clone(), HealthProfiles::from_config(&config), reports);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = monitor.spawn(shutdown_rx);

        for _ in 0..3 {
            reporter.report_failure("plain");
        }
        reporter.report_failure("batch");
        tokio::time::sleep(Duration::from_millis(100)).await;

        // without probes nothing could ever bring "plain" back
        let snapshot = pool.current_snapshot();
        assert_eq!(snapshot.get("plain").unwrap().status(), HealthStatus::Healthy);
        assert_eq!(snapshot.get("batch").unwrap().status(), HealthStatus::Unhealthy);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn aborting_the_monitor_stops_its_probes() {
        let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                        .await;
                });
            }
        });

        let pool = Arc::new(
            BackendPool::new(vec![BackendSpec {
                id: "b1".into(),
                address: addr.to_string(),
                group: "web".into(),
                kind: "default".into(),
                thresholds: HealthThresholds::default(),
            }])
            .unwrap(),
        );
        let mut config = ProxyConfig::default();
        config.health_check.interval_secs = 1;

        let (_reporter, reports) = HealthReporter::channel();
        let monitor = HealthMonitor::new(pool, HealthProfiles::from_config(&config), reports);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = monitor.spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(hits.load(std::sync::atomic::Ordering::SeqCst) >= 1);

        // no shutdown broadcast: the monitor is cancelled mid-select
        handle.abort();
        let _ = handle.await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after_abort = hits.load(std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), after_abort);
    }
}
