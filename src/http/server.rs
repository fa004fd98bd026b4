//! HTTP server setup and request pipeline.
//!
//! # Responsibilities
//! - Create Axum Router with the metrics route and the proxy fallback
//! - Wire up middleware (request ID, tracing)
//! - Admit, route, select and forward each request
//! - Record exactly one metric and one log line per request
//! - Run background tasks and drain on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::admin::{self, AdminState};
use crate::config::{ProxyConfig, SecurityConfig};
use crate::discovery::DnsDiscovery;
use crate::health::{HealthMonitor, HealthProfiles, HealthReporter};
use crate::http::proxy::{ForwardRequest, Forwarder};
use crate::http::request::{MakeRequestUuid, RequestContext, RequestOutcome, X_REQUEST_ID};
use crate::http::response::{error_response, too_many_requests};
use crate::load_balancer::{
    BackendPool, BackendSelector, BackendSpec, MembershipSource, PoolError, Selection,
};
use crate::net::InFlightTracker;
use crate::observability::metrics;
use crate::resilience::{PhaseTimeouts, RetryPolicy};
use crate::routing::RouteTable;
use crate::security::headers::apply_security_headers;
use crate::security::limits::{declared_too_large, read_body, BodyError};
use crate::security::rate_limit::{spawn_sweeper, Admission, RateLimiter};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub routes: Arc<RouteTable>,
    pub pool: Arc<BackendPool>,
    pub selector: Arc<BackendSelector>,
    pub forwarder: Arc<Forwarder>,
    pub timeouts: PhaseTimeouts,
    pub security: SecurityConfig,
    pub in_flight: InFlightTracker,
}

/// HTTP server for the edge router.
pub struct HttpServer {
    config: ProxyConfig,
    state: AppState,
    limiters: Vec<Arc<RateLimiter>>,
    monitor: HealthMonitor,
}

impl HttpServer {
    /// Create a server whose pool holds the statically configured backends.
    pub fn new(config: ProxyConfig) -> Result<Self, PoolError> {
        Self::with_discovered(config, Vec::new())
    }

    /// Create a server with members already resolved for each discovery entry.
    pub fn with_discovered(
        config: ProxyConfig,
        discovered: Vec<(String, Vec<BackendSpec>)>,
    ) -> Result<Self, PoolError> {
        let mut sources = vec![(MembershipSource::Static, BackendSpec::from_config(&config))];
        sources.extend(
            discovered
                .into_iter()
                .map(|(name, specs)| (MembershipSource::Discovery(name), specs)),
        );
        let pool = Arc::new(BackendPool::from_sources(sources)?);

        let (routes, limiters) = RouteTable::from_config(&config.routes, &config.rate_limit);
        let selector = BackendSelector::new(config.routing.no_healthy_policy, routes.groups());

        let (reporter, reports) = HealthReporter::channel();
        let timeouts = PhaseTimeouts::from_config(&config.timeouts);
        let forwarder = Forwarder::new(RetryPolicy::from_config(&config.retries), timeouts, reporter);
        let monitor = HealthMonitor::new(pool.clone(), HealthProfiles::from_config(&config), reports);

        let state = AppState {
            routes: Arc::new(routes),
            pool,
            selector: Arc::new(selector),
            forwarder: Arc::new(forwarder),
            timeouts,
            security: config.security.clone(),
            in_flight: InFlightTracker::new(),
        };

        Ok(Self {
            config,
            state,
            limiters,
            monitor,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn pool(&self) -> Arc<BackendPool> {
        self.state.pool.clone()
    }

    /// The client-facing router, without background tasks.
    pub fn router(&self) -> Router {
        build_router(&self.config, self.state.clone())
    }

    /// Serve until `shutdown` fires, then drain for up to the grace period.
    ///
    /// Configurations arriving on `config_updates` replace the static backend list.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let HttpServer {
            config,
            state,
            limiters,
            monitor,
        } = self;

        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, routes = state.routes.len(), "HTTP server starting");

        if config.observability.metrics_enabled && metrics::init_metrics().is_some() {
            metrics::record_pool(&state.pool.current_snapshot());
        }

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.push(monitor.spawn(shutdown.resubscribe()));
        if !limiters.is_empty() {
            let interval = Duration::from_secs(config.rate_limit.sweep_interval_secs.max(1));
            tasks.push(spawn_sweeper(limiters, interval, shutdown.resubscribe()));
        }
        for entry in &config.discovery {
            let thresholds = config.health_profile(&entry.kind).thresholds();
            let discovery = DnsDiscovery::new(entry.clone(), thresholds, state.pool.clone());
            tasks.push(discovery.spawn(shutdown.resubscribe()));
        }
        tasks.push(spawn_config_reload(
            state.pool.clone(),
            config_updates,
            shutdown.resubscribe(),
        ));
        if config.admin.enabled {
            tasks.push(serve_admin(&config, &state, shutdown.resubscribe()).await?);
        }

        let app = build_router(&config, state.clone())
            .into_make_service_with_connect_info::<SocketAddr>();
        let mut serve_shutdown = shutdown.resubscribe();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = serve_shutdown.recv().await;
        });
        let mut serving = tokio::spawn(async move { server.await });

        let grace = Duration::from_secs(config.timeouts.shutdown_grace_secs);
        let joined = tokio::select! {
            joined = &mut serving => joined,
            _ = shutdown.recv() => {
                tracing::info!(
                    grace_secs = grace.as_secs(),
                    in_flight = state.in_flight.count(),
                    "Shutdown signal received, draining in-flight requests"
                );
                match tokio::time::timeout(grace, &mut serving).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        tracing::warn!(
                            in_flight = state.in_flight.count(),
                            "Grace period elapsed, aborting remaining requests"
                        );
                        serving.abort();
                        Ok(Ok(()))
                    }
                }
            }
        };

        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("HTTP server stopped");

        match joined {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }
}

/// Build the Axum router with all middleware layers.
pub fn build_router(config: &ProxyConfig, state: AppState) -> Router {
    let mut router = Router::new();
    if config.observability.metrics_enabled {
        router = router.route(&config.observability.metrics_path, get(metrics_handler));
    }

    router
        .fallback(proxy_handler)
        .with_state(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                let request_id = request
                    .headers()
                    .get(X_REQUEST_ID)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::debug_span!(
                    "request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn metrics_handler() -> Response {
    match metrics::render() {
        Some(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "Metrics recorder not installed"),
    }
}

/// Main proxy handler.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let _in_flight = state.in_flight.track();
    let mut ctx = RequestContext::from_request(&request);

    let deadline = state.timeouts.request;
    let response = match tokio::time::timeout(deadline, handle(&state, &mut ctx, request)).await {
        Ok(response) => response,
        Err(_) => {
            ctx.outcome = RequestOutcome::Failure;
            ctx.error = Some(format!("request deadline of {deadline:?} exceeded"));
            error_response(StatusCode::GATEWAY_TIMEOUT, "Request deadline exceeded")
        }
    };

    finish(&state, &ctx, response)
}

async fn handle(state: &AppState, ctx: &mut RequestContext, request: Request<Body>) -> Response {
    // 1. Match Route
    let Some(route) = state.routes.match_request(ctx.host.as_deref(), &ctx.path) else {
        ctx.outcome = RequestOutcome::NoRoute;
        return error_response(StatusCode::NOT_FOUND, "No matching route");
    };
    ctx.route = Some(route.name.clone());

    // 2. Admission
    if let Some(limiter) = &route.limiter {
        if let Admission::Rejected { retry_after } = limiter.check(&ctx.client_key()) {
            ctx.outcome = RequestOutcome::RateLimited;
            return too_many_requests(retry_after);
        }
    }

    // 3. Buffer the body so retries can replay it
    let (parts, body) = request.into_parts();
    let limit = state.security.max_body_size;
    if declared_too_large(&parts.headers, limit) {
        ctx.outcome = RequestOutcome::Failure;
        ctx.error = Some(BodyError::TooLarge { limit }.to_string());
        return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
    }
    let body = match read_body(body, limit).await {
        Ok(body) => body,
        Err(e) => {
            ctx.outcome = RequestOutcome::Failure;
            ctx.error = Some(e.to_string());
            return match e {
                BodyError::TooLarge { .. } => {
                    error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large")
                }
                BodyError::Read(_) => {
                    error_response(StatusCode::BAD_REQUEST, "Could not read request body")
                }
            };
        }
    };

    // 4. Select backends from the current snapshot
    let snapshot = state.pool.current_snapshot();
    let plan = match state.selector.select(&snapshot, &route.backend_group) {
        Selection::Routable(plan) => plan,
        Selection::Degraded(plan) => {
            tracing::warn!(
                request_id = %ctx.request_id,
                group = %route.backend_group,
                candidates = plan.len(),
                "No healthy backend, forwarding to recovering backends"
            );
            plan
        }
        Selection::Unavailable => {
            ctx.outcome = RequestOutcome::NoRoute;
            ctx.error = Some(format!("no eligible backend in group '{}'", route.backend_group));
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "No healthy backends");
        }
    };

    // 5. Forward with retry
    let forward = ForwardRequest::new(&parts, body, ctx.client_ip);
    match state.forwarder.forward(ctx, &forward, &plan).await {
        Ok(response) => {
            ctx.outcome = if ctx.attempts() > 1 {
                RequestOutcome::Retry
            } else {
                RequestOutcome::Success
            };
            response
        }
        Err(e) => {
            ctx.outcome = RequestOutcome::Failure;
            ctx.error = Some(e.to_string());
            error_response(StatusCode::BAD_GATEWAY, "Upstream request failed")
        }
    }
}

/// Apply response headers, record the request metric and emit the request log line.
fn finish(state: &AppState, ctx: &RequestContext, mut response: Response) -> Response {
    if state.security.enable_headers {
        apply_security_headers(response.headers_mut());
    }

    let status = response.status();
    metrics::record_request(ctx.outcome.as_str(), status.as_u16(), ctx.start);

    let latency_ms = ctx.start.elapsed().as_millis() as u64;
    let client = ctx.client_key();
    let route = ctx.route.as_deref().unwrap_or("-");
    let error = ctx.error.as_deref().unwrap_or("");
    if status.is_server_error() {
        tracing::warn!(
            request_id = %ctx.request_id,
            client = %client,
            method = %ctx.method,
            path = %ctx.path,
            route,
            backends = ?ctx.backends,
            attempts = ctx.attempts(),
            status = status.as_u16(),
            outcome = ctx.outcome.as_str(),
            latency_ms,
            error,
            "Request failed"
        );
    } else {
        tracing::debug!(
            request_id = %ctx.request_id,
            client = %client,
            method = %ctx.method,
            path = %ctx.path,
            route,
            backends = ?ctx.backends,
            attempts = ctx.attempts(),
            status = status.as_u16(),
            outcome = ctx.outcome.as_str(),
            latency_ms,
            "Request completed"
        );
    }
    response
}

fn spawn_config_reload(
    pool: Arc<BackendPool>,
    mut updates: mpsc::UnboundedReceiver<ProxyConfig>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(next) = updates.recv() => {
                    match pool.set_members(MembershipSource::Static, BackendSpec::from_config(&next)) {
                        Ok(snapshot) => tracing::info!(
                            version = snapshot.version(),
                            backends = snapshot.len(),
                            "Applied backend list from reloaded configuration; other sections apply on restart"
                        ),
                        Err(e) => tracing::warn!(error = %e, "Rejected reloaded backend list"),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

async fn serve_admin(
    config: &ProxyConfig,
    state: &AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<JoinHandle<()>, std::io::Error> {
    let listener = TcpListener::bind(&config.admin.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Admin API listening");

    let app = admin::router(AdminState::new(
        &config.admin,
        state.pool.clone(),
        state.in_flight.clone(),
    ));
    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Admin API stopped");
        }
    }))
}
