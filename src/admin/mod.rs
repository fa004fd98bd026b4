//! Read-only admin API.
//!
//! Served on its own listener and guarded by a bearer key.

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::{middleware, routing::get, Router};

use crate::config::AdminConfig;
use crate::load_balancer::BackendPool;
use crate::net::InFlightTracker;

use self::auth::admin_auth_middleware;
use self::handlers::{get_backends, get_status};

#[derive(Clone)]
pub struct AdminState {
    pub pool: Arc<BackendPool>,
    pub in_flight: InFlightTracker,
    pub api_key: Arc<str>,
    pub started: Instant,
}

impl AdminState {
    pub fn new(config: &AdminConfig, pool: Arc<BackendPool>, in_flight: InFlightTracker) -> Self {
        Self {
            pool,
            in_flight,
            api_key: Arc::from(config.api_key.as_str()),
            started: Instant::now(),
        }
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/backends", get(get_backends))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
