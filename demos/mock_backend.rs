//! Standalone backend for trying the router by hand.
//!
//! ```text
//! cargo run --example mock_backend -- --port 9001 --name a
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;

#[derive(Parser)]
struct Args {
    #[arg(long, default_value_t = 9001)]
    port: u16,

    /// Echoed in every response body.
    #[arg(long, default_value = "backend")]
    name: String,
}

#[derive(Clone)]
struct MockState {
    name: Arc<str>,
    healthy: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let state = MockState {
        name: args.name.into(),
        healthy: Arc::new(AtomicBool::new(true)),
    };
    let app = Router::new()
        .route("/health", get(health))
        // flips the health endpoint between 200 and 500
        .route("/toggle", post(toggle))
        .fallback(respond)
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    tracing::info!(%addr, "Mock backend listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn respond(State(state): State<MockState>) -> String {
    format!("hello from {}", state.name)
}

async fn health(State(state): State<MockState>) -> StatusCode {
    if state.healthy.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn toggle(State(state): State<MockState>) -> &'static str {
    if state.healthy.fetch_xor(true, Ordering::SeqCst) {
        "unhealthy"
    } else {
        "healthy"
    }
}
