//! Edge router: load balancing, per-client rate limiting and health-driven backend
//! exclusion in front of a pool of HTTP replicas.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod routing;

// Traffic management
pub mod discovery;
pub mod health;
pub mod load_balancer;

// Cross-cutting concerns
pub mod admin;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
