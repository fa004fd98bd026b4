//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → handed to subsystems at startup
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → backend list applied to the pool as a membership change
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Invalid configuration is fatal at startup, ignored on reload
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::{
    AdminConfig, BackendConfig, DiscoveryConfig, HealthCheckConfig, ListenerConfig, LogFormat,
    NoHealthyPolicy, ObservabilityConfig, ProxyConfig, RateLimitConfig, RetryConfig,
    RouteConfig, RouteRateLimit, RoutingConfig, SecurityConfig, TimeoutConfig,
};
