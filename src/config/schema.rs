//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the edge router.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::health::state::HealthThresholds;

/// Root configuration for the edge router.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Route definitions mapping request paths to backend pools.
    pub routes: Vec<RouteConfig>,

    /// Statically configured backend replicas.
    pub backends: Vec<BackendConfig>,

    /// DNS-based membership sources.
    pub discovery: Vec<DiscoveryConfig>,

    /// Default health probe profile.
    pub health_check: HealthCheckConfig,

    /// Health probe profiles keyed by backend kind.
    pub health_kinds: BTreeMap<String, HealthCheckConfig>,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Backend selection policy.
    pub routing: RoutingConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Security hardening settings.
    pub security: SecurityConfig,

    /// Read-only admin API.
    pub admin: AdminConfig,
}

impl ProxyConfig {
    /// Probe profile for a backend kind, falling back to `health_check`.
    pub fn health_profile(&self, kind: &str) -> &HealthCheckConfig {
        self.health_kinds.get(kind).unwrap_or(&self.health_check)
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Route configuration mapping requests to a backend pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host header to match (exact match).
    #[serde(default)]
    pub host: Option<String>,

    /// Path prefix to match.
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Backend group name to forward to.
    pub backend_group: String,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,

    /// Whether requests on this route pass through the rate limiter.
    #[serde(default = "default_true")]
    pub rate_limited: bool,

    /// Route-specific bucket parameters.
    #[serde(default)]
    pub rate_limit: Option<RouteRateLimit>,
}

/// Per-route override of the token bucket parameters.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RouteRateLimit {
    pub capacity: u32,
    pub refill_per_minute: u32,
}

fn default_path_prefix() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend identifier.
    pub name: String,

    /// Backend group this server belongs to.
    #[serde(default = "default_group")]
    pub group: String,

    /// Backend address as `host:port` (e.g., "127.0.0.1:3000" or "app:8000").
    pub address: String,

    /// Probe profile name, looked up in `health_kinds`.
    #[serde(default = "default_kind")]
    pub kind: String,
}

fn default_group() -> String {
    "default".to_string()
}

fn default_kind() -> String {
    "default".to_string()
}

/// DNS discovery entry: every address the host resolves to becomes a backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// Entry name, used as the backend id prefix.
    pub name: String,

    #[serde(default = "default_group")]
    pub group: String,

    /// Host name to resolve (e.g., a compose service name).
    pub host: String,

    pub port: u16,

    #[serde(default = "default_kind")]
    pub kind: String,

    /// Re-resolution interval in seconds.
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
}

fn default_refresh_secs() -> u64 {
    5
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Health check timeout in seconds.
    pub timeout_secs: u64,

    /// Path to probe for HTTP health checks.
    pub path: String,

    /// Status the probe must return; any 2xx when unset.
    pub expected_status: Option<u16>,

    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub healthy_threshold: u32,
}

impl HealthCheckConfig {
    pub fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            unhealthy: self.unhealthy_threshold,
            healthy: self.healthy_threshold,
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 5,
            path: "/health".to_string(),
            expected_status: None,
            unhealthy_threshold: 5,
            healthy_threshold: 5,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backend connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Time allowed to deliver the request and receive the response head.
    pub send_secs: u64,

    /// Maximum idle gap between response body chunks.
    pub receive_secs: u64,

    /// Overall client-facing deadline across all attempts.
    pub request_secs: u64,

    /// Drain period for in-flight requests on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 60,
            send_secs: 60,
            receive_secs: 60,
            request_secs: 180,
            shutdown_grace_secs: 30,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Bucket capacity (sustained + burst).
    pub capacity: u32,

    /// Tokens added per minute.
    pub refill_per_minute: u32,

    /// Buckets untouched for this long are evicted.
    pub idle_timeout_secs: u64,

    /// How often the eviction sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 120,
            refill_per_minute: 100,
            idle_timeout_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts per request, the first one included.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds (0 = retry immediately).
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 0,
            max_delay_ms: 1000,
        }
    }
}

/// What to do when a route's pool has no Healthy backend.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoHealthyPolicy {
    /// Answer 503 without contacting any backend.
    #[default]
    FailClosed,
    /// Forward to a Recovering backend if one exists.
    FailOpen,
}

/// Backend selection settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RoutingConfig {
    pub no_healthy_policy: NoHealthyPolicy,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Path of the metrics endpoint on the main listener.
    pub metrics_path: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_path: "/metrics".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Security hardening configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Add security headers to every client response.
    pub enable_headers: bool,
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_headers: true,
            max_body_size: 2 * 1024 * 1024, // 2MB
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_uses_defaults() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [[backends]]
            name = "app-1"
            address = "127.0.0.1:3000"

            [[routes]]
            name = "all"
            backend_group = "default"
            "#,
        )
        .unwrap();

        assert_eq!(config.backends[0].group, "default");
        assert_eq!(config.backends[0].kind, "default");
        assert_eq!(config.routes[0].path_prefix, "/");
        assert!(config.routes[0].rate_limited);
        assert_eq!(config.rate_limit.capacity, 120);
        assert_eq!(config.rate_limit.refill_per_minute, 100);
        assert_eq!(config.retries.max_attempts, 2);
        assert_eq!(config.timeouts.connect_secs, 60);
        assert_eq!(config.routing.no_healthy_policy, NoHealthyPolicy::FailClosed);
    }

    #[test]
    fn health_profile_falls_back_to_default() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [routing]
            no_healthy_policy = "fail_open"

            [health_kinds.slow]
            interval_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.routing.no_healthy_policy, NoHealthyPolicy::FailOpen);
        assert_eq!(config.health_profile("slow").interval_secs, 30);
        assert_eq!(config.health_profile("slow").unhealthy_threshold, 5);
        assert_eq!(config.health_profile("fast").interval_secs, 10);
    }
}
