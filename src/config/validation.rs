//! Configuration validation.
//!
//! Serde handles syntax; this module checks semantics: a non-empty pool, routes that
//! reference existing groups, sane thresholds and non-zero durations. All errors are
//! collected so an operator sees every problem at once.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::str::FromStr;

use axum::http::uri::Authority;
use thiserror::Error;

use crate::config::schema::{HealthCheckConfig, ProxyConfig};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("backend pool is empty: configure at least one backend or discovery entry")]
    EmptyPool,

    #[error("no routes configured")]
    NoRoutes,

    #[error("invalid listener address '{0}'")]
    InvalidBindAddress(String),

    #[error("duplicate backend name '{0}'")]
    DuplicateBackend(String),

    #[error("backend '{name}' has invalid address '{address}' (expected host:port)")]
    InvalidBackendAddress { name: String, address: String },

    #[error("discovery entry '{0}' has an empty host")]
    EmptyDiscoveryHost(String),

    #[error("route '{route}' references unknown backend group '{group}'")]
    UnknownGroup { route: String, group: String },

    #[error("route '{0}' path prefix must start with '/'")]
    InvalidPathPrefix(String),

    #[error("health profile '{profile}': {field} must be greater than zero")]
    InvalidHealthProfile { profile: String, field: &'static str },

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("rate limit for '{0}' needs a positive capacity and refill rate")]
    InvalidRateLimit(String),

    #[error("metrics path '{0}' must start with '/'")]
    InvalidMetricsPath(String),
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }

    if config.backends.is_empty() && config.discovery.is_empty() {
        errors.push(ValidationError::EmptyPool);
    }

    let mut names = HashSet::new();
    let mut groups = HashSet::new();
    for backend in &config.backends {
        if !names.insert(backend.name.as_str()) {
            errors.push(ValidationError::DuplicateBackend(backend.name.clone()));
        }
        if !is_host_port(&backend.address) {
            errors.push(ValidationError::InvalidBackendAddress {
                name: backend.name.clone(),
                address: backend.address.clone(),
            });
        }
        groups.insert(backend.group.as_str());
    }
    for entry in &config.discovery {
        if entry.host.trim().is_empty() {
            errors.push(ValidationError::EmptyDiscoveryHost(entry.name.clone()));
        }
        if entry.refresh_secs == 0 {
            errors.push(ValidationError::ZeroValue("discovery.refresh_secs"));
        }
        groups.insert(entry.group.as_str());
    }

    if config.routes.is_empty() {
        errors.push(ValidationError::NoRoutes);
    }
    for route in &config.routes {
        if !groups.contains(route.backend_group.as_str()) {
            errors.push(ValidationError::UnknownGroup {
                route: route.name.clone(),
                group: route.backend_group.clone(),
            });
        }
        if !route.path_prefix.starts_with('/') {
            errors.push(ValidationError::InvalidPathPrefix(route.name.clone()));
        }
        if let Some(limit) = route.rate_limit {
            if limit.capacity == 0 || limit.refill_per_minute == 0 {
                errors.push(ValidationError::InvalidRateLimit(route.name.clone()));
            }
        }
    }

    validate_health_profile("default", &config.health_check, &mut errors);
    for (kind, profile) in &config.health_kinds {
        validate_health_profile(kind, profile, &mut errors);
    }

    if config.rate_limit.enabled
        && (config.rate_limit.capacity == 0 || config.rate_limit.refill_per_minute == 0)
    {
        errors.push(ValidationError::InvalidRateLimit("default".to_string()));
    }
    if config.rate_limit.sweep_interval_secs == 0 {
        errors.push(ValidationError::ZeroValue("rate_limit.sweep_interval_secs"));
    }

    let timeouts = &config.timeouts;
    for (value, name) in [
        (timeouts.connect_secs, "timeouts.connect_secs"),
        (timeouts.send_secs, "timeouts.send_secs"),
        (timeouts.receive_secs, "timeouts.receive_secs"),
        (timeouts.request_secs, "timeouts.request_secs"),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroValue(name));
        }
    }

    if config.retries.max_attempts == 0 {
        errors.push(ValidationError::ZeroValue("retries.max_attempts"));
    }

    if !config.observability.metrics_path.starts_with('/') {
        errors.push(ValidationError::InvalidMetricsPath(
            config.observability.metrics_path.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_health_profile(
    name: &str,
    profile: &HealthCheckConfig,
    errors: &mut Vec<ValidationError>,
) {
    let checks = [
        (profile.unhealthy_threshold as u64, "unhealthy_threshold"),
        (profile.healthy_threshold as u64, "healthy_threshold"),
        (profile.interval_secs, "interval_secs"),
        (profile.timeout_secs, "timeout_secs"),
    ];
    for (value, field) in checks {
        if value == 0 {
            errors.push(ValidationError::InvalidHealthProfile {
                profile: name.to_string(),
                field,
            });
        }
    }
}

fn is_host_port(address: &str) -> bool {
    Authority::from_str(address)
        .map(|authority| authority.port_u16().is_some() && !authority.host().is_empty())
        .unwrap_or(false)
}
