//! Startup orchestration.
//!
//! Order: configuration → initial discovery → pool, limiters and monitor → listener.
//! Any error here is fatal.

use thiserror::Error;

use crate::config::ProxyConfig;
use crate::discovery::{self, DiscoveryError};
use crate::http::HttpServer;
use crate::load_balancer::PoolError;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("initial discovery for '{entry}' failed: {source}")]
    Discovery {
        entry: String,
        source: DiscoveryError,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Resolve every discovery entry once, then build the server.
pub async fn prepare(config: ProxyConfig) -> Result<HttpServer, StartupError> {
    let mut discovered = Vec::with_capacity(config.discovery.len());
    for entry in &config.discovery {
        let thresholds = config.health_profile(&entry.kind).thresholds();
        let members = discovery::resolve(entry, thresholds)
            .await
            .map_err(|source| StartupError::Discovery {
                entry: entry.name.clone(),
                source,
            })?;
        tracing::info!(entry = %entry.name, host = %entry.host, members = members.len(), "Discovery resolved");
        discovered.push((entry.name.clone(), members));
    }

    let server = HttpServer::with_discovered(config, discovered)?;
    let snapshot = server.pool().current_snapshot();
    tracing::info!(
        backends = snapshot.len(),
        routable = snapshot.routable_count(),
        "Backend pool ready"
    );
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;

    #[tokio::test]
    async fn discovered_members_join_the_pool() {
        let mut config = ProxyConfig::default();
        config.discovery = vec![DiscoveryConfig {
            name: "api".into(),
            group: "web".into(),
            host: "127.0.0.1".into(),
            port: 9100,
            kind: "default".into(),
            refresh_secs: 5,
        }];

        let server = prepare(config).await.unwrap();
        assert!(server.pool().current_snapshot().get("api-127.0.0.1:9100").is_some());
    }

    #[tokio::test]
    async fn no_members_at_all_is_fatal() {
        let result = prepare(ProxyConfig::default()).await;
        assert!(matches!(result, Err(StartupError::Pool(PoolError::Empty))));
    }
}
