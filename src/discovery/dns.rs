//! DNS-based membership.
//!
//! A discovery entry names a host that resolves to every replica (a compose service name,
//! a headless service). Each resolved address becomes a backend with id
//! `{name}-{ip}:{port}`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::lookup_host;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::DiscoveryConfig;
use crate::health::state::HealthThresholds;
use crate::load_balancer::backend::BackendSpec;
use crate::load_balancer::pool::{BackendPool, MembershipSource, PoolError};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        source: std::io::Error,
    },

    #[error("{host} resolved to no addresses")]
    Empty { host: String },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Backend spec for one resolved address.
pub fn member_spec(
    entry: &DiscoveryConfig,
    address: SocketAddr,
    thresholds: HealthThresholds,
) -> BackendSpec {
    BackendSpec {
        id: format!("{}-{}", entry.name, address),
        address: address.to_string(),
        group: entry.group.clone(),
        kind: entry.kind.clone(),
        thresholds,
    }
}

/// Resolve an entry once. Addresses are sorted so ids come out in a stable order.
pub async fn resolve(
    entry: &DiscoveryConfig,
    thresholds: HealthThresholds,
) -> Result<Vec<BackendSpec>, DiscoveryError> {
    let mut addresses: Vec<SocketAddr> = lookup_host((entry.host.as_str(), entry.port))
        .await
        .map_err(|source| DiscoveryError::Resolve {
            host: entry.host.clone(),
            source,
        })?
        .collect();
    addresses.sort();
    addresses.dedup();

    if addresses.is_empty() {
        return Err(DiscoveryError::Empty {
            host: entry.host.clone(),
        });
    }
    Ok(addresses
        .into_iter()
        .map(|address| member_spec(entry, address, thresholds))
        .collect())
}

/// Periodically re-resolves one entry into the pool.
#[derive(Debug)]
pub struct DnsDiscovery {
    entry: DiscoveryConfig,
    thresholds: HealthThresholds,
    pool: Arc<BackendPool>,
}

impl DnsDiscovery {
    pub fn new(entry: DiscoveryConfig, thresholds: HealthThresholds, pool: Arc<BackendPool>) -> Self {
        Self {
            entry,
            thresholds,
            pool,
        }
    }

    pub fn source(&self) -> MembershipSource {
        MembershipSource::Discovery(self.entry.name.clone())
    }

    /// Resolve and replace this entry's members. Returns the member count.
    pub async fn refresh(&self) -> Result<usize, DiscoveryError> {
        let members = resolve(&self.entry, self.thresholds).await?;
        let count = members.len();
        self.pool.set_members(self.source(), members)?;
        Ok(count)
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let period = Duration::from_secs(self.entry.refresh_secs.max(1));
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.refresh().await {
                        Ok(count) => tracing::trace!(entry = %self.entry.name, count, "Discovery refreshed"),
                        Err(e) => tracing::warn!(
                            entry = %self.entry.name,
                            error = %e,
                            "Discovery refresh failed, keeping previous members"
                        ),
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!(entry = %self.entry.name, "Discovery stopping");
                    break;
                }
            }
        }
    }
}
