//! Background loop keeping the [`NameStore`] in sync with the remote topology.
//!
//! Each cycle fetches the topology, builds a mapping and installs it. A failed
//! cycle leaves the current mapping untouched; the next tick tries again.

use crate::error::Result;
use crate::store::{MappingDiff, NameStore};
use crate::topology::TopologyBuilder;
use crate::zeabur::{TopologySource, ZeaburClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shortest accepted refresh interval; smaller values are raised to it.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Credentials and schedule for the background refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshPolicy {
    pub api_url: String,
    pub api_key: String,
    pub server_id: String,
    pub interval: Duration,
    pub fetch_timeout: Duration,
}

/// Periodically refreshes a shared [`NameStore`].
pub struct Refresher {
    source: Arc<dyn TopologySource>,
    builder: TopologyBuilder,
    store: Arc<NameStore>,
    interval: Duration,
}

impl Refresher {
    /// Creates a refresher over an arbitrary topology source.
    ///
    /// `interval` is raised to [`MIN_INTERVAL`] if shorter.
    pub fn new(
        source: Arc<dyn TopologySource>,
        builder: TopologyBuilder,
        store: Arc<NameStore>,
        interval: Duration,
    ) -> Self {
        if interval < MIN_INTERVAL {
            warn!(requested = ?interval, "Refresh interval too short, using {:?}", MIN_INTERVAL);
        }
        Self {
            source,
            builder,
            store,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// Creates a refresher that talks to the Zeabur API.
    pub fn from_policy(policy: &RefreshPolicy, store: Arc<NameStore>) -> Result<Self> {
        let client = ZeaburClient::new(&policy.api_url, &policy.api_key, policy.fetch_timeout)?;
        Ok(Self::new(
            Arc::new(client),
            TopologyBuilder::new(&policy.server_id),
            store,
            policy.interval,
        ))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs one fetch, build and install cycle.
    ///
    /// The store is only touched once the new mapping is fully built.
    pub async fn refresh_once(&self) -> Result<MappingDiff> {
        let raw = self.source.fetch().await?;
        let mapping = self.builder.build(&raw)?;
        Ok(self.store.replace(mapping))
    }

    /// Refreshes immediately, then every interval, until `cancel` fires.
    ///
    /// Cancellation also abandons a fetch that is still in flight.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval = ?self.interval,
            server_id = %self.builder.server_id(),
            "Zeabur DNS refresher started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Refresh cycle interrupted by shutdown");
                    break;
                }
                result = self.refresh_once() => match result {
                    Ok(diff) => info!(
                        entries = self.store.size(),
                        added = diff.added.len(),
                        removed = diff.removed.len(),
                        changed = diff.changed.len(),
                        "Zeabur DNS store updated"
                    ),
                    Err(e) => warn!(
                        error = %e,
                        entries = self.store.size(),
                        "Failed to update Zeabur DNS store, keeping current mapping"
                    ),
                }
            }
        }

        info!("Zeabur DNS refresher stopped");
    }
}
