//! Stale-command reaper
//!
//! Commands stuck in PROCESSING past the staleness threshold are failed so
//! the queue keeps making progress. The store's status-guarded update means
//! a correlator racing the reaper produces exactly one terminal write.

use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::GatewayError;
use crate::store::Store;

/// Response text recorded on reaped commands
pub const TIMEOUT_RESPONSE: &str = "Command processing timed out";

/// Periodic worker failing commands that never received a reply
pub struct Reaper {
    store: Store,
    interval: Duration,
    reap_after: Duration,
}

impl Reaper {
    pub fn new(store: Store, interval: Duration, reap_after: Duration) -> Self {
        Self {
            store,
            interval,
            reap_after,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Command reaper started");
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Command reaper shutting down");
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!("Reaper cycle failed: {e}");
                    }
                }
            }
        }
    }

    /// Fail every PROCESSING command older than the threshold
    pub async fn run_cycle(&self) -> Result<u64, GatewayError> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.reap_after)
                .unwrap_or_else(|_| ChronoDuration::seconds(30));

        let reaped = self
            .store
            .reap_stale_commands(cutoff, TIMEOUT_RESPONSE)
            .await?;
        if reaped > 0 {
            info!("Reaped {reaped} stale command(s)");
        }
        Ok(reaped)
    }
}
