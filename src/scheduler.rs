//! Scheduled-command materializer
//!
//! Turns due `ScheduledCommand` rows into fresh PENDING commands and
//! advances their next-run time. A failed enqueue leaves the row due so it
//! is retried on the next tick.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::GatewayError;
use crate::store::Store;

/// Periodic worker firing operator-defined schedules
pub struct Scheduler {
    store: Store,
    interval: Duration,
}

impl Scheduler {
    pub fn new(store: Store, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Command scheduler started");
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Command scheduler shutting down");
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!("Scheduler cycle failed: {e}");
                    }
                }
            }
        }
    }

    /// Fire every due schedule once
    pub async fn run_cycle(&self) -> Result<usize, GatewayError> {
        let now = Utc::now();
        let due = self.store.due_schedules(now).await?;
        let mut fired = 0;

        for schedule in due {
            match self
                .store
                .enqueue_command(schedule.reader_id, schedule.command_type, None)
                .await
            {
                Ok(command) => {
                    let next = schedule.recurrence.advance(schedule.scheduled_time);
                    self.store
                        .complete_schedule_run(schedule.id, now, next)
                        .await?;
                    fired += 1;
                    info!(
                        "Scheduled {} command enqueued for reader {} ({})",
                        schedule.command_type, schedule.reader_id, command.command_id
                    );
                }
                Err(e) => {
                    // Schedule stays due and is retried next tick
                    warn!(
                        "Failed to enqueue scheduled command for reader {}: {e}",
                        schedule.reader_id
                    );
                }
            }
        }

        Ok(fired)
    }
}
