use crate::config::RetentionConfig;
use crate::metrics::ROWS_PURGED_TOTAL;
use crate::store::Store;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

/// Deletes readings and polling log rows older than the retention horizon.
#[derive(Debug, Clone, Copy)]
pub struct RetentionSweeper {
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(config: RetentionConfig) -> Self {
        Self { config }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.config.horizon
    }

    /// Best-effort: storage errors are logged and never returned.
    pub async fn sweep(&self, store: &dyn Store, now: DateTime<Utc>) {
        let cutoff = self.cutoff(now);

        let readings = match store.delete_readings_before(cutoff).await {
            Ok(n) => n,
            Err(e) => {
                error!("Retention sweep of readings failed: {}", e);
                0
            }
        };
        let logs = match store.delete_polling_logs_before(cutoff).await {
            Ok(n) => n,
            Err(e) => {
                error!("Retention sweep of polling logs failed: {}", e);
                0
            }
        };

        ROWS_PURGED_TOTAL.inc_by((readings + logs) as f64);
        if readings + logs > 0 {
            info!(
                "Retention removed {} readings and {} polling log entries older than {}",
                readings, logs, cutoff
            );
        } else {
            debug!("Retention found nothing older than {}", cutoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReadingKind;
    use crate::testing::MemoryStore;
    use chrono::Duration;

    #[tokio::test]
    async fn test_sweep_respects_horizon_boundary() {
        let store = MemoryStore::new();
        let hub = store.add_hub(|_| {});
        let device = store.add_device(hub.id, "dev-1", "Hall");
        let now = Utc::now();
        let horizon = Duration::days(7);

        let ages = [
            Duration::days(30),
            Duration::days(7) + Duration::seconds(1),
            Duration::days(7),
            Duration::days(1),
            Duration::zero(),
        ];
        for age in ages {
            store.add_reading(device.id, now - age, ReadingKind::Motion);
            store.add_poll_log(hub.id, now - age);
        }

        let sweeper = RetentionSweeper::new(RetentionConfig { horizon });
        sweeper.sweep(&store, now).await;

        let cutoff = now - horizon;
        let readings = store.readings();
        let logs = store.poll_logs();
        assert_eq!(readings.len(), 3);
        assert_eq!(logs.len(), 3);
        assert!(readings.iter().all(|r| r.timestamp >= cutoff));
        assert!(logs.iter().all(|l| l.timestamp >= cutoff));
    }

    #[tokio::test]
    async fn test_sweep_swallows_storage_errors() {
        let store = MemoryStore::new();
        store.fail_deletes(true);
        let sweeper = RetentionSweeper::new(RetentionConfig {
            horizon: Duration::days(1),
        });
        // Must complete without panicking or propagating.
        sweeper.sweep(&store, Utc::now()).await;
    }
}
