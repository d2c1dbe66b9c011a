//! Background maintenance
//!
//! Periodically marks silent workers offline and purges finished tasks past
//! their retention window.

use crate::scheduler::Scheduler;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Spawn the maintenance loop
pub fn start_maintenance(scheduler: Arc<Scheduler>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        info!("Maintenance loop running every {:?}", interval);

        loop {
            ticker.tick().await;
            run_once(&scheduler).await;
        }
    })
}

/// One sweep + purge pass
pub async fn run_once(scheduler: &Scheduler) {
    let now = Utc::now();

    let offline = scheduler.sweep_liveness(now);
    if !offline.is_empty() {
        info!("Marked {} workers offline: {:?}", offline.len(), offline);
    }

    let purged = scheduler.purge_finished(now).await;
    debug!("Maintenance pass done ({} tasks purged)", purged);
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptloop_common::config::SchedulerConfig;
    use promptloop_proto::{WorkerCapabilities, WorkerStatus};

    #[tokio::test]
    async fn test_run_once_marks_stale_workers() {
        let config = SchedulerConfig {
            liveness_window_secs: 30,
            ..Default::default()
        };
        let scheduler = Scheduler::in_memory(&config);
        scheduler
            .register_worker("w1", WorkerCapabilities::default())
            .unwrap();
        scheduler.set_last_heartbeat("w1", Utc::now() - chrono::Duration::seconds(120));

        run_once(&scheduler).await;
        assert_eq!(scheduler.worker("w1").unwrap().status, WorkerStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_loop_ticks() {
        let scheduler = Arc::new(Scheduler::in_memory(&SchedulerConfig::default()));
        scheduler
            .register_worker("w1", WorkerCapabilities::default())
            .unwrap();
        scheduler.set_last_heartbeat("w1", Utc::now() - chrono::Duration::seconds(600));

        let handle = start_maintenance(scheduler.clone(), Duration::from_secs(15));
        tokio::time::sleep(Duration::from_secs(16)).await;

        assert_eq!(scheduler.queue_stats().workers_offline, 1);
        handle.abort();
    }
}
