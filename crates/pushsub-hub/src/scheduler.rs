//! Periodic maintenance: requeue due subscribers and prune terminated ones.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use pushsub_core::config::HubConfig;
use pushsub_core::{Priority, SubscriptionLifecycle};

/// Timing and targets for the scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSettings {
    pub requeue_every: Duration,
    pub prune_every: Duration,
    pub prune_after_days: i64,
    pub default_priority: Priority,
}

impl From<&HubConfig> for ScheduleSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            requeue_every: Duration::from_secs(config.requeue_interval_secs.max(1)),
            prune_every: Duration::from_secs(config.prune_interval_secs.max(1)),
            prune_after_days: config.prune_after_days,
            default_priority: config.default_priority,
        }
    }
}

/// Spawn the maintenance loop. It runs until `shutdown` changes.
///
/// The first requeue happens immediately; pruning waits one full period.
pub fn spawn_scheduler(
    lifecycle: Arc<SubscriptionLifecycle>,
    settings: ScheduleSettings,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut requeue = tokio::time::interval(settings.requeue_every);
        requeue.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut prune = tokio::time::interval(settings.prune_every);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
        prune.tick().await; // Skip first immediate tick

        info!(
            requeue_secs = settings.requeue_every.as_secs(),
            prune_secs = settings.prune_every.as_secs(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = requeue.tick() => {
                    if let Err(e) = lifecycle.requeue(settings.default_priority).await {
                        warn!(error = %e, retryable = e.is_retryable(), "Scheduled requeue failed");
                    }
                }
                _ = prune.tick() => {
                    if let Err(e) = lifecycle.prune_terminated(settings.prune_after_days).await {
                        warn!(error = %e, "Scheduled prune failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Scheduler shutting down");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pushsub_core::dispatch::RecordingDispatcher;
    use pushsub_core::{MemoryStore, Renewal, RetryState, Subscriber, SubscriptionStore};

    fn settings(requeue_ms: u64, prune_ms: u64) -> ScheduleSettings {
        ScheduleSettings {
            requeue_every: Duration::from_millis(requeue_ms),
            prune_every: Duration::from_millis(prune_ms),
            prune_after_days: 30,
            default_priority: Priority::High,
        }
    }

    fn row(id: &str, state: RetryState, renewed_at: i64) -> Subscriber {
        let renewal = Renewal {
            owner_id: "o1".into(),
            nickname: id.into(),
            subscribe: true,
            callback_url: format!("https://example.com/{id}"),
            topic: "https://example.com/feed".into(),
            secret: String::new(),
        };
        let mut sub = Subscriber::renewed(id.into(), &renewal, None, renewed_at);
        sub.state = state;
        sub
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let config = HubConfig {
            requeue_interval_secs: 0,
            prune_interval_secs: 0,
            ..HubConfig::default()
        };
        let settings = ScheduleSettings::from(&config);
        assert_eq!(settings.requeue_every, Duration::from_secs(1));
        assert_eq!(settings.prune_every, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn requeues_and_prunes_until_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(RecordingDispatcher::new());
        store.upsert(&row("due", RetryState::Pending, 0)).await.unwrap();
        store.upsert(&row("dead", RetryState::Terminated, 0)).await.unwrap();
        let lifecycle = Arc::new(SubscriptionLifecycle::new(store.clone(), dispatcher.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_scheduler(lifecycle, settings(10, 20), shutdown_rx);

        let mut jobs = Vec::new();
        for _ in 0..100 {
            jobs.extend(dispatcher.take());
            if !jobs.is_empty() && store.get_by_id("dead").await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(jobs.iter().all(|j| j.subscriber_id == "due"));
        assert!(!jobs.is_empty());
        assert!(store.get_by_id("dead").await.unwrap().is_none());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
