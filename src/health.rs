// ===============================
// src/health.rs
// ===============================
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::now_ms;
use crate::metrics::HEALTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
        }
    }
}

/// Last time the detector heard from any source (epoch ms).
#[derive(Debug, Clone)]
pub struct Activity(Arc<AtomicI64>);

impl Activity {
    pub fn new() -> Self {
        Activity(Arc::new(AtomicI64::new(now_ms())))
    }

    pub fn touch(&self) {
        self.0.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_ms(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

pub fn evaluate(last_activity_ms: i64, now: i64, stall_after: Duration) -> HealthStatus {
    if now - last_activity_ms > stall_after.as_millis() as i64 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// DEGRADED once the detector has been silent for more than `stall_after`
/// (twice the refresh interval).
pub async fn run_monitor(
    activity: Activity,
    stall_after: Duration,
    tx: watch::Sender<HealthStatus>,
    cancel: CancellationToken,
) {
    let period = (stall_after / 4).max(Duration::from_millis(100));
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let status = evaluate(activity.last_ms(), now_ms(), stall_after);
                let prev = *tx.borrow();
                if status != prev {
                    match status {
                        HealthStatus::Degraded => warn!(
                            silent_ms = now_ms() - activity.last_ms(),
                            "detector stalled, health DEGRADED"
                        ),
                        HealthStatus::Healthy => info!("detector active again, health HEALTHY"),
                    }
                    let _ = tx.send(status);
                }
                HEALTH
                    .with_label_values(&["detector"])
                    .set((status == HealthStatus::Healthy) as i64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_threshold() {
        let stall = Duration::from_secs(120);
        assert_eq!(evaluate(0, 120_000, stall), HealthStatus::Healthy);
        assert_eq!(evaluate(0, 120_001, stall), HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn monitor_degrades_then_recovers() {
        let activity = Activity::new();
        let (tx, mut rx) = watch::channel(HealthStatus::Healthy);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_monitor(
            activity.clone(),
            Duration::from_millis(200),
            tx,
            cancel.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(3), async {
            while *rx.borrow_and_update() != HealthStatus::Degraded {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("degraded in time");

        activity.touch();
        tokio::time::timeout(Duration::from_secs(3), async {
            while *rx.borrow_and_update() != HealthStatus::Healthy {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("healthy again");

        cancel.cancel();
        let _ = task.await;
    }
}
