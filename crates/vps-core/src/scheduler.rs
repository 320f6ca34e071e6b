//! Periodic background tasks with overlap guards and graceful shutdown.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Admits at most one cycle at a time.
#[derive(Clone)]
pub struct CycleGuard {
    name: &'static str,
    running: Arc<AtomicBool>,
}

/// Held for the duration of a cycle; releases the guard on drop.
pub struct CycleToken {
    running: Arc<AtomicBool>,
}

impl Drop for CycleToken {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

impl CycleGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn try_enter(&self) -> Option<CycleToken> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(task = self.name, "Previous cycle still running, skipping");
            return None;
        }
        Some(CycleToken {
            running: self.running.clone(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Sender half: flip once to stop every periodic task.
#[derive(Clone)]
pub struct ShutdownTrigger(Arc<watch::Sender<bool>>);

pub type ShutdownSignal = watch::Receiver<bool>;

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // Ignore the error: it only means every task has already exited
        let _ = self.0.send(true);
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(Arc::new(tx)), rx)
}

/// Call `cycle` every `period` until shutdown is signalled.
///
/// The first cycle runs immediately. Ticks missed while a cycle overruns are
/// skipped rather than replayed. A cycle already in flight when shutdown
/// arrives is allowed to finish.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: ShutdownSignal,
    mut cycle: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(task = name, ?period, "Periodic task started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                // A dropped trigger counts as shutdown too
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let started = Instant::now();
                cycle().await;
                debug!(task = name, elapsed = ?started.elapsed(), "Cycle finished");
            }
        }
    }

    info!(task = name, "Periodic task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_guard_rejects_overlap() {
        let guard = CycleGuard::new("test");
        let token = guard.try_enter().unwrap();
        assert!(guard.is_running());
        assert!(guard.try_enter().is_none());
        drop(token);
        assert!(guard.try_enter().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_runs_until_shutdown() {
        let (trigger, signal) = shutdown_channel();
        let count = Arc::new(AtomicUsize::new(0));

        let task = {
            let count = count.clone();
            tokio::spawn(run_periodic(
                "count",
                Duration::from_secs(60),
                signal,
                move || {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                    }
                },
            ))
        };

        tokio::time::sleep(Duration::from_secs(150)).await;
        trigger.trigger();
        task.await.unwrap();
        // Ticks at 0s, 60s and 120s
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_cycle_completes_on_shutdown() {
        let (trigger, signal) = shutdown_channel();
        let finished = Arc::new(AtomicBool::new(false));

        let task = {
            let finished = finished.clone();
            tokio::spawn(run_periodic(
                "slow",
                Duration::from_secs(60),
                signal,
                move || {
                    let finished = finished.clone();
                    async move {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        finished.store(true, Ordering::SeqCst);
                    }
                },
            ))
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.trigger();
        task.await.unwrap();
        assert!(finished.load(Ordering::SeqCst));
    }
}
