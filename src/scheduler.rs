//! Periodic rebuild scheduler
//!
//! One timer per namespace. Every tick enqueues a sweep onto the rebuild
//! queue; the sweep itself runs on the queue's workers, so a slow or failing
//! sweep never holds up the timer.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::jobs::RebuildJob;
use crate::{JobQueue, Namespace};

/// Rebuild `namespace` every `every`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub namespace: Namespace,
    pub every: Duration,
}

impl Schedule {
    pub const fn new(namespace: Namespace, every: Duration) -> Self {
        Self { namespace, every }
    }
}

/// Configuration for the rebuild scheduler
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub schedules: Vec<Schedule>,
    /// Fire every schedule once as soon as the scheduler starts
    pub run_on_start: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        const MINUTE: u64 = 60;
        Self {
            schedules: vec![
                Schedule::new(Namespace::State, Duration::from_secs(10 * MINUTE)),
                Schedule::new(Namespace::UserStats, Duration::from_secs(30 * MINUTE)),
                Schedule::new(Namespace::Collections, Duration::from_secs(60 * MINUTE)),
                Schedule::new(Namespace::ShareLinks, Duration::from_secs(60 * MINUTE)),
                Schedule::new(Namespace::Insights, Duration::from_secs(240 * MINUTE)),
            ],
            run_on_start: true,
        }
    }
}

/// Running timers. Dropping the scheduler stops them.
pub struct RebuildScheduler {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl RebuildScheduler {
    /// Start one timer task per schedule
    pub fn start(queue: JobQueue<RebuildJob>, config: &ScheduleConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = config
            .schedules
            .iter()
            .filter(|schedule| {
                if schedule.every.is_zero() {
                    warn!("Ignoring zero interval for {} rebuilds", schedule.namespace);
                    return false;
                }
                true
            })
            .map(|schedule| {
                tokio::spawn(timer_task(
                    *schedule,
                    config.run_on_start,
                    queue.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect::<Vec<_>>();

        info!("Rebuild scheduler started with {} timers", handles.len());
        Self {
            handles,
            shutdown: shutdown_tx,
        }
    }

    pub fn timer_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop every timer. Sweeps already enqueued still run.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Rebuild timer exited abnormally: {}", e);
            }
        }
        info!("Rebuild scheduler stopped");
    }
}

async fn timer_task(
    schedule: Schedule,
    run_on_start: bool,
    queue: JobQueue<RebuildJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    let first = if run_on_start {
        Instant::now()
    } else {
        Instant::now() + schedule.every
    };
    let mut ticker = interval_at(first, schedule.every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                // A tick runs in its own task so a panic cannot end the loop
                let queue = queue.clone();
                let namespace = schedule.namespace;
                let tick = tokio::spawn(async move {
                    queue.enqueue(RebuildJob::sweep(namespace))
                });
                match tick.await {
                    Ok(Ok(())) => debug!("Scheduled {} rebuild", namespace),
                    Ok(Err(e)) => warn!("Failed to schedule {} rebuild: {}", namespace, e),
                    Err(e) => error!("Scheduled {} rebuild panicked: {}", namespace, e),
                }
            }
        }
    }
    debug!("Rebuild timer for {} stopped", schedule.namespace);
}
