//! Background job queue
//!
//! An at-least-once work queue served by a fixed pool of worker tasks:
//! - Concurrency bounded by the number of workers
//! - Automatic retry with exponential backoff
//! - Errors, panics and timeouts caught at the job boundary
//! - Optional retention of failed jobs for inspection
//!
//! Enqueueing never blocks. Retries are re-enqueued after their backoff delay
//! instead of holding a worker while they wait.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::CacheError;

/// Configuration for one job queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name used in logs
    pub name: &'static str,
    /// Number of jobs that may run at the same time
    pub concurrency: usize,
    /// Total executions per job, including the first
    pub attempts: u32,
    /// Delay before the first retry; doubles on each further retry
    pub backoff: Duration,
    /// A job running longer than this is aborted and counted as failed
    pub job_timeout: Duration,
    /// How many permanently failed jobs to keep; 0 discards them
    pub failed_history: usize,
}

impl QueueConfig {
    /// Heavyweight rebuild jobs: few at a time, retried, failures kept
    pub fn rebuild() -> Self {
        Self {
            name: "cache:rebuild",
            concurrency: 3,
            attempts: 3,
            backoff: Duration::from_secs(1),
            job_timeout: Duration::from_secs(600),
            failed_history: 100,
        }
    }

    /// Lightweight patch jobs: single attempt, no history
    pub fn patch() -> Self {
        Self {
            name: "cache:patch",
            concurrency: 3,
            attempts: 1,
            backoff: Duration::from_secs(1),
            job_timeout: Duration::from_secs(60),
            failed_history: 0,
        }
    }

    /// Delay before re-running a job that just failed its `attempt`-th run
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor)
    }
}

/// Trait for job payloads
pub trait Job: Clone + Debug + Send + Sync + 'static {}
impl<T> Job for T where T: Clone + Debug + Send + Sync + 'static {}

/// Executes jobs pulled from a queue
#[async_trait::async_trait]
pub trait JobHandler<J>: Send + Sync + 'static {
    async fn handle(&self, job: &J) -> Result<(), CacheError>;
}

/// A job that exhausted its attempts
#[derive(Debug, Clone)]
pub struct FailedJob<J> {
    pub job: J,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Counters since the queue was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
}

struct Envelope<J> {
    job: J,
    attempt: u32,
}

struct QueueShared<J> {
    config: QueueConfig,
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    /// Jobs enqueued or waiting for a retry that have not reached a final state
    outstanding: AtomicUsize,
    idle: Notify,
    failed_jobs: Mutex<VecDeque<FailedJob<J>>>,
}

/// Producer side of a job queue. Cheap to clone.
pub struct JobQueue<J> {
    tx: mpsc::UnboundedSender<Envelope<J>>,
    shared: Arc<QueueShared<J>>,
}

impl<J> Clone for JobQueue<J> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Consumer side of a job queue, turned into workers by [`JobReceiver::start`]
pub struct JobReceiver<J> {
    rx: mpsc::UnboundedReceiver<Envelope<J>>,
    queue: JobQueue<J>,
}

/// Create a queue and its receiving end
pub fn job_queue<J: Job>(config: QueueConfig) -> (JobQueue<J>, JobReceiver<J>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = JobQueue {
        tx,
        shared: Arc::new(QueueShared {
            config,
            enqueued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
            failed_jobs: Mutex::new(VecDeque::new()),
        }),
    };
    let receiver = JobReceiver {
        rx,
        queue: queue.clone(),
    };
    (queue, receiver)
}

impl<J: Job> JobQueue<J> {
    pub fn name(&self) -> &'static str {
        self.shared.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Add a job without waiting for it to run
    pub fn enqueue(&self, job: J) -> Result<(), CacheError> {
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Envelope { job, attempt: 1 }).is_err() {
            self.finish_one();
            return Err(CacheError::QueueClosed(self.name()));
        }
        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            retried: self.shared.retried.load(Ordering::Relaxed),
        }
    }

    /// Jobs not yet completed or dropped, including those waiting to retry
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Retained jobs that exhausted their attempts, oldest first
    pub async fn failed_jobs(&self) -> Vec<FailedJob<J>> {
        self.shared.failed_jobs.lock().await.iter().cloned().collect()
    }

    /// Wait until every enqueued job has completed or been dropped.
    ///
    /// Jobs left in the channel when the workers shut down count as dropped.
    pub async fn drained(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn finish_one(&self) {
        if self.shared.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.idle.notify_waiters();
        }
    }

    async fn execute<H: JobHandler<J>>(&self, envelope: Envelope<J>, handler: &Arc<H>) {
        let Envelope { job, attempt } = envelope;
        let config = &self.shared.config;
        debug!(
            "Queue {}: running {:?} (attempt {}/{})",
            config.name, job, attempt, config.attempts
        );

        let started = Instant::now();
        let task = {
            let handler = Arc::clone(handler);
            let job = job.clone();
            tokio::spawn(async move { handler.handle(&job).await })
        };
        let abort = task.abort_handle();

        let result = match tokio::time::timeout(config.job_timeout, task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(e)) if e.is_panic() => Err("job panicked".to_owned()),
            Ok(Err(_)) => Err("job was cancelled".to_owned()),
            Err(_) => {
                abort.abort();
                Err(format!("job timed out after {:?}", config.job_timeout))
            }
        };

        match result {
            Ok(()) => {
                self.shared.completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Queue {}: completed {:?} in {:?}",
                    config.name,
                    job,
                    started.elapsed()
                );
                self.finish_one();
            }
            Err(error) if attempt < config.attempts => {
                self.shared.retried.fetch_add(1, Ordering::Relaxed);
                let delay = config.backoff_delay(attempt);
                warn!(
                    "Queue {}: {:?} failed on attempt {}/{}: {}. Retrying in {:?}",
                    config.name, job, attempt, config.attempts, error, delay
                );
                let queue = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let retry = Envelope {
                        job,
                        attempt: attempt + 1,
                    };
                    if queue.tx.send(retry).is_err() {
                        debug!("Queue {}: closed before retry could run", queue.name());
                        queue.finish_one();
                    }
                });
            }
            Err(error) => {
                self.shared.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Queue {}: dropping {:?} after {} attempts: {}",
                    config.name, job, attempt, error
                );
                if config.failed_history > 0 {
                    let mut failed = self.shared.failed_jobs.lock().await;
                    if failed.len() == config.failed_history {
                        failed.pop_front();
                    }
                    failed.push_back(FailedJob {
                        job,
                        attempts: attempt,
                        error,
                        failed_at: Utc::now(),
                    });
                }
                self.finish_one();
            }
        }
    }
}

impl<J: Job> JobReceiver<J> {
    /// Spawn `concurrency` workers that feed jobs to `handler`
    pub fn start<H: JobHandler<J>>(self, handler: Arc<H>) -> WorkerPool {
        let JobReceiver { rx, queue } = self;
        let name = queue.name();
        let worker_count = queue.config().concurrency.max(1);
        let rx = Arc::new(Mutex::new(rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = (0..worker_count)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let queue = queue.clone();
                let handler = Arc::clone(&handler);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(worker_task(worker_id, queue, rx, handler, shutdown))
            })
            .collect();

        info!("Queue {}: started {} workers", name, worker_count);

        WorkerPool {
            name,
            handles,
            shutdown: shutdown_tx,
        }
    }

    /// Take the next pending job without running it
    #[cfg(test)]
    pub(crate) fn try_next(&mut self) -> Option<J> {
        self.rx.try_recv().ok().map(|envelope| envelope.job)
    }
}

async fn worker_task<J: Job, H: JobHandler<J>>(
    worker_id: usize,
    queue: JobQueue<J>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Envelope<J>>>>,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let envelope = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.changed() => None,
                msg = rx.recv() => msg,
            }
        };
        let Some(envelope) = envelope else {
            break;
        };
        queue.execute(envelope, &handler).await;
    }

    // Jobs still in the channel will never run; release them so `drained`
    // can return. Closing also rejects later enqueues and pending retries.
    let mut rx = rx.lock().await;
    rx.close();
    let mut dropped = 0;
    while rx.try_recv().is_ok() {
        queue.finish_one();
        dropped += 1;
    }
    if dropped > 0 {
        warn!(
            "Queue {}: dropped {} undelivered jobs on shutdown",
            queue.name(),
            dropped
        );
    }
    debug!("Queue {}: worker {} stopped", queue.name(), worker_id);
}

/// Running workers of one queue. Dropping the pool stops its workers.
pub struct WorkerPool {
    name: &'static str,
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop pulling new jobs and wait for running ones to finish.
    /// Jobs not yet picked up are discarded and the queue stops accepting work.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Queue {}: worker exited abnormally: {}", self.name, e);
            }
        }
        info!("Queue {}: workers stopped", self.name);
    }
}
