//! Background runtime
//!
//! Wires one store and one backend to the orchestrator, starts the worker
//! pools of both queues and the rebuild scheduler, and tears them down again.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::jobs::{PatchJob, RebuildJob};
use crate::queue::{JobHandler, job_queue};
use crate::{
    CacheConfig, CacheError, CacheOrchestrator, KeyValueStore, RebuildScheduler, SourceBackend,
    WorkerPool,
};

/// Runs rebuild jobs against an orchestrator
pub struct RebuildWorker<S: KeyValueStore, B: SourceBackend> {
    orchestrator: CacheOrchestrator<S, B>,
}

#[async_trait]
impl<S: KeyValueStore, B: SourceBackend> JobHandler<RebuildJob> for RebuildWorker<S, B> {
    async fn handle(&self, job: &RebuildJob) -> Result<(), CacheError> {
        self.orchestrator.run_rebuild(job).await
    }
}

/// Applies patch jobs; the job fails if any owner's entry failed
pub struct PatchWorker<S: KeyValueStore, B: SourceBackend> {
    orchestrator: CacheOrchestrator<S, B>,
}

#[async_trait]
impl<S: KeyValueStore, B: SourceBackend> JobHandler<PatchJob> for PatchWorker<S, B> {
    async fn handle(&self, job: &PatchJob) -> Result<(), CacheError> {
        self.orchestrator.apply_patch(job).await.into_result()
    }
}

/// A running cache: orchestrator, queue workers and scheduler
pub struct CacheRuntime<S: KeyValueStore, B: SourceBackend> {
    orchestrator: CacheOrchestrator<S, B>,
    rebuild_workers: WorkerPool,
    patch_workers: WorkerPool,
    scheduler: RebuildScheduler,
}

impl<S: KeyValueStore, B: SourceBackend> CacheRuntime<S, B> {
    /// Start everything. Must be called from within a tokio runtime.
    pub fn start(store: S, backend: B, config: CacheConfig) -> Self {
        let (rebuilds, rebuild_rx) = job_queue(config.rebuild_queue.clone());
        let (patches, patch_rx) = job_queue(config.patch_queue.clone());
        let schedule = config.schedule.clone();

        let orchestrator = CacheOrchestrator::new(store, backend, config, rebuilds.clone(), patches);

        let rebuild_workers = rebuild_rx.start(Arc::new(RebuildWorker {
            orchestrator: orchestrator.clone(),
        }));
        let patch_workers = patch_rx.start(Arc::new(PatchWorker {
            orchestrator: orchestrator.clone(),
        }));
        let scheduler = RebuildScheduler::start(rebuilds, &schedule);

        info!(
            "Cache runtime started: {} rebuild workers, {} patch workers, {} timers",
            rebuild_workers.worker_count(),
            patch_workers.worker_count(),
            scheduler.timer_count()
        );

        Self {
            orchestrator,
            rebuild_workers,
            patch_workers,
            scheduler,
        }
    }

    pub fn orchestrator(&self) -> &CacheOrchestrator<S, B> {
        &self.orchestrator
    }

    /// Wait until both queues are empty, including jobs enqueued by other jobs
    pub async fn drained(&self) {
        let rebuilds = self.orchestrator.rebuild_queue();
        let patches = self.orchestrator.patch_queue();
        while rebuilds.outstanding() > 0 || patches.outstanding() > 0 {
            rebuilds.drained().await;
            patches.drained().await;
        }
    }

    /// Stop the timers, then let workers finish the jobs they are running
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        self.rebuild_workers.shutdown().await;
        self.patch_workers.shutdown().await;
        info!("Cache runtime stopped");
    }
}
