//! warmcache - Redis-backed cache orchestration
//!
//! This library keeps expensive per-user and global query results warm in a
//! shared key-value store:
//! - Cache-aside reads that fall back to the source of truth on a miss
//! - Incremental patches that update cached listings in place
//! - Scheduled full rebuilds of every namespace
//! - A bounded-concurrency job queue with retry and exponential backoff
//!
//! The source of truth is pluggable through [`SourceBackend`]; storage is
//! either Redis ([`RedisStore`]) or in-process ([`MemoryStore`]).

mod backend;
mod config;
mod error;
mod invalidation;
pub mod jobs;
mod keys;
mod memory_store;
mod orchestrator;
mod queue;
mod runtime;
mod scheduler;
mod store;

#[cfg(test)]
mod test_support;

pub use backend::{CollectionMember, Permissions, SharedCollection, SourceBackend};
pub use config::CacheConfig;
pub use error::{BackendError, CacheError, SourceError, StoreError};
pub use invalidation::{AUTO_COLLECT_APPROVALS_FIELD, PERMISSIONS_FIELD};
pub use jobs::{PatchIntent, PatchJob, PatchOutcome, PatchReport, RebuildJob};
pub use keys::{CacheKey, EntryShape, GLOBAL_INSIGHTS_ID, IdentifierKind, Namespace};
pub use memory_store::MemoryStore;
pub use orchestrator::{CacheOrchestrator, Lookup, Origin, SweepReport};
pub use queue::{
    FailedJob, Job, JobHandler, JobQueue, JobReceiver, QueueConfig, QueueStats, WorkerPool,
    job_queue,
};
pub use runtime::{CacheRuntime, PatchWorker, RebuildWorker};
pub use scheduler::{RebuildScheduler, Schedule, ScheduleConfig};
pub use store::{KeyValueStore, RedisStore};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
