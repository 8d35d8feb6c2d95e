//! Cache orchestrator
//!
//! Owns the cache-aside read path, full rebuilds and sweeps, and in-place
//! patch application. All cache state lives in the [`KeyValueStore`]; the
//! orchestrator itself holds nothing between operations, so any number of
//! instances can share one store.
//!
//! Reads never see cache-layer errors:
//! - Hit: the stored value is returned untouched
//! - Miss: a rebuild is enqueued and the source of truth answers this caller
//! - Store down: the source of truth answers and nothing is enqueued

use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::jobs::{self, PatchJob, PatchOutcome, PatchReport, RebuildJob};
use crate::keys::{GLOBAL_INSIGHTS_ID, IdentifierKind};
use crate::{
    BackendError, CacheConfig, CacheError, CacheKey, JobQueue, KeyValueStore, Namespace,
    SourceBackend, SourceError,
};

/// Where a value returned by [`CacheOrchestrator::get`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Served from the store
    Cache,
    /// Cache miss; fetched live while a rebuild was enqueued
    Source,
    /// Store unreachable; fetched live without touching the cache
    Bypass,
}

/// Result of a read-through lookup
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    pub value: Value,
    pub origin: Origin,
}

/// Summary of a namespace sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub rebuilt: usize,
    /// Keys whose rebuild failed and were skipped
    pub failed: Vec<String>,
}

/// Cache-aside orchestrator over a key-value store and a source backend
pub struct CacheOrchestrator<S: KeyValueStore, B: SourceBackend> {
    inner: Arc<OrchestratorInner<S, B>>,
}

struct OrchestratorInner<S, B> {
    store: S,
    backend: B,
    config: CacheConfig,
    rebuilds: JobQueue<RebuildJob>,
    patches: JobQueue<PatchJob>,
}

impl<S: KeyValueStore, B: SourceBackend> Clone for CacheOrchestrator<S, B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: KeyValueStore, B: SourceBackend> CacheOrchestrator<S, B> {
    /// Create an orchestrator that enqueues onto the given queues.
    ///
    /// The queues' workers are started separately (see `CacheRuntime`), since
    /// they in turn call back into this orchestrator.
    pub fn new(
        store: S,
        backend: B,
        config: CacheConfig,
        rebuilds: JobQueue<RebuildJob>,
        patches: JobQueue<PatchJob>,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                store,
                backend,
                config,
                rebuilds,
                patches,
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn rebuild_queue(&self) -> &JobQueue<RebuildJob> {
        &self.inner.rebuilds
    }

    pub fn patch_queue(&self) -> &JobQueue<PatchJob> {
        &self.inner.patches
    }

    /// Get the entry at `key`, falling back to the source of truth on a miss
    pub async fn get(&self, key: &CacheKey) -> Result<Lookup, CacheError> {
        key.validate()?;

        let origin = match self.read_entry(key).await {
            Ok(Some(value)) => {
                debug!("Cache hit for key: {}", key);
                return Ok(Lookup {
                    value,
                    origin: Origin::Cache,
                });
            }
            Ok(None) => {
                debug!("Cache miss for key: {}", key);
                if let Err(e) = self.inner.rebuilds.enqueue(RebuildJob::one(key)) {
                    warn!("Failed to enqueue rebuild for key {}: {}", key, e);
                }
                Origin::Source
            }
            Err(e) => {
                warn!(
                    "Store read failed for key {} ({}). Falling back to source.",
                    key, e
                );
                Origin::Bypass
            }
        };

        let value = self.fetch_source(key).await?;
        Ok(Lookup { value, origin })
    }

    /// Find one entity inside a list entry, reading through like [`get`](Self::get)
    pub async fn get_entity(
        &self,
        key: &CacheKey,
        entity_id: &str,
    ) -> Result<Option<Value>, CacheError> {
        match self.get(key).await?.value {
            Value::Array(entities) => Ok(entities
                .into_iter()
                .find(|e| jobs::entity_id(e).as_deref() == Some(entity_id))),
            _ => Err(CacheError::ShapeMismatch(key.to_string())),
        }
    }

    /// Fetch `key` from the source of truth and overwrite its entry
    pub async fn rebuild_one(&self, key: &CacheKey) -> Result<Value, CacheError> {
        key.validate()?;
        let started = Instant::now();
        let value = self.fetch_source(key).await?;
        let stored = self.write_entry(key, value).await?;
        debug!("Rebuilt cache for key {} in {:?}", key, started.elapsed());
        Ok(stored)
    }

    /// Enqueue one rebuild per known identifier and return without waiting
    pub async fn rebuild_all(&self, namespace: Namespace) -> Result<usize, CacheError> {
        let keys = self.keys_for(namespace).await?;
        for key in &keys {
            self.inner.rebuilds.enqueue(RebuildJob::one(key))?;
        }
        info!("Enqueued {} rebuilds for {} cache", keys.len(), namespace);
        Ok(keys.len())
    }

    /// Rebuild every entry of `namespace` in turn.
    ///
    /// An identifier whose source fetch fails is logged and skipped. A store
    /// outage or a failure to enumerate the namespace fails the whole sweep so
    /// the rebuild queue retries it.
    pub async fn sweep(&self, namespace: Namespace) -> Result<SweepReport, CacheError> {
        info!("Generating {} cache...", namespace);
        let started = Instant::now();
        let keys = self.keys_for(namespace).await?;

        let mut report = SweepReport::default();
        for key in keys {
            match self.rebuild_one(&key).await {
                Ok(_) => report.rebuilt += 1,
                Err(e @ CacheError::StoreUnavailable(_)) => {
                    warn!(
                        "Aborting {} sweep after {} keys at {}: {}",
                        namespace, report.rebuilt, key, e
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!("Skipping {} during {} sweep: {}", key, namespace, e);
                    report.failed.push(key.to_string());
                }
            }
        }

        info!(
            "{} cache generated for {} keys in {}ms ({} failed)",
            namespace,
            report.rebuilt,
            started.elapsed().as_millis(),
            report.failed.len()
        );

        // Auto-collect listings embed collections, so refresh them afterwards
        if namespace == Namespace::Collections
            && let Err(e) = self
                .inner
                .rebuilds
                .enqueue(RebuildJob::sweep(Namespace::AutoCollects))
        {
            warn!("Failed to enqueue {} sweep: {}", Namespace::AutoCollects, e);
        }

        Ok(report)
    }

    /// Run a rebuild job: one entry, or a sweep when it names no identifier
    pub async fn run_rebuild(&self, job: &RebuildJob) -> Result<(), CacheError> {
        match job.key() {
            Some(key) => self.rebuild_one(&key).await.map(|_| ()),
            None => self.sweep(job.namespace).await.map(|_| ()),
        }
    }

    /// Apply a patch to every owning entry independently.
    ///
    /// An owner whose entry is missing is rebuilt instead of patched. Owners
    /// that succeed keep their update even if others fail.
    pub async fn apply_patch(&self, job: &PatchJob) -> PatchReport {
        let started = Instant::now();
        let targets = patch_targets(job);

        let outcomes = join_all(targets.into_iter().map(|(owner, key)| async move {
            let outcome = self.patch_entry(job, &key).await;
            if let Err(e) = &outcome {
                warn!(
                    "Failed to {} entity {} in {}: {}",
                    job.intent.name(),
                    job.entity_id,
                    key,
                    e
                );
            }
            (owner, outcome)
        }))
        .await;

        debug!(
            "Applied {} of entity {} to {} {} entries in {:?}",
            job.intent.name(),
            job.entity_id,
            outcomes.len(),
            job.namespace,
            started.elapsed()
        );
        PatchReport { outcomes }
    }

    async fn patch_entry(&self, job: &PatchJob, key: &CacheKey) -> Result<PatchOutcome, CacheError> {
        key.validate()?;
        let Some(mut entry) = self.read_entry(key).await? else {
            debug!("Patch target {} missing; rebuilding instead", key);
            self.rebuild_one(key).await?;
            return Ok(PatchOutcome::RebuiltOnMiss);
        };

        if !jobs::apply_intent(key, &mut entry, &job.entity_id, &job.intent)? {
            return Ok(PatchOutcome::Unchanged);
        }
        self.write_entry(key, entry).await?;
        Ok(PatchOutcome::Applied)
    }

    /// Read and decode the stored entry, deleting it if it is corrupt
    pub(crate) async fn read_entry(&self, key: &CacheKey) -> Result<Option<Value>, CacheError> {
        let store_key = key.format_key();
        let Some(json) = self.inner.store.get(&store_key).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<Value>(&json) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(
                    "Failed to deserialize cached value for key {}: {}. Deleting corrupt entry.",
                    key, e
                );
                if let Err(del_err) = self.inner.store.delete(&store_key).await {
                    warn!("Failed to delete corrupt entry for key {}: {}", key, del_err);
                }
                Ok(None)
            }
        }
    }

    /// Stamp and store a whole entry, returning what the store now holds.
    ///
    /// When the stored entry already carries the same payload, it is left
    /// untouched together with its original marker.
    async fn write_entry(&self, key: &CacheKey, mut value: Value) -> Result<Value, CacheError> {
        let store_key = key.format_key();
        if let (Some(field), Value::Object(map)) = (self.inner.config.freshness_field, &mut value) {
            map.remove(field);
            if let Some(current) = self.inner.store.get(&store_key).await?
                && let Ok(Value::Object(mut stored)) = serde_json::from_str::<Value>(&current)
                && stored.remove(field).is_some()
                && stored == *map
            {
                debug!("Entry {} unchanged; keeping stored value", key);
                let kept = serde_json::from_str(&current)?;
                if let Some(ttl) = self.inner.config.entry_ttl {
                    // Same bytes, fresh expiry
                    self.inner.store.set(&store_key, current, Some(ttl)).await?;
                }
                return Ok(kept);
            }
            map.insert(
                field.to_owned(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        let json = serde_json::to_string(&value)?;
        self.inner
            .store
            .set(&store_key, json, self.inner.config.entry_ttl)
            .await?;
        Ok(value)
    }

    /// Produce the current value for `key` from the source of truth
    pub async fn fetch_source(&self, key: &CacheKey) -> Result<Value, CacheError> {
        let backend = &self.inner.backend;
        let id = key.id().unwrap_or_default();

        match key.namespace() {
            Namespace::Collections => {
                found(key, backend.fetch_collections(id).await).map(Value::Array)
            }
            Namespace::AutoCollects => {
                found(key, backend.fetch_auto_collects(id).await).map(Value::Array)
            }
            Namespace::UserStats => found(key, backend.fetch_user_stats(id).await),
            Namespace::ShareLinks => found(key, backend.fetch_share_link(id).await),
            Namespace::State => found(key, backend.fetch_state().await),
            Namespace::Insights => {
                let user = (id != GLOBAL_INSIGHTS_ID).then_some(id);
                let mut periods = Map::new();
                for period in &self.inner.config.insight_periods {
                    let value = found(key, backend.fetch_insights(user, period).await)?;
                    periods.insert(period.clone(), value);
                }
                Ok(Value::Object(periods))
            }
        }
    }

    /// Every key currently derivable for `namespace`
    pub async fn keys_for(&self, namespace: Namespace) -> Result<Vec<CacheKey>, CacheError> {
        let backend = &self.inner.backend;
        let ids = match namespace.identifier_kind() {
            IdentifierKind::Singleton => return Ok(vec![CacheKey::singleton(namespace)]),
            IdentifierKind::User => backend.user_ids().await,
            IdentifierKind::ShareLink => backend.share_link_tokens().await,
        }
        .map_err(|e| CacheError::SourceFetch {
            key: namespace.to_string(),
            source: SourceError::Backend(e),
        })?;

        let mut keys: Vec<CacheKey> = ids
            .into_iter()
            .map(|id| CacheKey::entity(namespace, id))
            .collect();
        if namespace == Namespace::Insights {
            keys.push(CacheKey::entity(namespace, GLOBAL_INSIGHTS_ID));
        }
        Ok(keys)
    }
}

/// Owner label and key for each entry a patch touches
fn patch_targets(job: &PatchJob) -> Vec<(String, CacheKey)> {
    if job.namespace.is_singleton() {
        let key = CacheKey::singleton(job.namespace);
        return vec![(key.to_string(), key)];
    }
    job.owners
        .iter()
        .map(|owner| (owner.clone(), CacheKey::entity(job.namespace, owner.as_str())))
        .collect()
}

fn found<T>(key: &CacheKey, result: Result<Option<T>, BackendError>) -> Result<T, CacheError> {
    match result {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(CacheError::SourceFetch {
            key: key.to_string(),
            source: SourceError::NotFound,
        }),
        Err(e) => Err(CacheError::SourceFetch {
            key: key.to_string(),
            source: SourceError::Backend(e),
        }),
    }
}
