//! Test doubles shared by the unit tests

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::jobs::{PatchJob, RebuildJob};
use crate::queue::{JobReceiver, job_queue};
use crate::{
    BackendError, CacheConfig, CacheOrchestrator, KeyValueStore, MemoryStore, QueueConfig,
    SharedCollection, SourceBackend, StoreError,
};

#[derive(Default)]
struct MockData {
    users: Vec<String>,
    collections: HashMap<String, Vec<Value>>,
    shared: HashMap<String, SharedCollection>,
    auto_collects: HashMap<String, Vec<Value>>,
    stats: HashMap<String, Value>,
    insights: HashMap<(Option<String>, String), Value>,
    share_links: Vec<(String, Value)>,
    state: Option<Value>,
    failing: HashSet<String>,
    failing_enumerations: u32,
}

/// In-memory source of truth with failure injection
#[derive(Default)]
pub struct MockBackend {
    data: Mutex<MockData>,
    fetches: AtomicUsize,
    enumerations: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user_id: &str) {
        let mut data = self.data.lock().unwrap();
        if !data.users.iter().any(|u| u == user_id) {
            data.users.push(user_id.to_owned());
        }
    }

    pub fn set_collections(&self, user_id: &str, collections: Vec<Value>) {
        self.add_user(user_id);
        self.data
            .lock()
            .unwrap()
            .collections
            .insert(user_id.to_owned(), collections);
    }

    pub fn push_collection(&self, user_id: &str, collection: Value) {
        self.data
            .lock()
            .unwrap()
            .collections
            .entry(user_id.to_owned())
            .or_default()
            .push(collection);
    }

    pub fn set_shared_collection(&self, collection_id: &str, shared: SharedCollection) {
        self.data
            .lock()
            .unwrap()
            .shared
            .insert(collection_id.to_owned(), shared);
    }

    pub fn set_auto_collects(&self, user_id: &str, auto_collects: Vec<Value>) {
        self.add_user(user_id);
        self.data
            .lock()
            .unwrap()
            .auto_collects
            .insert(user_id.to_owned(), auto_collects);
    }

    pub fn set_stats(&self, user_id: &str, stats: Value) {
        self.add_user(user_id);
        self.data
            .lock()
            .unwrap()
            .stats
            .insert(user_id.to_owned(), stats);
    }

    pub fn set_insights(&self, user_id: Option<&str>, period: &str, insights: Value) {
        self.data
            .lock()
            .unwrap()
            .insights
            .insert((user_id.map(str::to_owned), period.to_owned()), insights);
    }

    pub fn set_share_link(&self, token: &str, projection: Value) {
        let mut data = self.data.lock().unwrap();
        data.share_links.retain(|(t, _)| t != token);
        data.share_links.push((token.to_owned(), projection));
    }

    pub fn set_state(&self, state: Value) {
        self.data.lock().unwrap().state = Some(state);
    }

    /// Make every fetch for `id` fail
    pub fn fail_for(&self, id: &str) {
        self.data.lock().unwrap().failing.insert(id.to_owned());
    }

    /// Make the next `times` identifier enumerations fail
    pub fn fail_enumerations(&self, times: u32) {
        self.data.lock().unwrap().failing_enumerations = times;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn enumeration_count(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    fn check(&self, id: &str) -> Result<(), BackendError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.data.lock().unwrap().failing.contains(id) {
            return Err(format!("backend unavailable for {}", id).into());
        }
        Ok(())
    }

    fn check_enumeration(&self) -> Result<(), BackendError> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.lock().unwrap();
        if data.failing_enumerations > 0 {
            data.failing_enumerations -= 1;
            return Err("enumeration failed".into());
        }
        Ok(())
    }
}

#[async_trait]
impl SourceBackend for MockBackend {
    async fn user_ids(&self) -> Result<Vec<String>, BackendError> {
        self.check_enumeration()?;
        Ok(self.data.lock().unwrap().users.clone())
    }

    async fn share_link_tokens(&self) -> Result<Vec<String>, BackendError> {
        self.check_enumeration()?;
        let data = self.data.lock().unwrap();
        Ok(data.share_links.iter().map(|(t, _)| t.clone()).collect())
    }

    async fn fetch_collections(
        &self,
        user_id: &str,
    ) -> Result<Option<Vec<Value>>, BackendError> {
        self.check(user_id)?;
        Ok(self.data.lock().unwrap().collections.get(user_id).cloned())
    }

    async fn fetch_collection(
        &self,
        collection_id: &str,
    ) -> Result<Option<SharedCollection>, BackendError> {
        self.check(collection_id)?;
        Ok(self.data.lock().unwrap().shared.get(collection_id).cloned())
    }

    async fn fetch_auto_collects(
        &self,
        user_id: &str,
    ) -> Result<Option<Vec<Value>>, BackendError> {
        self.check(user_id)?;
        let data = self.data.lock().unwrap();
        if !data.users.iter().any(|u| u == user_id) {
            return Ok(None);
        }
        Ok(Some(
            data.auto_collects.get(user_id).cloned().unwrap_or_default(),
        ))
    }

    async fn fetch_user_stats(&self, user_id: &str) -> Result<Option<Value>, BackendError> {
        self.check(user_id)?;
        Ok(self.data.lock().unwrap().stats.get(user_id).cloned())
    }

    async fn fetch_insights(
        &self,
        user_id: Option<&str>,
        period: &str,
    ) -> Result<Option<Value>, BackendError> {
        self.check(user_id.unwrap_or("global"))?;
        let key = (user_id.map(str::to_owned), period.to_owned());
        Ok(self.data.lock().unwrap().insights.get(&key).cloned())
    }

    async fn fetch_share_link(&self, token: &str) -> Result<Option<Value>, BackendError> {
        self.check(token)?;
        let data = self.data.lock().unwrap();
        Ok(data
            .share_links
            .iter()
            .find(|(t, _)| t == token)
            .map(|(_, v)| v.clone()))
    }

    async fn fetch_state(&self) -> Result<Option<Value>, BackendError> {
        self.check("state")?;
        Ok(self.data.lock().unwrap().state.clone())
    }
}

/// Memory store that can be switched off or made to reject writes per key
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
    failing_writes: Mutex<HashSet<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_writes_to(&self, key: &str) {
        self.failing_writes.lock().unwrap().insert(key.to_owned());
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check()?;
        if self.failing_writes.lock().unwrap().contains(key) {
            return Err(StoreError::Unavailable(format!("write to {} rejected", key)));
        }
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.delete_prefix(prefix).await
    }
}

/// Config with no freshness marker and two insight periods
pub fn test_config() -> CacheConfig {
    CacheConfig {
        freshness_field: None,
        insight_periods: vec!["2023".to_owned(), "latest".to_owned()],
        rebuild_queue: QueueConfig {
            name: "test:rebuild",
            ..QueueConfig::rebuild()
        },
        patch_queue: QueueConfig {
            name: "test:patch",
            ..QueueConfig::patch()
        },
        ..CacheConfig::default()
    }
}

pub type TestOrchestrator = CacheOrchestrator<FlakyStore, MockBackend>;

/// Orchestrator whose queues have no workers, so enqueued jobs stay visible
pub fn orchestrator(
    backend: MockBackend,
    config: CacheConfig,
) -> (
    TestOrchestrator,
    JobReceiver<RebuildJob>,
    JobReceiver<PatchJob>,
) {
    let (rebuilds, rebuild_rx) = job_queue(config.rebuild_queue.clone());
    let (patches, patch_rx) = job_queue(config.patch_queue.clone());
    let orchestrator = CacheOrchestrator::new(FlakyStore::new(), backend, config, rebuilds, patches);
    (orchestrator, rebuild_rx, patch_rx)
}
