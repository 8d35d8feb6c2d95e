//! Invalidation API used by mutation handlers
//!
//! Purges are synchronous: once they return, no reader can see the old entry.
//! Patches go through the patch queue unless the caller asks for `patch_now`.

use serde_json::Value;
use tracing::{debug, info};

use crate::backend::CollectionMember;
use crate::jobs::{PatchIntent, PatchJob, PatchReport, RebuildJob};
use crate::{
    CacheError, CacheKey, CacheOrchestrator, KeyValueStore, Namespace, SourceBackend, SourceError,
};

/// Nested list holding a collection's pending auto-collect approvals
pub const AUTO_COLLECT_APPROVALS_FIELD: &str = "autoCollectApprovals";

/// Field added to each user's copy of a shared collection
pub const PERMISSIONS_FIELD: &str = "permissionsMetadata";

impl<S: KeyValueStore, B: SourceBackend> CacheOrchestrator<S, B> {
    /// Delete the entry at `key`
    pub async fn purge(&self, key: &CacheKey) -> Result<(), CacheError> {
        key.validate()?;
        self.store().delete(&key.format_key()).await?;
        debug!("Purged cache key {}", key);
        Ok(())
    }

    /// Delete every entry of `namespace`, returning how many were removed
    pub async fn purge_namespace(&self, namespace: Namespace) -> Result<usize, CacheError> {
        let removed = if namespace.is_singleton() {
            self.store().delete(namespace.as_str()).await?;
            1
        } else {
            self.store().delete_prefix(&namespace.key_prefix()).await?
        };
        info!("Purged {} entries from {} cache", removed, namespace);
        Ok(removed)
    }

    /// Purge one entry, or the whole namespace when `id` is `None`
    pub async fn purge_id(&self, namespace: Namespace, id: Option<&str>) -> Result<usize, CacheError> {
        match id {
            Some(id) => {
                self.purge(&CacheKey::entity(namespace, id)).await?;
                Ok(1)
            }
            None => self.purge_namespace(namespace).await,
        }
    }

    /// Queue a patch for background application
    pub fn patch(&self, job: PatchJob) -> Result<(), CacheError> {
        self.patch_queue().enqueue(job)
    }

    /// Apply a patch before returning
    pub async fn patch_now(&self, job: &PatchJob) -> PatchReport {
        self.apply_patch(job).await
    }

    /// Queue a rebuild of a single entry
    pub fn enqueue_rebuild(&self, key: &CacheKey) -> Result<(), CacheError> {
        key.validate()?;
        self.rebuild_queue().enqueue(RebuildJob::one(key))
    }

    /// Queue a sweep of a whole namespace
    pub fn enqueue_sweep(&self, namespace: Namespace) -> Result<(), CacheError> {
        self.rebuild_queue().enqueue(RebuildJob::sweep(namespace))
    }

    /// Re-read a collection and push it into the listing of everyone who can see it.
    ///
    /// Each user gets their own copy carrying their permissions, so one patch
    /// per user is queued. Returns the number of patches queued.
    pub async fn refresh_collection(&self, collection_id: &str) -> Result<usize, CacheError> {
        let shared = self
            .backend()
            .fetch_collection(collection_id)
            .await
            .map_err(|e| CacheError::SourceFetch {
                key: format!("collection:{}", collection_id),
                source: SourceError::Backend(e),
            })?
            .ok_or_else(|| CacheError::SourceFetch {
                key: format!("collection:{}", collection_id),
                source: SourceError::NotFound,
            })?;

        let audience = shared.audience();
        for member in &audience {
            self.patch(PatchJob::upsert(
                Namespace::Collections,
                vec![member.user_id.clone()],
                collection_id,
                with_permissions(&shared.collection, member),
            ))?;
        }
        debug!(
            "Queued collection {} refresh for {} users",
            collection_id,
            audience.len()
        );
        Ok(audience.len())
    }

    /// Drop a collection from the listings of `user_ids`
    pub fn remove_collection(&self, collection_id: &str, user_ids: Vec<String>) -> Result<(), CacheError> {
        self.patch(PatchJob::remove(Namespace::Collections, user_ids, collection_id))
    }

    /// Remove an answered auto-collect approval from a user's pending list
    pub fn revoke_auto_collect(
        &self,
        user_id: &str,
        collection_id: &str,
        approval_id: &str,
    ) -> Result<(), CacheError> {
        self.patch(PatchJob::new(
            Namespace::AutoCollects,
            vec![user_id.to_owned()],
            collection_id,
            PatchIntent::RemoveChild {
                field: AUTO_COLLECT_APPROVALS_FIELD.to_owned(),
                child_id: approval_id.to_owned(),
            },
        ))
    }

    /// Rebuild the global state entry now and return it
    pub async fn refresh_state(&self) -> Result<Value, CacheError> {
        self.rebuild_one(&CacheKey::singleton(Namespace::State)).await
    }
}

fn with_permissions(collection: &Value, member: &CollectionMember) -> Value {
    let mut decorated = collection.clone();
    if let Value::Object(map) = &mut decorated {
        map.insert(
            PERMISSIONS_FIELD.to_owned(),
            serde_json::json!({
                "read": member.permissions.read,
                "write": member.permissions.write,
                "configure": member.permissions.configure,
            }),
        );
    }
    decorated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Permissions, SharedCollection};
    use crate::test_support::{MockBackend, orchestrator, test_config};
    use serde_json::json;

    #[tokio::test]
    async fn test_purge_namespace_leaves_other_namespaces() {
        let backend = MockBackend::new();
        backend.set_collections("1", vec![]);
        backend.set_collections("2", vec![]);
        backend.set_stats("1", json!({}));
        let (cache, _rebuilds, _patches) = orchestrator(backend, test_config());
        cache.sweep(Namespace::Collections).await.unwrap();
        cache.sweep(Namespace::UserStats).await.unwrap();

        assert_eq!(cache.purge_id(Namespace::Collections, None).await.unwrap(), 2);
        assert_eq!(cache.store().get("collections:1").await.unwrap(), None);
        assert!(cache.store().get("userStats:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_singleton() {
        let backend = MockBackend::new();
        backend.set_state(json!({"users": 1}));
        let (cache, _rebuilds, _patches) = orchestrator(backend, test_config());
        cache.refresh_state().await.unwrap();

        assert_eq!(cache.purge_namespace(Namespace::State).await.unwrap(), 1);
        assert_eq!(cache.store().get("state").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purge_surfaces_store_outage() {
        let (cache, _rebuilds, _patches) = orchestrator(MockBackend::new(), test_config());
        cache.store().set_down(true);
        let err = cache
            .purge(&CacheKey::entity(Namespace::Collections, "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_refresh_collection_fans_out_with_permissions() {
        let backend = MockBackend::new();
        backend.set_shared_collection(
            "5",
            SharedCollection {
                collection: json!({"id": 5, "name": "Screenshots"}),
                owner_id: "42".to_owned(),
                members: vec![CollectionMember {
                    user_id: "7".to_owned(),
                    permissions: Permissions {
                        read: true,
                        write: false,
                        configure: false,
                    },
                }],
            },
        );
        let (cache, _rebuilds, mut patches) = orchestrator(backend, test_config());

        assert_eq!(cache.refresh_collection("5").await.unwrap(), 2);

        let member = patches.try_next().unwrap();
        assert_eq!(member.owners, ["7"]);
        assert_eq!(member.entity_id, "5");
        let PatchIntent::Upsert(entity) = &member.intent else {
            panic!("expected upsert, got {:?}", member.intent);
        };
        assert_eq!(
            entity[PERMISSIONS_FIELD],
            json!({"read": true, "write": false, "configure": false})
        );

        let owner = patches.try_next().unwrap();
        assert_eq!(owner.owners, ["42"]);
        let PatchIntent::Upsert(entity) = &owner.intent else {
            panic!("expected upsert, got {:?}", owner.intent);
        };
        assert_eq!(
            entity[PERMISSIONS_FIELD],
            json!({"read": true, "write": true, "configure": true})
        );
        assert_eq!(entity["name"], "Screenshots");
    }

    #[tokio::test]
    async fn test_refresh_missing_collection_is_not_found() {
        let (cache, _rebuilds, mut patches) = orchestrator(MockBackend::new(), test_config());
        let err = cache.refresh_collection("404").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(patches.try_next().is_none());
    }

    #[tokio::test]
    async fn test_revoke_auto_collect_queues_remove_child() {
        let (cache, _rebuilds, mut patches) = orchestrator(MockBackend::new(), test_config());
        cache.revoke_auto_collect("7", "5", "100").unwrap();

        let job = patches.try_next().unwrap();
        assert_eq!(job.namespace, Namespace::AutoCollects);
        assert_eq!(
            job.intent,
            PatchIntent::RemoveChild {
                field: AUTO_COLLECT_APPROVALS_FIELD.to_owned(),
                child_id: "100".to_owned(),
            }
        );
    }

    #[tokio::test]
    async fn test_revoked_approval_leaves_auto_collect_listing() {
        let backend = MockBackend::new();
        backend.set_auto_collects(
            "7",
            vec![json!({"id": 5, AUTO_COLLECT_APPROVALS_FIELD: [{"id": 100}]})],
        );
        let (cache, _rebuilds, mut patches) = orchestrator(backend, test_config());
        let key = CacheKey::entity(Namespace::AutoCollects, "7");
        cache.rebuild_one(&key).await.unwrap();

        cache.revoke_auto_collect("7", "5", "100").unwrap();
        let job = patches.try_next().unwrap();
        assert!(cache.patch_now(&job).await.is_success());

        assert_eq!(cache.get(&key).await.unwrap().value, json!([]));
    }

    #[tokio::test]
    async fn test_remove_collection_queues_fan_out_remove() {
        let (cache, _rebuilds, mut patches) = orchestrator(MockBackend::new(), test_config());
        cache
            .remove_collection("5", vec!["7".to_owned(), "42".to_owned()])
            .unwrap();
        assert_eq!(
            patches.try_next(),
            Some(PatchJob::remove(
                Namespace::Collections,
                vec!["7".to_owned(), "42".to_owned()],
                "5"
            ))
        );
    }
}
