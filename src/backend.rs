//! Source-of-truth backend trait
//!
//! The relational store behind the cache is external to this crate. It is
//! reached through [`SourceBackend`], whose implementations can use SQL, HTTP,
//! or anything else. `Ok(None)` means the entity does not exist.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::BackendError;

/// Access flags a user holds on a shared collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub configure: bool,
}

impl Permissions {
    /// Full access, as held by a collection's owner
    pub const OWNER: Permissions = Permissions {
        read: true,
        write: true,
        configure: true,
    };
}

/// A user who has been granted access to a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMember {
    pub user_id: String,
    pub permissions: Permissions,
}

/// A hydrated collection together with everyone who can see it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedCollection {
    /// The collection as it appears in a user's listing
    pub collection: Value,
    pub owner_id: String,
    #[serde(default)]
    pub members: Vec<CollectionMember>,
}

impl SharedCollection {
    /// Every user whose listing embeds this collection, with their access.
    /// The owner comes last and overrides a member row for the same user.
    pub fn audience(&self) -> Vec<CollectionMember> {
        let mut audience: Vec<CollectionMember> = self
            .members
            .iter()
            .filter(|m| m.user_id != self.owner_id)
            .cloned()
            .collect();
        audience.push(CollectionMember {
            user_id: self.owner_id.clone(),
            permissions: Permissions::OWNER,
        });
        audience
    }
}

/// Trait for fetching derived data from the source of truth
#[async_trait]
pub trait SourceBackend: Send + Sync + 'static {
    /// Every user id with per-user cache entries
    async fn user_ids(&self) -> Result<Vec<String>, BackendError>;

    /// Every collection share-link token currently published
    async fn share_link_tokens(&self) -> Result<Vec<String>, BackendError>;

    /// Collections visible to a user, in listing order
    async fn fetch_collections(&self, user_id: &str)
    -> Result<Option<Vec<Value>>, BackendError>;

    /// One collection with its owner and members
    async fn fetch_collection(
        &self,
        collection_id: &str,
    ) -> Result<Option<SharedCollection>, BackendError>;

    /// Collections with pending auto-collect approvals for a user
    async fn fetch_auto_collects(
        &self,
        user_id: &str,
    ) -> Result<Option<Vec<Value>>, BackendError>;

    async fn fetch_user_stats(&self, user_id: &str) -> Result<Option<Value>, BackendError>;

    /// Insights for one period; `user_id` is `None` for the global aggregate
    async fn fetch_insights(
        &self,
        user_id: Option<&str>,
        period: &str,
    ) -> Result<Option<Value>, BackendError>;

    /// Public projection of the collection published under `token`
    async fn fetch_share_link(&self, token: &str) -> Result<Option<Value>, BackendError>;

    /// Global application state
    async fn fetch_state(&self) -> Result<Option<Value>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member(id: &str, write: bool) -> CollectionMember {
        CollectionMember {
            user_id: id.to_owned(),
            permissions: Permissions {
                read: true,
                write,
                configure: false,
            },
        }
    }

    #[test]
    fn test_audience_includes_owner_last() {
        let shared = SharedCollection {
            collection: json!({"id": 1}),
            owner_id: "42".to_owned(),
            members: vec![member("7", false), member("8", true)],
        };
        let audience = shared.audience();
        let ids: Vec<&str> = audience.iter().map(|m| m.user_id.as_str()).collect();
        assert_eq!(ids, ["7", "8", "42"]);
        assert_eq!(audience[2].permissions, Permissions::OWNER);
    }

    #[test]
    fn test_audience_owner_overrides_member_row() {
        let shared = SharedCollection {
            collection: json!({"id": 1}),
            owner_id: "42".to_owned(),
            members: vec![member("42", false)],
        };
        let audience = shared.audience();
        assert_eq!(audience.len(), 1);
        assert_eq!(audience[0].permissions, Permissions::OWNER);
    }
}
