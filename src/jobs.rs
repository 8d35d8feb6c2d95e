//! Rebuild and patch job descriptions
//!
//! Jobs are plain data. A [`RebuildJob`] regenerates entries from the source
//! of truth; a [`PatchJob`] mutates one entity inside existing list entries
//! without a full rebuild.

use serde_json::Value;

use crate::{CacheError, CacheKey, Namespace};

/// Field that identifies an entity inside a list entry
pub const ENTITY_ID_FIELD: &str = "id";

/// Full regeneration of one entry, or of a whole namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildJob {
    pub namespace: Namespace,
    /// `None` sweeps every identifier the source of truth knows about
    pub id: Option<String>,
}

impl RebuildJob {
    /// Rebuild the entry at `key`
    pub fn one(key: &CacheKey) -> Self {
        Self {
            namespace: key.namespace(),
            id: key.id().map(str::to_owned),
        }
    }

    /// Sweep an entire namespace
    pub fn sweep(namespace: Namespace) -> Self {
        Self {
            namespace,
            id: None,
        }
    }

    /// True when this job targets every identifier of a per-entity namespace
    pub fn is_sweep(&self) -> bool {
        self.id.is_none() && !self.namespace.is_singleton()
    }

    /// Key of the single entry this job rebuilds, if it is not a sweep
    pub fn key(&self) -> Option<CacheKey> {
        if self.is_sweep() {
            None
        } else {
            Some(CacheKey::new(self.namespace, self.id.clone()))
        }
    }
}

/// What a patch does to the targeted entity
#[derive(Debug, Clone, PartialEq)]
pub enum PatchIntent {
    /// Replace the entity with this value, or append it when absent
    Upsert(Value),
    /// Drop the entity if present
    Remove,
    /// Overwrite the whole entry
    Replace(Value),
    /// Remove one child from the entity's nested `field` list, dropping the
    /// entity once that list is empty
    RemoveChild { field: String, child_id: String },
}

impl PatchIntent {
    pub fn name(&self) -> &'static str {
        match self {
            PatchIntent::Upsert(_) => "upsert",
            PatchIntent::Remove => "remove",
            PatchIntent::Replace(_) => "replace",
            PatchIntent::RemoveChild { .. } => "remove-child",
        }
    }
}

/// Incremental change to one entity, fanned out to every owning entry
#[derive(Debug, Clone, PartialEq)]
pub struct PatchJob {
    pub namespace: Namespace,
    /// Identifiers whose entries embed the entity
    pub owners: Vec<String>,
    pub entity_id: String,
    pub intent: PatchIntent,
}

impl PatchJob {
    pub fn new(
        namespace: Namespace,
        owners: Vec<String>,
        entity_id: impl Into<String>,
        intent: PatchIntent,
    ) -> Self {
        Self {
            namespace,
            owners,
            entity_id: entity_id.into(),
            intent,
        }
    }

    pub fn upsert(
        namespace: Namespace,
        owners: Vec<String>,
        entity_id: impl Into<String>,
        entity: Value,
    ) -> Self {
        Self::new(namespace, owners, entity_id, PatchIntent::Upsert(entity))
    }

    pub fn remove(namespace: Namespace, owners: Vec<String>, entity_id: impl Into<String>) -> Self {
        Self::new(namespace, owners, entity_id, PatchIntent::Remove)
    }
}

/// Result of applying a patch to one owner's entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The entry was modified and written back
    Applied,
    /// The intent had nothing to do; the entry was left untouched
    Unchanged,
    /// The entry did not exist, so it was rebuilt from the source instead
    RebuiltOnMiss,
}

/// Per-owner results of one fan-out patch
#[derive(Debug, Default)]
pub struct PatchReport {
    pub outcomes: Vec<(String, Result<PatchOutcome, CacheError>)>,
}

impl PatchReport {
    pub fn failed(&self) -> impl Iterator<Item = (&str, &CacheError)> {
        self.outcomes
            .iter()
            .filter_map(|(owner, r)| r.as_ref().err().map(|e| (owner.as_str(), e)))
    }

    pub fn failed_owners(&self) -> Vec<String> {
        self.failed().map(|(owner, _)| owner.to_owned()).collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn outcome(&self, owner: &str) -> Option<&Result<PatchOutcome, CacheError>> {
        self.outcomes
            .iter()
            .find(|(o, _)| o == owner)
            .map(|(_, r)| r)
    }

    /// Collapse into a job-level result for queue retry bookkeeping
    pub fn into_result(self) -> Result<(), CacheError> {
        let failed = self.failed().count();
        if failed == 0 {
            Ok(())
        } else {
            Err(CacheError::PatchFailed {
                failed,
                total: self.outcomes.len(),
            })
        }
    }
}

/// Read an entity's id, accepting both string and numeric ids
pub fn entity_id(entity: &Value) -> Option<String> {
    match entity.get(ENTITY_ID_FIELD)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn position(entities: &[Value], id: &str) -> Option<usize> {
    entities
        .iter()
        .position(|e| entity_id(e).as_deref() == Some(id))
}

fn as_list<'a>(key: &CacheKey, entry: &'a mut Value) -> Result<&'a mut Vec<Value>, CacheError> {
    match entry {
        Value::Array(entities) => Ok(entities),
        _ => Err(CacheError::ShapeMismatch(key.to_string())),
    }
}

/// Apply `intent` for the entity `target_id` to a stored entry.
///
/// Returns whether the entry changed. New entities are appended so list order
/// keeps following the last rebuild.
pub fn apply_intent(
    key: &CacheKey,
    entry: &mut Value,
    target_id: &str,
    intent: &PatchIntent,
) -> Result<bool, CacheError> {
    match intent {
        PatchIntent::Replace(value) => {
            if *entry == *value {
                return Ok(false);
            }
            *entry = value.clone();
            Ok(true)
        }
        PatchIntent::Upsert(entity) => {
            let entities = as_list(key, entry)?;
            match position(entities, target_id) {
                Some(i) if &entities[i] == entity => Ok(false),
                Some(i) => {
                    entities[i] = entity.clone();
                    Ok(true)
                }
                None => {
                    entities.push(entity.clone());
                    Ok(true)
                }
            }
        }
        PatchIntent::Remove => {
            let entities = as_list(key, entry)?;
            match position(entities, target_id) {
                Some(i) => {
                    entities.remove(i);
                    Ok(true)
                }
                None => Ok(false),
            }
        }
        PatchIntent::RemoveChild { field, child_id } => {
            let entities = as_list(key, entry)?;
            let Some(i) = position(entities, target_id) else {
                return Ok(false);
            };
            let Some(Value::Array(children)) = entities[i].get_mut(field.as_str()) else {
                return Ok(false);
            };
            let before = children.len();
            children.retain(|c| entity_id(c).as_deref() != Some(child_id.as_str()));
            if children.len() == before {
                return Ok(false);
            }
            if children.is_empty() {
                entities.remove(i);
            }
            Ok(true)
        }
    }
}
