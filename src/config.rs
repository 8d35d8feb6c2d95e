//! Cache configuration

use std::time::Duration;

use crate::{QueueConfig, ScheduleConfig};

/// Configuration for the cache orchestrator and its background machinery
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL for entity cache entries. `None` keeps them until purged or rebuilt.
    pub entry_ttl: Option<Duration>,
    /// Field merged into object-shaped entries with the write timestamp.
    /// `None` disables the marker.
    pub freshness_field: Option<&'static str>,
    /// Periods cached for each insights entry
    pub insight_periods: Vec<String>,
    /// Queue for full rebuilds and sweeps
    pub rebuild_queue: QueueConfig,
    /// Queue for incremental patches
    pub patch_queue: QueueConfig,
    /// Periodic rebuild timers
    pub schedule: ScheduleConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entry_ttl: None,
            freshness_field: Some("_cachedAt"),
            insight_periods: ["2021", "2022", "2023", "latest"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            rebuild_queue: QueueConfig::rebuild(),
            patch_queue: QueueConfig::patch(),
            schedule: ScheduleConfig::default(),
        }
    }
}
