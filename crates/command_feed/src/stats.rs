// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Queue depth statistics and their read-through cache.

use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::Deserialize;

/// How long a cached statistics entry stays valid.
pub(crate) const STATS_TIME_TO_LIVE: Duration = Duration::from_secs(15 * 60);

/// Pending-work statistics for one slice of the agent's queue.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// The asset group the numbers apply to.
    #[serde(default)]
    pub asset_group_qualifier: Option<String>,

    /// The command type the numbers apply to, when filtered.
    #[serde(default)]
    pub command_type: Option<String>,

    /// How many commands are pending in this slice.
    #[serde(default)]
    pub pending_command_count: u64,
}

/// A concurrent cache of statistics responses keyed by the composed filter.
///
/// Entries carry their own expiration; staleness is checked on read and
/// stale entries are simply overwritten by the next successful fetch. The
/// write volume is far too low to justify background eviction.
#[derive(Debug, Default)]
pub(crate) struct StatsCache {
    entries: DashMap<String, CacheEntry>,
}

#[derive(Debug)]
struct CacheEntry {
    stats: Vec<QueueStats>,
    expires_at: SystemTime,
}

impl StatsCache {
    /// Returns the cached statistics for `key` when a fresh entry exists.
    pub(crate) fn get(&self, key: &str, now: SystemTime) -> Option<Vec<QueueStats>> {
        let entry = self.entries.get(key)?;

        if entry.expires_at > now {
            return Some(entry.stats.clone());
        }

        None
    }

    /// Stores statistics for `key`, valid for the configured time to live.
    pub(crate) fn put(&self, key: String, stats: Vec<QueueStats>, now: SystemTime) {
        let _ = self.entries.insert(
            key,
            CacheEntry {
                stats,
                expires_at: now + STATS_TIME_TO_LIVE,
            },
        );
    }
}

/// Composes the cache key from the requested filters.
pub(crate) fn stats_cache_key(asset_group_qualifier: Option<&str>, command_type: Option<&str>) -> String {
    match (asset_group_qualifier, command_type) {
        (Some(qualifier), Some(kind)) => format!("{qualifier}|{kind}"),
        (Some(qualifier), None) => format!("{qualifier}|"),
        (None, Some(kind)) => kind.to_owned(),
        (None, None) => "all".to_owned(),
    }
}
