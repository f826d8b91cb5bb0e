//! Versioned cache generations and the stale-generation sweep.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

use offgrid_common::{Error, Result};
use crate::provider::{ResourceStore, StoreKey};

/// A named cache partition tagged with a version.
///
/// Rendered as `{prefix}-{partition}-{version}`, e.g. `mfb-static-v3`.
/// Only the active generation of a partition is read or written; older
/// versions are removed by [`sweep_generations`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheGeneration {
    prefix: String,
    partition: String,
    version: String,
}

impl CacheGeneration {
    /// Create a new generation.
    ///
    /// # Errors
    /// - Any component is empty or contains whitespace
    /// - `version` contains '-'
    pub fn new(
        prefix: impl Into<String>,
        partition: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self> {
        let prefix = prefix.into();
        let partition = partition.into();
        let version = version.into();

        for (label, value) in [("prefix", &prefix), ("partition", &partition), ("version", &version)] {
            if value.is_empty() || value.chars().any(char::is_whitespace) {
                return Err(Error::InvalidInput(format!(
                    "Cache {} must be a non-empty token: {:?}",
                    label, value
                )));
            }
        }
        if version.contains('-') {
            return Err(Error::InvalidInput(format!(
                "Cache version cannot contain '-': {}",
                version
            )));
        }

        Ok(Self {
            prefix,
            partition,
            version,
        })
    }

    /// Partition name (e.g. "static").
    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Version identifier (e.g. "v3").
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Full cache name.
    pub fn name(&self) -> String {
        format!("{}-{}-{}", self.prefix, self.partition, self.version)
    }

    /// Address an entry inside this generation.
    pub fn key(&self, entry: impl Into<String>) -> StoreKey {
        StoreKey::new(self.name(), entry)
    }

    /// Whether `cache` is an older or newer version of this same partition.
    pub fn is_stale_sibling(&self, cache: &str) -> bool {
        let family = format!("{}-{}-", self.prefix, self.partition);
        match cache.strip_prefix(&family) {
            Some(version) => !version.is_empty() && !version.contains('-') && version != self.version,
            None => false,
        }
    }
}

impl fmt::Display for CacheGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Delete every entry belonging to a stale sibling of an active generation.
///
/// Caches outside the active generations' partitions are left alone.
///
/// # Returns
/// Number of entries removed.
pub async fn sweep_generations(
    store: &dyn ResourceStore,
    active: &[CacheGeneration],
) -> Result<usize> {
    let keys = store.keys().await?;
    let mut removed_by_cache: BTreeMap<String, usize> = BTreeMap::new();

    for key in keys {
        if active.iter().any(|g| g.is_stale_sibling(&key.cache)) && store.delete(&key).await? {
            *removed_by_cache.entry(key.cache.clone()).or_insert(0) += 1;
        }
    }

    for (cache, count) in &removed_by_cache {
        info!("Deleted outdated cache {} ({} entries)", cache, count);
    }
    let removed = removed_by_cache.values().sum();
    debug!("Generation sweep removed {} entries", removed);
    Ok(removed)
}
