//! Local filesystem resource store.

use async_trait::async_trait;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use offgrid_common::{Error, Result};
use crate::provider::{CachedResponse, ResourceStore, StoreKey};

/// Prefix of in-flight temporary files. Digest names never start with '.'.
const TMP_PREFIX: &str = ".tmp-";

/// On-disk entry: the full key travels with the value.
#[derive(Serialize)]
struct EntryRef<'a> {
    key: &'a StoreKey,
    value: &'a CachedResponse,
}

#[derive(Deserialize)]
struct Entry {
    key: StoreKey,
    value: CachedResponse,
}

/// Local filesystem resource store.
///
/// Each cache is a directory under the root and each entry a JSON file.
/// Directory and file names are blake2b digests of the cache name and
/// the entry key, so names stay 64 bytes whatever the URL length. The
/// key itself is stored inside the file. Writes go to a temporary file
/// that is renamed into place.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn digest(component: &str) -> String {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(component.as_bytes());

        let mut name = String::with_capacity(64);
        for byte in hasher.finalize() {
            let _ = write!(name, "{:02x}", byte);
        }
        name
    }

    fn cache_dir(&self, cache: &str) -> PathBuf {
        self.root.join(Self::digest(cache))
    }

    fn entry_path(&self, key: &StoreKey) -> PathBuf {
        self.cache_dir(&key.cache).join(Self::digest(&key.key))
    }

    async fn read_entry(path: &Path) -> Result<Option<Entry>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[async_trait]
impl ResourceStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<CachedResponse>> {
        match Self::read_entry(&self.entry_path(key)).await? {
            Some(entry) if entry.key == *key => Ok(Some(entry.value)),
            Some(entry) => {
                warn!("Digest collision: {} is stored where {} was expected", entry.key, key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &StoreKey, value: CachedResponse) -> Result<()> {
        let dir = self.cache_dir(&key.cache);
        fs::create_dir_all(&dir).await?;

        let bytes = serde_json::to_vec(&EntryRef { key, value: &value })?;
        let tmp = dir.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        fs::write(&tmp, &bytes).await?;

        if let Err(e) = fs::rename(&tmp, self.entry_path(key)).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::Io(e));
        }

        debug!("Stored {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    async fn delete(&self, key: &StoreKey) -> Result<bool> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn keys(&self) -> Result<Vec<StoreKey>> {
        let mut keys = Vec::new();

        let mut caches = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(Error::Io(e)),
        };

        while let Some(cache_entry) = caches.next_entry().await? {
            if !cache_entry.file_type().await?.is_dir() {
                continue;
            }

            let mut files = fs::read_dir(cache_entry.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if file.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                    continue;
                }
                match Self::read_entry(&file.path()).await {
                    Ok(Some(entry)) => keys.push(entry.key),
                    Ok(None) => {}
                    Err(e) => warn!("Skipping unreadable entry {}: {}", file.path().display(), e),
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
