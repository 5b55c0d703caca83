//! The JSON file persistence substrate.
//!
//! Every durable map in the orchestrator lives in one JSON document: a flat
//! file for the small stores (call state, blocklist, SMS queue) and a sharded
//! file per month or day for the large ones (redial queue, webhook log). The
//! write protocol is the same everywhere: take the store's lock with a
//! bounded wait, serialize, write a sibling temp file, rename it over the
//! live file. A crash on either side of the rename leaves a structurally
//! valid document on disk. All file I/O goes through `tokio::fs` so a large
//! shard write never stalls the worker threads driving adapter requests.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::errors::{DialerErrorKind, Result};

/// Bounded wait for the per-file lock; past this the write fails fast.
pub const LOCK_WAIT: Duration = Duration::from_secs(5);

/// One durable JSON document.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the live document. An absent file reads as the default value; a
    /// file that fails to parse is an error the caller must surface.
    pub async fn load<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Serialize-write-rename under the store lock. The lock covers only this
    /// sequence; callers must never hold it across adapter I/O.
    pub async fn persist<T>(&self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let _guard = timeout(LOCK_WAIT, self.lock.lock())
            .await
            .map_err(|_| DialerErrorKind::LockTimeout(self.path.display().to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Delete the live document, if present.
    pub async fn remove(&self) -> Result<()> {
        let _guard = timeout(LOCK_WAIT, self.lock.lock())
            .await
            .map_err(|_| DialerErrorKind::LockTimeout(self.path.display().to_string()))?;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Path of the shard for `key` under `data_dir`, e.g.
/// `<data>/redial-queue/redial-queue_2026-08.json`.
pub fn shard_path(data_dir: &Path, prefix: &str, key: &str) -> PathBuf {
    data_dir.join(prefix).join(format!("{prefix}_{key}.json"))
}

/// Delete shard files whose key sorts before `cutoff_key`, never touching the
/// shard named by `current_key`. Keys are zero-padded calendar strings, so
/// lexicographic order is chronological order; callers pass a cutoff of the
/// same granularity as the shard keys. Returns how many files were removed.
pub async fn sweep_shards(
    data_dir: &Path,
    prefix: &str,
    current_key: &str,
    cutoff_key: &str,
) -> Result<usize> {
    let dir = data_dir.join(prefix);
    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(key) = shard_key(&name, prefix) else {
            continue;
        };
        if key == current_key || key >= cutoff_key {
            continue;
        }
        fs::remove_file(entry.path()).await?;
        debug!("Swept expired shard"; "prefix" => prefix, "key" => key);
        removed += 1;
    }
    Ok(removed)
}

/// Extract the shard key out of a `{prefix}_{key}.json` file name.
fn shard_key<'a>(file_name: &'a str, prefix: &str) -> Option<&'a str> {
    file_name
        .strip_prefix(prefix)?
        .strip_prefix('_')?
        .strip_suffix(".json")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_derive::{Deserialize, Serialize};

    use super::*;

    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    struct Doc {
        count: u32,
        label: String,
    }

    #[tokio::test]
    async fn roundtrip_preserves_map() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("doc.json"));

        let mut map = HashMap::new();
        map.insert(
            "5558675309".to_owned(),
            Doc {
                count: 3,
                label: "pending".to_owned(),
            },
        );
        store.persist(&map).await.unwrap();

        let loaded: HashMap<String, Doc> = store.load().await.unwrap();
        assert_eq!(loaded, map);
    }

    #[tokio::test]
    async fn absent_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("missing.json"));
        let loaded: HashMap<String, Doc> = store.load().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn persist_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("doc.json"));

        store
            .persist(&Doc {
                count: 1,
                label: "one".to_owned(),
            })
            .await
            .unwrap();
        store
            .persist(&Doc {
                count: 2,
                label: "two".to_owned(),
            })
            .await
            .unwrap();

        // No temp file left behind, and the live file holds the last write.
        assert!(!dir.path().join("doc.tmp").exists());
        let loaded: Doc = store.load().await.unwrap();
        assert_eq!(loaded.count, 2);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error_not_a_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let store = FileStore::new(path);
        assert!(store.load::<HashMap<String, Doc>>().await.is_err());
    }

    #[tokio::test]
    async fn sweep_skips_current_and_recent_shards() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = "redial-queue";
        for key in ["2026-05", "2026-06", "2026-07", "2026-08"] {
            let store = FileStore::new(shard_path(dir.path(), prefix, key));
            store.persist(&HashMap::<String, Doc>::new()).await.unwrap();
        }

        let removed = sweep_shards(dir.path(), prefix, "2026-08", "2026-07")
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(shard_path(dir.path(), prefix, "2026-07").exists());
        assert!(shard_path(dir.path(), prefix, "2026-08").exists());
        assert!(!shard_path(dir.path(), prefix, "2026-05").exists());
    }

    #[tokio::test]
    async fn sweep_of_missing_dir_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            sweep_shards(dir.path(), "webhook-logs", "2026-08-01", "2026-07-02")
                .await
                .unwrap(),
            0
        );
    }

    #[test]
    fn shard_key_extraction() {
        assert_eq!(
            shard_key("redial-queue_2026-08.json", "redial-queue"),
            Some("2026-08")
        );
        assert_eq!(shard_key("redial-queue_2026-08.tmp", "redial-queue"), None);
        assert_eq!(shard_key("other_2026-08.json", "redial-queue"), None);
    }
}
