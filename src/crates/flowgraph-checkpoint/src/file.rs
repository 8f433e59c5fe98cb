//! File-based checkpoint storage
//!
//! One JSON document per session holds the latest snapshot:
//!
//! ```text
//! {dir}/
//! ├── thread-1.json
//! ├── thread-1.json.tmp      (only while a save is in flight)
//! └── user%3A42.json         (session ids are percent-encoded)
//! ```
//!
//! Saves write a temporary file, fsync it and rename it over the previous document, so
//! the old version stays readable until the new one is complete.

use crate::checkpoint::Checkpoint;
use crate::error::{CheckpointError, Result};
use crate::traits::CheckpointStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;

const PROBE_FILE: &str = ".flowgraph-probe";

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Durable store writing one JSON file per session
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    session_locks: LockMap,
}

/// Interest in one session's write lock; drops the map entry once nobody else holds it
struct LockEntry<'a> {
    locks: &'a LockMap,
    session_id: &'a str,
    lock: Option<Arc<tokio::sync::Mutex<()>>>,
}

impl Drop for LockEntry<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        self.lock.take();
        if locks
            .get(self.session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(self.session_id);
        }
    }
}

/// Exclusive write access to one session's file
///
/// Fields drop in order: the mutex is released before the entry is pruned.
struct SessionWrite<'a> {
    _guard: OwnedMutexGuard<()>,
    _entry: LockEntry<'a>,
}

impl FileCheckpointStore {
    /// Create a store rooted at `dir`. The directory is created lazily on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory of the store
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn checkpoint_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_session_id(session_id)))
    }

    fn temp_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json.tmp", encode_session_id(session_id)))
    }

    async fn lock_session<'a>(&'a self, session_id: &'a str) -> SessionWrite<'a> {
        let lock = Arc::clone(
            self.session_locks
                .lock()
                .entry(session_id.to_string())
                .or_default(),
        );
        let entry = LockEntry {
            locks: &self.session_locks,
            session_id,
            lock: Some(Arc::clone(&lock)),
        };
        SessionWrite {
            _guard: lock.lock_owned().await,
            _entry: entry,
        }
    }

    #[cfg(test)]
    fn tracked_sessions(&self) -> usize {
        self.session_locks.lock().len()
    }

    async fn read_record(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.checkpoint_path(session_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
        if checkpoint.session_id != session_id {
            return Err(CheckpointError::Invalid(format!(
                "{} holds session '{}', expected '{}'",
                path.display(),
                checkpoint.session_id,
                session_id
            )));
        }
        Ok(Some(checkpoint))
    }

    async fn write_atomic(&self, session_id: &str, data: &[u8]) -> Result<()> {
        let temp_path = self.temp_path(session_id);
        let final_path = self.checkpoint_path(session_id);

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, session_id: &str, state: &Value) -> Result<u64> {
        let _write = self.lock_session(session_id).await;

        fs::create_dir_all(&self.dir).await?;

        let version = self
            .read_record(session_id)
            .await?
            .map(|cp| cp.next_version())
            .unwrap_or(1);

        let checkpoint = Checkpoint::new(session_id, version, state.clone());
        let data = serde_json::to_vec_pretty(&checkpoint)?;
        self.write_atomic(session_id, &data).await?;

        tracing::debug!(
            session_id = %session_id,
            version,
            path = %self.checkpoint_path(session_id).display(),
            "Checkpoint written"
        );
        Ok(version)
    }

    async fn load(&self, session_id: &str) -> Result<Checkpoint> {
        self.read_record(session_id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound(session_id.to_string()))
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let _write = self.lock_session(session_id).await;

        match fs::remove_file(self.checkpoint_path(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ping(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let probe = self.dir.join(PROBE_FILE);
        fs::write(&probe, b"ok").await?;
        fs::remove_file(&probe).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}

/// Percent-encode everything outside `[A-Za-z0-9_-]` so any session id maps to one flat
/// file name.
fn encode_session_id(session_id: &str) -> String {
    let mut encoded = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => encoded.push(byte as char),
            other => encoded.push_str(&format!("%{:02X}", other)),
        }
    }
    encoded
}
