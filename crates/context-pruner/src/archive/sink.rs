//! Durable storage behind the archive.
//!
//! The [`ArchiveStore`](super::ArchiveStore) keeps its authoritative state in
//! memory and mirrors every insert and eviction into an [`ArchiveSink`]. The
//! sink decides the medium; the engine never sees paths or formats.
//!
//! Two sinks ship with the crate:
//! - [`MemorySink`]: no persistence, used when `archivePath` is unset.
//! - [`JsonDirSink`]: one JSON document per entry under a directory:
//!
//! ```text
//! archive_path/
//!   m-1f0c@1735689600000-1.json
//!   m-77ab@1735689600450-2.json
//! ```

use super::ArchiveEntry;
use crate::error::ArchiveError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Boxed future returned by sink operations.
pub type SinkFuture<'a, T> = BoxFuture<'a, Result<T, ArchiveError>>;

/// What the sink itself holds (may lag the in-memory store after I/O failures).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SinkStats {
    pub entries: usize,
    pub bytes: usize,
}

/// Narrow persistence interface for archive entries.
pub trait ArchiveSink: Send + Sync {
    /// Insert or overwrite an entry.
    fn put<'a>(&'a self, entry: &'a ArchiveEntry) -> SinkFuture<'a, ()>;
    fn get<'a>(&'a self, id: &'a str) -> SinkFuture<'a, Option<ArchiveEntry>>;
    /// Remove an entry. Removing a missing entry is not an error.
    fn evict<'a>(&'a self, id: &'a str) -> SinkFuture<'a, ()>;
    /// Every stored entry, for restoring the archive on startup.
    fn load_all(&self) -> SinkFuture<'_, Vec<ArchiveEntry>>;
    fn stats(&self) -> SinkFuture<'_, SinkStats>;
}

// ── MemorySink ────────────────────────────────────────────────────

/// In-process sink with no durability.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<HashMap<String, ArchiveEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ArchiveEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ArchiveSink for MemorySink {
    fn put<'a>(&'a self, entry: &'a ArchiveEntry) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            self.lock().insert(entry.id.clone(), entry.clone());
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> SinkFuture<'a, Option<ArchiveEntry>> {
        Box::pin(async move { Ok(self.lock().get(id).cloned()) })
    }

    fn evict<'a>(&'a self, id: &'a str) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            self.lock().remove(id);
            Ok(())
        })
    }

    fn load_all(&self) -> SinkFuture<'_, Vec<ArchiveEntry>> {
        Box::pin(async move { Ok(self.lock().values().cloned().collect()) })
    }

    fn stats(&self) -> SinkFuture<'_, SinkStats> {
        Box::pin(async move {
            let entries = self.lock();
            Ok(SinkStats {
                entries: entries.len(),
                bytes: entries.values().map(|e| e.size_bytes).sum(),
            })
        })
    }
}

// ── JsonDirSink ───────────────────────────────────────────────────

/// One pretty-printed JSON file per entry, written atomically.
#[derive(Debug, Clone)]
pub struct JsonDirSink {
    dir: PathBuf,
}

impl JsonDirSink {
    /// Create the sink, ensuring the directory exists.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ArchiveError::Io {
                path: dir.clone(),
                source,
            })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(id)))
    }
}

/// Map an entry id to a filesystem-safe file stem.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '@' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl ArchiveSink for JsonDirSink {
    fn put<'a>(&'a self, entry: &'a ArchiveEntry) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            let final_path = self.entry_path(&entry.id);
            let tmp_path = self.dir.join(format!(".{}.json.tmp", file_stem(&entry.id)));

            let json = serde_json::to_string_pretty(entry).map_err(|source| ArchiveError::Serde {
                id: entry.id.clone(),
                source,
            })?;
            tokio::fs::write(&tmp_path, json)
                .await
                .map_err(io_err(&tmp_path))?;
            tokio::fs::rename(&tmp_path, &final_path)
                .await
                .map_err(io_err(&final_path))?;
            debug!(id = %entry.id, "archive entry persisted");
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> SinkFuture<'a, Option<ArchiveEntry>> {
        Box::pin(async move {
            let path = self.entry_path(id);
            let json = match tokio::fs::read_to_string(&path).await {
                Ok(json) => json,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(io_err(&path)(e)),
            };
            let entry = serde_json::from_str(&json).map_err(|source| ArchiveError::Serde {
                id: id.to_string(),
                source,
            })?;
            Ok(Some(entry))
        })
    }

    fn evict<'a>(&'a self, id: &'a str) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            let path = self.entry_path(id);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_err(&path)(e)),
            }
        })
    }

    fn load_all(&self) -> SinkFuture<'_, Vec<ArchiveEntry>> {
        Box::pin(async move {
            let mut dir = tokio::fs::read_dir(&self.dir)
                .await
                .map_err(io_err(&self.dir))?;

            let mut entries = Vec::new();
            while let Some(item) = dir.next_entry().await.map_err(io_err(&self.dir))? {
                let path = item.path();
                let name = item.file_name().to_string_lossy().to_string();
                if name.starts_with('.') || !name.ends_with(".json") {
                    continue;
                }
                match tokio::fs::read_to_string(&path).await {
                    Ok(json) => match serde_json::from_str::<ArchiveEntry>(&json) {
                        Ok(e) => entries.push(e),
                        Err(e) => {
                            warn!("Skipping malformed archive entry at {}: {e}", path.display());
                        }
                    },
                    Err(e) => {
                        warn!("Skipping unreadable archive entry at {}: {e}", path.display());
                    }
                }
            }
            Ok(entries)
        })
    }

    fn stats(&self) -> SinkFuture<'_, SinkStats> {
        Box::pin(async move {
            let entries = self.load_all().await?;
            Ok(SinkStats {
                entries: entries.len(),
                bytes: entries.iter().map(|e| e.size_bytes).sum(),
            })
        })
    }
}
