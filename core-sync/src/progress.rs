//! # Progress Store
//!
//! Local, crash-safe ledger of job states used to resume interrupted runs.
//!
//! ## Overview
//!
//! The orchestrator persists every job transition through a [`ProgressStore`].
//! Two implementations are provided:
//!
//! - [`JsonFileProgressStore`]: a JSON snapshot (`key -> {state, attempts,
//!   last_error, updated_at, ...}`) rewritten via temp file + rename, plus an
//!   append-only journal so that a single [`upsert`](ProgressStore::upsert)
//!   costs one appended line instead of a full rewrite. The journal is folded
//!   into the snapshot every `checkpoint_every` upserts and on `save`.
//! - [`InMemoryProgressStore`]: for tests and dry runs.
//!
//! Both reset jobs left `in_flight` by a crashed run to `pending` on `load`.

use crate::job::{JobItem, JobState};
use crate::{Result, SyncError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Job key to job record.
pub type ProgressMap = BTreeMap<String, JobItem>;

const DEFAULT_CHECKPOINT_EVERY: usize = 256;

/// Persistence of job states across runs.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Load all known jobs. Jobs found `in_flight` come back as `pending`.
    async fn load(&self) -> Result<ProgressMap>;

    /// Replace the whole ledger.
    async fn save(&self, items: &ProgressMap) -> Result<()>;

    /// Insert or update a single job without rewriting the ledger.
    async fn upsert(&self, item: &JobItem) -> Result<()>;

    /// Drop `done` jobs from the ledger. Returns how many were removed.
    async fn compact(&self) -> Result<usize>;
}

// ============================================================================
// JSON file store
// ============================================================================

#[derive(Serialize, Deserialize)]
struct JournalEntry {
    key: String,
    item: JobItem,
}

struct FileState {
    items: Option<ProgressMap>,
    journal_len: usize,
}

/// Snapshot file plus append-only journal.
pub struct JsonFileProgressStore {
    path: PathBuf,
    journal_path: PathBuf,
    checkpoint_every: usize,
    state: Mutex<FileState>,
}

impl JsonFileProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let journal_path = journal_path_for(&path);
        Self {
            path,
            journal_path,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            state: Mutex::new(FileState {
                items: None,
                journal_len: 0,
            }),
        }
    }

    /// Fold the journal into the snapshot after this many upserts.
    pub fn with_checkpoint_every(mut self, upserts: usize) -> Self {
        self.checkpoint_every = upserts.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    async fn read_from_disk(&self) -> Result<(ProgressMap, usize)> {
        let mut items = match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => ProgressMap::new(),
            Ok(bytes) => serde_json::from_slice::<ProgressMap>(&bytes).map_err(|e| {
                SyncError::Progress(format!("{}: {}", self.path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProgressMap::new(),
            Err(e) => return Err(e.into()),
        };
        for (key, item) in items.iter_mut() {
            item.key = key.clone();
        }

        let journal = match tokio::fs::read_to_string(&self.journal_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = journal.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut replayed = 0;
        let mut torn = !journal.is_empty() && !journal.ends_with('\n');
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => {
                    let mut item = entry.item;
                    item.key = entry.key.clone();
                    items.insert(entry.key, item);
                    replayed += 1;
                }
                Err(e) if index + 1 == lines.len() => {
                    warn!(
                        journal = %self.journal_path.display(),
                        error = %e,
                        "Ignoring torn final journal entry"
                    );
                    torn = true;
                }
                Err(e) => {
                    return Err(SyncError::Progress(format!(
                        "{} line {}: {}",
                        self.journal_path.display(),
                        index + 1,
                        e
                    )));
                }
            }
        }

        // Appending after a partial line would glue the next entry onto it.
        if torn {
            self.write_snapshot(&items).await?;
            info!(
                path = %self.path.display(),
                jobs = items.len(),
                "Folded journal with torn tail into snapshot"
            );
            replayed = 0;
        }

        Ok((items, replayed))
    }

    async fn write_snapshot(&self, items: &ProgressMap) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(items)?;
        write_atomic(&self.path, &bytes).await?;

        match tokio::fs::remove_file(&self.journal_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn loaded<'a>(&self, state: &'a mut FileState) -> Result<&'a mut ProgressMap> {
        if state.items.is_none() {
            let (items, replayed) = self.read_from_disk().await?;
            state.journal_len = replayed;
            state.items = Some(items);
        }
        state
            .items
            .as_mut()
            .ok_or_else(|| SyncError::Progress("progress cache unavailable".to_string()))
    }
}

#[async_trait]
impl ProgressStore for JsonFileProgressStore {
    async fn load(&self) -> Result<ProgressMap> {
        let mut state = self.state.lock().await;
        let (mut items, replayed) = self.read_from_disk().await?;

        let mut reset = 0;
        for item in items.values_mut() {
            if item.reset_in_flight() {
                reset += 1;
            }
        }

        info!(
            path = %self.path.display(),
            jobs = items.len(),
            journal_entries = replayed,
            reset_in_flight = reset,
            "Loaded progress"
        );

        state.items = Some(items.clone());
        state.journal_len = replayed;
        Ok(items)
    }

    async fn save(&self, items: &ProgressMap) -> Result<()> {
        let mut state = self.state.lock().await;
        self.write_snapshot(items).await?;
        state.items = Some(items.clone());
        state.journal_len = 0;
        debug!(path = %self.path.display(), jobs = items.len(), "Saved progress snapshot");
        Ok(())
    }

    async fn upsert(&self, item: &JobItem) -> Result<()> {
        let mut state = self.state.lock().await;
        self.loaded(&mut state).await?.insert(item.key.clone(), item.clone());

        let entry = JournalEntry {
            key: item.key.clone(),
            item: item.clone(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        if let Some(parent) = self.journal_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.journal_path)
            .await?;
        if !ends_with_newline(&mut file).await? {
            file.write_all(b"\n").await?;
        }
        file.write_all(&line).await?;
        file.flush().await?;
        state.journal_len += 1;

        if state.journal_len >= self.checkpoint_every {
            let snapshot = self.loaded(&mut state).await?.clone();
            self.write_snapshot(&snapshot).await?;
            state.journal_len = 0;
            debug!(path = %self.path.display(), jobs = snapshot.len(), "Checkpointed progress journal");
        }

        Ok(())
    }

    async fn compact(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let items = self.loaded(&mut state).await?;
        let before = items.len();
        items.retain(|_, item| item.state != JobState::Done);
        let removed = before - items.len();

        let snapshot = items.clone();
        self.write_snapshot(&snapshot).await?;
        state.journal_len = 0;

        info!(path = %self.path.display(), removed, remaining = snapshot.len(), "Compacted progress");
        Ok(removed)
    }
}

/// True for an empty file or one whose last byte is `\n`.
async fn ends_with_newline(file: &mut tokio::fs::File) -> Result<bool> {
    if file.metadata().await?.len() == 0 {
        return Ok(true);
    }
    file.seek(std::io::SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}

fn journal_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "progress".into());
    name.push(".journal");
    path.with_file_name(name)
}

/// Write `bytes` to a sibling temp file then rename it over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "snapshot".into());
    tmp_name.push(format!(".tmp-{}", std::process::id()));
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local ledger.
#[derive(Default)]
pub struct InMemoryProgressStore {
    items: StdMutex<ProgressMap>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = JobItem>) -> Self {
        let map = items
            .into_iter()
            .map(|item| (item.key.clone(), item))
            .collect();
        Self {
            items: StdMutex::new(map),
        }
    }

    /// Current contents without the `in_flight` reset applied by `load`.
    pub fn snapshot(&self) -> ProgressMap {
        self.items
            .lock()
            .map(|items| items.clone())
            .unwrap_or_default()
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ProgressMap>> {
        self.items
            .lock()
            .map_err(|_| SyncError::Progress("progress lock poisoned".to_string()))
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn load(&self) -> Result<ProgressMap> {
        let mut items = self.guard()?;
        for item in items.values_mut() {
            item.reset_in_flight();
        }
        Ok(items.clone())
    }

    async fn save(&self, items: &ProgressMap) -> Result<()> {
        *self.guard()? = items.clone();
        Ok(())
    }

    async fn upsert(&self, item: &JobItem) -> Result<()> {
        self.guard()?.insert(item.key.clone(), item.clone());
        Ok(())
    }

    async fn compact(&self) -> Result<usize> {
        let mut items = self.guard()?;
        let before = items.len();
        items.retain(|_, item| item.state != JobState::Done);
        Ok(before - items.len())
    }
}

// ============================================================================
// Tests
// ============================================================================
