//! File-backed event storage.
//!
//! Layout of a storage directory:
//!
//! ```text
//! MANIFEST     magic + format version
//! LOCK         exclusive lock held while open
//! events.log   framed entries: Stored(record) | Completed(id)
//! ```
//!
//! The pending set lives in memory and is rebuilt by replaying `events.log`
//! on open. Completion appends a marker instead of rewriting the record;
//! [`PersistentStorage::purge_stale`] compacts the log down to the records
//! that are still deliverable.

use async_trait::async_trait;
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{StorageKind, StorageProvider, StorageResult};
use crate::error::StorageError;
use crate::frame::{self, FrameError};
use crate::types::{EventRecord, RecordFilter, RecordId, Timestamp};

/// Magic bytes for the storage manifest.
const STORAGE_MAGIC: &[u8; 4] = b"EVH\0";

/// Current storage format version.
const STORAGE_VERSION: u8 = 1;

const LOG_FILE: &str = "events.log";
const COMPACT_FILE: &str = "events.log.compact";

/// Entries are single records, far below the wire limit.
const MAX_ENTRY_SIZE: usize = frame::DEFAULT_MAX_FRAME_SIZE;

#[derive(Debug, Deserialize)]
enum LogEntry {
    Stored(EventRecord),
    Completed(RecordId),
}

/// Write-side twin of [`LogEntry`]; same encoding, borrows the record.
#[derive(Serialize)]
enum LogEntryRef<'a> {
    Stored(&'a EventRecord),
    Completed(RecordId),
}

/// (event type, subscriber id)
type QueueKey = (String, String);

/// Mutable log state, guarded by one lock.
struct LogState {
    writer: BufWriter<File>,
    /// Bytes of whole entries in the log.
    log_len: u64,
    /// Pending records by log sequence (FIFO order).
    pending: BTreeMap<u64, EventRecord>,
    by_id: HashMap<RecordId, u64>,
    /// Sequences of each subscriber's pending records.
    queues: HashMap<QueueKey, BTreeSet<u64>>,
    next_seq: u64,
    /// Entries compaction will drop: completion markers and duplicates.
    dead_entries: usize,
}

impl LogState {
    fn new(writer: BufWriter<File>, log_len: u64) -> Self {
        Self {
            writer,
            log_len,
            pending: BTreeMap::new(),
            by_id: HashMap::new(),
            queues: HashMap::new(),
            next_seq: 1,
            dead_entries: 0,
        }
    }

    /// Track a pending record. Returns false if its id is already pending.
    fn insert(&mut self, record: EventRecord) -> bool {
        if self.by_id.contains_key(&record.id) {
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_id.insert(record.id, seq);
        self.queues
            .entry((record.event_type.clone(), record.subscriber_id.clone()))
            .or_default()
            .insert(seq);
        self.pending.insert(seq, record);
        true
    }

    fn remove(&mut self, id: &RecordId) -> Option<EventRecord> {
        let seq = self.by_id.remove(id)?;
        let record = self.pending.remove(&seq)?;

        let key = (record.event_type.clone(), record.subscriber_id.clone());
        if let Some(queue) = self.queues.get_mut(&key) {
            queue.remove(&seq);
            if queue.is_empty() {
                self.queues.remove(&key);
            }
        }
        Some(record)
    }

    fn batch(&self, filter: &RecordFilter, limit: usize) -> Vec<EventRecord> {
        let key = (filter.event_type.clone(), filter.subscriber_id.clone());
        let Some(queue) = self.queues.get(&key) else {
            return Vec::new();
        };

        queue
            .iter()
            .filter_map(|seq| self.pending.get(seq))
            .filter(|r| filter.matches(r))
            .take(limit)
            .cloned()
            .collect()
    }

    fn subscriber_ids(&self, event_type: &str, now: Timestamp) -> Vec<String> {
        let mut ids: Vec<String> = self
            .queues
            .iter()
            .filter(|((ty, _), _)| ty.as_str() == event_type)
            .filter(|(_, queue)| {
                queue
                    .iter()
                    .filter_map(|seq| self.pending.get(seq))
                    .any(|r| r.is_pending(now))
            })
            .map(|((_, subscriber), _)| subscriber.clone())
            .collect();
        ids.sort();
        ids
    }
}

struct Inner {
    path: PathBuf,
    _lock_file: File,
    state: Mutex<LogState>,
    sync_writes: bool,
}

/// Durable provider backed by an append-only log.
///
/// Cheap to clone; clones share the same open log.
#[derive(Clone)]
pub struct PersistentStorage {
    inner: Arc<Inner>,
}

impl PersistentStorage {
    /// Open the storage at `path`, creating it if missing.
    pub fn open_or_create(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with_sync(path, true)
    }

    /// Open with control over fsync after every write.
    ///
    /// With `sync_writes = false` a crash can lose the most recent writes.
    pub fn open_with_sync(path: impl AsRef<Path>, sync_writes: bool) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        if path.join("MANIFEST").exists() {
            Self::verify_manifest(&path)?;
        } else {
            fs::create_dir_all(&path)?;
            Self::write_manifest(&path)?;
        }

        let lock_file = Self::acquire_lock(&path)?;
        let state = Self::replay(&path.join(LOG_FILE))?;

        tracing::debug!(
            path = %path.display(),
            pending = state.pending.len(),
            "Persistent storage opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                _lock_file: lock_file,
                state: Mutex::new(state),
                sync_writes,
            }),
        })
    }

    /// Directory this storage lives in.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of pending (stored, not completed) records, expired included.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Spawn a task that purges stale records every `interval` until `shutdown`.
    pub fn spawn_purge_task(
        &self,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let storage = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match storage.purge_stale().await {
                    Ok(removed) => {
                        tracing::debug!(removed = removed, "Purged stale event records")
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to purge stale event records"),
                }
            }
        })
    }

    /// Run `f` on the blocking pool; the state lock may be held across disk I/O.
    async fn blocking<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> StorageResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?
    }

    fn write_manifest(path: &Path) -> StorageResult<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORAGE_MAGIC)?;
        file.write_all(&[STORAGE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> StorageResult<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORAGE_MAGIC {
            return Err(StorageError::InvalidFormat("Invalid storage magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORAGE_VERSION {
            return Err(StorageError::InvalidFormat(format!(
                "Unsupported storage version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> StorageResult<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StorageError::Locked)?;
        Ok(lock_file)
    }

    /// Rebuild the pending set from the log, cutting off a torn tail.
    fn replay(log_path: &Path) -> StorageResult<LogState> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(log_path)?;

        let mut entries = Vec::new();
        let mut valid_len = 0u64;

        {
            let mut reader = BufReader::new(&file);
            loop {
                match frame::read::<_, LogEntry>(&mut reader, MAX_ENTRY_SIZE) {
                    Ok(Some((entry, size))) => {
                        valid_len += size as u64;
                        entries.push(entry);
                    }
                    Ok(None) => break,
                    Err(FrameError::Io(e)) => return Err(e.into()),
                    Err(e) => {
                        tracing::warn!(
                            path = %log_path.display(),
                            offset = valid_len,
                            error = %e,
                            "Truncating damaged tail of event log"
                        );
                        file.set_len(valid_len)?;
                        file.sync_all()?;
                        break;
                    }
                }
            }
        }

        let writer = OpenOptions::new().append(true).open(log_path)?;
        let mut state = LogState::new(BufWriter::new(writer), valid_len);

        for entry in entries {
            match entry {
                LogEntry::Stored(record) => {
                    let id = record.id;
                    if !state.insert(record) {
                        tracing::debug!(record = ?id, "Skipping duplicate stored entry");
                        state.dead_entries += 1;
                    }
                }
                LogEntry::Completed(id) => {
                    state.remove(&id);
                    state.dead_entries += 1;
                }
            }
        }

        Ok(state)
    }

    /// Append one entry. On failure the log is cut back to its last whole entry.
    fn append(inner: &Inner, state: &mut LogState, entry: &LogEntryRef<'_>) -> StorageResult<()> {
        let result = (|| -> StorageResult<usize> {
            let written = frame::write(&mut state.writer, entry)?;
            state.writer.flush()?;
            if inner.sync_writes {
                state.writer.get_ref().sync_data()?;
            }
            Ok(written)
        })();

        match result {
            Ok(written) => {
                state.log_len += written as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = Self::rollback(state) {
                    tracing::warn!(
                        path = %inner.path.display(),
                        error = %rollback,
                        "Failed to cut back event log after write error"
                    );
                }
                Err(e)
            }
        }
    }

    /// Drop buffered bytes and truncate the log to `log_len`.
    fn rollback(state: &mut LogState) -> StorageResult<()> {
        let file = state.writer.get_ref().try_clone()?;
        file.set_len(state.log_len)?;

        let failed = std::mem::replace(&mut state.writer, BufWriter::new(file));
        // Discard whatever the failed write left buffered.
        let (_file, _buffered) = failed.into_parts();
        Ok(())
    }

    /// Rewrite the log with only deliverable records. Returns records dropped.
    fn compact(inner: &Inner, now: Timestamp) -> StorageResult<usize> {
        let mut state = inner.state.lock();

        let expired: Vec<RecordId> = state
            .pending
            .values()
            .filter(|r| !r.is_pending(now))
            .map(|r| r.id)
            .collect();
        for id in &expired {
            state.remove(id);
        }

        let tmp_path = inner.path.join(COMPACT_FILE);
        let mut tmp = BufWriter::new(
            OpenOptions::new()
                .append(true)
                .create(true)
                .truncate(false)
                .open(&tmp_path)?,
        );
        tmp.get_ref().set_len(0)?;
        let mut tmp_len = 0u64;
        for record in state.pending.values() {
            tmp_len += frame::write(&mut tmp, &LogEntryRef::Stored(record))? as u64;
        }
        tmp.flush()?;
        tmp.get_ref().sync_all()?;

        // The open handle follows the file through the rename.
        fs::rename(&tmp_path, inner.path.join(LOG_FILE))?;
        state.writer = tmp;
        state.log_len = tmp_len;
        File::open(&inner.path)?.sync_all()?;

        let removed = expired.len() + state.dead_entries;
        state.dead_entries = 0;
        Ok(removed)
    }
}

#[async_trait]
impl StorageProvider for PersistentStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Persistent
    }

    async fn store_event(&self, record: EventRecord) -> StorageResult<()> {
        self.blocking(move |inner| {
            let mut state = inner.state.lock();
            // A retried store of a record that already landed.
            if state.by_id.contains_key(&record.id) {
                return Ok(());
            }
            Self::append(inner, &mut state, &LogEntryRef::Stored(&record))?;
            state.insert(record);
            Ok(())
        })
        .await
    }

    async fn get_next_batch(
        &self,
        filter: &RecordFilter,
        limit: usize,
    ) -> StorageResult<Vec<EventRecord>> {
        // Uncontended reads skip the blocking pool.
        let fast = self
            .inner
            .state
            .try_lock()
            .map(|state| state.batch(filter, limit));
        if let Some(batch) = fast {
            return Ok(batch);
        }

        let filter = filter.clone();
        self.blocking(move |inner| Ok(inner.state.lock().batch(&filter, limit)))
            .await
    }

    async fn mark_event_as_complete(&self, record: &EventRecord) -> StorageResult<()> {
        let id = record.id;
        self.blocking(move |inner| {
            let mut state = inner.state.lock();
            if !state.by_id.contains_key(&id) {
                return Ok(());
            }
            Self::append(inner, &mut state, &LogEntryRef::Completed(id))?;
            state.remove(&id);
            state.dead_entries += 1;
            Ok(())
        })
        .await
    }

    async fn restore_subscriber_ids(&self, event_type: &str) -> StorageResult<Vec<String>> {
        let event_type = event_type.to_string();
        self.blocking(move |inner| {
            Ok(inner
                .state
                .lock()
                .subscriber_ids(&event_type, Timestamp::now()))
        })
        .await
    }

    async fn purge_stale(&self) -> StorageResult<usize> {
        self.blocking(|inner| Self::compact(inner, Timestamp::now()))
            .await
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Best-effort flush on drop
        let _ = self.state.get_mut().writer.flush();
    }
}
