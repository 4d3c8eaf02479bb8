//! The persistent caching request queue.
//!
//! A plain UTF-8 file of LF-separated records, one per pending request:
//! `AIPID<TAB>RECACHE[<TAB>VERSION]` with `RECACHE` in `{0,1}`.  Appends
//! are synchronous so an accepted request survives a crash; pops rewrite
//! the file through a temp-and-rename so the sequence is never torn.

use crate::error::{CacheError, CacheResult};
use larder_core::AipId;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One pending cache request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    /// The identifier, without any version suffix.
    pub id: String,
    /// Whether an existing copy should be replaced.
    pub recache: bool,
    /// The pinned version, if any.
    pub version: Option<String>,
}

impl QueueEntry {
    /// Build an entry from a full AIP id, splitting off the version.
    pub fn parse(id: &str, recache: bool) -> CacheResult<Self> {
        let aip = AipId::parse(id)?;
        Ok(Self {
            id: aip.unversioned().to_string(),
            recache,
            version: aip.version().map(str::to_string),
        })
    }

    /// The full identifier, version suffix included.
    pub fn aipid(&self) -> String {
        match &self.version {
            Some(v) => format!("{}#{}", self.id, v),
            None => self.id.clone(),
        }
    }

    fn to_line(&self) -> String {
        let mut line = format!("{}\t{}", self.id, if self.recache { "1" } else { "0" });
        if let Some(v) = &self.version {
            line.push('\t');
            line.push_str(v);
        }
        line
    }

    fn from_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let mut parts = line.split('\t');
        let id = parts.next()?.trim().to_string();
        if id.is_empty() {
            return None;
        }
        let recache = !matches!(parts.next().map(str::trim), Some("0"));
        let version = parts
            .next()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        Some(Self {
            id,
            recache,
            version,
        })
    }
}

/// The persistent FIFO of caching requests.
///
/// Also the rendezvous between the cacher worker and status queries: it
/// tracks whether a worker is draining it and which item is in process.
pub struct CacheQueue {
    path: PathBuf,
    lock: Mutex<()>,
    running: AtomicBool,
    inprocess: StdMutex<Option<String>>,
}

impl CacheQueue {
    /// Wrap the queue file at the given path; the file need not exist yet.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
            running: AtomicBool::new(false),
            inprocess: StdMutex::new(None),
        }
    }

    /// Append one request; the record is durable before this returns.
    pub async fn queue(&self, id: &str, recache: bool) -> CacheResult<()> {
        let entry = QueueEntry::parse(id, recache)?;
        let _guard = self.lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| CacheError::Management(format!("cache queue IO failure: {e}")))?;
        file.write_all(format!("{}\n", entry.to_line()).as_bytes())
            .await
            .map_err(|e| CacheError::Management(format!("cache queue IO failure: {e}")))?;
        file.sync_data()
            .await
            .map_err(|e| CacheError::Management(format!("cache queue IO failure: {e}")))?;
        Ok(())
    }

    /// Read the pending entries in order.
    pub async fn load_queue(&self) -> CacheResult<Vec<QueueEntry>> {
        let _guard = self.lock.lock().await;
        self.load_unlocked().await
    }

    async fn load_unlocked(&self) -> CacheResult<Vec<QueueEntry>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CacheError::Management(format!(
                    "cannot read cache queue: {e}"
                )))
            }
        };
        Ok(text.lines().filter_map(QueueEntry::from_line).collect())
    }

    async fn save_unlocked(&self, entries: &[QueueEntry]) -> CacheResult<()> {
        let mut text = String::new();
        for entry in entries {
            text.push_str(&entry.to_line());
            text.push('\n');
        }
        let temp = self.path.with_extension("tmp");
        fs::write(&temp, text.as_bytes())
            .await
            .map_err(|e| CacheError::Management(format!("cannot save cache queue: {e}")))?;
        fs::rename(&temp, &self.path)
            .await
            .map_err(|e| CacheError::Management(format!("cannot save cache queue: {e}")))?;
        Ok(())
    }

    /// Remove and return the oldest entry, persisting the shortened queue
    /// before returning it.
    pub async fn pop_queue(&self) -> CacheResult<Option<QueueEntry>> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load_unlocked().await?;
        if entries.is_empty() {
            return Ok(None);
        }
        let entry = entries.remove(0);
        self.save_unlocked(&entries).await?;
        Ok(Some(entry))
    }

    /// True when any request is waiting.
    pub async fn has_pending(&self) -> bool {
        match fs::metadata(&self.path).await {
            Ok(meta) => meta.len() > 0,
            Err(_) => false,
        }
    }

    /// True when the given id is waiting in the queue.
    pub async fn is_queued(&self, id: &str) -> bool {
        let Ok(probe) = QueueEntry::parse(id, false) else {
            return false;
        };
        match self.load_queue().await {
            Ok(entries) => entries
                .iter()
                .any(|e| e.id == probe.id && e.version == probe.version),
            Err(e) => {
                tracing::error!("is_queued: status of {id} unknown: {e}");
                false
            }
        }
    }

    /// The id currently being cached, if a worker is mid-item.
    pub fn inprocess(&self) -> Option<String> {
        self.inprocess.lock().expect("inprocess poisoned").clone()
    }

    pub(crate) fn set_inprocess(&self, id: Option<String>) {
        *self.inprocess.lock().expect("inprocess poisoned") = id;
    }

    /// True when a cacher worker is draining this queue.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Claim the queue for a worker; false when one already holds it.
    pub(crate) fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn finish_running(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
