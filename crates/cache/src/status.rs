//! The integrity monitor's persistent status document.

use crate::error::{CacheError, CacheResult};
use larder_core::{clock, CacheObject};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// What the monitor did on its most recent cycles.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    /// Epoch ms when a cycle last completed.
    pub last_ran: i64,
    pub last_ran_date: String,
    /// Epoch ms of the last cycle that actually checked files.
    pub last_checked: i64,
    pub last_checked_date: String,
    /// How many files the last checking cycle examined.
    #[serde(default)]
    pub filecount: u64,
    /// Ids deleted for integrity failures on the last checking cycle.
    #[serde(default)]
    pub deleted: Vec<String>,
    /// Whether the monitor worker is alive; set at read time, never stored.
    #[serde(default)]
    pub running: bool,
}

impl Default for MonitorStatus {
    fn default() -> Self {
        Self {
            last_ran: 0,
            last_ran_date: "(never)".to_string(),
            last_checked: 0,
            last_checked_date: "(never)".to_string(),
            filecount: 0,
            deleted: Vec::new(),
            running: false,
        }
    }
}

/// The status document on disk, written whole via temp-and-rename so
/// readers never observe a torn write.
pub struct MonitorStatusFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MonitorStatusFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// Read the current status; a missing file yields the "(never)"
    /// placeholder and an unreadable one "(unknown)".
    pub async fn read(&self) -> MonitorStatus {
        let _guard = self.lock.lock().await;
        self.read_unlocked().await
    }

    async fn read_unlocked(&self) -> MonitorStatus {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return MonitorStatus::default();
            }
            Err(e) => {
                tracing::error!("failed to read monitor status data: {e}");
                return unknown_status();
            }
        };
        match serde_json::from_slice(&data) {
            Ok(status) => status,
            Err(e) => {
                tracing::error!("failed to parse monitor status (JSON) data: {e}");
                unknown_status()
            }
        }
    }

    async fn save_unlocked(&self, status: &MonitorStatus) -> CacheResult<()> {
        let data = serde_json::to_vec_pretty(status)
            .map_err(|e| CacheError::Management(format!("cannot serialize monitor status: {e}")))?;
        let temp = self.path.with_extension("tmp");
        fs::write(&temp, &data)
            .await
            .map_err(|e| CacheError::Management(format!("trouble saving monitor status: {e}")))?;
        fs::rename(&temp, &self.path)
            .await
            .map_err(|e| CacheError::Management(format!("trouble saving monitor status: {e}")))?;
        Ok(())
    }

    /// Record the results of one monitor cycle: update the document and
    /// emit the cycle's log lines.  Up to five deleted ids are listed in
    /// the log; the document always carries the full list.
    pub async fn record(
        &self,
        checked: usize,
        deleted: &[CacheObject],
    ) -> CacheResult<MonitorStatus> {
        let _guard = self.lock.lock().await;
        let mut status = self.read_unlocked().await;
        let ran = clock::now_ms();
        status.last_ran = ran;
        status.last_ran_date = clock::to_rfc3339(ran);
        status.running = false;

        if checked > 0 {
            tracing::info!(
                "Monitor checked {} file{}",
                checked,
                if checked == 1 { "" } else { "s" }
            );
            status.last_checked = ran;
            status.last_checked_date = clock::to_rfc3339(ran);
            status.filecount = checked as u64;
            status.deleted = deleted.iter().map(|co| co.id.clone()).collect();

            if deleted.is_empty() {
                tracing::info!("No files detected with integrity failures");
            } else {
                let mut msg = format!(
                    "Monitor deleted {} file{} with detected integrity failures",
                    deleted.len(),
                    if deleted.len() == 1 { "" } else { "s" }
                );
                if deleted.len() > 5 {
                    msg.push_str(", including");
                }
                msg.push(':');
                for co in deleted.iter().take(5) {
                    msg.push_str("\n   ");
                    msg.push_str(&co.id);
                }
                tracing::warn!("{msg}");
            }
        } else {
            tracing::info!("Monitor completes cycle with no files to check");
        }

        self.save_unlocked(&status).await?;
        Ok(status)
    }
}

fn unknown_status() -> MonitorStatus {
    MonitorStatus {
        last_ran_date: "(unknown)".to_string(),
        last_checked_date: "(unknown)".to_string(),
        ..MonitorStatus::default()
    }
}
