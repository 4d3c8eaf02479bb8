//! The caching-queue drainer.
//!
//! Pops entries off the persistent queue and caches them through the
//! [`Placement`] interface.  One item's failure is logged and skipped;
//! interrupts are honored at item boundaries.  The queue's run guard keeps
//! two drainers from racing over the same file.

use crate::error::{CacheError, CacheResult};
use crate::manager::Placement;
use crate::queue::{CacheQueue, QueueEntry};
use larder_core::AipId;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The queue-draining worker.
pub struct CacherWorker {
    queue: Arc<CacheQueue>,
    placement: Arc<dyn Placement>,
}

impl CacherWorker {
    pub fn new(queue: Arc<CacheQueue>, placement: Arc<dyn Placement>) -> Self {
        Self { queue, placement }
    }

    /// Start draining.  Fails when a drainer already holds the queue; a
    /// finished worker releases it, so a fresh one can be spawned after
    /// any exit.
    pub fn spawn(self) -> CacheResult<CacherHandle> {
        if !self.queue.try_start() {
            return Err(CacheError::Management(
                "caching worker is already running".to_string(),
            ));
        }
        let (interrupt_tx, interrupt_rx) = watch::channel(false);
        let join = tokio::spawn(run_loop(self.queue, self.placement, interrupt_rx));
        Ok(CacherHandle {
            interrupt: interrupt_tx,
            join,
        })
    }
}

/// Control handle for a spawned cacher worker.
pub struct CacherHandle {
    interrupt: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl CacherHandle {
    /// Ask the worker to stop before its next item.
    pub fn interrupt(&self) {
        let _ = self.interrupt.send(true);
    }

    pub async fn interrupt_and_wait(self) {
        self.interrupt();
        let _ = self.join.await;
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

async fn run_loop(
    queue: Arc<CacheQueue>,
    placement: Arc<dyn Placement>,
    interrupt: watch::Receiver<bool>,
) {
    if queue.has_pending().await {
        tracing::info!("Beginning queued cache request processing");
    }

    loop {
        if *interrupt.borrow() {
            tracing::info!("Interruption of caching worker requested; exiting");
            break;
        }
        let entry = match queue.pop_queue().await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                tracing::info!("Cache request queue is empty");
                break;
            }
            Err(e) => {
                tracing::error!("Trouble reading cache queue: {e}");
                break;
            }
        };

        let aipid = entry.aipid();
        queue.set_inprocess(Some(aipid.clone()));
        if let Err(e) = process_entry(placement.as_ref(), &entry).await {
            tracing::error!("Unable to cache {aipid}: {e} (moving on)");
        }
        queue.set_inprocess(None);
    }

    if queue.has_pending().await {
        tracing::warn!("Caching worker is exiting with requests unprocessed");
    }
    queue.finish_running();
}

async fn process_entry(placement: &dyn Placement, entry: &QueueEntry) -> CacheResult<()> {
    let aip = AipId::parse(&entry.aipid())?;
    if aip.is_dataset() {
        placement
            .cache_dataset(aip.dsid(), aip.version(), entry.recache, 0, None)
            .await?;
    } else {
        let id = entry.aipid();
        if entry.recache || !placement.is_cached(&id).await? {
            placement.cache(&id, true, 0).await?;
        }
    }
    Ok(())
}
