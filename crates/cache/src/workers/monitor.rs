//! The continuous integrity-checking worker.
//!
//! Sweeps start on multiples of the duty cycle since UTC midnight (plus a
//! configurable offset).  Each cycle drains its monitors to exhaustion in
//! order (head-bag staging first, then the data cache) and rewrites the
//! status document.  Interrupts are honored at sleep and batch boundaries.

use crate::error::{CacheError, CacheResult};
use crate::integrity::IntegrityMonitor;
use crate::status::MonitorStatusFile;
use larder_core::config::CacheConfig;
use larder_core::{clock, CacheObject};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Scheduling parameters for the monitor worker.
#[derive(Clone, Copy, Debug)]
pub struct MonitorSchedule {
    /// Interval between sweep starts, in ms.  Zero degenerates to a
    /// single immediate sweep.
    pub duty_cycle_ms: i64,
    /// Minimum age since an object's last check before it is due again.
    pub grace_period_ms: i64,
    /// Offset from UTC midnight applied to the sweep schedule.
    pub start_offset_ms: i64,
    /// How many objects each check batch selects.
    pub batch: usize,
    /// Run one cycle and exit instead of cycling forever.
    pub once: bool,
}

impl Default for MonitorSchedule {
    fn default() -> Self {
        Self {
            duty_cycle_ms: 30 * 60 * 1000,
            grace_period_ms: 24 * 3600 * 1000,
            start_offset_ms: 0,
            batch: 100,
            once: false,
        }
    }
}

impl MonitorSchedule {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            duty_cycle_ms: (config.duty_cycle_secs * 1000) as i64,
            grace_period_ms: (config.grace_period_secs * 1000) as i64,
            start_offset_ms: (config.start_offset_secs * 1000) as i64,
            batch: config.check_batch,
            once: false,
        }
    }
}

/// Where the worker currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    /// Waiting until the given epoch-ms instant.
    Sleeping(i64),
    Checking,
    Stopping,
    Exited,
}

/// The continuous integrity-checking worker.
pub struct MonitorWorker {
    monitors: Vec<IntegrityMonitor>,
    status_file: Arc<MonitorStatusFile>,
    schedule: MonitorSchedule,
    running_flag: Option<Arc<AtomicBool>>,
}

impl MonitorWorker {
    /// Build a worker sweeping the given monitors, in order.
    pub fn new(
        monitors: Vec<IntegrityMonitor>,
        status_file: Arc<MonitorStatusFile>,
        schedule: MonitorSchedule,
    ) -> Self {
        Self {
            monitors,
            status_file,
            schedule,
            running_flag: None,
        }
    }

    /// Share a liveness flag (see `CacheManager::monitor_running_flag`).
    pub fn with_running_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.running_flag = Some(flag);
        self
    }

    /// Start the worker.  The schedule's grace period is applied to every
    /// monitored inventory before the first sweep.
    pub fn spawn(self) -> MonitorHandle {
        for monitor in &self.monitors {
            monitor
                .inventory()
                .set_check_grace_period(self.schedule.grace_period_ms);
        }

        let (state_tx, state_rx) = watch::channel(MonitorState::Idle);
        let (interrupt_tx, interrupt_rx) = watch::channel(false);
        let once = Arc::new(AtomicBool::new(self.schedule.once));

        let join = tokio::spawn(run_loop(
            self.monitors,
            self.status_file,
            self.schedule,
            once.clone(),
            interrupt_rx,
            state_tx,
            self.running_flag,
        ));

        MonitorHandle {
            state: state_rx,
            interrupt: interrupt_tx,
            once,
            join,
        }
    }
}

/// Control handle for a spawned monitor worker.
pub struct MonitorHandle {
    state: watch::Receiver<MonitorState>,
    interrupt: watch::Sender<bool>,
    once: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    /// True when the worker is set to cycle forever.
    pub fn is_continuous(&self) -> bool {
        !self.once.load(Ordering::SeqCst)
    }

    /// Toggle continuous cycling.  Turning it off while a cycle runs lets
    /// the cycle finish and then exits the worker.
    pub fn set_continuous(&self, yes: bool) {
        self.once.store(!yes, Ordering::SeqCst);
    }

    /// Ask the worker to stop at its next sleep or batch boundary.
    pub fn interrupt(&self) {
        tracing::debug!("monitor stop requested; will exit at the next boundary");
        let _ = self.interrupt.send(true);
    }

    /// Interrupt and wait for the worker to exit.
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

fn initial_start(now: i64, offset: i64, duty: i64) -> i64 {
    let mut start = clock::midnight_utc_ms(now) + offset.max(0);
    if duty > 0 {
        while start <= now {
            start += duty;
        }
    } else {
        start = now;
    }
    start
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    monitors: Vec<IntegrityMonitor>,
    status_file: Arc<MonitorStatusFile>,
    schedule: MonitorSchedule,
    once: Arc<AtomicBool>,
    interrupt: watch::Receiver<bool>,
    state: watch::Sender<MonitorState>,
    running_flag: Option<Arc<AtomicBool>>,
) {
    if let Some(flag) = &running_flag {
        flag.store(true, Ordering::SeqCst);
    }
    tracing::info!(
        "Monitoring started with auto-repeat {}",
        if once.load(Ordering::SeqCst) { "off" } else { "on" }
    );

    let duty = schedule.duty_cycle_ms.max(0);
    let mut start = initial_start(clock::now_ms(), schedule.start_offset_ms, duty);
    let mut interrupt = interrupt;

    loop {
        let now = clock::now_ms();
        if once.load(Ordering::SeqCst) || now >= start {
            let _ = state.send(MonitorState::Checking);
            let mut deleted: Vec<CacheObject> = Vec::new();
            match sweep_until_done(&monitors, schedule.batch, &mut deleted, &interrupt).await {
                Ok(checked) => {
                    if let Err(e) = status_file.record(checked, &deleted).await {
                        tracing::error!("failed to record monitor results: {e}");
                    }
                }
                Err(CacheError::Interrupted) => {
                    let _ = state.send(MonitorState::Stopping);
                    tracing::info!("Monitor worker stop requested; exiting");
                    break;
                }
                Err(e) => {
                    // an expected error kind ends this worker cleanly; a
                    // fresh worker can be spawned over the same state
                    let _ = state.send(MonitorState::Stopping);
                    tracing::error!("integrity sweep halted: {e}");
                    break;
                }
            }

            // advance the cycle start past now
            if duty > 0 {
                let now = clock::now_ms();
                if start <= now {
                    start = now - ((now - start) % duty) + duty;
                }
                tracing::debug!("next check at epoch ms {start}");
            } else {
                once.store(true, Ordering::SeqCst);
            }

            if once.load(Ordering::SeqCst) {
                break;
            }
        }

        let wait = start - clock::now_ms();
        if wait > 0 {
            let _ = state.send(MonitorState::Sleeping(start));
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(wait as u64)) => {}
                changed = interrupt.changed() => {
                    if changed.is_err() || *interrupt.borrow() {
                        let _ = state.send(MonitorState::Stopping);
                        tracing::info!("Monitor worker stop requested; exiting");
                        break;
                    }
                }
            }
        }
    }

    let _ = state.send(MonitorState::Exited);
    if let Some(flag) = &running_flag {
        flag.store(false, Ordering::SeqCst);
    }
}

/// Drain each monitor in order until nothing more is due.
async fn sweep_until_done(
    monitors: &[IntegrityMonitor],
    batch: usize,
    deleted: &mut Vec<CacheObject>,
    interrupt: &watch::Receiver<bool>,
) -> CacheResult<usize> {
    let mut total = 0;
    for monitor in monitors {
        loop {
            if *interrupt.borrow() {
                return Err(CacheError::Interrupted);
            }
            let examined = monitor.find_corrupted_objects(batch, deleted, true).await?;
            total += examined;
            if examined == 0 {
                break;
            }
        }
    }
    Ok(total)
}
