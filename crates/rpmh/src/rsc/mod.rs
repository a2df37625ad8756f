//! RSC controller
//!
//! One [`Controller`] drives one channel (DRV) of the RSC. It owns the TCS
//! group table, a per-TCS in-use flag and response slot, and the deferred
//! worker that delivers completions to callers.
//!
//! Lock order: a group lock may be held while taking a TCS's response slot.
//! The interrupt handler takes response slots only, never a group lock.

pub mod dispatch;
pub mod regs;
pub mod slots;
pub mod tcs;
pub mod tracker;

use crate::config::ChannelConfig;
use crate::error::{ProbeError, TcsError};
use crate::hal::{IrqHandler, RegisterBus};
use crate::types::{ChannelId, QueueId, TcsType};
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use regs::{HardwareInfo, TcsRegs, MAX_DRV_ID, RSC_DRV_IRQ_ENABLE};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tcs::GroupTable;
use tracker::{Response, TrackerMsg};

/// Transfer counters, updated lock-free on the hot paths
#[derive(Default)]
pub struct ControllerStats {
    dispatch_attempts: AtomicU64,
    busy_rejections: AtomicU64,
    triggered: AtomicU64,
    completed: AtomicU64,
    io_errors: AtomicU64,
    cached_writes: AtomicU64,
    stray_irqs: AtomicU64,
}

impl ControllerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatch_attempts: self.dispatch_attempts.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            triggered: self.triggered.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            cached_writes: self.cached_writes.load(Ordering::Relaxed),
            stray_irqs: self.stray_irqs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub dispatch_attempts: u64,
    pub busy_rejections: u64,
    pub triggered: u64,
    pub completed: u64,
    pub io_errors: u64,
    pub cached_writes: u64,
    pub stray_irqs: u64,
}

pub struct Controller {
    name: String,
    id: ChannelId,
    irq: u32,
    regs: TcsRegs,
    groups: GroupTable,
    ncpt: usize,

    /// Set exactly while a response is outstanding for the TCS
    in_use: Vec<AtomicBool>,
    responses: Vec<Mutex<Option<Response>>>,

    tx: Sender<TrackerMsg>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: ControllerStats,
}

impl Controller {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    /// Command slots per TCS
    pub fn ncpt(&self) -> usize {
        self.ncpt
    }

    pub fn num_tcs(&self) -> usize {
        self.groups.num_tcs()
    }

    pub fn groups(&self) -> &GroupTable {
        &self.groups
    }

    pub fn queue_in_use(&self, queue: QueueId) -> bool {
        self.in_use
            .get(queue.0)
            .is_some_and(|f| f.load(Ordering::Acquire))
    }

    /// No active transfer is outstanding
    pub fn is_idle(&self) -> bool {
        self.groups
            .get(TcsType::Active)
            .queues()
            .all(|q| !self.queue_in_use(q))
    }

    /// Claimed Sleep/Wake slots, zero for uncached groups
    pub fn slots_in_use(&self, ty: TcsType) -> usize {
        self.groups
            .get(ty)
            .lock()
            .slots
            .as_ref()
            .map_or(0, |s| s.in_use())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the completion worker after it drains queued responses
    pub fn shutdown(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        log::info!("{}: shutting down", self.name);
        let _ = self.tx.send(TrackerMsg::Shutdown);
        // A callback may drop the last reference on the worker itself.
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            log::error!("{}: completion worker panicked", self.name);
        }
    }

    fn validate(&self, cmds: usize) -> Result<(), TcsError> {
        if cmds == 0 {
            return Err(TcsError::InvalidRequest("empty request"));
        }
        if cmds > crate::types::MAX_RPMH_PAYLOAD {
            return Err(TcsError::InvalidRequest("too many commands"));
        }
        if cmds > self.ncpt {
            return Err(TcsError::InvalidRequest("request does not fit one TCS"));
        }
        Ok(())
    }
}

impl IrqHandler for Controller {
    fn handle_irq(&self) {
        self.tcs_irq();
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for [`Controller`]
pub struct ControllerBuilder {
    config: ChannelConfig,
    bus: Option<Arc<dyn RegisterBus>>,
}

impl ControllerBuilder {
    pub fn new(config: ChannelConfig) -> Self {
        Self { config, bus: None }
    }

    pub fn with_bus(mut self, bus: Arc<dyn RegisterBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_response_queue_depth(mut self, depth: usize) -> Self {
        self.config.response_queue_depth = depth;
        self
    }

    pub fn with_sync_write_poll_limit(mut self, polls: u32) -> Self {
        self.config.sync_write_poll_limit = polls;
        self
    }

    /// Probe the channel: read its geometry, partition the TCSes, enable
    /// completion interrupts for the active group and start the worker.
    pub fn build(self) -> Result<Controller, ProbeError> {
        let config = self.config;
        let bus = self
            .bus
            .ok_or_else(|| ProbeError::MissingBus(config.name.clone()))?;

        if config.drv_id > MAX_DRV_ID {
            return Err(ProbeError::Geometry(format!(
                "drv_id {} above {}",
                config.drv_id, MAX_DRV_ID
            )));
        }

        let regs = TcsRegs::new(bus, config.tcs_offset, config.sync_write_poll_limit);
        let hw = HardwareInfo::decode(regs.read_config(), config.drv_id);
        let groups = GroupTable::probe(&config.tcs, hw)?;
        let num_tcs = groups.num_tcs();

        if config.response_queue_depth < num_tcs.max(1) {
            return Err(ProbeError::Geometry(format!(
                "response queue depth {} below {} TCSes",
                config.response_queue_depth, num_tcs
            )));
        }

        let (tx, rx) = channel::bounded(config.response_queue_depth);
        let worker_name = config.name.clone();
        let worker = std::thread::Builder::new()
            .name(format!("rsc-{}", config.name))
            .spawn(move || tracker::run_worker(&worker_name, rx))
            .map_err(ProbeError::Spawn)?;

        let active = groups.get(TcsType::Active);
        regs.write(RSC_DRV_IRQ_ENABLE, 0, 0, active.mask);

        log::info!(
            "{} ({}): {} of {} TCSes, {} commands each, irq {}",
            config.name,
            config.channel_id(),
            num_tcs,
            hw.max_tcs,
            hw.ncpt,
            config.irq
        );

        Ok(Controller {
            name: config.name.clone(),
            id: config.channel_id(),
            irq: config.irq,
            regs,
            ncpt: hw.ncpt,
            in_use: (0..num_tcs).map(|_| AtomicBool::new(false)).collect(),
            responses: (0..num_tcs).map(|_| Mutex::new(None)).collect(),
            groups,
            tx,
            worker: Mutex::new(Some(worker)),
            stats: ControllerStats::default(),
        })
    }
}
