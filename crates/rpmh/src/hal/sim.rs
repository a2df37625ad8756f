//! Simulated RSC register file
//!
//! Behaves like one DRV of the RSC closely enough to drive the scheduler:
//! - writing CONTROL with the trigger bit marks the TCS busy and queues it
//! - [`SimRsc::complete`] finishes a triggered TCS and raises its IRQ bit
//! - IRQ_CLEAR clears bits in IRQ_STATUS
//! - pinned registers ignore writes, modelling a wedged block
//!
//! It also records protocol violations the real hardware does not tolerate:
//! triggering a TCS that is still busy, or two busy TCSes carrying the same
//! command address.

use super::cpu::IrqContext;
use super::{IrqHandler, RegisterBus};
use crate::rsc::regs::*;
use crate::types::QueueId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How the coprocessor reports a finished TCS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdOutcome {
    /// Every command issued and completed
    Completed,
    /// Commands issued but no completion reported
    IssuedOnly,
    /// Commands never issued
    NotIssued,
}

impl CmdOutcome {
    fn status_bits(self) -> u32 {
        match self {
            CmdOutcome::Completed => CMD_STATUS_ISSUED | CMD_STATUS_COMPL,
            CmdOutcome::IssuedOnly => CMD_STATUS_ISSUED,
            CmdOutcome::NotIssued => 0,
        }
    }
}

#[derive(Default)]
struct SimState {
    regs: HashMap<usize, u32>,
    triggered: Vec<usize>,
    busy: HashSet<usize>,
    pinned: HashSet<usize>,
}

impl SimState {
    fn get(&self, offset: usize) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }
}

pub struct SimRsc {
    tcs_offset: usize,
    num_tcs: usize,
    ncpt: usize,
    state: Mutex<SimState>,
    writes: AtomicU64,
    violations: AtomicU64,
}

impl SimRsc {
    pub fn new(drv_id: u32, num_tcs: usize, ncpt: usize, tcs_offset: usize) -> Self {
        let mut state = SimState::default();
        let info = HardwareInfo {
            max_tcs: num_tcs,
            ncpt,
        };
        state.regs.insert(DRV_PRNT_CHLD_CONFIG, info.encode(drv_id));
        let sim = Self {
            tcs_offset,
            num_tcs,
            ncpt,
            state: Mutex::new(state),
            writes: AtomicU64::new(0),
            violations: AtomicU64::new(0),
        };
        {
            let mut state = sim.state.lock();
            for m in 0..num_tcs {
                state.regs.insert(sim.tcs_reg(RSC_DRV_STATUS, m, 0), 1);
            }
        }
        sim
    }

    fn tcs_reg(&self, reg: usize, m: usize, n: usize) -> usize {
        self.tcs_offset + reg + RSC_DRV_TCS_OFFSET * m + RSC_DRV_CMD_OFFSET * n
    }

    /// Split an offset into (TCS index, register within the TCS window)
    fn decode(&self, offset: usize) -> Option<(usize, usize)> {
        let rel = offset.checked_sub(self.tcs_offset)?;
        let m = rel / RSC_DRV_TCS_OFFSET;
        (m < self.num_tcs).then_some((m, rel % RSC_DRV_TCS_OFFSET))
    }

    fn enabled_addrs(&self, state: &SimState, m: usize) -> Vec<u32> {
        let enable = state.get(self.tcs_reg(RSC_DRV_CMD_ENABLE, m, 0));
        (0..self.ncpt)
            .filter(|n| enable & (1 << n) != 0)
            .map(|n| state.get(self.tcs_reg(RSC_DRV_CMD_ADDR, m, n)))
            .collect()
    }

    fn on_trigger(&self, state: &mut SimState, m: usize) {
        if state.busy.contains(&m) {
            log::warn!("sim: tcs{} re-triggered while busy", m);
            self.violations.fetch_add(1, Ordering::Relaxed);
        }

        let view: &SimState = state;
        let ours = self.enabled_addrs(view, m);
        let clash = view
            .busy
            .iter()
            .filter(|&&k| k != m)
            .any(|&k| self.enabled_addrs(view, k).iter().any(|a| ours.contains(a)));
        if clash {
            log::warn!("sim: tcs{} triggered with an address already in flight", m);
            self.violations.fetch_add(1, Ordering::Relaxed);
        }

        let enable = state.get(self.tcs_reg(RSC_DRV_CMD_ENABLE, m, 0));
        for n in (0..self.ncpt).filter(|n| enable & (1 << n) != 0) {
            state.regs.insert(self.tcs_reg(RSC_DRV_CMD_STATUS, m, n), 0);
        }
        state.regs.insert(self.tcs_reg(RSC_DRV_STATUS, m, 0), 0);
        state.busy.insert(m);
        state.triggered.push(m);
    }

    /// Finish a TCS: report `outcome` for every enabled command, mark the TCS
    /// idle and raise its completion interrupt bit.
    pub fn complete(&self, queue: QueueId, outcome: CmdOutcome) {
        let m = queue.0;
        let mut state = self.state.lock();
        let enable = state.get(self.tcs_reg(RSC_DRV_CMD_ENABLE, m, 0));
        for n in (0..self.ncpt).filter(|n| enable & (1 << n) != 0) {
            state
                .regs
                .insert(self.tcs_reg(RSC_DRV_CMD_STATUS, m, n), outcome.status_bits());
        }
        state.regs.insert(self.tcs_reg(RSC_DRV_STATUS, m, 0), 1);
        state.busy.remove(&m);
        state.triggered.retain(|&t| t != m);
        let irq = self.tcs_reg(RSC_DRV_IRQ_STATUS, 0, 0);
        let pending = state.get(irq) | (1 << m);
        state.regs.insert(irq, pending);
    }

    /// Triggered TCSes not yet completed, oldest first
    pub fn take_triggered(&self) -> Vec<QueueId> {
        let mut state = self.state.lock();
        std::mem::take(&mut state.triggered)
            .into_iter()
            .map(QueueId)
            .collect()
    }

    /// Force a TCS's STATUS register, independent of triggers
    pub fn set_idle(&self, queue: QueueId, idle: bool) {
        let offset = self.tcs_reg(RSC_DRV_STATUS, queue.0, 0);
        self.state.lock().regs.insert(offset, u32::from(idle));
    }

    /// Make a register ignore all further writes
    pub fn pin(&self, offset: usize) {
        self.state.lock().pinned.insert(offset);
    }

    pub fn unpin(&self, offset: usize) {
        self.state.lock().pinned.remove(&offset);
    }

    pub fn control(&self, queue: QueueId) -> u32 {
        self.peek(self.tcs_reg(RSC_DRV_CONTROL, queue.0, 0))
    }

    pub fn cmd_enable(&self, queue: QueueId) -> u32 {
        self.peek(self.tcs_reg(RSC_DRV_CMD_ENABLE, queue.0, 0))
    }

    /// (msgid, addr, data) of one command slot
    pub fn cmd(&self, queue: QueueId, n: usize) -> (u32, u32, u32) {
        let state = self.state.lock();
        (
            state.get(self.tcs_reg(RSC_DRV_CMD_MSGID, queue.0, n)),
            state.get(self.tcs_reg(RSC_DRV_CMD_ADDR, queue.0, n)),
            state.get(self.tcs_reg(RSC_DRV_CMD_DATA, queue.0, n)),
        )
    }

    pub fn irq_status(&self) -> u32 {
        self.peek(self.tcs_reg(RSC_DRV_IRQ_STATUS, 0, 0))
    }

    pub fn irq_enable(&self) -> u32 {
        self.peek(self.tcs_reg(RSC_DRV_IRQ_ENABLE, 0, 0))
    }

    pub fn peek(&self, offset: usize) -> u32 {
        self.state.lock().get(offset)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// Act as the coprocessor: complete every triggered TCS with `outcome`
    /// and deliver the interrupt to `handler`, until the responder is dropped.
    pub fn spawn_responder(
        self: &Arc<Self>,
        handler: Arc<dyn IrqHandler>,
        outcome: CmdOutcome,
    ) -> Responder {
        let stop = Arc::new(AtomicBool::new(false));
        let sim = Arc::clone(self);
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("rsc-sim-responder".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    let done = sim.take_triggered();
                    if done.is_empty() {
                        std::thread::sleep(Duration::from_micros(20));
                        continue;
                    }
                    for queue in done {
                        sim.complete(queue, outcome);
                    }
                    let _irq = IrqContext::enter();
                    handler.handle_irq();
                }
            })
            .ok();
        if handle.is_none() {
            log::error!("sim: failed to spawn responder thread");
        }
        Responder { stop, handle }
    }
}

impl RegisterBus for SimRsc {
    fn read32(&self, offset: usize) -> u32 {
        self.peek(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if state.pinned.contains(&offset) {
            return;
        }

        if offset == self.tcs_reg(RSC_DRV_IRQ_CLEAR, 0, 0) {
            let irq = self.tcs_reg(RSC_DRV_IRQ_STATUS, 0, 0);
            let pending = state.get(irq) & !value;
            state.regs.insert(irq, pending);
            return;
        }

        state.regs.insert(offset, value);
        if let Some((m, RSC_DRV_CONTROL)) = self.decode(offset) {
            if value & TCS_AMC_MODE_TRIGGER != 0 {
                self.on_trigger(&mut state, m);
            }
        }
    }
}

/// Handle to a running responder thread; stops it on drop
pub struct Responder {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Responder {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.shutdown();
    }
}
