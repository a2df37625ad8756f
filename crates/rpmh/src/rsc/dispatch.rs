//! Request dispatch
//!
//! Active requests are committed to a free TCS and triggered. Sleep and Wake
//! requests are written into the group's slot cache and left for the
//! coprocessor to apply on the next power transition.

use super::regs::*;
use super::slots::{SlotLookup, SlotRange};
use super::tcs::TcsGroup;
use super::tracker::{Response, TxDone};
use super::{Controller, ControllerStats};
use crate::error::TcsError;
use crate::types::{QueueId, TcsCmd, TcsRequest, TcsType};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

impl Controller {
    /// Commit an active request to a free TCS and trigger it.
    ///
    /// Returns [`TcsError::Busy`] when every TCS of the group is taken or one
    /// of the request's addresses is still in flight; the caller retries.
    /// On success `on_done` runs once the transfer completes.
    pub fn try_send_data(&self, req: &TcsRequest, on_done: &TxDone) -> Result<QueueId, TcsError> {
        if !req.state.is_active() {
            return Err(TcsError::InvalidRequest("not an active request"));
        }
        self.validate(req.cmds.len())?;
        let group = self.groups.for_state(req.state)?;
        ControllerStats::bump(&self.stats.dispatch_attempts);

        let _guard = group.lock();
        let Some(queue) = self.find_free(group) else {
            ControllerStats::bump(&self.stats.busy_rejections);
            return Err(TcsError::Busy);
        };
        if self.inflight_conflict(group, req) {
            ControllerStats::bump(&self.stats.busy_rejections);
            return Err(TcsError::Busy);
        }

        *self.responses[queue.0].lock() = Some(Response::new(queue, req.clone(), on_done.clone()));
        self.in_use[queue.0].store(true, Ordering::Release);

        self.write_cmds(req, req.cmds.iter().enumerate().map(|(n, c)| (queue.0, n, c)));
        if let Err(e) = self.trigger(queue) {
            self.rollback(queue);
            ControllerStats::bump(&self.stats.io_errors);
            return Err(e);
        }

        ControllerStats::bump(&self.stats.triggered);
        log::debug!(
            "{}: {} triggered, {} cmds, addr={:#x}",
            self.name,
            queue,
            req.cmds.len(),
            req.first_addr()
        );
        Ok(queue)
    }

    /// Write a Sleep or Wake request into the group's slot cache.
    ///
    /// A request whose addresses are already cached, in order, reuses those
    /// slots and only updates the data. Nothing is triggered.
    pub fn write_ctrl_data(&self, req: &TcsRequest) -> Result<SlotRange, TcsError> {
        if req.state.is_active() {
            return Err(TcsError::InvalidRequest("active request sent to slot cache"));
        }
        self.validate(req.cmds.len())?;
        let group = self.groups.for_state(req.state)?;

        let mut guard = group.lock();
        let Some(arena) = guard.slots.as_mut() else {
            return Err(TcsError::InvalidRequest("group has no slot cache"));
        };

        let addrs = req.addrs();
        let range = match arena.lookup(&addrs) {
            SlotLookup::Hit(range) => range,
            SlotLookup::Mismatch(slot) => {
                log::warn!(
                    "{}: addr={:#x} cached at {} with a different sequence",
                    self.name,
                    arena.cached(slot).unwrap_or_default(),
                    slot
                );
                return Err(TcsError::InvalidRequest("address cached with a different sequence"));
            }
            SlotLookup::Miss => {
                let range = arena.allocate(addrs.len()).map_err(|e| {
                    log::warn!("{}: {} group out of slots: {}", self.name, group.ty, e);
                    TcsError::OutOfCapacity(group.ty)
                })?;
                arena.claim(range, &addrs);
                range
            }
        };

        let placed = range.slots().zip(&req.cmds).map(|(slot, cmd)| {
            let (tcs, n) = arena.position(slot);
            (group.offset + tcs, n, cmd)
        });
        self.write_cmds(req, placed);

        ControllerStats::bump(&self.stats.cached_writes);
        log::debug!(
            "{}: cached {} cmds in {} group at {}",
            self.name,
            req.cmds.len(),
            group.ty,
            range.start
        );
        Ok(range)
    }

    /// Drop every cached Sleep and Wake vote and disable their commands
    pub fn invalidate(&self) -> Result<(), TcsError> {
        for ty in [TcsType::Sleep, TcsType::Wake] {
            let group = self.groups.get(ty);
            let mut guard = group.lock();
            for queue in group.queues() {
                self.regs.write_sync(RSC_DRV_CMD_ENABLE, queue.0, 0, 0)?;
            }
            if let Some(arena) = guard.slots.as_mut() {
                arena.clear();
            }
        }
        log::debug!("{}: sleep and wake caches invalidated", self.name);
        Ok(())
    }

    /// First TCS that the hardware reports idle and no response holds
    fn find_free(&self, group: &TcsGroup) -> Option<QueueId> {
        group.queues().find(|q| {
            !self.in_use[q.0].load(Ordering::Acquire) && self.regs.read(RSC_DRV_STATUS, q.0, 0) != 0
        })
    }

    /// Any of the request's addresses enabled on a TCS still in flight
    fn inflight_conflict(&self, group: &TcsGroup, req: &TcsRequest) -> bool {
        for q in group.queues() {
            let busy = self.in_use[q.0].load(Ordering::Acquire)
                || self.regs.read(RSC_DRV_STATUS, q.0, 0) == 0;
            if !busy {
                continue;
            }
            let enabled = self.regs.read(RSC_DRV_CMD_ENABLE, q.0, 0);
            for n in (0..self.ncpt).filter(|n| enabled & (1 << n) != 0) {
                let addr = self.regs.read(RSC_DRV_CMD_ADDR, q.0, n);
                if req.cmds.iter().any(|c| c.addr == addr) {
                    log::debug!("{}: addr={:#x} in flight on {}", self.name, addr, q);
                    return true;
                }
            }
        }
        false
    }

    /// Write message id, address and data for each `(tcs, slot, cmd)` and
    /// extend the TCS's enable and wait-for-completion masks.
    fn write_cmds<'a>(
        &self,
        req: &TcsRequest,
        placed: impl Iterator<Item = (usize, usize, &'a TcsCmd)>,
    ) {
        let mut masks: BTreeMap<usize, (u32, u32)> = BTreeMap::new();
        for (m, n, cmd) in placed {
            let ack = req.needs_ack(cmd);
            let mut msgid = CMD_MSGID_LEN | CMD_MSGID_WRITE;
            if ack {
                msgid |= CMD_MSGID_RESP_REQ;
            }
            self.regs.write(RSC_DRV_CMD_MSGID, m, n, msgid);
            self.regs.write(RSC_DRV_CMD_ADDR, m, n, cmd.addr);
            self.regs.write(RSC_DRV_CMD_DATA, m, n, cmd.data);

            let (enable, compl) = masks.entry(m).or_default();
            *enable |= 1 << n;
            if ack {
                *compl |= 1 << n;
            }
        }

        for (m, (enable, compl)) in masks {
            let compl = compl | self.regs.read(RSC_DRV_CMD_WAIT_FOR_CMPL, m, 0);
            self.regs.write(RSC_DRV_CMD_WAIT_FOR_CMPL, m, 0, compl);
            let enable = enable | self.regs.read(RSC_DRV_CMD_ENABLE, m, 0);
            self.regs.write(RSC_DRV_CMD_ENABLE, m, 0, enable);
        }
    }

    /// Re-arm the AMC: clear trigger and enable, then enable and trigger
    fn trigger(&self, queue: QueueId) -> Result<(), TcsError> {
        let m = queue.0;
        let mut reg = self.regs.read(RSC_DRV_CONTROL, m, 0);
        reg &= !TCS_AMC_MODE_TRIGGER;
        self.regs.write_sync(RSC_DRV_CONTROL, m, 0, reg)?;
        reg &= !TCS_AMC_MODE_ENABLE;
        self.regs.write_sync(RSC_DRV_CONTROL, m, 0, reg)?;
        reg |= TCS_AMC_MODE_ENABLE;
        self.regs.write_sync(RSC_DRV_CONTROL, m, 0, reg)?;
        reg |= TCS_AMC_MODE_TRIGGER;
        self.regs.write_sync(RSC_DRV_CONTROL, m, 0, reg)
    }

    fn rollback(&self, queue: QueueId) {
        let m = queue.0;
        self.regs.write(RSC_DRV_CMD_ENABLE, m, 0, 0);
        self.regs.write(RSC_DRV_CMD_WAIT_FOR_CMPL, m, 0, 0);
        self.responses[m].lock().take();
        self.in_use[m].store(false, Ordering::Release);
        log::error!("{}: {} failed to trigger, request dropped", self.name, queue);
    }
}
