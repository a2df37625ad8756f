//! Completion tracking
//!
//! The interrupt handler reclaims every finished TCS and hands its response
//! to a worker thread over a bounded channel. The worker invokes the
//! callbacks in the order the interrupts reported them.

use super::regs::*;
use super::{Controller, ControllerStats};
use crate::error::TcsError;
use crate::types::{QueueId, TcsRequest, TcsType};
use crossbeam::channel::{Receiver, TrySendError};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Completion callback, invoked once per accepted request
pub type TxDone = Arc<dyn Fn(&TcsRequest, Result<(), TcsError>) + Send + Sync>;

/// An accepted request waiting for its TCS to finish
pub struct Response {
    pub queue: QueueId,
    pub request: TcsRequest,
    pub err: Result<(), TcsError>,
    on_done: TxDone,
}

impl Response {
    pub fn new(queue: QueueId, request: TcsRequest, on_done: TxDone) -> Self {
        Self {
            queue,
            request,
            err: Ok(()),
            on_done,
        }
    }

    fn deliver(self) {
        (self.on_done)(&self.request, self.err);
    }
}

pub enum TrackerMsg {
    Done(Response),
    Shutdown,
}

impl Controller {
    /// Completion interrupt: reclaim each active TCS flagged in IRQ_STATUS.
    /// Bits outside the active group are cleared and counted as stray.
    pub(super) fn tcs_irq(&self) {
        let status = self.regs.read(RSC_DRV_IRQ_STATUS, 0, 0);

        for m in (0..u32::BITS as usize).filter(|m| status & (1 << m) != 0) {
            let queue = QueueId(m);
            if self.groups.group_of(queue).map(|g| g.ty) != Some(TcsType::Active) {
                log::warn!("{}: irq for non-active {}", self.name, queue);
                self.regs.write(RSC_DRV_IRQ_CLEAR, 0, 0, queue.bit());
                ControllerStats::bump(&self.stats.stray_irqs);
                continue;
            }

            let mut resp = self.responses[m].lock().take();
            match resp.as_mut() {
                Some(resp) => {
                    if let Err(e) = self.check_cmds(queue, &resp.request) {
                        resp.err = Err(e);
                    }
                }
                None => {
                    log::warn!("{}: no response pending on {}", self.name, queue);
                    ControllerStats::bump(&self.stats.stray_irqs);
                }
            }

            // Reclaim regardless of whether anyone was waiting.
            self.regs.write(RSC_DRV_CMD_ENABLE, m, 0, 0);
            self.regs.write(RSC_DRV_CMD_WAIT_FOR_CMPL, m, 0, 0);
            self.regs.write(RSC_DRV_IRQ_CLEAR, 0, 0, queue.bit());
            self.in_use[m].store(false, Ordering::Release);

            if let Some(resp) = resp {
                ControllerStats::bump(&self.stats.completed);
                if resp.err.is_err() {
                    ControllerStats::bump(&self.stats.io_errors);
                }
                log::debug!("{}: {} done, addr={:#x}", self.name, resp.queue, resp.request.first_addr());
                self.defer(resp);
            }
        }
    }

    fn check_cmds(&self, queue: QueueId, req: &TcsRequest) -> Result<(), TcsError> {
        for (n, cmd) in req.cmds.iter().enumerate() {
            let status = self.regs.read(RSC_DRV_CMD_STATUS, queue.0, n);
            let issued = status & CMD_STATUS_ISSUED != 0;
            let acked = !req.needs_ack(cmd) || status & CMD_STATUS_COMPL != 0;
            if !issued || !acked {
                log::error!(
                    "{}: incomplete request on {}: addr={:#x} data={:#x} status={:#x}",
                    self.name,
                    queue,
                    cmd.addr,
                    cmd.data,
                    status
                );
                return Err(TcsError::HardwareIo {
                    queue,
                    cmd: n,
                    status,
                });
            }
        }
        Ok(())
    }

    fn defer(&self, resp: Response) {
        let msg = match self.tx.try_send(TrackerMsg::Done(resp)) {
            Ok(()) => return,
            Err(TrySendError::Full(msg)) => {
                log::warn!("{}: response queue full, waiting for worker", self.name);
                match self.tx.send(msg) {
                    Ok(()) => return,
                    Err(e) => e.into_inner(),
                }
            }
            Err(TrySendError::Disconnected(msg)) => msg,
        };

        // Worker is gone; deliver here so no caller is left waiting.
        if let TrackerMsg::Done(resp) = msg {
            resp.deliver();
        }
    }
}

/// Body of the completion worker thread
pub(super) fn run_worker(name: &str, rx: Receiver<TrackerMsg>) {
    log::debug!("{}: completion worker started", name);
    while let Ok(msg) = rx.recv() {
        match msg {
            TrackerMsg::Done(resp) => resp.deliver(),
            TrackerMsg::Shutdown => {
                for late in rx.try_iter() {
                    if let TrackerMsg::Done(resp) = late {
                        resp.deliver();
                    }
                }
                break;
            }
        }
    }
    log::debug!("{}: completion worker stopped", name);
}
