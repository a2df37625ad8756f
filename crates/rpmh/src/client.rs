//! Client API for RPMh votes
//!
//! Active writes block until the coprocessor acknowledges them. Sleep and
//! Wake writes only update the controller's cache and return at once.

use crate::config::ClientConfig;
use crate::error::TcsError;
use crate::hal::cpu::irqs_disabled;
use crate::rsc::tracker::TxDone;
use crate::rsc::Controller;
use crate::types::{QueueId, RpmhState, TcsCmd, TcsRequest, MAX_REQ_IN_BATCH, MAX_RPMH_PAYLOAD};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Waitable handle signalled after a fixed number of transfer completions.
///
/// The first failure reported is kept and returned to the waiter.
pub struct Completion {
    remaining: AtomicUsize,
    state: Mutex<CompletionState>,
    cond: Condvar,
}

struct CompletionState {
    done: bool,
    error: Option<TcsError>,
}

impl Completion {
    pub fn new(waiters: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(waiters),
            state: Mutex::new(CompletionState {
                done: waiters == 0,
                error: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn complete_one(&self, result: Result<(), TcsError>) {
        if let Err(e) = result {
            self.state.lock().error.get_or_insert(e);
        }

        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => {
                self.state.lock().done = true;
                self.cond.notify_all();
            }
            Ok(_) => {}
            Err(_) => log::warn!("completion signalled more often than expected"),
        }
    }

    /// Block until every waiter completed or `deadline` passes
    pub fn wait_until(&self, deadline: Instant) -> Result<(), TcsError> {
        let mut state = self.state.lock();
        while !state.done {
            if self.cond.wait_until(&mut state, deadline).timed_out() && !state.done {
                return Err(TcsError::Timeout);
            }
        }
        match &state.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Callback feeding transfer results into a [`Completion`]
fn notifier(compl: &Arc<Completion>) -> TxDone {
    let compl = Arc::clone(compl);
    Arc::new(move |req: &TcsRequest, result: Result<(), TcsError>| {
        if let Err(e) = &result {
            log::error!("RPMH TX fail in msg addr={:#x}: {}", req.first_addr(), e);
        }
        compl.complete_one(result);
    })
}

/// Fire-and-forget callback; failures are only logged
fn log_failure() -> TxDone {
    Arc::new(|req: &TcsRequest, result: Result<(), TcsError>| {
        if let Err(e) = result {
            log::error!("RPMH async TX fail in msg addr={:#x}: {}", req.first_addr(), e);
        }
    })
}

/// Handle through which a subsystem votes on one RSC channel
#[derive(Clone)]
pub struct RpmhClient {
    ctrlr: Arc<Controller>,
    config: ClientConfig,
}

impl RpmhClient {
    pub fn new(ctrlr: Arc<Controller>, config: ClientConfig) -> Self {
        Self { ctrlr, config }
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.ctrlr
    }

    /// Write `cmds` for `state`, every command acknowledged.
    ///
    /// Active requests retry a busy group for up to the client timeout, then
    /// wait up to the client timeout again for completion. They may not be
    /// issued with interrupts disabled.
    pub fn write(&self, state: RpmhState, cmds: &[TcsCmd]) -> Result<(), TcsError> {
        let req = build_request(state, cmds)?.with_completion(true);
        if !state.is_active() {
            return self.ctrlr.write_ctrl_data(&req).map(|_| ());
        }
        if irqs_disabled() {
            return Err(TcsError::AtomicContext);
        }

        let compl = Completion::new(1);
        self.send_with_retry(&req, &notifier(&compl), Instant::now() + self.config.timeout())?;
        let result = compl.wait_until(Instant::now() + self.config.timeout());
        if result == Err(TcsError::Timeout) {
            log::error!(
                "{}: timed out waiting for addr={:#x}",
                self.ctrlr.name(),
                req.first_addr()
            );
        }
        result
    }

    /// Write `cmds` for `state` without waiting for the coprocessor.
    ///
    /// Usable with interrupts disabled; busy retries then spin.
    pub fn write_async(&self, state: RpmhState, cmds: &[TcsCmd]) -> Result<(), TcsError> {
        let req = build_request(state, cmds)?;
        if !state.is_active() {
            return self.ctrlr.write_ctrl_data(&req).map(|_| ());
        }
        let deadline = Instant::now() + self.config.timeout();
        self.send_with_retry(&req, &log_failure(), deadline).map(|_| ())
    }

    /// Write several requests for `state` and wait for all of them.
    ///
    /// Requests are dispatched in order. If one cannot be dispatched, it and
    /// every later request count as failed with that error.
    pub fn write_batch(&self, state: RpmhState, batch: &[&[TcsCmd]]) -> Result<(), TcsError> {
        if batch.is_empty() {
            return Err(TcsError::InvalidRequest("empty batch"));
        }
        if batch.len() > MAX_REQ_IN_BATCH {
            return Err(TcsError::InvalidRequest("too many requests in batch"));
        }
        let reqs = batch
            .iter()
            .map(|cmds| build_request(state, cmds))
            .collect::<Result<Vec<_>, _>>()?;

        if !state.is_active() {
            for req in &reqs {
                self.ctrlr.write_ctrl_data(req)?;
            }
            return Ok(());
        }
        if irqs_disabled() {
            return Err(TcsError::AtomicContext);
        }

        let compl = Completion::new(reqs.len());
        let on_done = notifier(&compl);
        for (i, req) in reqs.iter().enumerate() {
            let retry_until = Instant::now() + self.config.timeout();
            if let Err(e) = self.send_with_retry(req, &on_done, retry_until) {
                log::error!(
                    "{}: batch request {} failed to dispatch: {}",
                    self.ctrlr.name(),
                    i,
                    e
                );
                // Stand in for the completions that will never arrive.
                for unsent in &reqs[i..] {
                    on_done(unsent, Err(e.clone()));
                }
                break;
            }
        }
        compl.wait_until(Instant::now() + self.config.timeout())
    }

    /// Clear every cached Sleep and Wake vote on the channel
    pub fn invalidate(&self) -> Result<(), TcsError> {
        self.ctrlr.invalidate()
    }

    /// Dispatch, retrying while the active group is busy until `deadline`
    fn send_with_retry(
        &self,
        req: &TcsRequest,
        on_done: &TxDone,
        deadline: Instant,
    ) -> Result<QueueId, TcsError> {
        let mut retries = 0u64;
        loop {
            match self.ctrlr.try_send_data(req, on_done) {
                Err(TcsError::Busy) => {
                    if Instant::now() >= deadline {
                        log::error!(
                            "{}: no TCS freed for addr={:#x} after {} retries",
                            self.ctrlr.name(),
                            req.first_addr(),
                            retries
                        );
                        return Err(TcsError::Timeout);
                    }
                    if retries == 0 {
                        log::warn!(
                            "{}: TCS busy, retrying addr={:#x}",
                            self.ctrlr.name(),
                            req.first_addr()
                        );
                    }
                    retries += 1;
                    self.pause();
                }
                other => return other,
            }
        }
    }

    fn pause(&self) {
        let delay = self.config.busy_retry_delay();
        if irqs_disabled() {
            let until = Instant::now() + delay;
            while Instant::now() < until {
                std::hint::spin_loop();
            }
        } else {
            std::thread::sleep(delay);
        }
    }
}

fn build_request(state: RpmhState, cmds: &[TcsCmd]) -> Result<TcsRequest, TcsError> {
    if cmds.is_empty() {
        return Err(TcsError::InvalidRequest("empty request"));
    }
    if cmds.len() > MAX_RPMH_PAYLOAD {
        return Err(TcsError::InvalidRequest("too many commands"));
    }
    Ok(TcsRequest::new(state, cmds.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn completion_counts_down_and_keeps_first_error() {
        let compl = Completion::new(3);
        compl.complete_one(Ok(()));
        compl.complete_one(Err(TcsError::Busy));
        assert_eq!(compl.remaining(), 1);

        let waiter = {
            let compl = Arc::clone(&compl);
            std::thread::spawn(move || compl.wait_until(Instant::now() + Duration::from_secs(5)))
        };
        compl.complete_one(Err(TcsError::Timeout));
        assert_eq!(waiter.join().unwrap(), Err(TcsError::Busy));

        // Extra signals are ignored.
        compl.complete_one(Ok(()));
        assert_eq!(compl.remaining(), 0);
    }

    #[test]
    fn completion_times_out() {
        let compl = Completion::new(1);
        let started = Instant::now();
        let result = compl.wait_until(started + Duration::from_millis(20));
        assert_eq!(result, Err(TcsError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(Completion::new(0).wait_until(Instant::now()).is_ok());
    }

    #[test]
    fn request_validation() {
        assert!(matches!(
            build_request(RpmhState::ActiveOnly, &[]),
            Err(TcsError::InvalidRequest(_))
        ));
        let many: Vec<_> = (0..17).map(|i| TcsCmd::new(i * 4, i)).collect();
        assert!(matches!(
            build_request(RpmhState::Sleep, &many),
            Err(TcsError::InvalidRequest(_))
        ));
        let req = build_request(RpmhState::WakeOnly, &many[..16]).unwrap();
        assert_eq!(req.cmds.len(), 16);
        assert!(!req.wait_for_compl);
    }
}
