mod common;

use common::{init_logging, Rig};
use rayos_rpmh::hal::cpu::IrqContext;
use rayos_rpmh::hal::sim::CmdOutcome;
use rayos_rpmh::hal::IrqHandler;
use rayos_rpmh::types::MAX_REQ_IN_BATCH;
use rayos_rpmh::{QueueId, RpmhState, TcsCmd, TcsError, TcsType};
use std::time::{Duration, Instant};

fn settle(rig: &Rig, completed: u64) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if rig.ctrl.is_idle() && rig.ctrl.stats().completed == completed {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn active_batch_waits_for_every_request() {
    init_logging();
    let rig = Rig::new(2, 1, 1, 2000);
    let _hw = rig.respond(CmdOutcome::Completed);

    let a = [TcsCmd::new(0x30000, 1)];
    let b = [TcsCmd::new(0x30010, 2), TcsCmd::new(0x30014, 2)];
    let c = [TcsCmd::new(0x30000, 3)];
    assert_eq!(rig.client.write_batch(RpmhState::ActiveOnly, &[&a, &b, &c]), Ok(()));

    let stats = rig.ctrl.stats();
    assert_eq!(stats.triggered, 3);
    assert_eq!(stats.completed, 3);
    assert!(rig.ctrl.is_idle());
}

#[test]
fn batch_reports_the_first_failure() {
    init_logging();
    let rig = Rig::new(2, 1, 1, 2000);
    let _hw = rig.respond(CmdOutcome::NotIssued);

    let a = [TcsCmd::new(0x30000, 1)];
    let b = [TcsCmd::new(0x30010, 2)];
    let result = rig.client.write_batch(RpmhState::ActiveOnly, &[&a, &b]);
    assert!(matches!(result, Err(TcsError::HardwareIo { cmd: 0, status: 0, .. })));
    assert!(settle(&rig, 2));
}

#[test]
fn undispatched_requests_are_failed_in_place() {
    init_logging();
    let rig = Rig::new(1, 1, 1, 50);
    rig.sim.set_idle(QueueId(0), false);

    let a = [TcsCmd::new(0x30000, 1)];
    let b = [TcsCmd::new(0x30010, 2)];
    let started = Instant::now();
    let result = rig.client.write_batch(RpmhState::ActiveOnly, &[&a, &b]);

    assert_eq!(result, Err(TcsError::Timeout));
    // Fails once the dispatch deadline passes instead of waiting out a
    // second timeout for completions that cannot come.
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(rig.ctrl.stats().triggered, 0);
}

#[test]
fn batch_limits() {
    init_logging();
    let rig = Rig::new(1, 1, 1, 1000);
    assert!(matches!(
        rig.client.write_batch(RpmhState::ActiveOnly, &[]),
        Err(TcsError::InvalidRequest(_))
    ));

    let cmd = [TcsCmd::new(0x30000, 1)];
    let too_many: Vec<&[TcsCmd]> = (0..=MAX_REQ_IN_BATCH).map(|_| &cmd[..]).collect();
    assert!(matches!(
        rig.client.write_batch(RpmhState::ActiveOnly, &too_many),
        Err(TcsError::InvalidRequest(_))
    ));

    let empty: [TcsCmd; 0] = [];
    assert!(matches!(
        rig.client.write_batch(RpmhState::Sleep, &[&cmd, &empty]),
        Err(TcsError::InvalidRequest(_))
    ));
    assert_eq!(rig.ctrl.slots_in_use(TcsType::Sleep), 0);
}

#[test]
fn sleep_batch_is_cached() {
    init_logging();
    let rig = Rig::new(1, 1, 1, 1000);
    let a = [TcsCmd::new(0x500, 0)];
    let b = [TcsCmd::new(0x510, 0), TcsCmd::new(0x514, 0)];
    assert_eq!(rig.client.write_batch(RpmhState::Sleep, &[&a, &b]), Ok(()));
    assert_eq!(rig.ctrl.slots_in_use(TcsType::Sleep), 3);
    assert!(rig.sim.take_triggered().is_empty());
}

#[test]
fn async_write_returns_before_completion() {
    init_logging();
    let rig = Rig::new(1, 1, 1, 1000);

    let cmds = [TcsCmd::new(0x30000, 1)];
    assert_eq!(rig.client.write_async(RpmhState::ActiveOnly, &cmds), Ok(()));
    assert!(rig.ctrl.queue_in_use(QueueId(0)));
    assert_eq!(rig.sim.take_triggered(), vec![QueueId(0)]);

    rig.sim.complete(QueueId(0), CmdOutcome::Completed);
    {
        let _irq = IrqContext::enter();
        rig.ctrl.handle_irq();
    }
    assert!(settle(&rig, 1));
}

#[test]
fn async_write_allowed_with_irqs_disabled() {
    init_logging();
    let rig = Rig::new(1, 1, 1, 1000);
    let _hw = rig.respond(CmdOutcome::Completed);

    let _irq = IrqContext::enter();
    for i in 0..4 {
        let cmds = [TcsCmd::new(0x30000, i)];
        assert_eq!(rig.client.write_async(RpmhState::ActiveOnly, &cmds), Ok(()));
    }
    assert!(settle(&rig, 4));
}
