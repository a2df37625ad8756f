#![allow(dead_code)]

use rayos_rpmh::config::{ChannelConfig, ClientConfig, GroupConfig};
use rayos_rpmh::hal::sim::{CmdOutcome, Responder, SimRsc};
use rayos_rpmh::hal::IrqHandler;
use rayos_rpmh::{Controller, ControllerBuilder, RpmhClient, TcsType};
use std::sync::Arc;

pub const DRV_ID: u32 = 2;
pub const TCS_OFFSET: usize = 0xd00;

pub struct Rig {
    pub sim: Arc<SimRsc>,
    pub ctrl: Arc<Controller>,
    pub client: RpmhClient,
}

impl Rig {
    /// Channel with `(active, sleep, wake)` TCSes and no control block
    pub fn new(active: usize, sleep: usize, wake: usize, timeout_ms: u64) -> Self {
        Self::with_ncpt(active, sleep, wake, 16, timeout_ms)
    }

    pub fn with_ncpt(active: usize, sleep: usize, wake: usize, ncpt: usize, timeout_ms: u64) -> Self {
        let num_tcs = active + sleep + wake;
        let sim = Arc::new(SimRsc::new(DRV_ID, num_tcs, ncpt, TCS_OFFSET));
        let mut channel = ChannelConfig::new(
            "test_rsc",
            DRV_ID,
            vec![
                GroupConfig::new(TcsType::Active, active),
                GroupConfig::new(TcsType::Sleep, sleep),
                GroupConfig::new(TcsType::Wake, wake),
                GroupConfig::new(TcsType::Control, 0),
            ],
        );
        channel.tcs_offset = TCS_OFFSET;

        let ctrl = Arc::new(
            ControllerBuilder::new(channel)
                .with_bus(sim.clone())
                .with_sync_write_poll_limit(16)
                .build()
                .expect("probe"),
        );
        let client = RpmhClient::new(
            Arc::clone(&ctrl),
            ClientConfig {
                timeout_ms,
                busy_retry_delay_us: 10,
            },
        );
        Self { sim, ctrl, client }
    }

    pub fn respond(&self, outcome: CmdOutcome) -> Responder {
        let handler: Arc<dyn IrqHandler> = self.ctrl.clone();
        self.sim.spawn_responder(handler, outcome)
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
