//! Core types for the RPMh driver
//!
//! These are the structures that flow between clients, the RSC scheduler and
//! the completion path.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of commands a client may place in one request
pub const MAX_RPMH_PAYLOAD: usize = 16;

/// Hardware upper bound on command slots per TCS
pub const MAX_CMDS_PER_TCS: usize = 16;

/// Hard cap on TCSes of a single type
pub const MAX_TCS_PER_TYPE: usize = 3;

/// Maximum number of requests in one batch write
pub const MAX_REQ_IN_BATCH: usize = 10;

/// Power state a request applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpmhState {
    /// Applied immediately, completion is reported
    ActiveOnly,
    /// Latched by the coprocessor on the next wake transition
    WakeOnly,
    /// Latched by the coprocessor on the next sleep transition
    Sleep,
}

impl RpmhState {
    pub fn is_active(self) -> bool {
        matches!(self, RpmhState::ActiveOnly)
    }
}

/// TCS group types
///
/// The discriminant is the group's position in the controller's group table.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TcsType {
    /// Triggered on demand, completion via interrupt
    Active = 0,
    /// Shadow copy applied on sleep entry
    Sleep = 1,
    /// Shadow copy applied on wake
    Wake = 2,
    /// Separate control block, never dispatched to
    Control = 3,
}

impl TcsType {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }

    /// Group that serves requests for `state`
    pub fn for_state(state: RpmhState) -> TcsType {
        match state {
            RpmhState::ActiveOnly => TcsType::Active,
            RpmhState::WakeOnly => TcsType::Wake,
            RpmhState::Sleep => TcsType::Sleep,
        }
    }

    /// Sleep and Wake groups keep a slot cache instead of being triggered
    pub fn is_cached(self) -> bool {
        matches!(self, TcsType::Sleep | TcsType::Wake)
    }
}

impl fmt::Display for TcsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcsType::Active => "active",
            TcsType::Sleep => "sleep",
            TcsType::Wake => "wake",
            TcsType::Control => "control",
        };
        f.write_str(name)
    }
}

/// A single resource vote: write `data` to the coprocessor address `addr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcsCmd {
    pub addr: u32,
    pub data: u32,
    /// Wait for the coprocessor to acknowledge this command
    pub wait: bool,
}

impl TcsCmd {
    pub fn new(addr: u32, data: u32) -> Self {
        Self {
            addr,
            data,
            wait: false,
        }
    }

    pub fn with_ack(addr: u32, data: u32) -> Self {
        Self {
            addr,
            data,
            wait: true,
        }
    }
}

/// A request as submitted to the RSC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcsRequest {
    pub state: RpmhState,
    /// Every command in the request needs an acknowledgment
    pub wait_for_compl: bool,
    pub cmds: Vec<TcsCmd>,
}

impl TcsRequest {
    pub fn new(state: RpmhState, cmds: Vec<TcsCmd>) -> Self {
        Self {
            state,
            wait_for_compl: false,
            cmds,
        }
    }

    pub fn with_completion(mut self, wait: bool) -> Self {
        self.wait_for_compl = wait;
        self
    }

    /// Address of the first command, used to identify the request in logs
    pub fn first_addr(&self) -> u32 {
        self.cmds.first().map(|c| c.addr).unwrap_or(0)
    }

    /// Whether `cmd` must report completion before the request is done
    pub fn needs_ack(&self, cmd: &TcsCmd) -> bool {
        self.wait_for_compl || cmd.wait
    }

    pub fn addrs(&self) -> Vec<u32> {
        self.cmds.iter().map(|c| c.addr).collect()
    }
}

/// Absolute TCS index within one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub usize);

impl QueueId {
    pub fn bit(self) -> u32 {
        1u32 << self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcs{}", self.0)
    }
}

/// Hardware channel key (the DRV id of the RSC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "drv{}", self.0)
    }
}
