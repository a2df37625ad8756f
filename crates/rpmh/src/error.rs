//! Error types for the RSC driver and its clients.

use crate::types::{ChannelId, QueueId, TcsType};
use std::path::PathBuf;
use thiserror::Error;

// Collaborators receive plain errno values.
pub const EIO: i32 = 5;
pub const ENOMEM: i32 = 12;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const ETIMEDOUT: i32 = 110;

/// Failure of a single request. Never affects other requests on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TcsError {
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// No free TCS, or a command address is already in flight
    #[error("TCS busy")]
    Busy,

    #[error("{queue} command {cmd} not acknowledged (status {status:#x})")]
    HardwareIo {
        queue: QueueId,
        cmd: usize,
        status: u32,
    },

    #[error("register {offset:#x} did not latch {expected:#x} after {polls} polls")]
    RegisterLatch {
        offset: usize,
        expected: u32,
        polls: u32,
    },

    #[error("timed out waiting for TCS completion")]
    Timeout,

    #[error("no free slots left in the {0} group")]
    OutOfCapacity(TcsType),

    #[error("blocking RPMh write with interrupts disabled")]
    AtomicContext,
}

impl TcsError {
    /// Negative errno delivered to collaborators
    pub fn errno(&self) -> i32 {
        match self {
            TcsError::InvalidRequest(_) | TcsError::AtomicContext => -EINVAL,
            TcsError::Busy => -EBUSY,
            TcsError::HardwareIo { .. } | TcsError::RegisterLatch { .. } => -EIO,
            TcsError::Timeout => -ETIMEDOUT,
            TcsError::OutOfCapacity(_) => -ENOMEM,
        }
    }
}

/// Collapse a transfer result into the collaborator-facing error code
pub fn errno_of(result: &Result<(), TcsError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.errno(),
    }
}

/// Controller bring-up failures
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{ty} group lists {count} TCSes, at most {max} allowed")]
    CountAboveCap { ty: TcsType, count: usize, max: usize },

    #[error("{0} group configured more than once")]
    DuplicateType(TcsType),

    #[error("{0} group missing from TCS configuration")]
    MissingType(TcsType),

    #[error("TCS configuration needs {requested} queues, hardware provides {available}")]
    TooManyQueues { requested: usize, available: usize },

    #[error("invalid channel geometry: {0}")]
    Geometry(String),

    #[error("no register bus supplied for channel {0}")]
    MissingBus(String),

    #[error("channel {0} already registered")]
    DuplicateChannel(ChannelId),

    #[error("failed to spawn completion worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("channel {name}: drv_id {drv_id} above {max}")]
    DrvId { name: String, drv_id: u32, max: u32 },
}
