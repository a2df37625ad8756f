//! RayOS RPMh driver
//!
//! Kernel subsystems vote for resource state (clocks, regulators, power
//! domains) by writing commands into the RSC's Trigger Command Sets. Active
//! votes are triggered immediately and complete through an interrupt;
//! Sleep and Wake votes are cached in hardware until the next power
//! transition.
//!
//! ```no_run
//! use rayos_rpmh::{ControllerRegistry, RpmhConfig, RpmhState, TcsCmd};
//! # fn bus(_: &rayos_rpmh::config::ChannelConfig) -> std::sync::Arc<dyn rayos_rpmh::hal::RegisterBus> { unimplemented!() }
//!
//! let config = RpmhConfig::default();
//! let registry = ControllerRegistry::probe_all(&config, bus).unwrap();
//! let client = registry
//!     .client(config.channels[0].channel_id(), config.client.clone())
//!     .unwrap();
//! client
//!     .write(RpmhState::ActiveOnly, &[TcsCmd::new(0x30000, 1)])
//!     .unwrap();
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod hal;
pub mod registry;
pub mod rsc;
pub mod types;

pub use client::{Completion, RpmhClient};
pub use config::RpmhConfig;
pub use error::{ProbeError, TcsError};
pub use registry::ControllerRegistry;
pub use rsc::{Controller, ControllerBuilder, StatsSnapshot};
pub use types::{ChannelId, QueueId, RpmhState, TcsCmd, TcsRequest, TcsType};
