//! Channel and client configuration
//!
//! Values arrive already resolved (from the device tree on hardware) and are
//! loaded from TOML:
//!
//! ```toml
//! [client]
//! timeout_ms = 10000
//!
//! [[channel]]
//! name = "apps_rsc"
//! drv_id = 2
//! tcs_offset = 0xd00
//! tcs = [
//!   { type = "active", count = 2 },
//!   { type = "sleep", count = 3 },
//!   { type = "wake", count = 3 },
//!   { type = "control", count = 1 },
//! ]
//! ```

use crate::error::ConfigError;
use crate::rsc::regs::MAX_DRV_ID;
use crate::types::{ChannelId, TcsType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration: client policy plus every RSC channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpmhConfig {
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default, rename = "channel")]
    pub channels: Vec<ChannelConfig>,
}

impl RpmhConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject DRV ids whose TCS count field would not fit the config register
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.channels.iter().find(|c| c.drv_id > MAX_DRV_ID) {
            Some(c) => Err(ConfigError::DrvId {
                name: c.name.clone(),
                drv_id: c.drv_id,
                max: MAX_DRV_ID,
            }),
            None => Ok(()),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }
}

impl Default for RpmhConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            channels: vec![ChannelConfig::default()],
        }
    }
}

/// Blocking client policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bound on busy retries, and separately on the wait after dispatch
    pub timeout_ms: u64,
    /// Pause between attempts while every active TCS is busy
    pub busy_retry_delay_us: u64,
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn busy_retry_delay(&self) -> Duration {
        Duration::from_micros(self.busy_retry_delay_us)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            busy_retry_delay_us: 10,
        }
    }
}

/// One `(type, count)` entry of the TCS table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(rename = "type")]
    pub ty: TcsType,
    pub count: usize,
}

impl GroupConfig {
    pub fn new(ty: TcsType, count: usize) -> Self {
        Self { ty, count }
    }
}

/// One RSC channel (DRV) and its TCS partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub drv_id: u32,

    /// Byte offset of the TCS register block from the channel base
    #[serde(default = "default_tcs_offset")]
    pub tcs_offset: usize,

    /// Interrupt line reporting TCS completions
    #[serde(default)]
    pub irq: u32,

    /// Depth of the channel between the interrupt handler and the worker
    #[serde(default = "default_response_queue_depth")]
    pub response_queue_depth: usize,

    /// Read-back attempts before a synchronous register write gives up
    #[serde(default = "default_sync_write_poll_limit")]
    pub sync_write_poll_limit: u32,

    pub tcs: Vec<GroupConfig>,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, drv_id: u32, tcs: Vec<GroupConfig>) -> Self {
        Self {
            name: name.into(),
            drv_id,
            tcs_offset: default_tcs_offset(),
            irq: 0,
            response_queue_depth: default_response_queue_depth(),
            sync_write_poll_limit: default_sync_write_poll_limit(),
            tcs,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        ChannelId(self.drv_id)
    }

    /// TCSes drawn from the channel's pool (control blocks excluded)
    pub fn pooled_tcs(&self) -> usize {
        self.tcs
            .iter()
            .filter(|g| g.ty != TcsType::Control)
            .map(|g| g.count)
            .sum()
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new(
            "apps_rsc",
            2,
            vec![
                GroupConfig::new(TcsType::Active, 2),
                GroupConfig::new(TcsType::Sleep, 3),
                GroupConfig::new(TcsType::Wake, 3),
                GroupConfig::new(TcsType::Control, 1),
            ],
        )
    }
}

fn default_tcs_offset() -> usize {
    0xd00
}

fn default_response_queue_depth() -> usize {
    64
}

fn default_sync_write_poll_limit() -> u32 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[client]
timeout_ms = 250

[[channel]]
name = "apps_rsc"
drv_id = 2
tcs_offset = 0xd00
irq = 5
tcs = [
  { type = "active", count = 2 },
  { type = "sleep", count = 3 },
  { type = "wake", count = 3 },
  { type = "control", count = 0 },
]

[[channel]]
name = "disp_rsc"
drv_id = 0
tcs = [
  { type = "active", count = 0 },
  { type = "sleep", count = 1 },
  { type = "wake", count = 1 },
  { type = "control", count = 0 },
]
"#;

    #[test]
    fn parses_channels_and_defaults() {
        let config = RpmhConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.client.timeout(), Duration::from_millis(250));
        assert_eq!(config.client.busy_retry_delay(), Duration::from_micros(10));
        assert_eq!(config.channels.len(), 2);

        let apps = &config.channels[0];
        assert_eq!(apps.channel_id(), ChannelId(2));
        assert_eq!(apps.tcs_offset, 0xd00);
        assert_eq!(apps.irq, 5);
        assert_eq!(apps.tcs[1], GroupConfig::new(TcsType::Sleep, 3));
        assert_eq!(apps.pooled_tcs(), 8);

        let disp = &config.channels[1];
        assert_eq!(disp.response_queue_depth, 64);
        assert_eq!(disp.sync_write_poll_limit, 1000);
    }

    #[test]
    fn rejects_unknown_group_type() {
        let bad = r#"
[[channel]]
name = "x"
drv_id = 0
tcs = [{ type = "turbo", count = 1 }]
"#;
        assert!(matches!(
            RpmhConfig::from_toml_str(bad),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rejects_drv_id_past_the_config_register() {
        let bad = r#"
[[channel]]
name = "far_rsc"
drv_id = 6
tcs = [{ type = "active", count = 1 }]
"#;
        assert!(matches!(
            RpmhConfig::from_toml_str(bad),
            Err(ConfigError::DrvId { drv_id: 6, max: 3, .. })
        ));
        assert!(RpmhConfig::default().validate().is_ok());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpmh.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = RpmhConfig::load(&path).unwrap();
        assert_eq!(config.channels[1].name, "disp_rsc");

        let missing = RpmhConfig::load(dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
