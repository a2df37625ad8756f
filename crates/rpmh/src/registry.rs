//! Controller registry
//!
//! Maps each channel id to its probed controller. Clients look up their
//! channel here instead of through global state.

use crate::client::RpmhClient;
use crate::config::{ChannelConfig, ClientConfig, RpmhConfig};
use crate::error::ProbeError;
use crate::hal::RegisterBus;
use crate::rsc::{Controller, ControllerBuilder};
use crate::types::ChannelId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ControllerRegistry {
    controllers: RwLock<HashMap<ChannelId, Arc<Controller>>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe every configured channel, taking each one's bus from `bus_for`
    pub fn probe_all<F>(config: &RpmhConfig, mut bus_for: F) -> Result<Self, ProbeError>
    where
        F: FnMut(&ChannelConfig) -> Arc<dyn RegisterBus>,
    {
        let registry = Self::new();
        for channel in &config.channels {
            let ctrl = ControllerBuilder::new(channel.clone())
                .with_bus(bus_for(channel))
                .build()?;
            registry.register(ctrl)?;
        }
        Ok(registry)
    }

    pub fn register(&self, ctrl: Controller) -> Result<Arc<Controller>, ProbeError> {
        let mut controllers = self.controllers.write();
        let id = ctrl.id();
        if controllers.contains_key(&id) {
            return Err(ProbeError::DuplicateChannel(id));
        }
        let ctrl = Arc::new(ctrl);
        controllers.insert(id, Arc::clone(&ctrl));
        log::debug!("registered {} as {}", ctrl.name(), id);
        Ok(ctrl)
    }

    pub fn get(&self, id: ChannelId) -> Option<Arc<Controller>> {
        self.controllers.read().get(&id).cloned()
    }

    pub fn remove(&self, id: ChannelId) -> Option<Arc<Controller>> {
        self.controllers.write().remove(&id)
    }

    /// Registered channel ids in ascending order
    pub fn ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.controllers.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.controllers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.read().is_empty()
    }

    pub fn client(&self, id: ChannelId, config: ClientConfig) -> Option<RpmhClient> {
        self.get(id).map(|ctrl| RpmhClient::new(ctrl, config))
    }

    /// Stop every controller's completion worker
    pub fn shutdown(&self) {
        for ctrl in self.controllers.read().values() {
            ctrl.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimRsc;

    const TWO_CHANNELS: &str = r#"
[[channel]]
name = "apps_rsc"
drv_id = 2
tcs = [
  { type = "active", count = 2 },
  { type = "sleep", count = 1 },
  { type = "wake", count = 1 },
  { type = "control", count = 0 },
]

[[channel]]
name = "disp_rsc"
drv_id = 0
tcs = [
  { type = "active", count = 1 },
  { type = "sleep", count = 1 },
  { type = "wake", count = 1 },
  { type = "control", count = 0 },
]
"#;

    fn sim_bus(channel: &ChannelConfig) -> Arc<dyn RegisterBus> {
        Arc::new(SimRsc::new(
            channel.drv_id,
            channel.pooled_tcs(),
            16,
            channel.tcs_offset,
        ))
    }

    #[test]
    fn probes_and_looks_up_channels() {
        let config = RpmhConfig::from_toml_str(TWO_CHANNELS).unwrap();
        let registry = ControllerRegistry::probe_all(&config, sim_bus).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec![ChannelId(0), ChannelId(2)]);
        assert_eq!(registry.get(ChannelId(0)).unwrap().name(), "disp_rsc");
        assert!(registry.client(ChannelId(2), ClientConfig::default()).is_some());
        assert!(registry.client(ChannelId(1), ClientConfig::default()).is_none());

        let removed = registry.remove(ChannelId(2)).unwrap();
        assert_eq!(removed.num_tcs(), 4);
        assert_eq!(registry.len(), 1);
        registry.shutdown();
    }

    #[test]
    fn rejects_duplicate_channel() {
        let mut config = RpmhConfig::from_toml_str(TWO_CHANNELS).unwrap();
        config.channels[1].drv_id = 2;
        let err = ControllerRegistry::probe_all(&config, sim_bus).err();
        assert!(matches!(err, Some(ProbeError::DuplicateChannel(ChannelId(2)))));
    }
}
