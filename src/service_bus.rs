use crate::meter_instance::{MeterIdentity, MeterInstance, MeterPath, Value};
use anyhow::{bail, Result};
use std::collections::BTreeMap;
use tracing::info;

const SERVICE_PREFIX: &str = "com.victronenergy.pvinverter";

/// Service name of the serially polled meter.
pub fn serial_service_name(device_instance: u32) -> String {
    format!("{SERVICE_PREFIX}.sdm120_pv_{device_instance}")
}

/// Service name of the message-fed meter.
pub fn mqtt_service_name(device_instance: u32) -> String {
    format!("{SERVICE_PREFIX}.mqtt_pv_{device_instance}")
}

/// The published object tree: every meter instance under its service name.
#[derive(Default)]
pub struct ServiceBus {
    services: BTreeMap<String, MeterInstance>,
}

impl ServiceBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a meter instance. Names and device instances are unique.
    pub fn register(&mut self, name: String, identity: &MeterIdentity) -> Result<MeterInstance> {
        if self.services.contains_key(&name) {
            bail!("service {} is already registered", name);
        }
        let device_instance = Value::Int(identity.device_instance.into());
        let taken = self
            .services
            .values()
            .any(|existing| existing.read(MeterPath::DeviceInstance) == device_instance);
        if taken {
            bail!(
                "device instance {} is already used by another service",
                identity.device_instance
            );
        }

        info!("{} /DeviceInstance = {}", name, identity.device_instance);
        let instance = MeterInstance::new(name.clone(), identity);
        self.services.insert(name, instance.clone());
        Ok(instance)
    }

    pub fn get(&self, name: &str) -> Option<&MeterInstance> {
        self.services.get(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &MeterInstance> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
