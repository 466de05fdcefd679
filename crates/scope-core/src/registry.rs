//! Device registry for runtime digitizer management.
//!
//! Central hub that maps TOML config sections to driver instances:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    DeviceRegistry                       │
//! │  factories: HashMap<driver_type, Box<dyn DriverFactory>>│
//! │  devices:   HashMap<device_id, Arc<dyn DigitizerDriver>>│
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Factories are registered once at startup; devices are opened, looked up
//! and closed by id. The registry never configures or arms a device, that is
//! the acquisition engine's job.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut registry = DeviceRegistry::new();
//! registry.register_factory(Box::new(SimDigitizerFactory));
//!
//! let driver = registry.open("scope0", "sim", config).await?;
//! driver.initialize().await?;
//! ```

use crate::driver::{DigitizerDriver, DriverFactory};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Registry of driver factories and open devices.
///
/// Lookups go through a `parking_lot::Mutex`; it is never held across an
/// await point, `open` builds the driver first and inserts afterwards.
#[derive(Default)]
pub struct DeviceRegistry {
    factories: HashMap<&'static str, Box<dyn DriverFactory>>,
    devices: Mutex<HashMap<String, Arc<dyn DigitizerDriver>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver factory. Later registrations for the same
    /// `driver_type` replace earlier ones.
    pub fn register_factory(&mut self, factory: Box<dyn DriverFactory>) {
        info!(
            driver_type = factory.driver_type(),
            name = factory.name(),
            "registering driver factory"
        );
        self.factories.insert(factory.driver_type(), factory);
    }

    /// Driver types currently registered, for diagnostics.
    pub fn driver_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Validate config and build a driver, storing it under `device_id`.
    ///
    /// Fails if the id is already taken or no factory handles `driver_type`.
    pub async fn open(
        &self,
        device_id: &str,
        driver_type: &str,
        config: toml::Value,
    ) -> Result<Arc<dyn DigitizerDriver>> {
        if self.devices.lock().contains_key(device_id) {
            return Err(anyhow!("device id '{device_id}' is already registered"));
        }

        let factory = self.factories.get(driver_type).ok_or_else(|| {
            anyhow!(
                "unknown driver type '{}', registered types: {:?}",
                driver_type,
                self.driver_types()
            )
        })?;

        factory.validate(&config)?;
        let driver = factory.build(config).await?;

        let mut devices = self.devices.lock();
        if devices.contains_key(device_id) {
            return Err(anyhow!("device id '{device_id}' is already registered"));
        }
        devices.insert(device_id.to_string(), driver.clone());
        info!(device_id, driver_type, "device opened");
        Ok(driver)
    }

    /// Look up an open device by id.
    pub fn get(&self, device_id: &str) -> Option<Arc<dyn DigitizerDriver>> {
        self.devices.lock().get(device_id).cloned()
    }

    /// Ids of all open devices, sorted.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.devices.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close one device and remove it from the registry.
    pub async fn close(&self, device_id: &str) -> Result<()> {
        let driver = self
            .devices
            .lock()
            .remove(device_id)
            .ok_or_else(|| anyhow!("device id '{device_id}' is not registered"))?;
        driver.close().await?;
        info!(device_id, "device closed");
        Ok(())
    }

    /// Close every open device. Errors are collected, not short-circuited,
    /// so one stuck device cannot keep the others open.
    pub async fn close_all(&self) -> Result<()> {
        let drained: Vec<_> = self.devices.lock().drain().collect();
        let mut failures = Vec::new();
        for (id, driver) in drained {
            if let Err(e) = driver.close().await {
                failures.push(format!("{id}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("failed to close devices: {}", failures.join(", ")))
        }
    }
}
