use log::info;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::db::{DatabaseService, StoreError};
use crate::models::Device;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device imei must not be empty")]
    EmptyImei,
    #[error("device {0} already exists")]
    DuplicateDevice(String),
    #[error("device {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// In-memory mirror of the persisted device table. Every routing decision
/// consults it; mutations write through to the store before touching the
/// mirror, so a crash mid-write never leaves the mirror ahead of durable
/// state.
pub struct DeviceRegistry {
    devices: RwLock<Vec<Device>>,
    db: Arc<DatabaseService>,
}

impl DeviceRegistry {
    pub fn new(db: Arc<DatabaseService>) -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
            db,
        }
    }

    /// Hydrates the mirror from the store. Returns the loaded snapshot.
    pub fn load(&self) -> Result<Vec<Device>, RegistryError> {
        let loaded = self.db.load_devices()?;
        info!("Loaded {} registered device(s).", loaded.len());

        let mut devices = self.devices.write().unwrap();
        *devices = loaded.clone();
        Ok(loaded)
    }

    pub fn register(&self, device: Device) -> Result<(), RegistryError> {
        if device.imei.is_empty() {
            return Err(RegistryError::EmptyImei);
        }

        let mut devices = self.devices.write().unwrap();
        if devices.iter().any(|d| d.imei == device.imei) {
            return Err(RegistryError::DuplicateDevice(device.imei));
        }

        self.db.insert_device(&device)?;
        devices.push(device);
        Ok(())
    }

    pub fn unregister(&self, imei: &str) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().unwrap();
        if !devices.iter().any(|d| d.imei == imei) {
            return Err(RegistryError::NotFound(imei.to_string()));
        }

        self.db.delete_device(imei)?;
        devices.retain(|d| d.imei != imei);
        Ok(())
    }

    /// Snapshot in registration order.
    pub fn all(&self) -> Vec<Device> {
        self.devices.read().unwrap().clone()
    }

    pub fn match_by_imei(&self, imei: &str) -> Option<Device> {
        self.devices
            .read()
            .unwrap()
            .iter()
            .find(|d| d.imei == imei)
            .cloned()
    }

    pub fn match_by_topic(&self, topic: &str) -> Vec<Device> {
        self.devices
            .read()
            .unwrap()
            .iter()
            .filter(|d| d.read_topic == topic)
            .cloned()
            .collect()
    }
}
