//! Device tables and the global device constructor registry.
//!
//! Backends register a constructor under a name (e.g. `"ref-cpu"`), and callers build a
//! [`DeviceRegistry`] either from concrete devices or from registered names. Device
//! indices used throughout graphs and bytecode are slots in a `DeviceRegistry`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use super::{Device, DeviceIndex};
use crate::error::{Result, RuntimeError};

/// Factory that creates a fresh device instance.
pub type DeviceConstructor = Arc<dyn Fn() -> Arc<dyn Device> + Send + Sync>;

static DEVICE_CONSTRUCTORS: Lazy<RwLock<HashMap<String, DeviceConstructor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers a device constructor under `name`, replacing any previous registration.
pub fn register_device<F>(name: &str, constructor: F)
where
    F: Fn() -> Arc<dyn Device> + Send + Sync + 'static,
{
    DEVICE_CONSTRUCTORS
        .write()
        .expect("device registry poisoned")
        .insert(name.to_string(), Arc::new(constructor));
}

/// Instantiates a device registered under `name`.
pub fn create_device(name: &str) -> Option<Arc<dyn Device>> {
    let constructor = DEVICE_CONSTRUCTORS
        .read()
        .expect("device registry poisoned")
        .get(name)
        .cloned()?;
    Some(constructor())
}

/// Names of all registered device constructors, sorted.
pub fn list_devices() -> Vec<String> {
    let mut names: Vec<String> = DEVICE_CONSTRUCTORS
        .read()
        .expect("device registry poisoned")
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}

/// Ordered table of devices an execution plan can target.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<Arc<dyn Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table by instantiating each registered name in order.
    pub fn from_names(names: &[&str]) -> Result<Self> {
        let mut registry = Self::new();
        for name in names {
            let device = create_device(name).ok_or_else(|| {
                RuntimeError::InvalidArgument(format!("no device registered under '{name}'"))
            })?;
            registry.add(device);
        }
        Ok(registry)
    }

    pub fn with_device(mut self, device: Arc<dyn Device>) -> Self {
        self.add(device);
        self
    }

    pub fn add(&mut self, device: Arc<dyn Device>) -> DeviceIndex {
        let index = DeviceIndex(self.devices.len() as u32);
        self.devices.push(device);
        index
    }

    pub fn get(&self, index: DeviceIndex) -> Result<&Arc<dyn Device>> {
        self.devices.get(index.as_usize()).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!(
                "device index {index} out of range ({} devices)",
                self.devices.len()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceIndex, &Arc<dyn Device>)> {
        self.devices
            .iter()
            .enumerate()
            .map(|(index, device)| (DeviceIndex(index as u32), device))
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.devices.iter().map(|device| device.name().to_string()))
            .finish()
    }
}
