//! Device inventory loaded from a TOML file.
//!
//! The file keeps the layout of the old INI inventory: one table per device,
//! named after the device.
//!
//! ```toml
//! [cabinet-01]
//! ip = "192.168.1.10"
//! username = "root"
//! password = "secret"
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, warn};
use serde::Deserialize;

use super::Device;
use crate::error::ConfigError;

/// Raw table as it appears in the file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceEntry {
    #[serde(alias = "ip")]
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    identity_file: Option<String>,
}

/// Outcome of resolving a selection against the registry.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Known devices, in registry order.
    pub devices: Vec<Arc<Device>>,

    /// Selected names with no registry entry, in selection order.
    pub unknown: Vec<String>,
}

/// Ordered set of devices, keyed by name.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: IndexMap<String, Arc<Device>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from devices, rejecting duplicate names.
    pub fn from_devices(
        devices: impl IntoIterator<Item = Device>,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for device in devices {
            registry.insert(device)?;
        }
        Ok(registry)
    }

    /// Parse an inventory from TOML text.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let entries: IndexMap<String, DeviceEntry> =
            toml::from_str(text).map_err(|source| ConfigError::Parse {
                path: origin.to_path_buf(),
                source,
            })?;

        let mut registry = Self::new();
        for (name, entry) in entries {
            let device = Self::build(name, entry)?;
            debug!("Loaded device: {}", device.name);
            registry.insert(device)?;
        }
        Ok(registry)
    }

    /// Load an inventory file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading device configurations from {}", path.display());
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    fn build(name: String, entry: DeviceEntry) -> Result<Device, ConfigError> {
        let missing = |field| ConfigError::MissingField {
            device: name.clone(),
            field,
        };
        let host = entry.host.ok_or_else(|| missing("ip"))?;
        let username = entry.username.ok_or_else(|| missing("username"))?;
        let password = match (entry.password, &entry.identity_file) {
            (Some(password), _) => password,
            (None, Some(_)) => String::new(),
            (None, None) => return Err(missing("password")),
        };

        let mut device = Device::new(name.clone(), host, username, password);
        device.port = entry.port;
        device.identity_file = entry.identity_file.map(Into::into);
        Ok(device)
    }

    fn insert(&mut self, device: Device) -> Result<(), ConfigError> {
        if self.devices.contains_key(&device.name) {
            return Err(ConfigError::DuplicateDevice(device.name));
        }
        self.devices.insert(device.name.clone(), Arc::new(device));
        Ok(())
    }

    /// Get a device by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Device>> {
        self.devices.get(name)
    }

    /// All devices in registry order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.values()
    }

    /// All device names in registry order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Resolve selected names into connection records.
    ///
    /// Devices come back in registry order regardless of selection order;
    /// repeated names resolve once.
    pub fn resolve<S: AsRef<str>>(&self, selected: &[S]) -> Resolution {
        let mut resolution = Resolution::default();

        for name in selected {
            let name = name.as_ref();
            if !self.devices.contains_key(name) && !resolution.unknown.iter().any(|n| n == name) {
                warn!("Selected device '{name}' is not in the registry");
                resolution.unknown.push(name.to_string());
            }
        }

        resolution.devices = self
            .devices
            .iter()
            .filter(|(name, _)| selected.iter().any(|s| s.as_ref() == name.as_str()))
            .map(|(_, device)| Arc::clone(device))
            .collect();

        resolution
    }
}
