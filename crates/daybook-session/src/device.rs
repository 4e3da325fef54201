//! Stable per-installation device identity.
//!
//! The device identifier binds refresh tokens to one installation. It is
//! generated once, persisted in durable key-value storage, and reused for
//! every later session - it is the only value that survives logout.
//!
//! Two storage backends are provided: a JSON file under the platform
//! config directory, and the OS keychain.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use keyring::Entry;
use tracing::info;
use uuid::Uuid;

/// Fixed key the device identifier is stored under
const DEVICE_ID_KEY: &str = "device_uuid";

/// Application name used for config directory and keychain service names
const APP_NAME: &str = "daybook";

/// Device store file name
const DEVICE_FILE: &str = "device.json";

/// Durable key-value storage for installation-scoped values.
pub trait DeviceStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

// ============================================================================
// File-backed store
// ============================================================================

/// Key-value store backed by a JSON file under the platform config dir.
pub struct FileDeviceStore {
    path: PathBuf,
}

impl FileDeviceStore {
    pub fn new() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(Self {
            path: config_dir.join(APP_NAME).join(DEVICE_FILE),
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents =
            std::fs::read_to_string(&self.path).context("Failed to read device store file")?;
        serde_json::from_str(&contents).context("Failed to parse device store file")
    }
}

impl DeviceStore for FileDeviceStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_map()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&map)?;
        std::fs::write(&self.path, contents).context("Failed to write device store file")?;
        Ok(())
    }
}

// ============================================================================
// Keychain-backed store
// ============================================================================

/// Key-value store backed by the OS keychain.
pub struct KeyringDeviceStore {
    service: String,
}

impl KeyringDeviceStore {
    pub fn new() -> Self {
        Self {
            service: APP_NAME.to_string(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl Default for KeyringDeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStore for KeyringDeviceStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to read from keychain"),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store value in keychain")
    }
}

// ============================================================================
// Device identity provider
// ============================================================================

/// Produces and persists the stable per-installation device identifier.
#[derive(Clone)]
pub struct DeviceIdentity {
    store: Arc<dyn DeviceStore>,
}

impl DeviceIdentity {
    pub fn new(store: Arc<dyn DeviceStore>) -> Self {
        Self { store }
    }

    /// Return the persisted device identifier, generating and persisting a
    /// new v4 UUID on first call. Storage failures propagate.
    pub fn get_or_create(&self) -> Result<String> {
        if let Some(id) = self.store.get(DEVICE_ID_KEY)? {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        self.store.set(DEVICE_ID_KEY, &id)?;
        info!(device_id = %id, "generated new device identifier");
        Ok(id)
    }

    /// Persist a server-assigned device identifier. The server owns the
    /// binding; when it reassigns the id on login, the new value must be
    /// the one presented on future refreshes, including after a restart.
    pub fn adopt(&self, id: &str) -> Result<()> {
        self.store.set(DEVICE_ID_KEY, id)?;
        info!(device_id = %id, "adopted server-assigned device identifier");
        Ok(())
    }
}
