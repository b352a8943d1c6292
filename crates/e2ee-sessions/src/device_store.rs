use crate::{DeviceIdentity, DeviceList, Result, StorageAdapter};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const STORAGE_VERSION: &str = "1";

/// Validated device lists of every user this client has queried.
///
/// A user that was never queried has no entry at all; a user whose query
/// returned nothing valid has an empty list.
#[derive(Clone)]
pub struct DeviceKeyStore {
    users: Arc<RwLock<HashMap<String, DeviceList>>>,
    storage: Arc<dyn StorageAdapter>,
}

impl DeviceKeyStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            storage,
        }
    }

    /// Restore every persisted device list.
    pub async fn load(storage: Arc<dyn StorageAdapter>) -> Result<Self> {
        let store = Self::new(storage);
        let prefix = store.key_prefix();
        let mut users = store.users.write().await;

        for key in store.storage.list(&prefix)? {
            let Some(data) = store.storage.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<DeviceList>(&data) {
                Ok(list) => {
                    users.insert(list.user_id.clone(), list);
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable device list"),
            }
        }

        drop(users);
        Ok(store)
    }

    /// Replace the device list of `user_id` with the valid subset of
    /// `raw_records` (device id → raw record).
    ///
    /// Records that fail validation are dropped. Trust flags of devices whose
    /// keys did not change carry over. A known device id that now presents a
    /// different ed25519 key is not replaced.
    pub async fn upsert_user(
        &self,
        user_id: &str,
        raw_records: &BTreeMap<String, Value>,
    ) -> Result<DeviceList> {
        let mut validated = DeviceList::new(user_id);
        for (device_id, raw) in raw_records {
            match DeviceIdentity::from_signed_record(user_id, device_id, raw) {
                Ok(device) => {
                    validated.devices.insert(device_id.clone(), device);
                }
                Err(e) => {
                    warn!(user_id, device_id = %device_id, error = %e, "Dropping invalid device keys");
                }
            }
        }

        let mut users = self.users.write().await;
        let previous = users.get(user_id);

        let mut list = DeviceList::new(user_id);
        for (device_id, mut device) in validated.devices {
            if let Some(existing) = previous.and_then(|p| p.get(&device_id)) {
                if existing.ed25519_key() != device.ed25519_key() {
                    warn!(user_id, device_id = %device_id, "Device presented a new signing key, keeping the known one");
                    list.devices.insert(device_id, existing.clone());
                    continue;
                }
                if existing.same_keys(&device) {
                    device.verified = existing.verified;
                    device.blocked = existing.blocked;
                }
            }
            list.devices.insert(device_id, device);
        }

        self.save(&list)?;
        users.insert(user_id.to_string(), list.clone());
        debug!(user_id, devices = list.len(), "Replaced device list");

        Ok(list)
    }

    pub async fn get(&self, user_id: &str, device_id: &str) -> Option<DeviceIdentity> {
        self.users
            .read()
            .await
            .get(user_id)
            .and_then(|list| list.get(device_id))
            .cloned()
    }

    /// `None` if the user was never queried.
    pub async fn get_user(&self, user_id: &str) -> Option<DeviceList> {
        self.users.read().await.get(user_id).cloned()
    }

    pub async fn device_by_curve25519_key(
        &self,
        user_id: &str,
        curve25519_key: &str,
    ) -> Option<DeviceIdentity> {
        self.users
            .read()
            .await
            .get(user_id)
            .and_then(|list| list.by_curve25519_key(curve25519_key))
            .cloned()
    }

    pub async fn tracked_users(&self) -> Vec<String> {
        self.users.read().await.keys().cloned().collect()
    }

    pub async fn set_blocked(&self, user_id: &str, device_id: &str, blocked: bool) -> Result<bool> {
        self.update_device(user_id, device_id, |device| device.blocked = blocked)
            .await
    }

    pub async fn set_verified(&self, user_id: &str, device_id: &str, verified: bool) -> Result<bool> {
        self.update_device(user_id, device_id, |device| device.verified = verified)
            .await
    }

    /// Returns `false` when the device is unknown.
    async fn update_device(
        &self,
        user_id: &str,
        device_id: &str,
        update: impl FnOnce(&mut DeviceIdentity),
    ) -> Result<bool> {
        let mut users = self.users.write().await;
        let Some(list) = users.get_mut(user_id) else {
            return Ok(false);
        };
        let Some(device) = list.devices.get_mut(device_id) else {
            return Ok(false);
        };

        update(device);
        self.save(list)?;
        Ok(true)
    }

    fn key_prefix(&self) -> String {
        format!("v{}/device-keys/", STORAGE_VERSION)
    }

    fn save(&self, list: &DeviceList) -> Result<()> {
        let key = format!("{}{}", self.key_prefix(), list.user_id);
        self.storage.put(&key, serde_json::to_string(list)?)
    }
}
