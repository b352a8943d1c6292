use crate::engine::{CryptoEngine, IdentityKeys};
use crate::{
    CiphertextInfo, DeviceIdentity, DeviceKeyStore, Error, OlmPayload, OutboundEnvelope,
    PlaintextEvent, Result, SessionCache, ED25519,
};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Fans one plaintext event out to a set of recipient devices.
#[derive(Clone)]
pub struct Encryptor {
    user_id: String,
    device_id: String,
    engine: Arc<dyn CryptoEngine>,
    devices: DeviceKeyStore,
    sessions: SessionCache,
}

impl Encryptor {
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        engine: Arc<dyn CryptoEngine>,
        devices: DeviceKeyStore,
        sessions: SessionCache,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            engine,
            devices,
            sessions,
        }
    }

    /// Encrypt `event` for each `(user id, device id)` in `recipient_devices`.
    ///
    /// Blocked devices are left out; verification state is not consulted.
    /// Devices are encrypted for concurrently. One that fails (unknown device,
    /// no one-time key, engine error) is logged and left out, the rest still
    /// get the event. An empty target set is not an error.
    #[instrument(skip_all, fields(event_type = %event.event_type, targets = recipient_devices.len()))]
    pub async fn encrypt_for_room(
        &self,
        event: &PlaintextEvent,
        recipient_devices: &[(String, String)],
    ) -> Result<OutboundEnvelope> {
        let identity = self
            .engine
            .identity_keys()
            .ok_or(Error::MissingIdentityKeys)?;

        let unique: BTreeSet<&(String, String)> = recipient_devices.iter().collect();
        let mut targets = Vec::with_capacity(unique.len());
        for (user_id, device_id) in unique {
            let Some(device) = self.devices.get(user_id, device_id).await else {
                warn!(user_id = %user_id, device_id = %device_id, "Skipping unknown device");
                continue;
            };
            if device.blocked {
                debug!(user_id = %user_id, device_id = %device_id, "Skipping blocked device");
                continue;
            }
            if device.curve25519_key().is_none() {
                warn!(user_id = %user_id, device_id = %device_id, "Skipping device without curve25519 key");
                continue;
            }
            targets.push(device);
        }

        let results = join_all(
            targets
                .iter()
                .map(|device| self.encrypt_for_device(event, &identity, device)),
        )
        .await;

        let mut envelope = OutboundEnvelope::new(identity.curve25519.clone());
        envelope.ciphertext = results.into_iter().flatten().collect::<BTreeMap<_, _>>();
        debug!(recipients = envelope.recipient_count(), "Event encrypted");
        Ok(envelope)
    }

    async fn encrypt_for_device(
        &self,
        event: &PlaintextEvent,
        identity: &IdentityKeys,
        device: &DeviceIdentity,
    ) -> Option<(String, CiphertextInfo)> {
        let curve25519 = device.curve25519_key()?.to_string();
        let payload = OlmPayload {
            event_type: event.event_type.clone(),
            content: event.content.clone(),
            sender: self.user_id.clone(),
            sender_device: self.device_id.clone(),
            keys: BTreeMap::from([(ED25519.to_string(), identity.ed25519.clone())]),
            recipient: device.user_id.clone(),
            recipient_keys: device
                .ed25519_key()
                .map(|key| BTreeMap::from([(ED25519.to_string(), key.to_string())]))
                .unwrap_or_default(),
        };

        let result = match serde_json::to_string(&payload) {
            Ok(plaintext) => {
                self.sessions
                    .encrypt(&device.user_id, &device.device_id, &plaintext)
                    .await
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(ciphertext) => Some((curve25519, ciphertext)),
            Err(e) => {
                warn!(user_id = %device.user_id, device_id = %device.device_id, error = %e, "Dropping device from envelope");
                None
            }
        }
    }
}
