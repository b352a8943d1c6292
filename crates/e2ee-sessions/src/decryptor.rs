use crate::engine::CryptoEngine;
use crate::{
    DecryptedEvent, DecryptionOutcome, DeviceIdentity, DeviceKeyStore, FailurePlaceholder,
    FailureReason, InboundEnvelope, OlmPayload, SessionCache, ED25519, OLM_ALGORITHM,
};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Turns an inbound `m.room.encrypted` payload into a plaintext event or a
/// placeholder. Never fails.
#[derive(Clone)]
pub struct Decryptor {
    user_id: String,
    engine: Arc<dyn CryptoEngine>,
    devices: DeviceKeyStore,
    sessions: SessionCache,
}

impl Decryptor {
    pub fn new(
        user_id: impl Into<String>,
        engine: Arc<dyn CryptoEngine>,
        devices: DeviceKeyStore,
        sessions: SessionCache,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            engine,
            devices,
            sessions,
        }
    }

    #[instrument(skip(self, envelope, own_identity_key))]
    pub async fn decrypt(
        &self,
        sender: &str,
        envelope: &InboundEnvelope,
        own_identity_key: &str,
    ) -> DecryptionOutcome {
        let fail = |reason: FailureReason| {
            debug!(%reason, "Event left undecrypted");
            DecryptionOutcome::Undecryptable(FailurePlaceholder::new(sender, reason))
        };

        let Some(ciphertext) = envelope.ciphertext.get(own_identity_key) else {
            return fail(FailureReason::NotAddressedToUs);
        };
        if envelope.algorithm != OLM_ALGORITHM {
            warn!(algorithm = %envelope.algorithm, "Unsupported encryption algorithm");
            return fail(FailureReason::DecryptionFailed);
        }

        let Some(device) = self
            .devices
            .device_by_curve25519_key(sender, &envelope.sender_key)
            .await
        else {
            return fail(FailureReason::UnknownSenderDevice);
        };

        let plaintext = match self
            .sessions
            .decrypt(sender, &device.device_id, ciphertext)
            .await
        {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(device_id = %device.device_id, error = %e, "Failed to decrypt");
                return fail(FailureReason::DecryptionFailed);
            }
        };

        let payload: OlmPayload = match serde_json::from_str(&plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(device_id = %device.device_id, error = %e, "Decrypted payload is not an event");
                return fail(FailureReason::DecryptionFailed);
            }
        };

        if !self.payload_matches(sender, &device, &payload) {
            warn!(device_id = %device.device_id, "Decrypted payload names a different sender or recipient");
            return fail(FailureReason::MismatchedSender);
        }

        DecryptionOutcome::Decrypted(DecryptedEvent {
            sender: sender.to_string(),
            sender_device: device.device_id,
            event_type: payload.event_type,
            content: payload.content,
            encrypted: true,
        })
    }

    fn payload_matches(&self, sender: &str, device: &DeviceIdentity, payload: &OlmPayload) -> bool {
        let own_ed25519 = self.engine.identity_keys().map(|keys| keys.ed25519);

        payload.sender == sender
            && payload.sender_device == device.device_id
            && payload.keys.get(ED25519).map(String::as_str) == device.ed25519_key()
            && payload.recipient == self.user_id
            && payload.recipient_keys.get(ED25519) == own_ed25519.as_ref()
    }
}
