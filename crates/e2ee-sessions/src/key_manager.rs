use crate::device::{verify_json, Signatures};
use crate::engine::{CryptoEngine, GeneratedKey, IdentityKeys};
use crate::transport::{KeysClaimRequest, Transport, UploadKeysRequest};
use crate::utils::canonical_json;
use crate::{
    DeviceKeyStore, Error, Result, CURVE25519, ED25519, MEGOLM_ALGORITHM, OLM_ALGORITHM,
    SIGNED_CURVE25519,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A single-use public key published for session establishment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeKeyBundle {
    /// `"<algorithm>:<key id>"`, as the server lists it.
    pub key_id: String,
    pub algorithm: String,
    pub key: String,
    #[serde(default)]
    pub signatures: Signatures,
}

/// A one-time key claimed for a specific remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedKey {
    pub user_id: String,
    pub device_id: String,
    pub bundle: OneTimeKeyBundle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub one_time_keys_uploaded: usize,
    /// Server-side counts of unclaimed keys after the upload, per algorithm.
    pub one_time_key_counts: BTreeMap<String, u64>,
}

impl UploadReport {
    pub fn signed_curve25519_count(&self) -> u64 {
        self.one_time_key_counts
            .get(SIGNED_CURVE25519)
            .copied()
            .unwrap_or(0)
    }
}

/// Publishes this device's keys and claims other devices' one-time keys.
#[derive(Clone)]
pub struct KeyLifecycleManager {
    user_id: String,
    engine: Arc<dyn CryptoEngine>,
    transport: Arc<dyn Transport>,
    devices: DeviceKeyStore,
    one_time_key_target: usize,
}

impl KeyLifecycleManager {
    pub fn new(
        user_id: impl Into<String>,
        engine: Arc<dyn CryptoEngine>,
        transport: Arc<dyn Transport>,
        devices: DeviceKeyStore,
        one_time_key_target: usize,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            engine,
            transport,
            devices,
            one_time_key_target,
        }
    }

    /// Create identity keys if needed, publish the signed device record, then
    /// publish `one_time_key_count` fresh one-time keys.
    ///
    /// The two uploads are separate requests. When the second one fails the
    /// error says the device keys already went through; nothing is rolled
    /// back.
    #[instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn generate_and_upload_own_keys(
        &self,
        device_id: &str,
        one_time_key_count: usize,
    ) -> Result<UploadReport> {
        let identity_keys = self
            .engine
            .generate_identity_keys()
            .map_err(|e| upload_error(false, e))?;
        let device_keys = self
            .signed_device_keys(device_id, &identity_keys)
            .map_err(|e| upload_error(false, e))?;

        self.transport
            .upload_keys(device_id, UploadKeysRequest::DeviceKeys(device_keys))
            .await
            .map_err(|e| upload_error(false, e))?;
        info!("Device keys uploaded");

        self.upload_one_time_keys(device_id, one_time_key_count)
            .await
            .map_err(|e| upload_error(true, e))
    }

    /// Generate `count` new one-time keys and upload them together with any
    /// earlier keys the server never acknowledged.
    #[instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn upload_one_time_keys(&self, device_id: &str, count: usize) -> Result<UploadReport> {
        if count > 0 {
            self.engine.generate_one_time_keys(count)?;
        }

        let pending = self.engine.unpublished_one_time_keys();
        if pending.is_empty() {
            return Ok(UploadReport::default());
        }

        let mut one_time_keys = BTreeMap::new();
        for key in &pending {
            one_time_keys.insert(
                format!("{SIGNED_CURVE25519}:{}", key.key_id),
                self.signed_one_time_key(device_id, key)?,
            );
        }

        let response = self
            .transport
            .upload_keys(device_id, UploadKeysRequest::OneTimeKeys(one_time_keys))
            .await?;

        let key_ids: Vec<String> = pending.iter().map(|key| key.key_id.clone()).collect();
        self.engine.mark_keys_as_published(&key_ids);
        info!(count = key_ids.len(), "One-time keys uploaded");

        Ok(UploadReport {
            one_time_keys_uploaded: key_ids.len(),
            one_time_key_counts: response.one_time_key_counts,
        })
    }

    /// How many keys to generate so the server ends up holding the target
    /// count again. Keys awaiting a retried upload count as held.
    pub fn one_time_keys_to_replenish(&self, server_count: u64) -> usize {
        let held = usize::try_from(server_count)
            .unwrap_or(usize::MAX)
            .saturating_add(self.engine.unpublished_one_time_keys().len());
        self.one_time_key_target.saturating_sub(held)
    }

    /// Claim exactly one one-time key of `algorithm` for a device already
    /// present in the store.
    #[instrument(skip(self))]
    pub async fn claim_one_time_key(
        &self,
        user_id: &str,
        device_id: &str,
        algorithm: &str,
    ) -> Result<ClaimedKey> {
        let device = self
            .devices
            .get(user_id, device_id)
            .await
            .ok_or_else(|| Error::NoSuchDevice {
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
            })?;
        let exhausted = || Error::KeyExhausted {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
        };

        let request = KeysClaimRequest {
            one_time_keys: BTreeMap::from([(
                user_id.to_string(),
                BTreeMap::from([(device_id.to_string(), algorithm.to_string())]),
            )]),
        };
        let mut response = self.transport.claim_keys(request).await?;
        if let Some(failure) = response.failures.get(user_id) {
            debug!(failure = %failure, "Claim reported a failure for the user");
        }

        let prefix = format!("{algorithm}:");
        let (key_id, value) = response
            .one_time_keys
            .remove(user_id)
            .and_then(|mut devices| devices.remove(device_id))
            .and_then(|keys| keys.into_iter().find(|(id, _)| id.starts_with(&prefix)))
            .ok_or_else(exhausted)?;

        let signed = algorithm.starts_with("signed_");
        let bundle = match value {
            Value::String(key) if !signed => OneTimeKeyBundle {
                key_id,
                algorithm: algorithm.to_string(),
                key,
                signatures: Signatures::new(),
            },
            Value::Object(_) => {
                if signed {
                    let Some(ed25519) = device.ed25519_key() else {
                        warn!("No signing key to check the claimed one-time key against");
                        return Err(exhausted());
                    };
                    let signing_key_id = format!("{ED25519}:{device_id}");
                    if let Err(e) = verify_json(&value, user_id, &signing_key_id, ed25519) {
                        warn!(error = %e, "Claimed one-time key is not signed by the device");
                        return Err(exhausted());
                    }
                }
                let key = value
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(exhausted)?
                    .to_string();
                let signatures: Signatures = value
                    .get("signatures")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or_default();
                OneTimeKeyBundle {
                    key_id,
                    algorithm: algorithm.to_string(),
                    key,
                    signatures,
                }
            }
            _ => {
                warn!(key_id = %key_id, "Claimed one-time key is unsigned or malformed");
                return Err(exhausted());
            }
        };

        debug!(key_id = %bundle.key_id, "Claimed one-time key");
        Ok(ClaimedKey {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            bundle,
        })
    }

    fn signed_device_keys(&self, device_id: &str, identity_keys: &IdentityKeys) -> Result<Value> {
        let mut record = json!({
            "user_id": self.user_id,
            "device_id": device_id,
            "algorithms": [OLM_ALGORITHM, MEGOLM_ALGORITHM],
            "keys": {
                format!("{CURVE25519}:{device_id}"): identity_keys.curve25519,
                format!("{ED25519}:{device_id}"): identity_keys.ed25519,
            },
        });
        self.attach_signature(&mut record, device_id)?;
        Ok(record)
    }

    fn signed_one_time_key(&self, device_id: &str, key: &GeneratedKey) -> Result<Value> {
        let mut signed = json!({ "key": key.public_key });
        self.attach_signature(&mut signed, device_id)?;
        Ok(signed)
    }

    fn attach_signature(&self, value: &mut Value, device_id: &str) -> Result<()> {
        let signature = self.engine.sign(&canonical_json(value)?)?;
        value["signatures"] = json!({
            self.user_id.as_str(): { format!("{ED25519}:{device_id}"): signature }
        });
        Ok(())
    }
}

fn upload_error(device_keys_uploaded: bool, error: Error) -> Error {
    match error {
        Error::Upload { reason, .. } => Error::Upload {
            device_keys_uploaded,
            reason,
        },
        other => Error::Upload {
            device_keys_uploaded,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::signing_key;
    use crate::engine::DalekEngine;
    use crate::utils::encode_base64;
    use crate::{DeviceIdentity, InMemoryHomeserver, InMemoryStorage};
    use ed25519_dalek::Signer;

    const ALICE: &str = "@alice:example.org";
    const BOB: &str = "@bob:example.org";

    fn manager(server: &InMemoryHomeserver, user_id: &str) -> (KeyLifecycleManager, DeviceKeyStore) {
        let devices = DeviceKeyStore::new(Arc::new(InMemoryStorage::new()));
        let manager = KeyLifecycleManager::new(
            user_id,
            Arc::new(DalekEngine::new()),
            Arc::new(server.connect(user_id)),
            devices.clone(),
            10,
        );
        (manager, devices)
    }

    #[tokio::test]
    async fn uploaded_device_record_validates() {
        let server = InMemoryHomeserver::new();
        let (bob, _) = manager(&server, BOB);
        let report = bob.generate_and_upload_own_keys("BOBDEV", 5).await.unwrap();

        assert_eq!(report.one_time_keys_uploaded, 5);
        assert_eq!(report.signed_curve25519_count(), 5);
        let record = server.device_record(BOB, "BOBDEV").unwrap();
        assert!(DeviceIdentity::from_signed_record(BOB, "BOBDEV", &record).is_ok());
    }

    #[tokio::test]
    async fn rejected_one_time_keys_report_partial_success_and_retry() {
        let server = InMemoryHomeserver::new();
        let (bob, _) = manager(&server, BOB);
        server.reject_one_time_key_uploads(true);

        let err = bob.generate_and_upload_own_keys("BOBDEV", 3).await.unwrap_err();
        assert!(matches!(err, Error::Upload { device_keys_uploaded: true, .. }));
        assert!(server.device_record(BOB, "BOBDEV").is_some());
        assert_eq!(bob.one_time_keys_to_replenish(0), 7);

        server.reject_one_time_key_uploads(false);
        let report = bob.upload_one_time_keys("BOBDEV", 0).await.unwrap();
        assert_eq!(report.one_time_keys_uploaded, 3);
        assert_eq!(server.one_time_key_count(BOB, "BOBDEV", SIGNED_CURVE25519), 3);
    }

    #[tokio::test]
    async fn offline_server_fails_before_device_keys() {
        let server = InMemoryHomeserver::new();
        let (bob, _) = manager(&server, BOB);
        server.set_offline(true);

        let err = bob.generate_and_upload_own_keys("BOBDEV", 3).await.unwrap_err();
        assert!(matches!(err, Error::Upload { device_keys_uploaded: false, .. }));
    }

    #[tokio::test]
    async fn claim_requires_a_known_device() {
        let server = InMemoryHomeserver::new();
        let (alice, _) = manager(&server, ALICE);
        let err = alice
            .claim_one_time_key(BOB, "BOBDEV", SIGNED_CURVE25519)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoSuchDevice { .. }));
    }

    #[tokio::test]
    async fn claim_returns_one_signed_key_until_exhausted() {
        let server = InMemoryHomeserver::new();
        let (bob, _) = manager(&server, BOB);
        bob.generate_and_upload_own_keys("BOBDEV", 1).await.unwrap();

        let (alice, devices) = manager(&server, ALICE);
        let record = server.device_record(BOB, "BOBDEV").unwrap();
        devices
            .upsert_user(BOB, &BTreeMap::from([("BOBDEV".to_string(), record)]))
            .await
            .unwrap();

        let claimed = alice
            .claim_one_time_key(BOB, "BOBDEV", SIGNED_CURVE25519)
            .await
            .unwrap();
        assert_eq!(claimed.bundle.algorithm, SIGNED_CURVE25519);
        assert!(claimed.bundle.key_id.starts_with("signed_curve25519:"));
        assert!(claimed.bundle.signatures.contains_key(BOB));

        let err = alice
            .claim_one_time_key(BOB, "BOBDEV", SIGNED_CURVE25519)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyExhausted { .. }));
    }

    /// Bob with identity keys but no one-time keys, and Alice who knows Bob's
    /// device.
    async fn keyless_bob(server: &InMemoryHomeserver) -> (KeyLifecycleManager, KeyLifecycleManager) {
        let (bob, _) = manager(server, BOB);
        bob.generate_and_upload_own_keys("BOBDEV", 0).await.unwrap();

        let (alice, devices) = manager(server, ALICE);
        let record = server.device_record(BOB, "BOBDEV").unwrap();
        devices
            .upsert_user(BOB, &BTreeMap::from([("BOBDEV".to_string(), record)]))
            .await
            .unwrap();
        (bob, alice)
    }

    async fn assert_exhausted(alice: &KeyLifecycleManager) {
        let err = alice
            .claim_one_time_key(BOB, "BOBDEV", SIGNED_CURVE25519)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyExhausted { .. }));
    }

    #[tokio::test]
    async fn bare_string_for_signed_key_is_refused() {
        let server = InMemoryHomeserver::new();
        let (_bob, alice) = keyless_bob(&server).await;
        server.insert_one_time_key(
            BOB,
            "BOBDEV",
            "signed_curve25519:AAAAAQ",
            json!(encode_base64([7u8; 32])),
        );
        assert_exhausted(&alice).await;

        // Unsigned algorithms still take the bare form.
        server.insert_one_time_key(BOB, "BOBDEV", "curve25519:AAAAAg", json!(encode_base64([8u8; 32])));
        let claimed = alice
            .claim_one_time_key(BOB, "BOBDEV", CURVE25519)
            .await
            .unwrap();
        assert_eq!(claimed.bundle.key, encode_base64([8u8; 32]));
        assert!(claimed.bundle.signatures.is_empty());
    }

    #[tokio::test]
    async fn tampered_claimed_key_is_refused() {
        let server = InMemoryHomeserver::new();
        let (bob, alice) = keyless_bob(&server).await;
        let generated = GeneratedKey {
            key_id: "AAAAAQ".to_string(),
            public_key: encode_base64([1u8; 32]),
        };
        let mut signed = bob.signed_one_time_key("BOBDEV", &generated).unwrap();
        signed["key"] = json!(encode_base64([2u8; 32]));
        server.insert_one_time_key(BOB, "BOBDEV", "signed_curve25519:AAAAAQ", signed);

        assert_exhausted(&alice).await;
    }

    #[tokio::test]
    async fn claimed_key_signed_by_another_key_is_refused() {
        let server = InMemoryHomeserver::new();
        let (_bob, alice) = keyless_bob(&server).await;
        let mut signed = json!({ "key": encode_base64([1u8; 32]) });
        let forged = signing_key(9).sign(canonical_json(&signed).unwrap().as_bytes());
        signed["signatures"] = json!({ BOB: { "ed25519:BOBDEV": encode_base64(forged.to_bytes()) } });
        server.insert_one_time_key(BOB, "BOBDEV", "signed_curve25519:AAAAAQ", signed);

        assert_exhausted(&alice).await;
    }

    #[tokio::test]
    async fn claimed_key_without_signatures_is_refused() {
        let server = InMemoryHomeserver::new();
        let (_bob, alice) = keyless_bob(&server).await;
        server.insert_one_time_key(
            BOB,
            "BOBDEV",
            "signed_curve25519:AAAAAQ",
            json!({ "key": encode_base64([1u8; 32]) }),
        );

        assert_exhausted(&alice).await;
    }
}
