//! Signed device records as returned by `/keys/query`, and their validation.

use crate::utils::{canonical_json, decode_base64};
use crate::{CURVE25519, ED25519};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub type Signatures = BTreeMap<String, BTreeMap<String, String>>;

/// Why a raw device record was refused.
///
/// These never leave the crate as errors: the offending device is dropped
/// from the list and the reason is logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed device record: {0}")]
    Malformed(String),

    #[error("user id mismatch: expected {expected}, found {found}")]
    UserIdMismatch { expected: String, found: String },

    #[error("device id mismatch: expected {expected}, found {found}")]
    DeviceIdMismatch { expected: String, found: String },

    #[error("record carries no ed25519 key for its own device")]
    MissingSigningKey,

    #[error("record carries no curve25519 key for its own device")]
    MissingIdentityKey,

    #[error("record carries no self-signature")]
    MissingSignature,

    #[error("invalid key or signature encoding: {0}")]
    InvalidEncoding(String),

    #[error("signature does not verify")]
    BadSignature,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustFlags {
    pub verified: bool,
    pub blocked: bool,
}

/// Wire shape of a device's key record.
#[derive(Debug, Clone, Deserialize)]
struct DeviceKeys {
    user_id: String,
    device_id: String,
    algorithms: Vec<String>,
    keys: BTreeMap<String, String>,
    #[serde(default)]
    signatures: Signatures,
}

/// A validated device of some user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub user_id: String,
    pub device_id: String,
    pub algorithms: BTreeSet<String>,
    pub keys: BTreeMap<String, String>,
    pub signatures: Signatures,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub blocked: bool,
}

impl DeviceIdentity {
    /// Validate a raw record returned for `expected_user_id` under the map
    /// key `expected_device_id`.
    ///
    /// The signature is checked over the canonical form of the raw JSON, so
    /// fields this crate does not model are covered too.
    pub fn from_signed_record(
        expected_user_id: &str,
        expected_device_id: &str,
        raw: &Value,
    ) -> Result<Self, ValidationError> {
        let record: DeviceKeys = serde_json::from_value(raw.clone())
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;

        if record.user_id != expected_user_id {
            return Err(ValidationError::UserIdMismatch {
                expected: expected_user_id.to_string(),
                found: record.user_id,
            });
        }

        if record.device_id != expected_device_id {
            return Err(ValidationError::DeviceIdMismatch {
                expected: expected_device_id.to_string(),
                found: record.device_id,
            });
        }

        let key_id = format!("{ED25519}:{}", record.device_id);
        let signing_key = record
            .keys
            .get(&key_id)
            .ok_or(ValidationError::MissingSigningKey)?;

        verify_json(raw, &record.user_id, &key_id, signing_key)?;

        if !record
            .keys
            .contains_key(&format!("{CURVE25519}:{}", record.device_id))
        {
            return Err(ValidationError::MissingIdentityKey);
        }

        Ok(Self {
            user_id: record.user_id,
            device_id: record.device_id,
            algorithms: record.algorithms.into_iter().collect(),
            keys: record.keys,
            signatures: record.signatures,
            verified: false,
            blocked: false,
        })
    }

    pub fn ed25519_key(&self) -> Option<&str> {
        self.key(ED25519)
    }

    pub fn curve25519_key(&self) -> Option<&str> {
        self.key(CURVE25519)
    }

    fn key(&self, algorithm: &str) -> Option<&str> {
        self.keys
            .get(&format!("{algorithm}:{}", self.device_id))
            .map(String::as_str)
    }

    pub fn trust(&self) -> TrustFlags {
        TrustFlags {
            verified: self.verified,
            blocked: self.blocked,
        }
    }

    /// Same device, same identity keys; trust flags and signatures may differ.
    pub fn same_keys(&self, other: &DeviceIdentity) -> bool {
        self.user_id == other.user_id
            && self.device_id == other.device_id
            && self.keys == other.keys
    }
}

/// Check `signatures[signer][key_id]` on `value` against the base64 ed25519
/// `public_key`.
pub fn verify_json(
    value: &Value,
    signer: &str,
    key_id: &str,
    public_key: &str,
) -> Result<(), ValidationError> {
    let signature = value
        .get("signatures")
        .and_then(|s| s.get(signer))
        .and_then(|s| s.get(key_id))
        .and_then(Value::as_str)
        .ok_or(ValidationError::MissingSignature)?;

    let key_bytes: [u8; 32] = decode_base64(public_key)
        .map_err(|e| ValidationError::InvalidEncoding(e.to_string()))?
        .try_into()
        .map_err(|_| ValidationError::InvalidEncoding("ed25519 key must be 32 bytes".to_string()))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| ValidationError::InvalidEncoding(e.to_string()))?;

    let signature_bytes: [u8; 64] = decode_base64(signature)
        .map_err(|e| ValidationError::InvalidEncoding(e.to_string()))?
        .try_into()
        .map_err(|_| ValidationError::InvalidEncoding("signature must be 64 bytes".to_string()))?;
    let signature = Signature::from_bytes(&signature_bytes);

    let canonical =
        canonical_json(value).map_err(|e| ValidationError::Malformed(e.to_string()))?;

    verifying_key
        .verify(canonical.as_bytes(), &signature)
        .map_err(|_| ValidationError::BadSignature)
}

/// All validated devices of one user, keyed by device id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceList {
    pub user_id: String,
    pub devices: BTreeMap<String, DeviceIdentity>,
}

impl DeviceList {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            devices: BTreeMap::new(),
        }
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceIdentity> {
        self.devices.get(device_id)
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn by_curve25519_key(&self, key: &str) -> Option<&DeviceIdentity> {
        self.devices
            .values()
            .find(|device| device.curve25519_key() == Some(key))
    }
}
