use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

pub const OLM_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";
pub const SIGNED_CURVE25519: &str = "signed_curve25519";
pub const CURVE25519: &str = "curve25519";
pub const ED25519: &str = "ed25519";
pub const ROOM_ENCRYPTED_EVENT_TYPE: &str = "m.room.encrypted";
pub const ROOM_MESSAGE_EVENT_TYPE: &str = "m.room.message";
pub const NEW_DEVICE_EVENT_TYPE: &str = "m.new_device";
pub const BAD_ENCRYPTED_MSGTYPE: &str = "m.bad.encrypted";
pub const MAX_SKIP: usize = 1000;

/// Olm message type: `0` carries the material needed to establish the
/// receiving side of a session, `1` is a plain ratchet message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    PreKey,
    Normal,
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::PreKey => 0,
            MessageType::Normal => 1,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::PreKey),
            1 => Ok(MessageType::Normal),
            other => Err(format!("unknown olm message type {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiphertextInfo {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub body: String,
}

/// Content of an `m.room.encrypted` event using the olm algorithm.
///
/// `ciphertext` is keyed by the curve25519 identity key of each recipient
/// device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub algorithm: String,
    pub sender_key: String,
    pub ciphertext: BTreeMap<String, CiphertextInfo>,
}

pub type OutboundEnvelope = EncryptedEnvelope;
pub type InboundEnvelope = EncryptedEnvelope;

impl EncryptedEnvelope {
    pub fn new(sender_key: impl Into<String>) -> Self {
        Self {
            algorithm: OLM_ALGORITHM.to_string(),
            sender_key: sender_key.into(),
            ciphertext: BTreeMap::new(),
        }
    }

    pub fn recipient_count(&self) -> usize {
        self.ciphertext.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaintextEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: Value,
}

impl PlaintextEvent {
    pub fn new(event_type: impl Into<String>, content: Value) -> Self {
        Self {
            event_type: event_type.into(),
            content,
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new(
            ROOM_MESSAGE_EVENT_TYPE,
            json!({ "msgtype": "m.text", "body": body.into() }),
        )
    }
}

/// What actually goes through the ratchet for one recipient device.
///
/// Binding sender and recipient identities into the encrypted payload lets the
/// receiver reject a ciphertext that was re-addressed or replayed under
/// another identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OlmPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: Value,
    pub sender: String,
    pub sender_device: String,
    pub keys: BTreeMap<String, String>,
    pub recipient: String,
    pub recipient_keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedEvent {
    pub sender: String,
    pub sender_device: String,
    pub event_type: String,
    pub content: Value,
    /// Always `true`; kept so display code can badge the event.
    pub encrypted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    NotAddressedToUs,
    UnknownSenderDevice,
    DecryptionFailed,
    MismatchedSender,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FailureReason::NotAddressedToUs => "message was not encrypted for this device",
            FailureReason::UnknownSenderDevice => "unknown sender device",
            FailureReason::DecryptionFailed => "decryption failed",
            FailureReason::MismatchedSender => "sender identity mismatch",
        };
        f.write_str(reason)
    }
}

/// Stand-in event for a message that could not be decrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct FailurePlaceholder {
    pub sender: String,
    pub reason: FailureReason,
    pub event_type: String,
    pub content: Value,
}

impl FailurePlaceholder {
    pub fn new(sender: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            sender: sender.into(),
            reason,
            event_type: ROOM_MESSAGE_EVENT_TYPE.to_string(),
            content: json!({
                "msgtype": BAD_ENCRYPTED_MSGTYPE,
                "body": format!("** Unable to decrypt: {reason} **"),
            }),
        }
    }

    pub fn msgtype(&self) -> Option<&str> {
        self.content.get("msgtype").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecryptionOutcome {
    Decrypted(DecryptedEvent),
    Undecryptable(FailurePlaceholder),
}

impl DecryptionOutcome {
    pub fn is_decrypted(&self) -> bool {
        matches!(self, DecryptionOutcome::Decrypted(_))
    }

    pub fn decrypted(&self) -> Option<&DecryptedEvent> {
        match self {
            DecryptionOutcome::Decrypted(event) => Some(event),
            DecryptionOutcome::Undecryptable(_) => None,
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            DecryptionOutcome::Decrypted(_) => None,
            DecryptionOutcome::Undecryptable(placeholder) => Some(placeholder.reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDeviceContent {
    pub device_id: String,
    #[serde(default)]
    pub rooms: Vec<String>,
}

/// Out-of-band notification that `sender` added a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceListSignal {
    pub sender: String,
    pub content: NewDeviceContent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_serializes_as_integer() {
        let info = CiphertextInfo {
            message_type: MessageType::PreKey,
            body: "abc".to_string(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json, json!({"type": 0, "body": "abc"}));

        let parsed: CiphertextInfo =
            serde_json::from_value(json!({"type": 1, "body": "x"})).unwrap();
        assert_eq!(parsed.message_type, MessageType::Normal);

        assert!(serde_json::from_value::<CiphertextInfo>(json!({"type": 7, "body": "x"})).is_err());
    }

    #[test]
    fn placeholder_uses_bad_encrypted_msgtype() {
        let placeholder = FailurePlaceholder::new("@bob:example.org", FailureReason::UnknownSenderDevice);
        assert_eq!(placeholder.msgtype(), Some(BAD_ENCRYPTED_MSGTYPE));
        assert_eq!(placeholder.event_type, ROOM_MESSAGE_EVENT_TYPE);
    }
}
