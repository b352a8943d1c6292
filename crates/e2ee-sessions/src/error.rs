use thiserror::Error;

/// Errors surfaced to callers of this crate.
///
/// The enum is `Clone` because one failed network operation is handed to every
/// caller that was awaiting the same in-flight request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("No such device {device_id} for user {user_id}")]
    NoSuchDevice { user_id: String, device_id: String },

    #[error("No one-time key available for device {device_id} of user {user_id}")]
    KeyExhausted { user_id: String, device_id: String },

    #[error("Key upload failed (device keys uploaded: {device_keys_uploaded}): {reason}")]
    Upload {
        device_keys_uploaded: bool,
        reason: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Crypto engine error: {0}")]
    Engine(String),

    #[error("Identity keys have not been generated")]
    MissingIdentityKeys,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
