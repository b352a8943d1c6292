//! Contract with the ratchet implementation.
//!
//! The core never looks inside a session: it asks the engine to create one and
//! then drives it through [`RatchetSession`].

mod dalek;

pub use dalek::DalekEngine;

use crate::{CiphertextInfo, ClaimedKey, Result};

/// Public halves of the device's long-lived identity keys, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKeys {
    pub curve25519: String,
    pub ed25519: String,
}

/// Public half of a freshly generated one-time key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedKey {
    pub key_id: String,
    pub public_key: String,
}

pub trait CryptoEngine: Send + Sync {
    /// Create the identity key pairs, or return the existing ones.
    fn generate_identity_keys(&self) -> Result<IdentityKeys>;

    fn identity_keys(&self) -> Option<IdentityKeys>;

    fn generate_one_time_keys(&self, count: usize) -> Result<Vec<GeneratedKey>>;

    /// One-time keys generated but not yet acknowledged by the server.
    fn unpublished_one_time_keys(&self) -> Vec<GeneratedKey>;

    fn mark_keys_as_published(&self, key_ids: &[String]);

    /// Sign a canonical JSON string with the ed25519 identity key.
    fn sign(&self, message: &str) -> Result<String>;

    fn establish_outbound_session(
        &self,
        their_identity_key: &str,
        claimed: &ClaimedKey,
    ) -> Result<Box<dyn RatchetSession>>;

    /// Fails unless `pre_key_message` decrypts with the resulting session;
    /// the message itself is left for the caller to decrypt.
    fn establish_inbound_session(
        &self,
        their_identity_key: &str,
        pre_key_message: &CiphertextInfo,
    ) -> Result<Box<dyn RatchetSession>>;

    fn unpickle_session(&self, pickle: &str) -> Result<Box<dyn RatchetSession>>;
}

pub trait RatchetSession: Send + Sync + std::fmt::Debug {
    fn session_id(&self) -> String;

    fn encrypt(&mut self, plaintext: &str) -> Result<CiphertextInfo>;

    /// Must leave the session untouched when it returns an error.
    fn decrypt(&mut self, message: &CiphertextInfo) -> Result<String>;

    fn pickle(&self) -> Result<String>;
}
