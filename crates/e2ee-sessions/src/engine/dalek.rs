//! Reference engine: x25519 triple Diffie-Hellman session setup, HKDF-SHA256
//! symmetric chains and ChaCha20-Poly1305 message encryption.
//!
//! There is no Diffie-Hellman ratchet step; every session keeps the two
//! chains derived at setup for its whole life.

use super::{CryptoEngine, GeneratedKey, IdentityKeys, RatchetSession};
use crate::utils::{decode_base64, decode_key, encode_base64, kdf};
use crate::{CiphertextInfo, ClaimedKey, Error, MessageType, Result, MAX_SKIP};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

const ROOT_INFO: &[u8] = b"E2EE_ROOT";
const CHAIN_INFO: &[u8] = b"E2EE_CHAIN";
const MESSAGE_INFO: &[u8] = b"E2EE_MESSAGE";

#[derive(Clone, Serialize, Deserialize)]
struct OneTimeKeyEntry {
    #[serde(with = "hex::serde")]
    secret: [u8; 32],
    public_key: String,
    published: bool,
}

struct Account {
    signing_key: SigningKey,
    identity_secret: StaticSecret,
    one_time_keys: BTreeMap<String, OneTimeKeyEntry>,
    next_key_id: u32,
}

#[derive(Serialize, Deserialize)]
struct StoredAccount {
    #[serde(with = "hex::serde")]
    signing_key: [u8; 32],
    #[serde(with = "hex::serde")]
    identity_secret: [u8; 32],
    one_time_keys: BTreeMap<String, OneTimeKeyEntry>,
    next_key_id: u32,
}

impl Account {
    fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            identity_secret: StaticSecret::random_from_rng(OsRng),
            one_time_keys: BTreeMap::new(),
            next_key_id: 0,
        }
    }

    fn identity_keys(&self) -> IdentityKeys {
        IdentityKeys {
            curve25519: encode_base64(PublicKey::from(&self.identity_secret).as_bytes()),
            ed25519: encode_base64(self.signing_key.verifying_key().as_bytes()),
        }
    }
}

/// Reference [`CryptoEngine`] backed by the dalek curve crates.
#[derive(Default)]
pub struct DalekEngine {
    account: Mutex<Option<Account>>,
}

impl DalekEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize identity and unconsumed one-time keys.
    pub fn pickle_account(&self) -> Result<Option<String>> {
        let guard = self.lock()?;
        let Some(account) = guard.as_ref() else {
            return Ok(None);
        };
        let stored = StoredAccount {
            signing_key: account.signing_key.to_bytes(),
            identity_secret: account.identity_secret.to_bytes(),
            one_time_keys: account.one_time_keys.clone(),
            next_key_id: account.next_key_id,
        };
        Ok(Some(serde_json::to_string(&stored)?))
    }

    pub fn from_account_pickle(pickle: &str) -> Result<Self> {
        let stored: StoredAccount = serde_json::from_str(pickle)?;
        let account = Account {
            signing_key: SigningKey::from_bytes(&stored.signing_key),
            identity_secret: StaticSecret::from(stored.identity_secret),
            one_time_keys: stored.one_time_keys,
            next_key_id: stored.next_key_id,
        };
        Ok(Self {
            account: Mutex::new(Some(account)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Account>>> {
        self.account
            .lock()
            .map_err(|_| Error::Engine("account lock poisoned".to_string()))
    }
}

impl CryptoEngine for DalekEngine {
    fn generate_identity_keys(&self) -> Result<IdentityKeys> {
        let mut guard = self.lock()?;
        Ok(guard.get_or_insert_with(Account::generate).identity_keys())
    }

    fn identity_keys(&self) -> Option<IdentityKeys> {
        self.lock().ok()?.as_ref().map(Account::identity_keys)
    }

    fn generate_one_time_keys(&self, count: usize) -> Result<Vec<GeneratedKey>> {
        let mut guard = self.lock()?;
        let account = guard.as_mut().ok_or(Error::MissingIdentityKeys)?;

        let mut generated = Vec::with_capacity(count);
        for _ in 0..count {
            account.next_key_id = account
                .next_key_id
                .checked_add(1)
                .ok_or_else(|| Error::Engine("one-time key id space exhausted".to_string()))?;
            let key_id = encode_base64(account.next_key_id.to_be_bytes());
            let secret = StaticSecret::random_from_rng(OsRng);
            let public_key = encode_base64(PublicKey::from(&secret).as_bytes());

            account.one_time_keys.insert(
                key_id.clone(),
                OneTimeKeyEntry {
                    secret: secret.to_bytes(),
                    public_key: public_key.clone(),
                    published: false,
                },
            );
            generated.push(GeneratedKey { key_id, public_key });
        }
        Ok(generated)
    }

    fn unpublished_one_time_keys(&self) -> Vec<GeneratedKey> {
        let Ok(guard) = self.lock() else {
            return Vec::new();
        };
        guard
            .as_ref()
            .map(|account| {
                account
                    .one_time_keys
                    .iter()
                    .filter(|(_, entry)| !entry.published)
                    .map(|(key_id, entry)| GeneratedKey {
                        key_id: key_id.clone(),
                        public_key: entry.public_key.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn mark_keys_as_published(&self, key_ids: &[String]) {
        let Ok(mut guard) = self.lock() else {
            return;
        };
        if let Some(account) = guard.as_mut() {
            for key_id in key_ids {
                if let Some(entry) = account.one_time_keys.get_mut(key_id) {
                    entry.published = true;
                }
            }
        }
    }

    fn sign(&self, message: &str) -> Result<String> {
        let guard = self.lock()?;
        let account = guard.as_ref().ok_or(Error::MissingIdentityKeys)?;
        Ok(encode_base64(
            account.signing_key.sign(message.as_bytes()).to_bytes(),
        ))
    }

    fn establish_outbound_session(
        &self,
        their_identity_key: &str,
        claimed: &ClaimedKey,
    ) -> Result<Box<dyn RatchetSession>> {
        let guard = self.lock()?;
        let account = guard.as_ref().ok_or(Error::MissingIdentityKeys)?;

        let their_identity = PublicKey::from(decode_key(their_identity_key)?);
        let their_one_time_key = PublicKey::from(decode_key(&claimed.bundle.key)?);
        let base_secret = StaticSecret::random_from_rng(OsRng);
        let base_key = encode_base64(PublicKey::from(&base_secret).as_bytes());

        let (initiator_chain, responder_chain) = derive_chains(
            account.identity_secret.diffie_hellman(&their_one_time_key),
            base_secret.diffie_hellman(&their_identity),
            base_secret.diffie_hellman(&their_one_time_key),
        );

        let our_identity_key = account.identity_keys().curve25519;
        let state = SessionState {
            session_id: session_id(&our_identity_key, &base_key, &claimed.bundle.key),
            is_initiator: true,
            received_message: false,
            our_identity_key,
            their_identity_key: their_identity_key.to_string(),
            base_key,
            one_time_key: claimed.bundle.key.clone(),
            sending_chain_key: initiator_chain,
            sending_counter: 0,
            receiving_chain_key: responder_chain,
            receiving_counter: 0,
            skipped_message_keys: BTreeMap::new(),
        };

        Ok(Box::new(DalekSession { state }))
    }

    fn establish_inbound_session(
        &self,
        their_identity_key: &str,
        pre_key_message: &CiphertextInfo,
    ) -> Result<Box<dyn RatchetSession>> {
        if pre_key_message.message_type != MessageType::PreKey {
            return Err(Error::Engine(
                "inbound sessions can only be created from pre-key messages".to_string(),
            ));
        }
        let body: PreKeyBody = decode_body(&pre_key_message.body)?;
        if body.identity_key != their_identity_key {
            return Err(Error::Engine(
                "pre-key message identity key does not match the sender".to_string(),
            ));
        }

        let mut guard = self.lock()?;
        let account = guard.as_mut().ok_or(Error::MissingIdentityKeys)?;

        let (key_id, entry) = account
            .one_time_keys
            .iter()
            .find(|(_, entry)| entry.public_key == body.one_time_key)
            .map(|(key_id, entry)| (key_id.clone(), entry.clone()))
            .ok_or_else(|| Error::Engine("unknown or already used one-time key".to_string()))?;

        let one_time_secret = StaticSecret::from(entry.secret);
        let their_identity = PublicKey::from(decode_key(&body.identity_key)?);
        let base_key = PublicKey::from(decode_key(&body.base_key)?);

        let (initiator_chain, responder_chain) = derive_chains(
            one_time_secret.diffie_hellman(&their_identity),
            account.identity_secret.diffie_hellman(&base_key),
            one_time_secret.diffie_hellman(&base_key),
        );

        let session = DalekSession {
            state: SessionState {
                session_id: session_id(&body.identity_key, &body.base_key, &body.one_time_key),
                is_initiator: false,
                received_message: false,
                our_identity_key: account.identity_keys().curve25519,
                their_identity_key: their_identity_key.to_string(),
                base_key: body.base_key,
                one_time_key: body.one_time_key,
                sending_chain_key: responder_chain,
                sending_counter: 0,
                receiving_chain_key: initiator_chain,
                receiving_counter: 0,
                skipped_message_keys: BTreeMap::new(),
            },
        };

        let mut trial = session.clone();
        trial.decrypt(pre_key_message)?;

        account.one_time_keys.remove(&key_id);
        Ok(Box::new(session))
    }

    fn unpickle_session(&self, pickle: &str) -> Result<Box<dyn RatchetSession>> {
        let state: SessionState = serde_json::from_str(pickle)?;
        Ok(Box::new(DalekSession { state }))
    }
}

fn derive_chains(
    s1: SharedSecret,
    s2: SharedSecret,
    s3: SharedSecret,
) -> ([u8; 32], [u8; 32]) {
    let mut secret = Vec::with_capacity(96);
    secret.extend_from_slice(s1.as_bytes());
    secret.extend_from_slice(s2.as_bytes());
    secret.extend_from_slice(s3.as_bytes());

    let outputs = kdf(&secret, ROOT_INFO, 2);
    (outputs[0], outputs[1])
}

fn session_id(initiator_identity_key: &str, base_key: &str, one_time_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(initiator_identity_key.as_bytes());
    hasher.update(base_key.as_bytes());
    hasher.update(one_time_key.as_bytes());
    encode_base64(hasher.finalize())
}

/// Returns the next chain key and the message key for the current position.
fn advance_chain(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let outputs = kdf(chain_key, CHAIN_INFO, 2);
    (outputs[0], outputs[1])
}

fn message_cipher(message_key: &[u8; 32]) -> (ChaCha20Poly1305, [u8; 12]) {
    let outputs = kdf(message_key, MESSAGE_INFO, 2);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&outputs[1][..12]);
    (ChaCha20Poly1305::new(Key::from_slice(&outputs[0])), nonce)
}

fn associated_data(session_id: &str, counter: u32) -> Vec<u8> {
    let mut aad = session_id.as_bytes().to_vec();
    aad.extend_from_slice(&counter.to_be_bytes());
    aad
}

fn decode_body<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T> {
    Ok(serde_json::from_slice(&decode_base64(body)?)?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RatchetMessage {
    counter: u32,
    ciphertext: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PreKeyBody {
    one_time_key: String,
    base_key: String,
    identity_key: String,
    message: RatchetMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionState {
    session_id: String,
    is_initiator: bool,
    received_message: bool,
    our_identity_key: String,
    their_identity_key: String,
    base_key: String,
    one_time_key: String,
    #[serde(with = "hex::serde")]
    sending_chain_key: [u8; 32],
    sending_counter: u32,
    #[serde(with = "hex::serde")]
    receiving_chain_key: [u8; 32],
    receiving_counter: u32,
    #[serde(with = "serde_skipped_keys")]
    skipped_message_keys: BTreeMap<u32, [u8; 32]>,
}

impl SessionState {
    fn message_key_for(&mut self, counter: u32) -> Result<[u8; 32]> {
        if counter < self.receiving_counter {
            return self.skipped_message_keys.remove(&counter).ok_or_else(|| {
                Error::Engine("message key already used or discarded".to_string())
            });
        }

        if (counter - self.receiving_counter) as usize > MAX_SKIP {
            return Err(Error::Engine("too many skipped messages".to_string()));
        }

        let mut chain_key = self.receiving_chain_key;
        let mut message_key = [0u8; 32];
        for position in self.receiving_counter..=counter {
            let (next_chain_key, key) = advance_chain(&chain_key);
            chain_key = next_chain_key;
            if position == counter {
                message_key = key;
            } else {
                self.skipped_message_keys.insert(position, key);
            }
        }
        while self.skipped_message_keys.len() > MAX_SKIP {
            self.skipped_message_keys.pop_first();
        }

        self.receiving_chain_key = chain_key;
        self.receiving_counter = counter
            .checked_add(1)
            .ok_or_else(|| Error::Engine("receiving chain exhausted".to_string()))?;
        Ok(message_key)
    }
}

#[derive(Debug, Clone)]
struct DalekSession {
    state: SessionState,
}

impl RatchetSession for DalekSession {
    fn session_id(&self) -> String {
        self.state.session_id.clone()
    }

    fn encrypt(&mut self, plaintext: &str) -> Result<CiphertextInfo> {
        let counter = self.state.sending_counter;
        let next_counter = counter
            .checked_add(1)
            .ok_or_else(|| Error::Engine("sending chain exhausted".to_string()))?;
        let (next_chain_key, message_key) = advance_chain(&self.state.sending_chain_key);
        let (cipher, nonce) = message_cipher(&message_key);
        let aad = associated_data(&self.state.session_id, counter);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Engine("encryption failed".to_string()))?;

        self.state.sending_chain_key = next_chain_key;
        self.state.sending_counter = next_counter;

        let message = RatchetMessage {
            counter,
            ciphertext: encode_base64(ciphertext),
        };

        // Until the responder answers, it may not have the session yet.
        if self.state.is_initiator && !self.state.received_message {
            let body = PreKeyBody {
                one_time_key: self.state.one_time_key.clone(),
                base_key: self.state.base_key.clone(),
                identity_key: self.state.our_identity_key.clone(),
                message,
            };
            Ok(CiphertextInfo {
                message_type: MessageType::PreKey,
                body: encode_base64(serde_json::to_vec(&body)?),
            })
        } else {
            Ok(CiphertextInfo {
                message_type: MessageType::Normal,
                body: encode_base64(serde_json::to_vec(&message)?),
            })
        }
    }

    fn decrypt(&mut self, message: &CiphertextInfo) -> Result<String> {
        let ratchet_message = match message.message_type {
            MessageType::PreKey => {
                let body: PreKeyBody = decode_body(&message.body)?;
                if self.state.is_initiator
                    || body.base_key != self.state.base_key
                    || body.one_time_key != self.state.one_time_key
                {
                    return Err(Error::Engine(
                        "pre-key message belongs to another session".to_string(),
                    ));
                }
                body.message
            }
            MessageType::Normal => decode_body(&message.body)?,
        };

        let mut state = self.state.clone();
        let message_key = state.message_key_for(ratchet_message.counter)?;
        let (cipher, nonce) = message_cipher(&message_key);
        let aad = associated_data(&state.session_id, ratchet_message.counter);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &decode_base64(&ratchet_message.ciphertext)?,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Engine("decryption failed".to_string()))?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| Error::Engine("plaintext is not valid UTF-8".to_string()))?;

        state.received_message = true;
        self.state = state;
        Ok(plaintext)
    }

    fn pickle(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.state)?)
    }
}

mod serde_skipped_keys {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(map: &BTreeMap<u32, [u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map_serializer = serializer.serialize_map(Some(map.len()))?;
        for (k, v) in map {
            map_serializer.serialize_entry(k, &hex::encode(v))?;
        }
        map_serializer.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<u32, [u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map: BTreeMap<u32, String> = BTreeMap::deserialize(deserializer)?;
        map.into_iter()
            .map(|(k, v)| {
                let mut array = [0u8; 32];
                hex::decode_to_slice(&v, &mut array).map_err(serde::de::Error::custom)?;
                Ok((k, array))
            })
            .collect()
    }
}
