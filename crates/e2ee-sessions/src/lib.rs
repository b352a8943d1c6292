//! Device identity, one-time key and pairwise session layer for end-to-end
//! encrypted rooms.
//!
//! Devices publish signed identity records and single-use keys, learn and
//! validate the devices of the users they share rooms with, and fan each room
//! event out as one ratchet-encrypted ciphertext per recipient device.

pub mod client;
pub mod config;
pub mod decryptor;
pub mod device;
pub mod device_list;
pub mod device_store;
pub mod encryptor;
pub mod engine;
pub mod error;
pub mod file_storage;
pub mod homeserver;
pub mod key_manager;
pub mod session_cache;
pub mod storage;
pub mod transport;
pub mod types;
pub mod utils;

pub use client::E2eeClient;
pub use config::E2eeConfig;
pub use decryptor::Decryptor;
pub use device::{DeviceIdentity, DeviceList, Signatures, TrustFlags, ValidationError};
pub use device_list::DeviceListTracker;
pub use device_store::DeviceKeyStore;
pub use encryptor::Encryptor;
pub use engine::{CryptoEngine, DalekEngine, GeneratedKey, IdentityKeys, RatchetSession};
pub use error::{Error, Result};
pub use file_storage::FileStorageAdapter;
pub use homeserver::{HomeserverConnection, InMemoryHomeserver, RoomEvent};
pub use key_manager::{ClaimedKey, KeyLifecycleManager, OneTimeKeyBundle, UploadReport};
pub use session_cache::{SessionCache, SessionHandle};
pub use storage::{InMemoryStorage, StorageAdapter};
pub use transport::{
    KeysClaimRequest, KeysClaimResponse, KeysQueryRequest, KeysQueryResponse, Transport,
    UploadKeysRequest, UploadKeysResponse,
};
pub use types::*;
