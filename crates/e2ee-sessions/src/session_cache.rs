use crate::engine::{CryptoEngine, RatchetSession};
use crate::utils::{spawn_shared, SharedResult};
use crate::{
    CiphertextInfo, DeviceKeyStore, Error, KeyLifecycleManager, MessageType, Result,
    StorageAdapter, SIGNED_CURVE25519,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const STORAGE_VERSION: &str = "1";
const MAX_INACTIVE: usize = 10;

type DeviceKey = (String, String);

/// Shared reference to one ratchet session with a remote device.
///
/// Clones refer to the same session; ratchet steps on it are serialized.
#[derive(Clone)]
pub struct SessionHandle {
    user_id: String,
    device_id: String,
    session_id: String,
    session: Arc<Mutex<Box<dyn RatchetSession>>>,
}

impl SessionHandle {
    fn new(user_id: &str, device_id: &str, session: Box<dyn RatchetSession>) -> Self {
        Self {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            session_id: session.session_id(),
            session: Arc::new(Mutex::new(session)),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Sessions with one remote device: the one used for sending, and older ones
/// kept so that messages still in flight on them can be decrypted.
#[derive(Clone)]
struct DeviceSessions {
    active: SessionHandle,
    inactive: Vec<SessionHandle>,
}

impl DeviceSessions {
    fn handles(&self) -> Vec<SessionHandle> {
        std::iter::once(self.active.clone())
            .chain(self.inactive.iter().cloned())
            .collect()
    }

    /// Make `handle` active. Returns sessions evicted from the inactive list.
    fn promote(&mut self, handle: SessionHandle) -> Vec<SessionHandle> {
        if self.active.same_session(&handle) {
            return Vec::new();
        }
        self.inactive.retain(|h| !h.same_session(&handle));
        let previous = std::mem::replace(&mut self.active, handle);
        self.inactive.insert(0, previous);

        if self.inactive.len() > MAX_INACTIVE {
            self.inactive.split_off(MAX_INACTIVE)
        } else {
            Vec::new()
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredDeviceSessions {
    user_id: String,
    device_id: String,
    active: String,
    inactive: Vec<String>,
}

/// Ratchet sessions with remote devices, keyed by (user id, device id).
///
/// Outbound establishment for a device is deduplicated: the first caller
/// starts it on its own task and every concurrent caller awaits that task.
/// A session is in the cache before any caller sees it.
#[derive(Clone)]
pub struct SessionCache {
    engine: Arc<dyn CryptoEngine>,
    keys: KeyLifecycleManager,
    devices: DeviceKeyStore,
    storage: Arc<dyn StorageAdapter>,
    sessions: Arc<Mutex<HashMap<DeviceKey, DeviceSessions>>>,
    pending: Arc<Mutex<HashMap<DeviceKey, SharedResult<SessionHandle>>>>,
}

impl SessionCache {
    pub fn new(
        engine: Arc<dyn CryptoEngine>,
        keys: KeyLifecycleManager,
        devices: DeviceKeyStore,
        storage: Arc<dyn StorageAdapter>,
    ) -> Self {
        Self {
            engine,
            keys,
            devices,
            storage,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Restore every persisted session through the engine.
    pub async fn load(
        engine: Arc<dyn CryptoEngine>,
        keys: KeyLifecycleManager,
        devices: DeviceKeyStore,
        storage: Arc<dyn StorageAdapter>,
    ) -> Result<Self> {
        let cache = Self::new(engine, keys, devices, storage);
        let mut sessions = cache.sessions.lock().await;

        for key in cache.storage.list(&cache.index_prefix())? {
            let Some(data) = cache.storage.get(&key)? else {
                continue;
            };
            let stored: StoredDeviceSessions = match serde_json::from_str(&data) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable session index");
                    continue;
                }
            };

            let Some(active) = cache.restore(&stored.user_id, &stored.device_id, &stored.active)
            else {
                continue;
            };
            let inactive = stored
                .inactive
                .iter()
                .filter_map(|session_id| {
                    cache.restore(&stored.user_id, &stored.device_id, session_id)
                })
                .collect();

            sessions.insert(
                (stored.user_id, stored.device_id),
                DeviceSessions { active, inactive },
            );
        }

        info!(devices = sessions.len(), "Sessions restored");
        drop(sessions);
        Ok(cache)
    }

    /// The session used for sending to the device, if any.
    pub async fn get(&self, user_id: &str, device_id: &str) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .await
            .get(&device_key(user_id, device_id))
            .map(|sessions| sessions.active.clone())
    }

    pub async fn session_count(&self, user_id: &str, device_id: &str) -> usize {
        self.sessions
            .lock()
            .await
            .get(&device_key(user_id, device_id))
            .map_or(0, |sessions| 1 + sessions.inactive.len())
    }

    /// Cached session for the device, or claim a one-time key and establish
    /// one.
    ///
    /// Concurrent callers for the same device share a single establishment.
    /// It keeps running if every caller goes away, and a session it produces
    /// is cached even if nobody is left to receive it.
    pub async fn ensure_outbound_session(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<SessionHandle> {
        if let Some(handle) = self.get(user_id, device_id).await {
            return Ok(handle);
        }

        let key = device_key(user_id, device_id);
        let establishment = {
            let mut pending = self.pending.lock().await;

            // The previous establishment may have finished while we waited.
            if let Some(handle) = self.get(user_id, device_id).await {
                return Ok(handle);
            }

            match pending.get(&key) {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let cache = self.clone();
                    let task_key = key.clone();
                    let establishment =
                        spawn_shared(async move { cache.establish_outbound(task_key).await });
                    pending.insert(key, establishment.clone());
                    establishment
                }
            }
        };

        establishment.await
    }

    async fn establish_outbound(&self, key: DeviceKey) -> Result<SessionHandle> {
        let (user_id, device_id) = (key.0.as_str(), key.1.as_str());
        let result = self.create_outbound(user_id, device_id).await;

        let mut pending = self.pending.lock().await;
        if let Ok(handle) = &result {
            self.install(handle.clone()).await;
        }
        pending.remove(&key);
        result
    }

    async fn create_outbound(&self, user_id: &str, device_id: &str) -> Result<SessionHandle> {
        let identity_key = self.identity_key(user_id, device_id).await?;
        let claimed = self
            .keys
            .claim_one_time_key(user_id, device_id, SIGNED_CURVE25519)
            .await?;
        let session = self
            .engine
            .establish_outbound_session(&identity_key, &claimed)?;

        debug!(user_id, device_id, session_id = %session.session_id(), "Established outbound session");
        Ok(SessionHandle::new(user_id, device_id, session))
    }

    /// Establish the receiving side of a session from a pre-key message when
    /// nothing is cached for the device. A cached session is returned as is.
    pub async fn ensure_inbound_session(
        &self,
        user_id: &str,
        device_id: &str,
        pre_key_message: &CiphertextInfo,
    ) -> Result<SessionHandle> {
        if let Some(handle) = self.get(user_id, device_id).await {
            return Ok(handle);
        }
        self.establish_inbound(user_id, device_id, pre_key_message, false)
            .await
    }

    /// Establish a new session from a pre-key message that no cached session
    /// decrypts, and make it the active one.
    pub async fn replace_inbound_session(
        &self,
        user_id: &str,
        device_id: &str,
        pre_key_message: &CiphertextInfo,
    ) -> Result<SessionHandle> {
        self.establish_inbound(user_id, device_id, pre_key_message, true)
            .await
    }

    async fn establish_inbound(
        &self,
        user_id: &str,
        device_id: &str,
        pre_key_message: &CiphertextInfo,
        replace: bool,
    ) -> Result<SessionHandle> {
        let identity_key = self.identity_key(user_id, device_id).await?;

        // No await between the check and the insert, so a cancelled caller
        // either left the cache untouched or finished the insert.
        let mut sessions = self.sessions.lock().await;
        let key = device_key(user_id, device_id);
        if !replace {
            if let Some(existing) = sessions.get(&key) {
                return Ok(existing.active.clone());
            }
        }

        let session = self
            .engine
            .establish_inbound_session(&identity_key, pre_key_message)?;
        self.save_session(user_id, device_id, &*session);
        let handle = SessionHandle::new(user_id, device_id, session);
        debug!(user_id, device_id, session_id = %handle.session_id(), "Established inbound session");

        self.install_locked(&mut sessions, handle.clone());
        Ok(handle)
    }

    /// Encrypt with the device's active session, establishing one if needed.
    pub async fn encrypt(
        &self,
        user_id: &str,
        device_id: &str,
        plaintext: &str,
    ) -> Result<CiphertextInfo> {
        let handle = self.ensure_outbound_session(user_id, device_id).await?;
        let mut session = handle.session.lock().await;
        let ciphertext = session.encrypt(plaintext)?;
        self.save_session(user_id, device_id, &**session);
        Ok(ciphertext)
    }

    /// Decrypt a message from the device.
    ///
    /// Cached sessions are tried newest first and the one that works becomes
    /// active. A pre-key message none of them can read starts a new session.
    pub async fn decrypt(
        &self,
        user_id: &str,
        device_id: &str,
        message: &CiphertextInfo,
    ) -> Result<String> {
        let handles = self
            .sessions
            .lock()
            .await
            .get(&device_key(user_id, device_id))
            .map(DeviceSessions::handles)
            .unwrap_or_default();

        for handle in &handles {
            let mut session = handle.session.lock().await;
            if let Ok(plaintext) = session.decrypt(message) {
                self.save_session(user_id, device_id, &**session);
                drop(session);
                self.install(handle.clone()).await;
                return Ok(plaintext);
            }
        }

        if message.message_type != MessageType::PreKey {
            return Err(Error::Engine(
                "no session for this device can decrypt the message".to_string(),
            ));
        }

        self.decrypt_with_new_session(user_id, device_id, message, !handles.is_empty())
            .await
    }

    /// Decrypt a pre-key message that none of the sessions seen by the caller
    /// could read.
    ///
    /// With nothing cached, a session installed by a concurrent decrypt may
    /// come back from `ensure_inbound_session`. If that one cannot read the
    /// message either, a new session is established from it.
    async fn decrypt_with_new_session(
        &self,
        user_id: &str,
        device_id: &str,
        message: &CiphertextInfo,
        sessions_cached: bool,
    ) -> Result<String> {
        if !sessions_cached {
            let handle = self
                .ensure_inbound_session(user_id, device_id, message)
                .await?;
            let mut session = handle.session.lock().await;
            if let Ok(plaintext) = session.decrypt(message) {
                self.save_session(user_id, device_id, &**session);
                return Ok(plaintext);
            }
            debug!(user_id, device_id, "Cached session cannot read the pre-key message");
        }

        let handle = self
            .replace_inbound_session(user_id, device_id, message)
            .await?;
        let mut session = handle.session.lock().await;
        let plaintext = session.decrypt(message)?;
        self.save_session(user_id, device_id, &**session);
        Ok(plaintext)
    }

    async fn identity_key(&self, user_id: &str, device_id: &str) -> Result<String> {
        self.devices
            .get(user_id, device_id)
            .await
            .and_then(|device| device.curve25519_key().map(str::to_string))
            .ok_or_else(|| Error::NoSuchDevice {
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
            })
    }

    async fn install(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.lock().await;
        self.install_locked(&mut sessions, handle);
    }

    fn install_locked(&self, sessions: &mut HashMap<DeviceKey, DeviceSessions>, handle: SessionHandle) {
        let key = device_key(&handle.user_id, &handle.device_id);
        let evicted = match sessions.get_mut(&key) {
            Some(existing) => existing.promote(handle),
            None => {
                sessions.insert(
                    key.clone(),
                    DeviceSessions {
                        active: handle,
                        inactive: Vec::new(),
                    },
                );
                Vec::new()
            }
        };

        if let Some(device_sessions) = sessions.get(&key) {
            self.save_index(device_sessions);
        }
        for handle in evicted {
            let key = self.session_key(&handle.user_id, &handle.device_id, &handle.session_id);
            if let Err(e) = self.storage.del(&key) {
                warn!(error = %e, "Failed to delete evicted session");
            }
        }
    }

    fn restore(&self, user_id: &str, device_id: &str, session_id: &str) -> Option<SessionHandle> {
        let key = self.session_key(user_id, device_id, session_id);
        let pickle = match self.storage.get(&key) {
            Ok(Some(pickle)) => pickle,
            Ok(None) => {
                warn!(user_id, device_id, session_id, "Session pickle missing");
                return None;
            }
            Err(e) => {
                warn!(user_id, device_id, error = %e, "Failed to read session");
                return None;
            }
        };

        match self.engine.unpickle_session(&pickle) {
            Ok(session) => Some(SessionHandle::new(user_id, device_id, session)),
            Err(e) => {
                warn!(user_id, device_id, error = %e, "Failed to unpickle session");
                None
            }
        }
    }

    // Storage failures never undo a ratchet step that already happened; they
    // are logged and the in-memory session stays authoritative.
    fn save_session(&self, user_id: &str, device_id: &str, session: &dyn RatchetSession) {
        let key = self.session_key(user_id, device_id, &session.session_id());
        let result = session
            .pickle()
            .and_then(|pickle| self.storage.put(&key, pickle));
        if let Err(e) = result {
            warn!(user_id, device_id, error = %e, "Failed to persist session");
        }
    }

    fn save_index(&self, sessions: &DeviceSessions) {
        let stored = StoredDeviceSessions {
            user_id: sessions.active.user_id.clone(),
            device_id: sessions.active.device_id.clone(),
            active: sessions.active.session_id.clone(),
            inactive: sessions
                .inactive
                .iter()
                .map(|h| h.session_id.clone())
                .collect(),
        };
        let key = format!("{}{}/{}", self.index_prefix(), stored.user_id, stored.device_id);
        let result = serde_json::to_string(&stored)
            .map_err(Error::from)
            .and_then(|data| self.storage.put(&key, data));
        if let Err(e) = result {
            warn!(user_id = %stored.user_id, device_id = %stored.device_id, error = %e, "Failed to persist session index");
        }
    }

    fn session_key(&self, user_id: &str, device_id: &str, session_id: &str) -> String {
        format!("{}{}/{}/{}", self.session_prefix(), user_id, device_id, session_id)
    }

    fn session_prefix(&self) -> String {
        format!("v{}/sessions/", STORAGE_VERSION)
    }

    fn index_prefix(&self) -> String {
        format!("v{}/session-index/", STORAGE_VERSION)
    }
}

fn device_key(user_id: &str, device_id: &str) -> DeviceKey {
    (user_id.to_string(), device_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DalekEngine;
    use crate::{InMemoryHomeserver, InMemoryStorage};
    use std::collections::BTreeMap;

    const ALICE: &str = "@alice:example.org";
    const BOB: &str = "@bob:example.org";

    struct Side {
        engine: Arc<DalekEngine>,
        keys: KeyLifecycleManager,
        devices: DeviceKeyStore,
        storage: Arc<dyn StorageAdapter>,
        cache: SessionCache,
    }

    fn side(server: &InMemoryHomeserver, user_id: &str) -> Side {
        let engine = Arc::new(DalekEngine::new());
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let devices = DeviceKeyStore::new(storage.clone());
        let keys = KeyLifecycleManager::new(
            user_id,
            engine.clone(),
            Arc::new(server.connect(user_id)),
            devices.clone(),
            10,
        );
        let cache = SessionCache::new(engine.clone(), keys.clone(), devices.clone(), storage.clone());
        Side {
            engine,
            keys,
            devices,
            storage,
            cache,
        }
    }

    async fn learn(side: &Side, server: &InMemoryHomeserver, user_id: &str, device_id: &str) {
        let record = server.device_record(user_id, device_id).unwrap();
        side.devices
            .upsert_user(user_id, &BTreeMap::from([(device_id.to_string(), record)]))
            .await
            .unwrap();
    }

    async fn pair() -> (InMemoryHomeserver, Side, Side) {
        let server = InMemoryHomeserver::new();
        let alice = side(&server, ALICE);
        let bob = side(&server, BOB);
        alice.keys.generate_and_upload_own_keys("ALICEDEV", 3).await.unwrap();
        bob.keys.generate_and_upload_own_keys("BOBDEV", 3).await.unwrap();
        learn(&alice, &server, BOB, "BOBDEV").await;
        learn(&bob, &server, ALICE, "ALICEDEV").await;
        (server, alice, bob)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_establishment() {
        let (server, alice, _bob) = pair().await;

        let (a, b, c) = tokio::join!(
            alice.cache.ensure_outbound_session(BOB, "BOBDEV"),
            alice.cache.ensure_outbound_session(BOB, "BOBDEV"),
            alice.cache.ensure_outbound_session(BOB, "BOBDEV"),
        );

        let a = a.unwrap();
        assert!(a.same_session(&b.unwrap()));
        assert!(a.same_session(&c.unwrap()));
        assert_eq!(server.claim_request_count(), 1);
        assert_eq!(server.one_time_key_count(BOB, "BOBDEV", SIGNED_CURVE25519), 2);
    }

    #[tokio::test]
    async fn dropped_caller_still_caches_the_session() {
        let (server, alice, _bob) = pair().await;

        let mut caller = Box::pin(alice.cache.ensure_outbound_session(BOB, "BOBDEV"));
        assert!(futures::poll!(&mut caller).is_pending());
        drop(caller);

        for _ in 0..100 {
            if alice.cache.get(BOB, "BOBDEV").await.is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(alice.cache.get(BOB, "BOBDEV").await.is_some());

        alice.cache.ensure_outbound_session(BOB, "BOBDEV").await.unwrap();
        assert_eq!(server.claim_request_count(), 1);
    }

    #[tokio::test]
    async fn failed_establishment_caches_nothing() {
        let (server, alice, _bob) = pair().await;
        server.set_offline(true);

        let err = alice.cache.ensure_outbound_session(BOB, "BOBDEV").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(alice.cache.get(BOB, "BOBDEV").await.is_none());

        server.set_offline(false);
        assert!(alice.cache.ensure_outbound_session(BOB, "BOBDEV").await.is_ok());
    }

    #[tokio::test]
    async fn unknown_device_is_rejected_before_claiming() {
        let (server, alice, _bob) = pair().await;
        let err = alice.cache.ensure_outbound_session(BOB, "NOPE").await.unwrap_err();
        assert!(matches!(err, Error::NoSuchDevice { .. }));
        assert_eq!(server.claim_request_count(), 0);
    }

    #[tokio::test]
    async fn inbound_session_is_reused_for_later_messages() {
        let (_server, alice, bob) = pair().await;

        let first = alice.cache.encrypt(BOB, "BOBDEV", "one").await.unwrap();
        let second = alice.cache.encrypt(BOB, "BOBDEV", "two").await.unwrap();
        assert_eq!(first.message_type, MessageType::PreKey);

        assert_eq!(bob.cache.decrypt(ALICE, "ALICEDEV", &first).await.unwrap(), "one");
        let handle = bob.cache.get(ALICE, "ALICEDEV").await.unwrap();
        assert_eq!(bob.cache.decrypt(ALICE, "ALICEDEV", &second).await.unwrap(), "two");
        assert!(handle.same_session(&bob.cache.get(ALICE, "ALICEDEV").await.unwrap()));
        assert_eq!(bob.cache.session_count(ALICE, "ALICEDEV").await, 1);
    }

    #[tokio::test]
    async fn normal_message_without_session_fails() {
        let (_server, alice, bob) = pair().await;
        let first = alice.cache.encrypt(BOB, "BOBDEV", "one").await.unwrap();
        bob.cache.decrypt(ALICE, "ALICEDEV", &first).await.unwrap();
        let reply = bob.cache.encrypt(ALICE, "ALICEDEV", "reply").await.unwrap();
        assert_eq!(reply.message_type, MessageType::Normal);

        let stranger = side(&InMemoryHomeserver::new(), ALICE);
        assert!(stranger.cache.decrypt(BOB, "BOBDEV", &reply).await.is_err());
    }

    #[tokio::test]
    async fn simultaneous_initiation_keeps_both_sessions_readable() {
        let (_server, alice, bob) = pair().await;

        let from_alice = alice.cache.encrypt(BOB, "BOBDEV", "from alice").await.unwrap();
        let from_bob = bob.cache.encrypt(ALICE, "ALICEDEV", "from bob").await.unwrap();

        assert_eq!(
            bob.cache.decrypt(ALICE, "ALICEDEV", &from_alice).await.unwrap(),
            "from alice"
        );
        assert_eq!(
            alice.cache.decrypt(BOB, "BOBDEV", &from_bob).await.unwrap(),
            "from bob"
        );
        assert_eq!(bob.cache.session_count(ALICE, "ALICEDEV").await, 2);

        let next = alice.cache.encrypt(BOB, "BOBDEV", "after").await.unwrap();
        assert_eq!(bob.cache.decrypt(ALICE, "ALICEDEV", &next).await.unwrap(), "after");
    }

    #[tokio::test]
    async fn sessions_survive_a_reload() {
        let (_server, alice, bob) = pair().await;
        let first = alice.cache.encrypt(BOB, "BOBDEV", "one").await.unwrap();
        bob.cache.decrypt(ALICE, "ALICEDEV", &first).await.unwrap();

        let devices = DeviceKeyStore::load(bob.storage.clone()).await.unwrap();
        let reloaded = SessionCache::load(bob.engine.clone(), bob.keys.clone(), devices, bob.storage.clone())
            .await
            .unwrap();

        let second = alice.cache.encrypt(BOB, "BOBDEV", "two").await.unwrap();
        assert_eq!(reloaded.decrypt(ALICE, "ALICEDEV", &second).await.unwrap(), "two");
    }

    #[tokio::test]
    async fn pre_key_message_racing_another_establishment_still_decrypts() {
        let (_server, alice, bob) = pair().await;
        let first = alice.cache.encrypt(BOB, "BOBDEV", "one").await.unwrap();

        // A second session from the same device, unknown to Alice's cache.
        let claimed = alice
            .keys
            .claim_one_time_key(BOB, "BOBDEV", SIGNED_CURVE25519)
            .await
            .unwrap();
        let bob_key = bob.engine.identity_keys().unwrap().curve25519;
        let mut other = alice
            .engine
            .establish_outbound_session(&bob_key, &claimed)
            .unwrap();
        let second = other.encrypt("two").unwrap();
        assert_eq!(second.message_type, MessageType::PreKey);

        // The first session lands after this decrypt saw an empty cache.
        bob.cache
            .ensure_inbound_session(ALICE, "ALICEDEV", &first)
            .await
            .unwrap();
        let plaintext = bob
            .cache
            .decrypt_with_new_session(ALICE, "ALICEDEV", &second, false)
            .await
            .unwrap();

        assert_eq!(plaintext, "two");
        assert_eq!(bob.cache.session_count(ALICE, "ALICEDEV").await, 2);
        assert_eq!(bob.cache.decrypt(ALICE, "ALICEDEV", &first).await.unwrap(), "one");
    }
}
