use crate::engine::{CryptoEngine, IdentityKeys};
use crate::transport::Transport;
use crate::{
    DecryptionOutcome, Decryptor, DeviceKeyStore, DeviceListSignal, DeviceListTracker,
    E2eeConfig, Encryptor, FailurePlaceholder, FailureReason, InMemoryStorage, InboundEnvelope,
    KeyLifecycleManager, OutboundEnvelope, PlaintextEvent, Result, SessionCache, StorageAdapter,
    UploadReport, ROOM_ENCRYPTED_EVENT_TYPE,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Everything one logged-in device needs to send and receive encrypted room
/// events.
#[derive(Clone)]
pub struct E2eeClient {
    config: E2eeConfig,
    engine: Arc<dyn CryptoEngine>,
    transport: Arc<dyn Transport>,
    devices: DeviceKeyStore,
    keys: KeyLifecycleManager,
    sessions: SessionCache,
    tracker: DeviceListTracker,
    encryptor: Encryptor,
    decryptor: Decryptor,
}

impl E2eeClient {
    /// A client with empty stores. Without `storage`, state lives in memory.
    pub fn new(
        config: E2eeConfig,
        engine: Arc<dyn CryptoEngine>,
        transport: Arc<dyn Transport>,
        storage: Option<Arc<dyn StorageAdapter>>,
    ) -> Self {
        let storage = storage.unwrap_or_else(|| Arc::new(InMemoryStorage::new()));
        let devices = DeviceKeyStore::new(storage.clone());
        let keys = Self::key_manager(&config, &engine, &transport, &devices);
        let sessions = SessionCache::new(engine.clone(), keys.clone(), devices.clone(), storage);
        Self::assemble(config, engine, transport, devices, keys, sessions)
    }

    /// A client whose device lists and sessions are restored from `storage`,
    /// or from the store the config points at.
    pub async fn load(
        config: E2eeConfig,
        engine: Arc<dyn CryptoEngine>,
        transport: Arc<dyn Transport>,
        storage: Option<Arc<dyn StorageAdapter>>,
    ) -> Result<Self> {
        let storage = match storage {
            Some(storage) => storage,
            None => config.open_storage()?,
        };
        let devices = DeviceKeyStore::load(storage.clone()).await?;
        let keys = Self::key_manager(&config, &engine, &transport, &devices);
        let sessions =
            SessionCache::load(engine.clone(), keys.clone(), devices.clone(), storage).await?;
        info!(user_id = %config.user_id, device_id = %config.device_id, "Client restored");
        Ok(Self::assemble(config, engine, transport, devices, keys, sessions))
    }

    fn key_manager(
        config: &E2eeConfig,
        engine: &Arc<dyn CryptoEngine>,
        transport: &Arc<dyn Transport>,
        devices: &DeviceKeyStore,
    ) -> KeyLifecycleManager {
        KeyLifecycleManager::new(
            config.user_id.clone(),
            engine.clone(),
            transport.clone(),
            devices.clone(),
            config.one_time_key_count,
        )
    }

    fn assemble(
        config: E2eeConfig,
        engine: Arc<dyn CryptoEngine>,
        transport: Arc<dyn Transport>,
        devices: DeviceKeyStore,
        keys: KeyLifecycleManager,
        sessions: SessionCache,
    ) -> Self {
        let tracker = DeviceListTracker::new(transport.clone(), devices.clone());
        let encryptor = Encryptor::new(
            config.user_id.clone(),
            config.device_id.clone(),
            engine.clone(),
            devices.clone(),
            sessions.clone(),
        );
        let decryptor = Decryptor::new(
            config.user_id.clone(),
            engine.clone(),
            devices.clone(),
            sessions.clone(),
        );
        Self {
            config,
            engine,
            transport,
            devices,
            keys,
            sessions,
            tracker,
            encryptor,
            decryptor,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn identity_keys(&self) -> Option<IdentityKeys> {
        self.engine.identity_keys()
    }

    pub fn devices(&self) -> &DeviceKeyStore {
        &self.devices
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    pub fn device_lists(&self) -> &DeviceListTracker {
        &self.tracker
    }

    pub fn keys(&self) -> &KeyLifecycleManager {
        &self.keys
    }

    /// Publish identity keys and the configured number of one-time keys.
    pub async fn upload_own_keys(&self) -> Result<UploadReport> {
        self.keys
            .generate_and_upload_own_keys(&self.config.device_id, self.config.one_time_key_count)
            .await
    }

    /// Top the server back up to the configured one-time key count, given how
    /// many it reports holding.
    pub async fn replenish_one_time_keys(&self, server_count: u64) -> Result<UploadReport> {
        let count = self.keys.one_time_keys_to_replenish(server_count);
        self.keys
            .upload_one_time_keys(&self.config.device_id, count)
            .await
    }

    /// Refresh stale member device lists and encrypt `event` for every device
    /// of every member except this one.
    #[instrument(skip_all, fields(user_id = %self.config.user_id))]
    pub async fn encrypt_room_event(
        &self,
        member_user_ids: &[String],
        event: &PlaintextEvent,
    ) -> Result<OutboundEnvelope> {
        self.tracker.ensure_fresh(member_user_ids).await?;

        let mut recipients = Vec::new();
        for user_id in member_user_ids.iter().collect::<BTreeSet<_>>() {
            let Some(list) = self.devices.get_user(user_id).await else {
                continue;
            };
            for device_id in list.device_ids() {
                if *user_id == self.config.user_id && device_id == self.config.device_id {
                    continue;
                }
                recipients.push((user_id.clone(), device_id));
            }
        }

        self.encryptor.encrypt_for_room(event, &recipients).await
    }

    /// Encrypt `event` for the room members and send it as `m.room.encrypted`.
    /// Returns the server-assigned event id.
    pub async fn send_room_event(
        &self,
        room_id: &str,
        member_user_ids: &[String],
        event: &PlaintextEvent,
    ) -> Result<String> {
        let envelope = self.encrypt_room_event(member_user_ids, event).await?;
        let content = serde_json::to_value(&envelope)?;
        let event_id = self
            .transport
            .send_room_event(room_id, ROOM_ENCRYPTED_EVENT_TYPE, content)
            .await?;
        debug!(room_id, event_id = %event_id, recipients = envelope.recipient_count(), "Encrypted event sent");
        Ok(event_id)
    }

    /// Decrypt an `m.room.encrypted` payload from `sender`.
    ///
    /// An unknown sender device marks the sender stale so the next send or
    /// refresh picks the new device up.
    pub async fn receive_room_event(
        &self,
        sender: &str,
        envelope: &InboundEnvelope,
    ) -> DecryptionOutcome {
        let Some(identity) = self.engine.identity_keys() else {
            return DecryptionOutcome::Undecryptable(FailurePlaceholder::new(
                sender,
                FailureReason::NotAddressedToUs,
            ));
        };

        let outcome = self
            .decryptor
            .decrypt(sender, envelope, &identity.curve25519)
            .await;
        if outcome.failure_reason() == Some(FailureReason::UnknownSenderDevice) {
            self.tracker.mark_stale(sender).await;
        }
        outcome
    }

    pub async fn receive_device_list_signal(&self, signal: &DeviceListSignal) {
        self.tracker.receive_device_list_signal(signal).await;
    }

    pub async fn receive_sync_device_lists(&self, changed: &[String], left: &[String]) {
        self.tracker.receive_device_list_changes(changed, left).await;
    }

    pub async fn set_device_blocked(&self, user_id: &str, device_id: &str, blocked: bool) -> Result<bool> {
        self.devices.set_blocked(user_id, device_id, blocked).await
    }

    pub async fn set_device_verified(&self, user_id: &str, device_id: &str, verified: bool) -> Result<bool> {
        self.devices.set_verified(user_id, device_id, verified).await
    }
}
