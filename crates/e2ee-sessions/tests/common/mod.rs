#![allow(dead_code)]

use std::sync::Arc;

use e2ee_sessions::{
    DalekEngine, E2eeClient, E2eeConfig, InMemoryHomeserver, InMemoryStorage, InboundEnvelope,
    Result, StorageAdapter,
};
use tracing_subscriber::EnvFilter;

pub const ALICE: &str = "@alice:example.org";
pub const BOB: &str = "@bob:example.org";
pub const MALLORY: &str = "@mallory:example.org";
pub const ROOM: &str = "!room:example.org";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct TestDevice {
    pub client: E2eeClient,
    pub engine: Arc<DalekEngine>,
    pub storage: Arc<dyn StorageAdapter>,
}

/// A client for `user_id`/`device_id` whose keys are already on the server.
pub async fn device(
    server: &InMemoryHomeserver,
    user_id: &str,
    device_id: &str,
    one_time_keys: usize,
) -> Result<TestDevice> {
    init_tracing();
    let engine = Arc::new(DalekEngine::new());
    let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
    let mut config = E2eeConfig::new(user_id, device_id);
    config.one_time_key_count = one_time_keys;

    let client = E2eeClient::new(
        config,
        engine.clone(),
        Arc::new(server.connect(user_id)),
        Some(storage.clone()),
    );
    client.upload_own_keys().await?;

    Ok(TestDevice {
        client,
        engine,
        storage,
    })
}

pub fn members(user_ids: &[&str]) -> Vec<String> {
    user_ids.iter().map(|id| id.to_string()).collect()
}

/// Content of the `index`-th event sent to `room_id`.
pub fn sent_envelope(server: &InMemoryHomeserver, room_id: &str, index: usize) -> InboundEnvelope {
    let events = server.room_events(room_id);
    serde_json::from_value(events[index].content.clone()).expect("sent event is an olm envelope")
}

pub fn curve25519_key(device: &TestDevice) -> String {
    device
        .client
        .identity_keys()
        .expect("identity keys were generated")
        .curve25519
}
