//! In-process stand-in for the server side of the key endpoints.
//!
//! Keeps uploaded device records and one-time keys, hands each one-time key
//! out at most once and counts the requests it serves. A few switches inject
//! the failures a real deployment produces (unreachable federation peers,
//! rejected uploads, a server that is down, slow queries).

use crate::transport::{
    KeysClaimRequest, KeysClaimResponse, KeysQueryRequest, KeysQueryResponse, Transport,
    UploadKeysRequest, UploadKeysResponse,
};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct RoomEvent {
    pub event_id: String,
    pub sender: String,
    pub event_type: String,
    pub content: Value,
}

#[derive(Default)]
struct ServerState {
    device_keys: BTreeMap<String, BTreeMap<String, Value>>,
    one_time_keys: BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>,
    room_events: BTreeMap<String, Vec<RoomEvent>>,
    query_counts: BTreeMap<String, usize>,
    query_requests: usize,
    claim_requests: usize,
    next_event_id: u64,
    offline: bool,
    reject_one_time_keys: bool,
    unreachable_users: BTreeSet<String>,
    query_delay: Option<Duration>,
}

impl ServerState {
    fn one_time_key_counts(&self, user_id: &str, device_id: &str) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        if let Some(keys) = self
            .one_time_keys
            .get(user_id)
            .and_then(|devices| devices.get(device_id))
        {
            for key_id in keys.keys() {
                let algorithm = key_id.split(':').next().unwrap_or_default();
                *counts.entry(algorithm.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline {
            return Err(Error::Transport("homeserver unreachable".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryHomeserver {
    state: Arc<Mutex<ServerState>>,
}

impl InMemoryHomeserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`Transport`] authenticated as `user_id`.
    pub fn connect(&self, user_id: impl Into<String>) -> HomeserverConnection {
        HomeserverConnection {
            server: self.clone(),
            user_id: user_id.into(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every request fails with a transport error while set.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn reject_one_time_key_uploads(&self, reject: bool) {
        self.state().reject_one_time_keys = reject;
    }

    /// Queries and claims for `user_id` are reported under `failures`.
    pub fn set_unreachable(&self, user_id: &str, unreachable: bool) {
        let mut state = self.state();
        if unreachable {
            state.unreachable_users.insert(user_id.to_string());
        } else {
            state.unreachable_users.remove(user_id);
        }
    }

    pub fn set_query_delay(&self, delay: Option<Duration>) {
        self.state().query_delay = delay;
    }

    /// Store a raw device record as is, bypassing the upload checks.
    pub fn insert_device_record(&self, user_id: &str, device_id: &str, record: Value) {
        self.state()
            .device_keys
            .entry(user_id.to_string())
            .or_default()
            .insert(device_id.to_string(), record);
    }

    /// Store a raw one-time key as is, bypassing the upload checks.
    pub fn insert_one_time_key(&self, user_id: &str, device_id: &str, key_id: &str, key: Value) {
        self.state()
            .one_time_keys
            .entry(user_id.to_string())
            .or_default()
            .entry(device_id.to_string())
            .or_default()
            .insert(key_id.to_string(), key);
    }

    pub fn device_record(&self, user_id: &str, device_id: &str) -> Option<Value> {
        self.state()
            .device_keys
            .get(user_id)
            .and_then(|devices| devices.get(device_id))
            .cloned()
    }

    pub fn remove_device(&self, user_id: &str, device_id: &str) {
        let mut state = self.state();
        if let Some(devices) = state.device_keys.get_mut(user_id) {
            devices.remove(device_id);
        }
        if let Some(devices) = state.one_time_keys.get_mut(user_id) {
            devices.remove(device_id);
        }
    }

    pub fn one_time_key_count(&self, user_id: &str, device_id: &str, algorithm: &str) -> u64 {
        self.state()
            .one_time_key_counts(user_id, device_id)
            .get(algorithm)
            .copied()
            .unwrap_or(0)
    }

    /// How many `/keys/query` requests named `user_id`.
    pub fn query_count(&self, user_id: &str) -> usize {
        self.state().query_counts.get(user_id).copied().unwrap_or(0)
    }

    pub fn query_request_count(&self) -> usize {
        self.state().query_requests
    }

    pub fn claim_request_count(&self) -> usize {
        self.state().claim_requests
    }

    pub fn room_events(&self, room_id: &str) -> Vec<RoomEvent> {
        self.state()
            .room_events
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }
}

pub struct HomeserverConnection {
    server: InMemoryHomeserver,
    user_id: String,
}

impl HomeserverConnection {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

#[async_trait]
impl Transport for HomeserverConnection {
    async fn upload_keys(
        &self,
        device_id: &str,
        request: UploadKeysRequest,
    ) -> Result<UploadKeysResponse> {
        let mut state = self.server.state();
        state.ensure_online()?;

        match request {
            UploadKeysRequest::DeviceKeys(record) => {
                let owner = record.get("user_id").and_then(Value::as_str);
                let device = record.get("device_id").and_then(Value::as_str);
                if owner != Some(self.user_id.as_str()) || device != Some(device_id) {
                    return Err(Error::Transport(
                        "device keys do not belong to the uploading device".to_string(),
                    ));
                }
                state
                    .device_keys
                    .entry(self.user_id.clone())
                    .or_default()
                    .insert(device_id.to_string(), record);
            }
            UploadKeysRequest::OneTimeKeys(keys) => {
                if state.reject_one_time_keys {
                    return Err(Error::Transport("one-time key upload rejected".to_string()));
                }
                let stored = state
                    .one_time_keys
                    .entry(self.user_id.clone())
                    .or_default()
                    .entry(device_id.to_string())
                    .or_default();
                for (key_id, key) in keys {
                    stored.insert(key_id, key);
                }
            }
        }

        debug!(user_id = %self.user_id, device_id, "Keys uploaded");
        Ok(UploadKeysResponse {
            one_time_key_counts: state.one_time_key_counts(&self.user_id, device_id),
        })
    }

    async fn query_keys(&self, request: KeysQueryRequest) -> Result<KeysQueryResponse> {
        let delay = {
            let state = self.server.state();
            state.ensure_online()?;
            state.query_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.server.state();
        state.ensure_online()?;
        state.query_requests += 1;

        let mut response = KeysQueryResponse::default();
        for (user_id, wanted) in request.device_keys {
            *state.query_counts.entry(user_id.clone()).or_insert(0) += 1;

            if state.unreachable_users.contains(&user_id) {
                response
                    .failures
                    .insert(user_id, json!({ "status": 503, "message": "Not ready for retry" }));
                continue;
            }

            let devices = state
                .device_keys
                .get(&user_id)
                .map(|devices| {
                    devices
                        .iter()
                        .filter(|(device_id, _)| wanted.is_empty() || wanted.contains_key(*device_id))
                        .map(|(device_id, record)| (device_id.clone(), record.clone()))
                        .collect()
                })
                .unwrap_or_default();
            response.device_keys.insert(user_id, devices);
        }

        Ok(response)
    }

    async fn claim_keys(&self, request: KeysClaimRequest) -> Result<KeysClaimResponse> {
        let mut state = self.server.state();
        state.ensure_online()?;
        state.claim_requests += 1;

        let mut response = KeysClaimResponse::default();
        for (user_id, devices) in request.one_time_keys {
            if state.unreachable_users.contains(&user_id) {
                response
                    .failures
                    .insert(user_id, json!({ "status": 503, "message": "Not ready for retry" }));
                continue;
            }

            for (device_id, algorithm) in devices {
                let Some(keys) = state
                    .one_time_keys
                    .get_mut(&user_id)
                    .and_then(|devices| devices.get_mut(&device_id))
                else {
                    continue;
                };

                let prefix = format!("{algorithm}:");
                let Some(key_id) = keys.keys().find(|id| id.starts_with(&prefix)).cloned() else {
                    continue;
                };
                if let Some(key) = keys.remove(&key_id) {
                    response
                        .one_time_keys
                        .entry(user_id.clone())
                        .or_default()
                        .entry(device_id)
                        .or_default()
                        .insert(key_id, key);
                }
            }
        }

        Ok(response)
    }

    async fn send_room_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String> {
        let mut state = self.server.state();
        state.ensure_online()?;

        state.next_event_id += 1;
        let event_id = format!("${}", state.next_event_id);
        state
            .room_events
            .entry(room_id.to_string())
            .or_default()
            .push(RoomEvent {
                event_id: event_id.clone(),
                sender: self.user_id.clone(),
                event_type: event_type.to_string(),
                content,
            });

        Ok(event_id)
    }
}
