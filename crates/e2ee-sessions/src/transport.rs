//! Request and response bodies of the key endpoints, and the seam through
//! which the crate talks to a homeserver.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Body of `/keys/upload`. Device keys and one-time keys travel in separate
/// requests so a rejection of one is never ambiguous about the other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadKeysRequest {
    /// The signed device record.
    DeviceKeys(Value),
    /// `"<algorithm>:<key id>"` → signed key object.
    OneTimeKeys(BTreeMap<String, Value>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadKeysResponse {
    /// Unclaimed one-time keys the server holds for the device, per algorithm.
    #[serde(default)]
    pub one_time_key_counts: BTreeMap<String, u64>,
}

/// Body of `/keys/query`: user id → device id filter. An empty filter means
/// "all devices".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysQueryRequest {
    pub device_keys: BTreeMap<String, Map<String, Value>>,
}

impl KeysQueryRequest {
    pub fn for_users<I, S>(user_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            device_keys: user_ids
                .into_iter()
                .map(|user_id| (user_id.into(), Map::new()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    /// user id → device id → raw signed device record.
    #[serde(default)]
    pub device_keys: BTreeMap<String, BTreeMap<String, Value>>,
    /// Remote servers that could not be reached, keyed by user or server.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// Body of `/keys/claim`: user id → device id → algorithm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysClaimRequest {
    pub one_time_keys: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// user id → device id → `"<algorithm>:<key id>"` → key.
    #[serde(default)]
    pub one_time_keys: BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>,
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// Authenticated connection of one local user to their homeserver.
///
/// Implementations report every failure as [`crate::Error::Transport`] and do
/// not retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn upload_keys(
        &self,
        device_id: &str,
        request: UploadKeysRequest,
    ) -> Result<UploadKeysResponse>;

    async fn query_keys(&self, request: KeysQueryRequest) -> Result<KeysQueryResponse>;

    async fn claim_keys(&self, request: KeysClaimRequest) -> Result<KeysClaimResponse>;

    /// Returns the event id the server assigned.
    async fn send_room_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_request_asks_for_all_devices() {
        let request = KeysQueryRequest::for_users(["@a:x", "@b:x"]);
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"device_keys": {"@a:x": {}, "@b:x": {}}})
        );
    }

    #[test]
    fn responses_tolerate_missing_sections() {
        let response: KeysClaimResponse = serde_json::from_value(json!({})).unwrap();
        assert!(response.one_time_keys.is_empty());
        assert!(response.failures.is_empty());
    }
}
