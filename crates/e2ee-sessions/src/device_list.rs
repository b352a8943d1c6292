//! Keeps the device lists of tracked users fresh, with one `/keys/query` in
//! flight per user at a time.
//!
//! Every change signal bumps a per-user generation. A query records the
//! generation it started at and only clears the stale flag if no signal
//! arrived in the meantime, so a change can never be lost to a query that was
//! already on the wire.

use crate::transport::{KeysQueryRequest, Transport};
use crate::utils::{spawn_shared, unix_now, SharedResult};
use crate::{DeviceKeyStore, DeviceListSignal, Result};
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[derive(Clone)]
struct InFlightQuery {
    started_generation: u64,
    query: SharedResult<()>,
}

#[derive(Default)]
struct UserState {
    last_queried: Option<u64>,
    stale: bool,
    generation: u64,
    /// Queries that finished with an answer (good or not) for this user.
    attempts: u64,
    last_attempt_generation: u64,
    in_flight: Option<InFlightQuery>,
}

impl UserState {
    fn needs_query(&self) -> bool {
        self.stale || self.last_queried.is_none()
    }
}

/// What an `ensure_fresh` caller is waiting for: an attempt that started no
/// earlier than `generation` and finished after the call began.
struct Waiter {
    user_id: String,
    generation: u64,
    attempts_at_start: u64,
}

impl Waiter {
    fn satisfied_by(&self, state: &UserState) -> bool {
        state.attempts > self.attempts_at_start && state.last_attempt_generation >= self.generation
    }
}

#[derive(Clone)]
pub struct DeviceListTracker {
    transport: Arc<dyn Transport>,
    devices: DeviceKeyStore,
    users: Arc<Mutex<HashMap<String, UserState>>>,
}

impl DeviceListTracker {
    pub fn new(transport: Arc<dyn Transport>, devices: DeviceKeyStore) -> Self {
        Self {
            transport,
            devices,
            users: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Make sure every listed user has been queried since their last change.
    ///
    /// Stale and never-queried users without a query in flight are batched
    /// into a single request; users that already have one in flight wait for
    /// it. A user the server cannot answer for keeps its previous list and
    /// stays stale. A transport failure is returned to every caller waiting
    /// on that request.
    #[instrument(skip_all, fields(users = user_ids.len()))]
    pub async fn ensure_fresh(&self, user_ids: &[String]) -> Result<()> {
        let mut waiters: Vec<Waiter> = {
            let mut users = self.users.lock().await;
            user_ids
                .iter()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .filter_map(|user_id| {
                    let state = users.entry(user_id.clone()).or_default();
                    state.needs_query().then(|| Waiter {
                        user_id: user_id.clone(),
                        generation: state.generation,
                        attempts_at_start: state.attempts,
                    })
                })
                .collect()
        };

        loop {
            let queries = {
                let mut users = self.users.lock().await;
                waiters.retain(|waiter| {
                    users
                        .get(&waiter.user_id)
                        .is_some_and(|state| !waiter.satisfied_by(state))
                });
                if waiters.is_empty() {
                    return Ok(());
                }

                let mut queries: Vec<SharedResult<()>> = Vec::new();
                let mut to_query = Vec::new();
                for waiter in &waiters {
                    let Some(state) = users.get(&waiter.user_id) else {
                        continue;
                    };
                    match &state.in_flight {
                        Some(in_flight) => {
                            if !queries.iter().any(|q| q.ptr_eq(&in_flight.query)) {
                                queries.push(in_flight.query.clone());
                            }
                        }
                        None => to_query.push(waiter.user_id.clone()),
                    }
                }

                if !to_query.is_empty() {
                    let tracker = self.clone();
                    let batch = to_query.clone();
                    let query = spawn_shared(async move { tracker.run_query(batch).await });
                    for user_id in &to_query {
                        if let Some(state) = users.get_mut(user_id) {
                            state.in_flight = Some(InFlightQuery {
                                started_generation: state.generation,
                                query: query.clone(),
                            });
                        }
                    }
                    queries.push(query);
                }
                queries
            };

            for result in join_all(queries).await {
                result?;
            }
        }
    }

    async fn run_query(&self, user_ids: Vec<String>) -> Result<()> {
        debug!(users = ?user_ids, "Querying device keys");
        let response = match self
            .transport
            .query_keys(KeysQueryRequest::for_users(user_ids.iter().cloned()))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let mut users = self.users.lock().await;
                for user_id in &user_ids {
                    if let Some(state) = users.get_mut(user_id) {
                        state.in_flight = None;
                    }
                }
                warn!(error = %e, "Device key query failed");
                return Err(e);
            }
        };

        for user_id in &user_ids {
            let failed = response.failures.contains_key(user_id)
                || server_name(user_id).is_some_and(|server| response.failures.contains_key(server));
            let refreshed = match response.device_keys.get(user_id) {
                Some(records) if !failed => match self.devices.upsert_user(user_id, records).await {
                    Ok(list) => {
                        info!(user_id = %user_id, devices = list.len(), "Device list updated");
                        true
                    }
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "Failed to store device list");
                        false
                    }
                },
                _ => {
                    warn!(user_id = %user_id, "Server returned no device keys, keeping the previous list");
                    false
                }
            };

            let mut users = self.users.lock().await;
            if let Some(state) = users.get_mut(user_id) {
                let started = state
                    .in_flight
                    .take()
                    .map_or(state.generation, |q| q.started_generation);
                state.attempts += 1;
                state.last_attempt_generation = started;
                if refreshed {
                    state.last_queried = Some(unix_now());
                    if state.generation == started {
                        state.stale = false;
                    }
                }
            }
        }

        Ok(())
    }

    /// The user changed their devices; the next `ensure_fresh` re-queries.
    pub async fn mark_stale(&self, user_id: &str) {
        let mut users = self.users.lock().await;
        let state = users.entry(user_id.to_string()).or_default();
        state.stale = true;
        state.generation += 1;
        debug!(user_id, generation = state.generation, "Device list marked stale");
    }

    pub async fn receive_device_list_signal(&self, signal: &DeviceListSignal) {
        debug!(sender = %signal.sender, device_id = %signal.content.device_id, "New device announced");
        self.mark_stale(&signal.sender).await;
    }

    /// Sync-level notification: `changed` users are stale, `left` users are
    /// no longer tracked.
    pub async fn receive_device_list_changes(&self, changed: &[String], left: &[String]) {
        for user_id in changed {
            self.mark_stale(user_id).await;
        }
        let mut users = self.users.lock().await;
        for user_id in left {
            users.remove(user_id);
        }
    }

    pub async fn is_stale(&self, user_id: &str) -> bool {
        self.users
            .lock()
            .await
            .get(user_id)
            .map_or(true, UserState::needs_query)
    }

    pub async fn last_queried(&self, user_id: &str) -> Option<u64> {
        self.users
            .lock()
            .await
            .get(user_id)
            .and_then(|state| state.last_queried)
    }

    pub async fn is_tracked(&self, user_id: &str) -> bool {
        self.users.lock().await.contains_key(user_id)
    }
}

fn server_name(user_id: &str) -> Option<&str> {
    user_id.split_once(':').map(|(_, server)| server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::{signed_record, signing_key};
    use crate::{InMemoryHomeserver, InMemoryStorage, NewDeviceContent};
    use std::time::Duration;

    const ALICE: &str = "@alice:example.org";
    const BOB: &str = "@bob:example.org";
    const CAROL: &str = "@carol:remote.org";

    fn tracker(server: &InMemoryHomeserver) -> (DeviceListTracker, DeviceKeyStore) {
        let devices = DeviceKeyStore::new(Arc::new(InMemoryStorage::new()));
        (
            DeviceListTracker::new(Arc::new(server.connect(ALICE)), devices.clone()),
            devices,
        )
    }

    fn users(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn fresh_users_are_not_queried_again() {
        let server = InMemoryHomeserver::new();
        server.insert_device_record(BOB, "D1", signed_record(BOB, "D1", &signing_key(1)));
        let (tracker, devices) = tracker(&server);

        tracker.ensure_fresh(&users(&[BOB])).await.unwrap();
        tracker.ensure_fresh(&users(&[BOB])).await.unwrap();

        assert_eq!(server.query_count(BOB), 1);
        assert!(devices.get(BOB, "D1").await.is_some());
        assert!(!tracker.is_stale(BOB).await);
        assert!(tracker.last_queried(BOB).await.is_some());
    }

    #[tokio::test]
    async fn stale_users_are_batched_into_one_query() {
        let server = InMemoryHomeserver::new();
        let (tracker, _) = tracker(&server);

        tracker.ensure_fresh(&users(&[BOB, CAROL, BOB])).await.unwrap();
        assert_eq!(server.query_request_count(), 1);
        assert_eq!(server.query_count(BOB), 1);
        assert_eq!(server.query_count(CAROL), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_the_in_flight_query() {
        let server = InMemoryHomeserver::new();
        server.set_query_delay(Some(Duration::from_millis(20)));
        let (tracker, _) = tracker(&server);
        tracker
            .receive_device_list_signal(&DeviceListSignal {
                sender: BOB.to_string(),
                content: NewDeviceContent {
                    device_id: "D2".to_string(),
                    rooms: vec![],
                },
            })
            .await;

        let bob = users(&[BOB]);
        let results = join_all((0..5).map(|_| tracker.ensure_fresh(&bob))).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(server.query_count(BOB), 1);
    }

    #[tokio::test]
    async fn change_during_query_keeps_user_stale() {
        let server = InMemoryHomeserver::new();
        server.set_query_delay(Some(Duration::from_millis(50)));
        let (tracker, _) = tracker(&server);

        let bob = users(&[BOB]);
        let (first, _) = tokio::join!(tracker.ensure_fresh(&bob), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tracker.mark_stale(BOB).await;
        });
        first.unwrap();
        assert!(tracker.is_stale(BOB).await);

        tracker.ensure_fresh(&bob).await.unwrap();
        assert_eq!(server.query_count(BOB), 2);
        assert!(!tracker.is_stale(BOB).await);
    }

    #[tokio::test]
    async fn unreachable_user_keeps_previous_list() {
        let server = InMemoryHomeserver::new();
        server.insert_device_record(CAROL, "C1", signed_record(CAROL, "C1", &signing_key(3)));
        let (tracker, devices) = tracker(&server);
        tracker.ensure_fresh(&users(&[CAROL])).await.unwrap();

        server.set_unreachable(CAROL, true);
        tracker.mark_stale(CAROL).await;
        tracker.ensure_fresh(&users(&[CAROL])).await.unwrap();

        assert!(devices.get(CAROL, "C1").await.is_some());
        assert!(tracker.is_stale(CAROL).await);
        assert_eq!(server.query_count(CAROL), 2);
    }

    #[tokio::test]
    async fn transport_failure_reaches_the_caller_and_allows_retry() {
        let server = InMemoryHomeserver::new();
        let (tracker, _) = tracker(&server);
        server.set_offline(true);

        assert!(tracker.ensure_fresh(&users(&[BOB])).await.is_err());
        assert!(tracker.is_stale(BOB).await);

        server.set_offline(false);
        tracker.ensure_fresh(&users(&[BOB])).await.unwrap();
        assert!(!tracker.is_stale(BOB).await);
    }

    #[tokio::test]
    async fn left_users_stop_being_tracked() {
        let server = InMemoryHomeserver::new();
        let (tracker, _) = tracker(&server);
        tracker.ensure_fresh(&users(&[BOB, CAROL])).await.unwrap();

        tracker
            .receive_device_list_changes(&users(&[BOB]), &users(&[CAROL]))
            .await;
        assert!(tracker.is_stale(BOB).await);
        assert!(!tracker.is_tracked(CAROL).await);
    }
}
