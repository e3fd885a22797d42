// Storage abstraction for the orchestration engine
// This defines the contract the engine uses against its durable state

//! # Storage Abstraction Layer
//!
//! The engine never keeps a flow in memory across two dispatch cycles. All
//! state lives behind three traits:
//!
//! - [`FlowStateStore`]: flow records, per-session inbound queues, per-session
//!   leases and the outbound queue the agent transport drains
//! - [`ClientStore`]: client records and crash history
//! - [`HuntStore`]: hunt records
//!
//! [`FleetStore`] bundles the three so collaborators can hold a single
//! `Arc<dyn FleetStore>` and stay agnostic of the backend.
//!
//! ## Leases and Compare-and-Update
//!
//! A session is processed by at most one worker at a time. The worker obtains a
//! [`SessionLease`] from [`FlowStateStore::lease_ready_sessions`], reads the
//! flow, runs continuations and writes everything back with one
//! [`FlowStateStore::write_flow_state`] call. That call fails with
//! `ConcurrentModification` when the lease expired or was taken over, or when
//! the flow's `version` moved since it was read. Nothing is overwritten
//! silently: the unacknowledged messages stay queued and are retried.
//!
//! ## Rust Learning Notes:
//!
//! ### Async Traits
//! Rust doesn't natively support async functions in trait objects yet.
//! The `async-trait` crate provides a macro to enable async trait methods.
//!
//! ### Supertraits with a Blanket Implementation
//! `impl<T> FleetStore for T where T: FlowStateStore + ClientStore + HuntStore`
//! means any type implementing the three traits is automatically a
//! `FleetStore`, so `Arc<InMemoryStorage>` coerces to `Arc<dyn FleetStore>`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    AgentRequest, ClientId, ClientRecord, CrashRecord, FlowInstance, Hunt, HuntId,
    MessageEnvelope, SessionId,
};
use crate::{FleetError, Result};

/// Exclusive right to process one session until `expires_at`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLease {
    pub session_id: SessionId,
    pub lease_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl SessionLease {
    pub fn new(session_id: SessionId, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        Self {
            session_id,
            lease_id: Uuid::new_v4(),
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// An inbound envelope together with the store's handle for acknowledging it
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub message_id: String,
    pub envelope: MessageEnvelope,
}

/// Everything one dispatch cycle produced, written as one unit
///
/// `flow.version` must be the version that was read; the store bumps it.
#[derive(Debug, Clone)]
pub struct FlowCommit {
    pub flow: FlowInstance,
    /// Inbound message ids consumed by this cycle
    pub acked: Vec<String>,
    /// Requests to deliver to the agent
    pub outbound: Vec<AgentRequest>,
    /// Child flows started by a continuation
    pub new_flows: Vec<FlowInstance>,
    /// Envelopes for other sessions (a child's terminal status for its parent)
    pub notifications: Vec<MessageEnvelope>,
}

impl FlowCommit {
    pub fn new(flow: FlowInstance) -> Self {
        Self {
            flow,
            acked: Vec::new(),
            outbound: Vec::new(),
            new_flows: Vec::new(),
            notifications: Vec::new(),
        }
    }
}

/// Durable flow state, inbound queues, leases and outbound delivery
#[async_trait::async_trait]
pub trait FlowStateStore: Send + Sync {
    /// Queue an envelope for the session named in the envelope
    async fn enqueue_inbound(&self, envelope: MessageEnvelope) -> Result<()>;

    /// Lease up to `max` sessions that have queued envelopes and no live lease
    async fn lease_ready_sessions(&self, max: usize, ttl: Duration) -> Result<Vec<SessionLease>>;

    /// Lease one specific session, queued messages or not
    ///
    /// Returns `None` while another worker holds a live lease.
    async fn try_lease(&self, session_id: &SessionId, ttl: Duration) -> Result<Option<SessionLease>>;

    /// Envelopes queued for the leased session, oldest first
    async fn fetch_inbound(&self, lease: &SessionLease) -> Result<Vec<QueuedMessage>>;

    /// Delete consumed envelopes outside of a flow commit
    async fn ack_inbound(&self, lease: &SessionLease, message_ids: &[String]) -> Result<()>;

    /// Current flow record, `None` when the session has none
    async fn read_flow_state(&self, session_id: &SessionId) -> Result<Option<FlowInstance>>;

    /// Insert a new flow plus its first side effects
    ///
    /// ## Errors
    /// - `AlreadyExists` when the session already has a flow
    async fn create_flow(&self, commit: FlowCommit) -> Result<FlowInstance>;

    /// Atomic compare-and-update of a leased session
    ///
    /// ## Errors
    /// - `ConcurrentModification` when the lease is lost or the version moved
    async fn write_flow_state(&self, lease: &SessionLease, commit: FlowCommit) -> Result<FlowInstance>;

    /// Give up a lease; unknown or foreign leases are ignored
    async fn release_lease(&self, lease: &SessionLease) -> Result<()>;

    async fn enqueue_outbound(&self, request: AgentRequest) -> Result<()>;

    /// Remove and return up to `max` pending requests for a client
    async fn drain_outbound(&self, client_id: &ClientId, max: usize) -> Result<Vec<AgentRequest>>;

    async fn list_flows(&self, client_id: Option<&ClientId>) -> Result<Vec<FlowInstance>>;
}

/// Client records and their crash history
#[async_trait::async_trait]
pub trait ClientStore: Send + Sync {
    async fn read_client(&self, client_id: &ClientId) -> Result<Option<ClientRecord>>;

    async fn write_client(&self, record: ClientRecord) -> Result<()>;

    /// Return the client record, creating a placeholder when none exists
    async fn ensure_client(&self, client_id: &ClientId) -> Result<ClientRecord>;

    async fn list_clients(&self) -> Result<Vec<ClientRecord>>;

    /// Append to the client's crash history and set it as `last_crash`
    async fn write_crash(&self, crash: CrashRecord) -> Result<()>;

    async fn list_client_crashes(&self, client_id: &ClientId) -> Result<Vec<CrashRecord>>;

    /// Crashes linked to one flow session
    async fn list_flow_crashes(&self, session_id: &SessionId) -> Result<Vec<CrashRecord>>;
}

#[async_trait::async_trait]
pub trait HuntStore: Send + Sync {
    /// ## Errors
    /// - `AlreadyExists` when the hunt id is taken
    async fn create_hunt(&self, hunt: Hunt) -> Result<Hunt>;

    async fn read_hunt(&self, hunt_id: &HuntId) -> Result<Option<Hunt>>;

    /// Compare-and-swap on `hunt.version`; the stored copy gets the next version
    ///
    /// ## Errors
    /// - `HuntNotFound` when the hunt was never created
    /// - `ConcurrentModification` when another writer got in first; re-read and retry
    async fn write_hunt(&self, hunt: Hunt) -> Result<Hunt>;

    async fn list_hunts(&self) -> Result<Vec<Hunt>>;
}

/// The full store a [`crate::FleetEngine`] is bound to
pub trait FleetStore: FlowStateStore + ClientStore + HuntStore {}

impl<T> FleetStore for T where T: FlowStateStore + ClientStore + HuntStore {}

#[derive(Default)]
struct Inner {
    flows: HashMap<SessionId, FlowInstance>,
    /// Per-session inbound queue keyed by arrival sequence
    inbound: HashMap<SessionId, BTreeMap<u64, MessageEnvelope>>,
    next_message_seq: u64,
    leases: HashMap<SessionId, SessionLease>,
    outbound: HashMap<ClientId, VecDeque<AgentRequest>>,
    clients: HashMap<ClientId, ClientRecord>,
    crashes: HashMap<ClientId, Vec<CrashRecord>>,
    hunts: HashMap<HuntId, Hunt>,
}

impl Inner {
    fn holds_lease(&self, lease: &SessionLease) -> bool {
        match self.leases.get(&lease.session_id) {
            Some(current) => current.lease_id == lease.lease_id && !current.is_expired(),
            None => false,
        }
    }

    fn is_leased(&self, session_id: &SessionId) -> bool {
        self.leases
            .get(session_id)
            .map_or(false, |lease| !lease.is_expired())
    }

    fn push_inbound(&mut self, envelope: MessageEnvelope) {
        let seq = self.next_message_seq;
        self.next_message_seq += 1;
        self.inbound
            .entry(envelope.session_id.clone())
            .or_default()
            .insert(seq, envelope);
    }

    fn remove_inbound(&mut self, session_id: &SessionId, message_ids: &[String]) {
        if let Some(queue) = self.inbound.get_mut(session_id) {
            for id in message_ids {
                if let Ok(seq) = id.parse::<u64>() {
                    queue.remove(&seq);
                }
            }
            if queue.is_empty() {
                self.inbound.remove(session_id);
            }
        }
    }

    /// Side effects shared by create and write; callers have already validated
    fn apply_side_effects(&mut self, commit: &FlowCommit) {
        for request in &commit.outbound {
            self.outbound
                .entry(request.client_id.clone())
                .or_default()
                .push_back(request.clone());
        }
        for child in &commit.new_flows {
            let mut child = child.clone();
            child.version += 1;
            self.flows.insert(child.session_id.clone(), child);
        }
        for envelope in &commit.notifications {
            self.push_inbound(envelope.clone());
        }
    }

    fn check_children_absent(&self, commit: &FlowCommit) -> Result<()> {
        for child in &commit.new_flows {
            if self.flows.contains_key(&child.session_id) {
                return Err(FleetError::AlreadyExists(child.session_id.to_string()));
            }
        }
        Ok(())
    }
}

/// In-memory storage implementation for development and testing
///
/// One lock guards all maps, so every commit is applied atomically: either
/// the flow, its acks, its outbound requests, its children and its
/// notifications are all visible, or none of them are.
///
/// ## Limitations
///
/// - **Not persistent**: Data is lost when process restarts
/// - **Not distributed**: Cannot share data across multiple processes
///
/// ## Rust Learning Notes:
///
/// ### tokio::sync::RwLock
/// Unlike `std::sync::RwLock`, the tokio lock is never poisoned, so there is
/// no `unwrap()` on acquisition, and its guard can be held across `.await`.
#[derive(Default)]
pub struct InMemoryStorage {
    inner: RwLock<Inner>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of envelopes waiting for a session
    pub async fn pending_inbound(&self, session_id: &SessionId) -> usize {
        let inner = self.inner.read().await;
        inner.inbound.get(session_id).map_or(0, |q| q.len())
    }

    /// Force a lease to expire (used to simulate a stalled worker)
    pub async fn expire_lease(&self, session_id: &SessionId) {
        let mut inner = self.inner.write().await;
        if let Some(lease) = inner.leases.get_mut(session_id) {
            lease.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }
}

#[async_trait::async_trait]
impl FlowStateStore for InMemoryStorage {
    async fn enqueue_inbound(&self, envelope: MessageEnvelope) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.push_inbound(envelope);
        Ok(())
    }

    async fn lease_ready_sessions(&self, max: usize, ttl: Duration) -> Result<Vec<SessionLease>> {
        let mut inner = self.inner.write().await;

        let mut ready: Vec<(u64, SessionId)> = inner
            .inbound
            .iter()
            .filter(|(session, queue)| !queue.is_empty() && !inner.is_leased(session))
            .filter_map(|(session, queue)| queue.keys().next().map(|seq| (*seq, session.clone())))
            .collect();
        // oldest queued message first
        ready.sort();

        let leases: Vec<SessionLease> = ready
            .into_iter()
            .take(max)
            .map(|(_, session)| SessionLease::new(session, ttl))
            .collect();
        for lease in &leases {
            inner.leases.insert(lease.session_id.clone(), lease.clone());
        }
        Ok(leases)
    }

    async fn try_lease(&self, session_id: &SessionId, ttl: Duration) -> Result<Option<SessionLease>> {
        let mut inner = self.inner.write().await;
        if inner.is_leased(session_id) {
            return Ok(None);
        }
        let lease = SessionLease::new(session_id.clone(), ttl);
        inner.leases.insert(session_id.clone(), lease.clone());
        Ok(Some(lease))
    }

    async fn fetch_inbound(&self, lease: &SessionLease) -> Result<Vec<QueuedMessage>> {
        let inner = self.inner.read().await;
        if !inner.holds_lease(lease) {
            return Err(FleetError::ConcurrentModification {
                key: lease.session_id.to_string(),
            });
        }
        Ok(inner
            .inbound
            .get(&lease.session_id)
            .map(|queue| {
                queue
                    .iter()
                    .map(|(seq, envelope)| QueuedMessage {
                        message_id: seq.to_string(),
                        envelope: envelope.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ack_inbound(&self, lease: &SessionLease, message_ids: &[String]) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.holds_lease(lease) {
            return Err(FleetError::ConcurrentModification {
                key: lease.session_id.to_string(),
            });
        }
        inner.remove_inbound(&lease.session_id, message_ids);
        Ok(())
    }

    async fn read_flow_state(&self, session_id: &SessionId) -> Result<Option<FlowInstance>> {
        let inner = self.inner.read().await;
        Ok(inner.flows.get(session_id).cloned())
    }

    async fn create_flow(&self, commit: FlowCommit) -> Result<FlowInstance> {
        let mut inner = self.inner.write().await;
        if inner.flows.contains_key(&commit.flow.session_id) {
            return Err(FleetError::AlreadyExists(commit.flow.session_id.to_string()));
        }
        inner.check_children_absent(&commit)?;

        let mut flow = commit.flow.clone();
        flow.version += 1;
        inner.flows.insert(flow.session_id.clone(), flow.clone());
        inner.apply_side_effects(&commit);
        Ok(flow)
    }

    async fn write_flow_state(&self, lease: &SessionLease, commit: FlowCommit) -> Result<FlowInstance> {
        let mut inner = self.inner.write().await;
        let session_id = commit.flow.session_id.clone();
        let conflict = || FleetError::ConcurrentModification {
            key: session_id.to_string(),
        };

        if lease.session_id != session_id || !inner.holds_lease(lease) {
            return Err(conflict());
        }
        let stored_version = inner.flows.get(&session_id).map(|f| f.version);
        if stored_version != Some(commit.flow.version) {
            return Err(conflict());
        }
        inner.check_children_absent(&commit)?;

        let mut flow = commit.flow.clone();
        flow.version += 1;
        inner.flows.insert(session_id.clone(), flow.clone());
        inner.remove_inbound(&session_id, &commit.acked);
        inner.apply_side_effects(&commit);
        Ok(flow)
    }

    async fn release_lease(&self, lease: &SessionLease) -> Result<()> {
        let mut inner = self.inner.write().await;
        let owned = inner
            .leases
            .get(&lease.session_id)
            .map_or(false, |current| current.lease_id == lease.lease_id);
        if owned {
            inner.leases.remove(&lease.session_id);
        }
        Ok(())
    }

    async fn enqueue_outbound(&self, request: AgentRequest) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .outbound
            .entry(request.client_id.clone())
            .or_default()
            .push_back(request);
        Ok(())
    }

    async fn drain_outbound(&self, client_id: &ClientId, max: usize) -> Result<Vec<AgentRequest>> {
        let mut inner = self.inner.write().await;
        let Some(queue) = inner.outbound.get_mut(client_id) else {
            return Ok(Vec::new());
        };
        let take = max.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    async fn list_flows(&self, client_id: Option<&ClientId>) -> Result<Vec<FlowInstance>> {
        let inner = self.inner.read().await;
        let mut flows: Vec<FlowInstance> = inner
            .flows
            .values()
            .filter(|flow| client_id.map_or(true, |id| &flow.client_id == id))
            .cloned()
            .collect();
        flows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(flows)
    }
}

#[async_trait::async_trait]
impl ClientStore for InMemoryStorage {
    async fn read_client(&self, client_id: &ClientId) -> Result<Option<ClientRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.clients.get(client_id).cloned())
    }

    async fn write_client(&self, record: ClientRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.clients.insert(record.client_id.clone(), record);
        Ok(())
    }

    async fn ensure_client(&self, client_id: &ClientId) -> Result<ClientRecord> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .clients
            .entry(client_id.clone())
            .or_insert_with(|| ClientRecord::placeholder(client_id.clone()))
            .clone())
    }

    async fn list_clients(&self) -> Result<Vec<ClientRecord>> {
        let inner = self.inner.read().await;
        let mut clients: Vec<ClientRecord> = inner.clients.values().cloned().collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(clients)
    }

    async fn write_crash(&self, crash: CrashRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        let client_id = crash.client_id.clone();
        inner
            .clients
            .entry(client_id.clone())
            .or_insert_with(|| ClientRecord::placeholder(client_id.clone()))
            .last_crash = Some(crash.clone());
        inner.crashes.entry(client_id).or_default().push(crash);
        Ok(())
    }

    async fn list_client_crashes(&self, client_id: &ClientId) -> Result<Vec<CrashRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.crashes.get(client_id).cloned().unwrap_or_default())
    }

    async fn list_flow_crashes(&self, session_id: &SessionId) -> Result<Vec<CrashRecord>> {
        let inner = self.inner.read().await;
        let mut crashes: Vec<CrashRecord> = inner
            .crashes
            .values()
            .flatten()
            .filter(|crash| crash.session_id.as_ref() == Some(session_id))
            .cloned()
            .collect();
        crashes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(crashes)
    }
}

#[async_trait::async_trait]
impl HuntStore for InMemoryStorage {
    async fn create_hunt(&self, hunt: Hunt) -> Result<Hunt> {
        let mut inner = self.inner.write().await;
        if inner.hunts.contains_key(&hunt.hunt_id) {
            return Err(FleetError::AlreadyExists(hunt.hunt_id.to_string()));
        }
        inner.hunts.insert(hunt.hunt_id.clone(), hunt.clone());
        Ok(hunt)
    }

    async fn read_hunt(&self, hunt_id: &HuntId) -> Result<Option<Hunt>> {
        let inner = self.inner.read().await;
        Ok(inner.hunts.get(hunt_id).cloned())
    }

    async fn write_hunt(&self, mut hunt: Hunt) -> Result<Hunt> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .hunts
            .get(&hunt.hunt_id)
            .ok_or_else(|| FleetError::HuntNotFound(hunt.hunt_id.to_string()))?;
        if stored.version != hunt.version {
            return Err(FleetError::ConcurrentModification {
                key: hunt.hunt_id.to_string(),
            });
        }
        hunt.version += 1;
        inner.hunts.insert(hunt.hunt_id.clone(), hunt.clone());
        Ok(hunt)
    }

    async fn list_hunts(&self) -> Result<Vec<Hunt>> {
        let inner = self.inner.read().await;
        let mut hunts: Vec<Hunt> = inner.hunts.values().cloned().collect();
        hunts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(hunts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FlowSpec, FlowStatus, Payload};
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    const TTL: Duration = Duration::from_secs(30);

    fn session() -> SessionId {
        SessionId::from("C.1000000000000000/flows/F.00000001")
    }

    fn flow() -> FlowInstance {
        FlowInstance::new(
            session(),
            ClientId::from_index(0),
            &FlowSpec::new("ClientActionRunner", json!({"action": "Echo"})),
        )
    }

    fn reply(response_id: u64) -> MessageEnvelope {
        MessageEnvelope::response(session(), 1, response_id, Payload::text("pong"))
    }

    #[tokio::test]
    async fn test_only_one_lease_per_session() {
        let store = InMemoryStorage::new();
        store.enqueue_inbound(reply(0)).await.unwrap();

        let first = store.lease_ready_sessions(10, TTL).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = store.lease_ready_sessions(10, TTL).await.unwrap();
        assert!(second.is_empty());
        assert!(store.try_lease(&session(), TTL).await.unwrap().is_none());

        store.release_lease(&first[0]).await.unwrap();
        let third = store.lease_ready_sessions(10, TTL).await.unwrap();
        assert_eq!(third.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable_and_loses_write() {
        let store = InMemoryStorage::new();
        store.create_flow(FlowCommit::new(flow())).await.unwrap();
        store.enqueue_inbound(reply(0)).await.unwrap();

        let stale = store.lease_ready_sessions(1, TTL).await.unwrap().remove(0);
        let read = store.read_flow_state(&session()).await.unwrap().unwrap();
        store.expire_lease(&session()).await;

        let fresh = store.lease_ready_sessions(1, TTL).await.unwrap();
        assert_eq!(fresh.len(), 1);

        let result = store.write_flow_state(&stale, FlowCommit::new(read)).await;
        assert!(matches!(result, Err(FleetError::ConcurrentModification { .. })));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_concurrent_modification() {
        let store = InMemoryStorage::new();
        store.create_flow(FlowCommit::new(flow())).await.unwrap();
        store.enqueue_inbound(reply(0)).await.unwrap();
        let lease = store.lease_ready_sessions(1, TTL).await.unwrap().remove(0);

        let read = store.read_flow_state(&session()).await.unwrap().unwrap();
        assert_eq!(read.version, 1);
        let written = assert_ok!(store.write_flow_state(&lease, FlowCommit::new(read.clone())).await);
        assert_eq!(written.version, 2);

        // replaying the same update against the old version must fail
        assert_err!(store.write_flow_state(&lease, FlowCommit::new(read)).await);
    }

    #[tokio::test]
    async fn test_commit_applies_all_side_effects() {
        let store = InMemoryStorage::new();
        store.create_flow(FlowCommit::new(flow())).await.unwrap();
        store.enqueue_inbound(reply(0)).await.unwrap();
        store.enqueue_inbound(reply(1)).await.unwrap();

        let lease = store.lease_ready_sessions(1, TTL).await.unwrap().remove(0);
        let messages = store.fetch_inbound(&lease).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].envelope.response_id, 0);

        let parent = SessionId::from("C.1000000000000000/flows/F.00000002");
        let mut commit = FlowCommit::new(store.read_flow_state(&session()).await.unwrap().unwrap());
        commit.acked = vec![messages[0].message_id.clone()];
        commit.outbound.push(AgentRequest {
            session_id: session(),
            client_id: ClientId::from_index(0),
            request_id: 2,
            action: "Echo".to_string(),
            args: Payload::empty(),
            issued_at: Utc::now(),
            cpu_limit: None,
            network_bytes_limit: None,
        });
        commit
            .notifications
            .push(MessageEnvelope::status(parent.clone(), 1, 0, FlowStatus::ok()));
        store.write_flow_state(&lease, commit).await.unwrap();

        assert_eq!(store.pending_inbound(&session()).await, 1);
        assert_eq!(store.pending_inbound(&parent).await, 1);
        let outbound = store.drain_outbound(&ClientId::from_index(0), 10).await.unwrap();
        assert_eq!(outbound.len(), 1);
        assert!(store
            .drain_outbound(&ClientId::from_index(0), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_create_flow_twice_fails() {
        let store = InMemoryStorage::new();
        assert_ok!(store.create_flow(FlowCommit::new(flow())).await);
        let result = store.create_flow(FlowCommit::new(flow())).await;
        assert!(matches!(result, Err(FleetError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_crash_history_and_placeholder() {
        let store = InMemoryStorage::new();
        let client = ClientId::from_index(7);
        let crash = CrashRecord::new(client.clone(), Some(session()), "Client Crash", "boom");
        store.write_crash(crash.clone()).await.unwrap();

        let record = store.read_client(&client).await.unwrap().unwrap();
        assert!(record.placeholder);
        assert_eq!(record.last_crash, Some(crash.clone()));
        assert_eq!(store.list_client_crashes(&client).await.unwrap().len(), 1);
        assert_eq!(store.list_flow_crashes(&session()).await.unwrap(), vec![crash]);

        let ensured = store.ensure_client(&client).await.unwrap();
        assert!(ensured.last_crash.is_some());
    }

    fn hunt() -> Hunt {
        let spec = crate::models::HuntSpec {
            description: String::new(),
            flow: FlowSpec::new("ClientActionRunner", json!({"action": "Echo"})),
            client_selection: crate::models::ClientSelection::All,
            client_rate: None,
            crash_alert_target: None,
            failure_threshold: None,
            creator: None,
        };
        Hunt::from_spec(HuntId::random(), spec, 20)
    }

    #[tokio::test]
    async fn test_stale_hunt_write_is_refused() {
        let store = InMemoryStorage::new();
        let created = store.create_hunt(hunt()).await.unwrap();

        let mut first = created.clone();
        first.counters.completed += 1;
        let written = store.write_hunt(first).await.unwrap();
        assert_eq!(written.version, 1);

        // a writer still holding the old copy must not overwrite the completion
        let mut stale = created;
        stale.counters.errors += 1;
        let result = store.write_hunt(stale).await;
        assert!(matches!(result, Err(FleetError::ConcurrentModification { .. })));

        let stored = store.read_hunt(&written.hunt_id).await.unwrap().unwrap();
        assert_eq!(stored.counters.completed, 1);
        assert_eq!(stored.counters.errors, 0);
    }

    #[tokio::test]
    async fn test_write_of_unknown_hunt_fails() {
        let store = InMemoryStorage::new();
        let result = store.write_hunt(hunt()).await;
        assert!(matches!(result, Err(FleetError::HuntNotFound(_))));
    }
}
