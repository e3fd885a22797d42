// NATS storage implementation for flows, queues, clients and hunts
// This provides distributed, persistent storage using NATS JetStream key-value buckets

//! # NATS Storage Implementation
//!
//! This module implements the store traits on JetStream key-value buckets so
//! several server processes can share one fleet.
//!
//! ## Bucket Layout
//!
//! | Bucket               | Key                        | Value            |
//! |----------------------|----------------------------|------------------|
//! | `{prefix}_flows`     | `{session}`                | `FlowInstance`   |
//! | `{prefix}_inbound`   | `{session}.{message_id}`   | `MessageEnvelope`|
//! | `{prefix}_leases`    | `{session}`                | lease record     |
//! | `{prefix}_outbound`  | `{client}.{message_id}`    | `AgentRequest`   |
//! | `{prefix}_clients`   | `{client}`                 | `ClientRecord`   |
//! | `{prefix}_crashes`   | `{client}.{message_id}`    | `CrashRecord`    |
//! | `{prefix}_hunts`     | `{hunt}`                   | `Hunt`           |
//!
//! ## Ready Sessions
//!
//! Listing the inbound bucket on every worker poll costs a full key scan. The
//! store instead keeps an in-process index of queued inbound keys per session.
//! A watch on the inbound bucket replays the current keys at startup and then
//! follows every put and purge, whichever process made it. Writes made through
//! this store are applied to the index right away so a local enqueue is
//! leasable without waiting for the watch. Should the watch end, polls fall
//! back to a full scan.
//!
//! Identifiers contain `/` and `.`, so every id segment is base64url encoded
//! before it becomes part of a key. Message ids start with a zero padded
//! nanosecond timestamp and sort in arrival order.
//!
//! ## Consistency
//!
//! Leases and flow records are written with revision-checked `update` calls.
//! `write_flow_state` first re-checks the lease, then compare-and-updates the
//! flow record: that update is the commit point. Outbound requests, child
//! flows, notifications and the ack of consumed envelopes are written after it
//! and are not atomic with it. A process dying in between leaves envelopes that
//! the next cycle discards as duplicates.
//!
//! ## Rust Learning Notes:
//!
//! ### Error Conversion at the Boundary
//! Each async-nats call has its own error type. They are wrapped with
//! `anyhow::anyhow!` and converted into `FleetError::Storage` by `?`, except
//! where the error kind carries meaning (a failed revision check becomes
//! `ConcurrentModification`, an existing key becomes `AlreadyExists`).

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, kv, Context};
use async_nats::Client;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::storage::{ClientStore, FlowCommit, FlowStateStore, HuntStore, QueuedMessage, SessionLease};
use crate::config::StorageSettings;
use crate::models::{
    AgentRequest, ClientId, ClientRecord, CrashRecord, FlowInstance, Hunt, HuntId,
    MessageEnvelope, SessionId,
};
use crate::{FleetError, Result};

/// Configuration for NATS storage
#[derive(Debug, Clone)]
pub struct NATSStorageConfig {
    /// NATS server URLs
    pub nats_urls: Vec<String>,
    /// Prefix of every bucket name
    pub bucket_prefix: String,
    /// Replicas per bucket
    pub num_replicas: usize,
}

impl Default for NATSStorageConfig {
    fn default() -> Self {
        Self {
            nats_urls: vec!["nats://localhost:4222".to_string()],
            bucket_prefix: "fleet".to_string(),
            num_replicas: 1,
        }
    }
}

impl From<&StorageSettings> for NATSStorageConfig {
    fn from(settings: &StorageSettings) -> Self {
        Self {
            nats_urls: settings.nats_urls.clone(),
            bucket_prefix: settings.bucket_prefix.clone(),
            ..Self::default()
        }
    }
}

/// Lease as stored in the leases bucket; an expired record is a free lease
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    lease_id: Uuid,
    expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn is_live(&self) -> bool {
        self.expires_at > Utc::now()
    }

    fn released() -> Self {
        Self {
            lease_id: Uuid::nil(),
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

struct Buckets {
    flows: kv::Store,
    inbound: kv::Store,
    leases: kv::Store,
    outbound: kv::Store,
    clients: kv::Store,
    crashes: kv::Store,
    hunts: kv::Store,
}

/// Queued inbound message ids per encoded session
struct PendingIndex {
    sessions: DashMap<String, BTreeSet<String>>,
    /// False once the inbound watch ended
    live: AtomicBool,
}

impl PendingIndex {
    fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            live: AtomicBool::new(true),
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Track one change of an inbound key `{session}.{message_id}`
    fn apply(&self, key: &str, operation: kv::Operation) {
        let Some((session, message_id)) = key.split_once('.') else {
            return;
        };
        match operation {
            kv::Operation::Put => {
                self.sessions
                    .entry(session.to_string())
                    .or_default()
                    .insert(message_id.to_string());
            }
            kv::Operation::Delete | kv::Operation::Purge => {
                if let Some(mut ids) = self.sessions.get_mut(session) {
                    ids.remove(message_id);
                }
                self.sessions.remove_if(session, |_, ids| ids.is_empty());
            }
        }
    }

    /// Replace the index with a full listing of the inbound bucket
    fn reload(&self, keys: &[String]) {
        self.sessions.clear();
        for key in keys {
            self.apply(key, kv::Operation::Put);
        }
    }

    /// Encoded sessions with queued messages, oldest message first
    fn ready(&self) -> Vec<String> {
        let mut ready: Vec<(String, String)> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .first()
                    .map(|oldest| (oldest.clone(), entry.key().clone()))
            })
            .collect();
        ready.sort();
        ready.into_iter().map(|(_, session)| session).collect()
    }

    /// Inbound keys of one session, in message id order
    fn keys_of(&self, session_id: &SessionId) -> Vec<String> {
        let session = encode_id(session_id.as_str());
        self.sessions
            .get(&session)
            .map(|ids| ids.iter().map(|id| format!("{}.{}", session, id)).collect())
            .unwrap_or_default()
    }
}

/// Feed the index from the inbound bucket until the watch ends
async fn track_inbound(mut watch: kv::Watch, pending: Arc<PendingIndex>) {
    while let Some(entry) = watch.next().await {
        match entry {
            Ok(entry) => pending.apply(&entry.key, entry.operation),
            Err(e) => {
                warn!("Inbound watch failed: {}", e);
                break;
            }
        }
    }
    pending.live.store(false, Ordering::Release);
    warn!("Inbound watch ended; ready sessions now need a full scan");
}

/// NATS JetStream storage implementation
pub struct NATSStorage {
    client: Client,
    buckets: Buckets,
    pending: Arc<PendingIndex>,
    watcher: JoinHandle<()>,
}

impl Drop for NATSStorage {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

fn encode_id(id: &str) -> String {
    URL_SAFE_NO_PAD.encode(id.as_bytes())
}

fn decode_id(key: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(key).ok()?;
    String::from_utf8(bytes).ok()
}

/// Sortable unique id: zero padded nanoseconds, then a random suffix
fn new_message_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{:020}-{}", nanos, Uuid::new_v4().simple())
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn conflict(session_id: &SessionId) -> FleetError {
    FleetError::ConcurrentModification {
        key: session_id.to_string(),
    }
}

impl NATSStorage {
    /// Connect and make sure every bucket exists
    pub async fn new(config: NATSStorageConfig) -> Result<Self> {
        let client = async_nats::connect(config.nats_urls.join(","))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to NATS: {}", e))?;
        let jetstream = jetstream::new(client.clone());

        let bucket = |name: &str| format!("{}_{}", config.bucket_prefix, name);
        let buckets = Buckets {
            flows: Self::ensure_bucket(&jetstream, &bucket("flows"), &config).await?,
            inbound: Self::ensure_bucket(&jetstream, &bucket("inbound"), &config).await?,
            leases: Self::ensure_bucket(&jetstream, &bucket("leases"), &config).await?,
            outbound: Self::ensure_bucket(&jetstream, &bucket("outbound"), &config).await?,
            clients: Self::ensure_bucket(&jetstream, &bucket("clients"), &config).await?,
            crashes: Self::ensure_bucket(&jetstream, &bucket("crashes"), &config).await?,
            hunts: Self::ensure_bucket(&jetstream, &bucket("hunts"), &config).await?,
        };
        let pending = Arc::new(PendingIndex::new());
        let watch = buckets
            .inbound
            .watch_with_history(">")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to watch inbound bucket: {}", e))?;
        let watcher = tokio::spawn(track_inbound(watch, pending.clone()));
        info!(urls = ?config.nats_urls, prefix = %config.bucket_prefix, "Connected NATS storage");

        Ok(Self {
            client,
            buckets,
            pending,
            watcher,
        })
    }

    /// Create with default configuration
    pub async fn with_default_config() -> Result<Self> {
        Self::new(NATSStorageConfig::default()).await
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn ensure_bucket(jetstream: &Context, name: &str, config: &NATSStorageConfig) -> Result<kv::Store> {
        if let Ok(store) = jetstream.get_key_value(name).await {
            return Ok(store);
        }
        debug!(bucket = name, "Creating key-value bucket");
        let store = jetstream
            .create_key_value(kv::Config {
                bucket: name.to_string(),
                history: 1,
                num_replicas: config.num_replicas,
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create bucket {}: {}", name, e))?;
        Ok(store)
    }

    /// Latest live value and its revision
    async fn read_entry<T: DeserializeOwned>(store: &kv::Store, key: &str) -> Result<Option<(T, u64)>> {
        let entry = store
            .entry(key)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read key {}: {}", key, e))?;
        match entry {
            Some(entry) if entry.operation == kv::Operation::Put => {
                Ok(Some((from_bytes(&entry.value)?, entry.revision)))
            }
            _ => Ok(None),
        }
    }

    /// Revision of the latest entry, deleted or not
    async fn revision(store: &kv::Store, key: &str) -> Result<Option<u64>> {
        let entry = store
            .entry(key)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read key {}: {}", key, e))?;
        Ok(entry.map(|e| e.revision))
    }

    async fn read_value<T: DeserializeOwned>(store: &kv::Store, key: &str) -> Result<Option<T>> {
        Ok(Self::read_entry(store, key).await?.map(|(value, _)| value))
    }

    async fn put_value<T: Serialize>(store: &kv::Store, key: &str, value: &T) -> Result<u64> {
        let revision = store
            .put(key, to_bytes(value)?)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write key {}: {}", key, e))?;
        Ok(revision)
    }

    /// Insert only if the key holds no live value
    async fn create_value<T: Serialize>(store: &kv::Store, key: &str, value: &T) -> Result<u64> {
        store.create(key, to_bytes(value)?).await.map_err(|e| {
            if e.kind() == kv::CreateErrorKind::AlreadyExists {
                FleetError::AlreadyExists(key.to_string())
            } else {
                FleetError::Storage(anyhow::anyhow!("Failed to create key {}: {}", key, e))
            }
        })
    }

    async fn keys(store: &kv::Store) -> Result<Vec<String>> {
        let keys = store
            .keys()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list keys: {}", e))?;
        let mut keys: Vec<String> = keys
            .try_collect()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list keys: {}", e))?;
        keys.sort();
        Ok(keys)
    }

    /// Keys below one encoded id, in message id order
    async fn keys_under(store: &kv::Store, owner: &str) -> Result<Vec<String>> {
        let prefix = format!("{}.", encode_id(owner));
        Ok(Self::keys(store)
            .await?
            .into_iter()
            .filter(|key| key.starts_with(&prefix))
            .collect())
    }

    async fn values<T: DeserializeOwned>(store: &kv::Store, keys: &[String]) -> Result<Vec<T>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = Self::read_value(store, key).await? {
                values.push(value);
            }
        }
        Ok(values)
    }

    async fn purge(store: &kv::Store, key: &str) -> Result<()> {
        store
            .purge(key)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to purge key {}: {}", key, e))?;
        Ok(())
    }

    /// Take the lease if it is free or expired; `None` while someone holds it
    async fn acquire(&self, session_id: &SessionId, ttl: Duration) -> Result<Option<SessionLease>> {
        let key = encode_id(session_id.as_str());
        let current: Option<(LeaseRecord, u64)> = Self::read_entry(&self.buckets.leases, &key).await?;
        if matches!(&current, Some((record, _)) if record.is_live()) {
            return Ok(None);
        }

        let lease = SessionLease::new(session_id.clone(), ttl);
        let record = LeaseRecord {
            lease_id: lease.lease_id,
            expires_at: lease.expires_at,
        };
        let written = match current {
            Some((_, revision)) => self
                .buckets
                .leases
                .update(key.as_str(), to_bytes(&record)?, revision)
                .await
                .is_ok(),
            None => Self::create_value(&self.buckets.leases, &key, &record).await.is_ok(),
        };
        // losing the race to another worker is not an error
        Ok(written.then_some(lease))
    }

    /// The lease's stored record, if `lease` still holds it
    async fn held_lease(&self, lease: &SessionLease) -> Result<Option<u64>> {
        let key = encode_id(lease.session_id.as_str());
        let current: Option<(LeaseRecord, u64)> = Self::read_entry(&self.buckets.leases, &key).await?;
        Ok(current
            .filter(|(record, _)| record.lease_id == lease.lease_id && record.is_live())
            .map(|(_, revision)| revision))
    }

    async fn check_lease(&self, lease: &SessionLease) -> Result<()> {
        match self.held_lease(lease).await? {
            Some(_) => Ok(()),
            None => Err(conflict(&lease.session_id)),
        }
    }

    async fn push_inbound(&self, envelope: &MessageEnvelope) -> Result<()> {
        let key = format!("{}.{}", encode_id(envelope.session_id.as_str()), new_message_id());
        Self::put_value(&self.buckets.inbound, &key, envelope).await?;
        self.pending.apply(&key, kv::Operation::Put);
        Ok(())
    }

    async fn purge_inbound(&self, key: &str) -> Result<()> {
        Self::purge(&self.buckets.inbound, key).await?;
        self.pending.apply(key, kv::Operation::Purge);
        Ok(())
    }

    async fn apply_side_effects(&self, commit: &FlowCommit) -> Result<()> {
        for child in &commit.new_flows {
            let mut child = child.clone();
            child.version += 1;
            Self::create_value(&self.buckets.flows, &encode_id(child.session_id.as_str()), &child).await?;
        }
        for request in &commit.outbound {
            self.enqueue_outbound(request.clone()).await?;
        }
        for envelope in &commit.notifications {
            self.push_inbound(envelope).await?;
        }
        Ok(())
    }

    async fn check_children_absent(&self, commit: &FlowCommit) -> Result<()> {
        for child in &commit.new_flows {
            let key = encode_id(child.session_id.as_str());
            if Self::read_entry::<FlowInstance>(&self.buckets.flows, &key).await?.is_some() {
                return Err(FleetError::AlreadyExists(child.session_id.to_string()));
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl FlowStateStore for NATSStorage {
    async fn enqueue_inbound(&self, envelope: MessageEnvelope) -> Result<()> {
        self.push_inbound(&envelope).await
    }

    async fn lease_ready_sessions(&self, max: usize, ttl: Duration) -> Result<Vec<SessionLease>> {
        if !self.pending.is_live() {
            self.pending.reload(&Self::keys(&self.buckets.inbound).await?);
        }

        let mut leases = Vec::new();
        for encoded in self.pending.ready() {
            if leases.len() >= max {
                break;
            }
            let Some(session) = decode_id(&encoded) else {
                continue;
            };
            if let Some(lease) = self.acquire(&SessionId(session), ttl).await? {
                leases.push(lease);
            }
        }
        Ok(leases)
    }

    async fn try_lease(&self, session_id: &SessionId, ttl: Duration) -> Result<Option<SessionLease>> {
        self.acquire(session_id, ttl).await
    }

    async fn fetch_inbound(&self, lease: &SessionLease) -> Result<Vec<QueuedMessage>> {
        self.check_lease(lease).await?;
        let keys = if self.pending.is_live() {
            self.pending.keys_of(&lease.session_id)
        } else {
            Self::keys_under(&self.buckets.inbound, lease.session_id.as_str()).await?
        };
        let mut messages = Vec::new();
        for key in keys {
            if let Some(envelope) = Self::read_value(&self.buckets.inbound, &key).await? {
                messages.push(QueuedMessage {
                    message_id: key,
                    envelope,
                });
            }
        }
        Ok(messages)
    }

    async fn ack_inbound(&self, lease: &SessionLease, message_ids: &[String]) -> Result<()> {
        self.check_lease(lease).await?;
        for message_id in message_ids {
            self.purge_inbound(message_id).await?;
        }
        Ok(())
    }

    async fn read_flow_state(&self, session_id: &SessionId) -> Result<Option<FlowInstance>> {
        Self::read_value(&self.buckets.flows, &encode_id(session_id.as_str())).await
    }

    async fn create_flow(&self, commit: FlowCommit) -> Result<FlowInstance> {
        self.check_children_absent(&commit).await?;
        let mut flow = commit.flow.clone();
        flow.version += 1;
        Self::create_value(&self.buckets.flows, &encode_id(flow.session_id.as_str()), &flow)
            .await
            .map_err(|e| match e {
                FleetError::AlreadyExists(_) => FleetError::AlreadyExists(flow.session_id.to_string()),
                other => other,
            })?;
        self.apply_side_effects(&commit).await?;
        Ok(flow)
    }

    async fn write_flow_state(&self, lease: &SessionLease, commit: FlowCommit) -> Result<FlowInstance> {
        let session_id = commit.flow.session_id.clone();
        if lease.session_id != session_id {
            return Err(conflict(&session_id));
        }
        self.check_lease(lease).await?;

        let key = encode_id(session_id.as_str());
        let (stored, revision): (FlowInstance, u64) = Self::read_entry(&self.buckets.flows, &key)
            .await?
            .ok_or_else(|| conflict(&session_id))?;
        if stored.version != commit.flow.version {
            return Err(conflict(&session_id));
        }
        self.check_children_absent(&commit).await?;

        let mut flow = commit.flow.clone();
        flow.version += 1;
        self.buckets
            .flows
            .update(key.as_str(), to_bytes(&flow)?, revision)
            .await
            .map_err(|_| conflict(&session_id))?;

        self.apply_side_effects(&commit).await?;
        for message_id in &commit.acked {
            self.purge_inbound(message_id).await?;
        }
        Ok(flow)
    }

    async fn release_lease(&self, lease: &SessionLease) -> Result<()> {
        let Some(revision) = self.held_lease(lease).await? else {
            return Ok(());
        };
        let key = encode_id(lease.session_id.as_str());
        // a concurrent takeover wins; nothing to release then
        if let Err(e) = self
            .buckets
            .leases
            .update(key.as_str(), to_bytes(&LeaseRecord::released())?, revision)
            .await
        {
            debug!(session_id = %lease.session_id, "Lease changed before release: {}", e);
        }
        Ok(())
    }

    async fn enqueue_outbound(&self, request: AgentRequest) -> Result<()> {
        let key = format!("{}.{}", encode_id(request.client_id.as_str()), new_message_id());
        Self::put_value(&self.buckets.outbound, &key, &request).await?;
        Ok(())
    }

    async fn drain_outbound(&self, client_id: &ClientId, max: usize) -> Result<Vec<AgentRequest>> {
        let keys: Vec<String> = Self::keys_under(&self.buckets.outbound, client_id.as_str())
            .await?
            .into_iter()
            .take(max)
            .collect();
        let mut requests = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(request) = Self::read_value(&self.buckets.outbound, &key).await? {
                requests.push(request);
            }
            Self::purge(&self.buckets.outbound, &key).await?;
        }
        Ok(requests)
    }

    async fn list_flows(&self, client_id: Option<&ClientId>) -> Result<Vec<FlowInstance>> {
        let keys = Self::keys(&self.buckets.flows).await?;
        let mut flows: Vec<FlowInstance> = Self::values::<FlowInstance>(&self.buckets.flows, &keys)
            .await?
            .into_iter()
            .filter(|flow: &FlowInstance| client_id.map_or(true, |id| &flow.client_id == id))
            .collect();
        flows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(flows)
    }
}

#[async_trait::async_trait]
impl ClientStore for NATSStorage {
    async fn read_client(&self, client_id: &ClientId) -> Result<Option<ClientRecord>> {
        Self::read_value(&self.buckets.clients, &encode_id(client_id.as_str())).await
    }

    async fn write_client(&self, record: ClientRecord) -> Result<()> {
        Self::put_value(&self.buckets.clients, &encode_id(record.client_id.as_str()), &record).await?;
        Ok(())
    }

    async fn ensure_client(&self, client_id: &ClientId) -> Result<ClientRecord> {
        let key = encode_id(client_id.as_str());
        if let Some(record) = Self::read_value(&self.buckets.clients, &key).await? {
            return Ok(record);
        }
        let placeholder = ClientRecord::placeholder(client_id.clone());
        match Self::create_value(&self.buckets.clients, &key, &placeholder).await {
            Ok(_) => Ok(placeholder),
            // created concurrently
            Err(FleetError::AlreadyExists(_)) => Ok(Self::read_value(&self.buckets.clients, &key)
                .await?
                .unwrap_or(placeholder)),
            Err(e) => Err(e),
        }
    }

    async fn list_clients(&self) -> Result<Vec<ClientRecord>> {
        let keys = Self::keys(&self.buckets.clients).await?;
        let mut clients: Vec<ClientRecord> = Self::values(&self.buckets.clients, &keys).await?;
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(clients)
    }

    async fn write_crash(&self, crash: CrashRecord) -> Result<()> {
        let key = format!("{}.{}", encode_id(crash.client_id.as_str()), new_message_id());
        Self::put_value(&self.buckets.crashes, &key, &crash).await?;

        let mut client = self.ensure_client(&crash.client_id).await?;
        client.last_crash = Some(crash);
        self.write_client(client).await
    }

    async fn list_client_crashes(&self, client_id: &ClientId) -> Result<Vec<CrashRecord>> {
        let keys = Self::keys_under(&self.buckets.crashes, client_id.as_str()).await?;
        Self::values(&self.buckets.crashes, &keys).await
    }

    async fn list_flow_crashes(&self, session_id: &SessionId) -> Result<Vec<CrashRecord>> {
        let keys = match session_id.client_id() {
            Some(client_id) => Self::keys_under(&self.buckets.crashes, client_id.as_str()).await?,
            None => Self::keys(&self.buckets.crashes).await?,
        };
        let crashes: Vec<CrashRecord> = Self::values(&self.buckets.crashes, &keys).await?;
        Ok(crashes
            .into_iter()
            .filter(|crash| crash.session_id.as_ref() == Some(session_id))
            .collect())
    }
}

#[async_trait::async_trait]
impl HuntStore for NATSStorage {
    async fn create_hunt(&self, hunt: Hunt) -> Result<Hunt> {
        Self::create_value(&self.buckets.hunts, &encode_id(hunt.hunt_id.as_str()), &hunt)
            .await
            .map_err(|e| match e {
                FleetError::AlreadyExists(_) => FleetError::AlreadyExists(hunt.hunt_id.to_string()),
                other => other,
            })?;
        Ok(hunt)
    }

    async fn read_hunt(&self, hunt_id: &HuntId) -> Result<Option<Hunt>> {
        Self::read_value(&self.buckets.hunts, &encode_id(hunt_id.as_str())).await
    }

    async fn write_hunt(&self, mut hunt: Hunt) -> Result<Hunt> {
        let key = encode_id(hunt.hunt_id.as_str());
        let hunt_id = hunt.hunt_id.to_string();
        let hunt_conflict = || FleetError::ConcurrentModification { key: hunt_id.clone() };
        let (stored, revision): (Hunt, u64) = Self::read_entry(&self.buckets.hunts, &key)
            .await?
            .ok_or_else(|| FleetError::HuntNotFound(hunt_id.clone()))?;
        if stored.version != hunt.version {
            return Err(hunt_conflict());
        }

        hunt.version += 1;
        // the revision catches a writer in another process between read and update
        self.buckets
            .hunts
            .update(key.as_str(), to_bytes(&hunt)?, revision)
            .await
            .map_err(|_| hunt_conflict())?;
        Ok(hunt)
    }

    async fn list_hunts(&self) -> Result<Vec<Hunt>> {
        let keys = Self::keys(&self.buckets.hunts).await?;
        let mut hunts: Vec<Hunt> = Self::values(&self.buckets.hunts, &keys).await?;
        hunts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(hunts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FlowSpec, FlowStatus};
    use serde_json::json;

    #[test]
    fn test_ids_encode_to_valid_keys() {
        let session = "C.1000000000000000/flows/F.1A2B3C4D";
        let key = encode_id(session);
        assert!(key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(decode_id(&key).as_deref(), Some(session));
    }

    #[test]
    fn test_message_ids_sort_in_creation_order() {
        let first = new_message_id();
        std::thread::sleep(Duration::from_millis(2));
        let second = new_message_id();
        assert!(first < second);
    }

    #[test]
    fn test_pending_index_orders_sessions_by_oldest_message() {
        let index = PendingIndex::new();
        let first = SessionId("C.1000000000000000/flows/F.1".to_string());
        let second = SessionId("C.1000000000000000/flows/F.2".to_string());
        let key = |session: &SessionId, id: &str| format!("{}.{}", encode_id(session.as_str()), id);

        index.apply(&key(&second, "0001-b"), kv::Operation::Put);
        index.apply(&key(&first, "0002-a"), kv::Operation::Put);
        index.apply(&key(&second, "0003-c"), kv::Operation::Put);
        assert_eq!(
            index.ready(),
            vec![encode_id(second.as_str()), encode_id(first.as_str())]
        );
        assert_eq!(
            index.keys_of(&second),
            vec![key(&second, "0001-b"), key(&second, "0003-c")]
        );

        // consuming the oldest message moves the session back in line
        index.apply(&key(&second, "0001-b"), kv::Operation::Purge);
        assert_eq!(
            index.ready(),
            vec![encode_id(first.as_str()), encode_id(second.as_str())]
        );

        index.apply(&key(&second, "0003-c"), kv::Operation::Purge);
        index.apply(&key(&first, "0002-a"), kv::Operation::Delete);
        assert!(index.ready().is_empty());
        assert!(index.keys_of(&first).is_empty());
    }

    #[test]
    fn test_pending_index_reload_replaces_contents() {
        let index = PendingIndex::new();
        let session = SessionId("C.1000000000000000/flows/F.1".to_string());
        let encoded = encode_id(session.as_str());
        index.apply(&format!("{}.0001-a", encoded), kv::Operation::Put);

        index.reload(&[format!("{}.0005-e", encoded), "not-an-inbound-key".to_string()]);
        assert_eq!(index.keys_of(&session), vec![format!("{}.0005-e", encoded)]);
        assert_eq!(index.ready(), vec![encoded]);
    }

    #[test]
    fn test_released_lease_is_not_live() {
        assert!(!LeaseRecord::released().is_live());
    }

    /// Needs a JetStream-enabled server at nats://localhost:4222
    #[tokio::test]
    #[ignore]
    async fn test_commit_against_live_server() {
        let config = NATSStorageConfig {
            bucket_prefix: format!("fleet_test_{}", Uuid::new_v4().simple()),
            ..NATSStorageConfig::default()
        };
        let store = NATSStorage::new(config).await.unwrap();

        let client_id = ClientId::from_index(0);
        let session = SessionId::for_flow(&client_id, &crate::models::FlowId::random());
        let flow = FlowInstance::new(session.clone(), client_id, &FlowSpec::new("ClientActionRunner", json!({})));
        let created = store.create_flow(FlowCommit::new(flow)).await.unwrap();
        assert_eq!(created.version, 1);

        store
            .enqueue_inbound(MessageEnvelope::status(session.clone(), 1, 0, FlowStatus::ok()))
            .await
            .unwrap();
        let lease = store
            .lease_ready_sessions(10, Duration::from_secs(30))
            .await
            .unwrap()
            .remove(0);
        assert!(store.try_lease(&session, Duration::from_secs(30)).await.unwrap().is_none());

        let messages = store.fetch_inbound(&lease).await.unwrap();
        assert_eq!(messages.len(), 1);

        let mut commit = FlowCommit::new(created.clone());
        commit.acked = messages.into_iter().map(|m| m.message_id).collect();
        let written = store.write_flow_state(&lease, commit).await.unwrap();
        assert_eq!(written.version, 2);

        // stale version loses
        let stale = store.write_flow_state(&lease, FlowCommit::new(created)).await;
        assert!(matches!(stale, Err(FleetError::ConcurrentModification { .. })));

        store.release_lease(&lease).await.unwrap();
        assert!(store.fetch_inbound(&lease).await.is_err());
    }

    /// Needs a JetStream-enabled server at nats://localhost:4222
    #[tokio::test]
    #[ignore]
    async fn test_stale_hunt_write_against_live_server() {
        let config = NATSStorageConfig {
            bucket_prefix: format!("fleet_test_{}", Uuid::new_v4().simple()),
            ..NATSStorageConfig::default()
        };
        let store = NATSStorage::new(config).await.unwrap();

        let spec = crate::models::HuntSpec {
            description: String::new(),
            flow: FlowSpec::new("ClientActionRunner", json!({"action": "Echo"})),
            client_selection: crate::models::ClientSelection::All,
            client_rate: None,
            crash_alert_target: None,
            failure_threshold: None,
            creator: None,
        };
        let created = store
            .create_hunt(Hunt::from_spec(HuntId::random(), spec, 20))
            .await
            .unwrap();
        let written = store.write_hunt(created.clone()).await.unwrap();
        assert_eq!(written.version, 1);

        let stale = store.write_hunt(created).await;
        assert!(matches!(stale, Err(FleetError::ConcurrentModification { .. })));
    }
}
