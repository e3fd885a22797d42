// Hunt coordinator - fan a flow out across the fleet under a rate limit

//! # Hunts
//!
//! A hunt runs one flow spec on many clients. The coordinator:
//!
//! 1. validates the flow spec once when the hunt is created
//! 2. starts one flow per client, at most `client_rate` per tick; the rest wait
//!    in the hunt's queue for later ticks
//! 3. observes the terminal transitions of its flows, alerts the hunt's own
//!    target on errors and crashes, and pauses the hunt once the failure
//!    threshold is crossed
//!
//! Pausing never touches flows that are already running, and a hunt never
//! retries a client on its own.
//!
//! ## Token Buckets
//!
//! Every hunt has its own bucket holding `client_rate` tokens per tick. Starting
//! a client takes a token; [`HuntCoordinator::tick`] refills the bucket and
//! drains the queue. The bucket's mutex also serializes every read-modify-write
//! of the hunt record inside this process. Across processes the store compares
//! the hunt's version on write, and the coordinator re-applies the edit to a
//! fresh copy when another writer got in first. Tokens and alerts are only
//! committed once the write went through.
//!
//! ## Rust Learning Notes:
//!
//! ### DashMap of Arc<Mutex<_>>
//! `DashMap` shards its locks, so looking up one hunt's bucket never blocks
//! work on another hunt. The bucket itself sits behind a `tokio::sync::Mutex`
//! because the hunt update awaits the store while holding it.
//!
//! ### Weak References Against Cycles
//! The runner owns its observers and the coordinator owns the runner. The
//! observer handed to the runner holds a `Weak<HuntCoordinator>`, so the two
//! do not keep each other alive.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::alerts::AlertDispatcher;
use super::events::{EngineEvent, EventBus};
use super::runner::{FlowObserver, FlowRunner};
use super::storage::{ClientStore, FleetStore, HuntStore};
use crate::models::{
    ClientId, ClientSelection, FlowInstance, FlowStartRequest, FlowState, Hunt, HuntId, HuntSpec,
    HuntState, SessionId,
};
use crate::{FleetError, Result};

/// Attempts of one hunt read-modify-write before the conflict is returned
const HUNT_WRITE_ATTEMPTS: u32 = 5;

/// Per-hunt token bucket, refilled once per tick
#[derive(Debug, Clone, Default)]
struct TokenBucket {
    tokens: u32,
    initialized: bool,
}

impl TokenBucket {
    /// A bucket seen for the first time starts full
    fn init(&mut self, capacity: u32) {
        if !self.initialized {
            self.tokens = capacity;
            self.initialized = true;
        }
    }

    fn refill(&mut self, capacity: u32) {
        self.tokens = capacity;
        self.initialized = true;
    }

    fn try_acquire(&mut self) -> bool {
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// What one attempt of [`HuntCoordinator::edit_hunt`] did to the record
enum HuntEdit<T> {
    /// Persist the edited hunt
    Write(T),
    /// Nothing changed; skip the write
    Unchanged(T),
}

/// Result of a dispatch round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HuntDispatch {
    pub started: Vec<SessionId>,
    /// Clients still waiting for a later tick
    pub queued: usize,
}

/// Aggregate view of a hunt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HuntStats {
    pub hunt_id: HuntId,
    pub state: HuntState,
    pub started: u64,
    pub queued: usize,
    pub completed: u64,
    pub errors: u64,
    pub crashes: u64,
    pub pause_reason: Option<String>,
}

impl From<&Hunt> for HuntStats {
    fn from(hunt: &Hunt) -> Self {
        Self {
            hunt_id: hunt.hunt_id.clone(),
            state: hunt.state,
            started: hunt.counters.started,
            queued: hunt.queued_clients.len(),
            completed: hunt.counters.completed,
            errors: hunt.counters.errors,
            crashes: hunt.counters.crashes,
            pause_reason: hunt.pause_reason.clone(),
        }
    }
}

pub struct HuntCoordinator {
    store: Arc<dyn FleetStore>,
    runner: Arc<FlowRunner>,
    alerts: AlertDispatcher,
    events: EventBus,
    default_rate: u32,
    buckets: DashMap<HuntId, Arc<Mutex<TokenBucket>>>,
}

impl HuntCoordinator {
    pub fn new(runner: Arc<FlowRunner>, alerts: AlertDispatcher, default_rate: u32) -> Self {
        Self {
            store: runner.store().clone(),
            events: runner.events().clone(),
            runner,
            alerts,
            default_rate,
            buckets: DashMap::new(),
        }
    }

    /// Observer to register with the runner so hunt flows report back
    pub fn observer(self: &Arc<Self>) -> Arc<dyn FlowObserver> {
        Arc::new(HuntObserver {
            coordinator: Arc::downgrade(self),
        })
    }

    fn bucket(&self, hunt_id: &HuntId) -> Arc<Mutex<TokenBucket>> {
        self.buckets
            .entry(hunt_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::default())))
            .clone()
    }

    pub async fn read_hunt(&self, hunt_id: &HuntId) -> Result<Hunt> {
        self.store
            .read_hunt(hunt_id)
            .await?
            .ok_or_else(|| FleetError::HuntNotFound(hunt_id.to_string()))
    }

    pub async fn list_hunts(&self) -> Result<Vec<Hunt>> {
        self.store.list_hunts().await
    }

    pub async fn hunt_stats(&self, hunt_id: &HuntId) -> Result<HuntStats> {
        Ok(HuntStats::from(&self.read_hunt(hunt_id).await?))
    }

    /// Create a hunt and dispatch the clients its selection resolves to
    ///
    /// The flow spec is validated once here; an invalid spec creates nothing.
    pub async fn start_hunt(&self, spec: HuntSpec) -> Result<Hunt> {
        self.runner.flows().validate(&spec.flow)?;

        let hunt = Hunt::from_spec(HuntId::random(), spec, self.default_rate);
        let hunt = self.store.create_hunt(hunt).await?;
        info!(
            hunt_id = %hunt.hunt_id,
            flow_name = %hunt.flow.flow_name,
            client_rate = hunt.client_rate,
            "Created hunt"
        );

        let clients = self.resolve_selection(&hunt.client_selection).await?;
        if !clients.is_empty() {
            self.start_clients(&hunt.hunt_id, clients).await?;
        }
        self.read_hunt(&hunt.hunt_id).await
    }

    async fn resolve_selection(&self, selection: &ClientSelection) -> Result<Vec<ClientId>> {
        Ok(match selection {
            ClientSelection::Clients { client_ids } => client_ids.clone(),
            ClientSelection::All => self
                .store
                .list_clients()
                .await?
                .into_iter()
                .map(|c| c.client_id)
                .collect(),
            ClientSelection::Label { label } => self
                .store
                .list_clients()
                .await?
                .into_iter()
                .filter(|c| c.has_label(label))
                .map(|c| c.client_id)
                .collect(),
        })
    }

    /// Read-modify-write of one hunt record
    ///
    /// The bucket lock serializes writers inside this process; a writer in
    /// another process shows up as `ConcurrentModification`, and the edit is
    /// applied again to a fresh copy.
    async fn edit_hunt<T>(
        &self,
        hunt_id: &HuntId,
        mut edit: impl FnMut(&mut Hunt) -> Result<HuntEdit<T>>,
    ) -> Result<(Hunt, T)> {
        let mut attempt = 1;
        loop {
            let mut hunt = self.read_hunt(hunt_id).await?;
            let value = match edit(&mut hunt)? {
                HuntEdit::Unchanged(value) => return Ok((hunt, value)),
                HuntEdit::Write(value) => value,
            };
            hunt.updated_at = Utc::now();
            match self.store.write_hunt(hunt).await {
                Ok(hunt) => return Ok((hunt, value)),
                Err(FleetError::ConcurrentModification { .. }) if attempt < HUNT_WRITE_ATTEMPTS => {
                    debug!(hunt_id = %hunt_id, attempt, "Hunt changed during update, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Add clients to a hunt; as many as the current tick allows start now
    ///
    /// Clients the hunt already knows are ignored. A paused hunt only queues.
    ///
    /// ## Errors
    /// - `HuntNotFound`
    /// - `InvalidState` for a stopped hunt
    pub async fn start_clients(&self, hunt_id: &HuntId, client_ids: Vec<ClientId>) -> Result<HuntDispatch> {
        let bucket = self.bucket(hunt_id);
        let (hunt, planned) = {
            let mut bucket = bucket.lock().await;
            let (hunt, (planned, tokens)) = self
                .edit_hunt(hunt_id, |hunt| {
                    if hunt.state == HuntState::Stopped {
                        return Err(FleetError::InvalidState(format!("hunt {} is stopped", hunt.hunt_id)));
                    }
                    let mut tokens = bucket.clone();
                    tokens.init(hunt.client_rate);

                    for client_id in &client_ids {
                        if hunt.knows_client(client_id) {
                            debug!(hunt_id = %hunt.hunt_id, client_id = %client_id, "Client already part of hunt");
                            continue;
                        }
                        hunt.queued_clients.push_back(client_id.clone());
                    }
                    let planned = Self::plan_starts(hunt, &mut tokens);
                    Ok(HuntEdit::Write((planned, tokens)))
                })
                .await?;
            *bucket = tokens;
            (hunt, planned)
        };

        self.launch(&hunt, planned).await
    }

    /// Refill the hunt's bucket and start queued clients
    pub async fn tick(&self, hunt_id: &HuntId) -> Result<HuntDispatch> {
        let bucket = self.bucket(hunt_id);
        let (hunt, planned) = {
            let mut bucket = bucket.lock().await;
            let (hunt, (planned, tokens)) = self
                .edit_hunt(hunt_id, |hunt| {
                    let mut tokens = bucket.clone();
                    tokens.refill(hunt.client_rate);
                    let planned = Self::plan_starts(hunt, &mut tokens);
                    Ok(if planned.is_empty() {
                        HuntEdit::Unchanged((planned, tokens))
                    } else {
                        HuntEdit::Write((planned, tokens))
                    })
                })
                .await?;
            *bucket = tokens;
            (hunt, planned)
        };

        self.launch(&hunt, planned).await
    }

    /// Tick every running hunt. Returns the number of flows started.
    pub async fn tick_all(&self) -> Result<usize> {
        let mut started = 0;
        for hunt in self.store.list_hunts().await? {
            if hunt.state != HuntState::Started {
                continue;
            }
            match self.tick(&hunt.hunt_id).await {
                Ok(dispatch) => started += dispatch.started.len(),
                Err(e) => warn!(hunt_id = %hunt.hunt_id, "Hunt tick failed: {}", e),
            }
        }
        Ok(started)
    }

    /// Take clients off the queue while the bucket has tokens
    fn plan_starts(hunt: &mut Hunt, bucket: &mut TokenBucket) -> Vec<(ClientId, SessionId)> {
        let mut planned = Vec::new();
        if hunt.state != HuntState::Started {
            return planned;
        }

        while let Some(client_id) = hunt.queued_clients.front().cloned() {
            if hunt.is_rate_limited() && !bucket.try_acquire() {
                debug!(
                    hunt_id = %hunt.hunt_id,
                    queued = hunt.queued_clients.len(),
                    "{}",
                    FleetError::RateLimitExceeded {
                        hunt_id: hunt.hunt_id.to_string()
                    }
                );
                break;
            }
            hunt.queued_clients.pop_front();
            let session_id = SessionId::for_hunt(&client_id, &hunt.hunt_id);
            hunt.started_sessions.insert(client_id.clone(), session_id.clone());
            hunt.counters.started += 1;
            planned.push((client_id, session_id));
        }
        planned
    }

    /// Start the planned flows; runs without the bucket lock because a flow
    /// that finishes during its start reports back through the observer
    async fn launch(&self, hunt: &Hunt, planned: Vec<(ClientId, SessionId)>) -> Result<HuntDispatch> {
        let mut started = Vec::with_capacity(planned.len());
        for (client_id, session_id) in planned {
            let request = FlowStartRequest {
                client_id: client_id.clone(),
                flow: hunt.flow.clone(),
                session_id: Some(session_id.clone()),
                hunt_id: Some(hunt.hunt_id.clone()),
                creator: hunt.creator.clone(),
            };
            match self.runner.start_flow(request).await {
                Ok(flow) => {
                    debug!(hunt_id = %hunt.hunt_id, client_id = %client_id, session_id = %flow.session_id, "Started hunt flow");
                    started.push(flow.session_id);
                }
                Err(e) => {
                    error!(hunt_id = %hunt.hunt_id, client_id = %client_id, "Failed to start hunt flow: {}", e);
                    self.record_start_failure(&hunt.hunt_id, &client_id, &session_id, &e.to_string())
                        .await?;
                }
            }
        }

        if !started.is_empty() {
            info!(hunt_id = %hunt.hunt_id, count = started.len(), queued = hunt.queued_clients.len(), "Dispatched hunt clients");
        }
        Ok(HuntDispatch {
            started,
            queued: hunt.queued_clients.len(),
        })
    }

    /// Stop dispatching new clients; running flows continue
    pub async fn pause_hunt(&self, hunt_id: &HuntId, reason: &str) -> Result<Hunt> {
        let bucket = self.bucket(hunt_id);
        let _guard = bucket.lock().await;
        let (hunt, paused) = self
            .edit_hunt(hunt_id, |hunt| match hunt.state {
                HuntState::Paused => Ok(HuntEdit::Unchanged(false)),
                HuntState::Stopped => Err(FleetError::InvalidState(format!("hunt {} is stopped", hunt.hunt_id))),
                HuntState::Started => {
                    Self::pause(hunt, reason);
                    Ok(HuntEdit::Write(true))
                }
            })
            .await?;
        if paused {
            self.announce_pause(&hunt, reason);
        }
        Ok(hunt)
    }

    /// Resume a paused hunt; queued clients start with the tokens left in this tick
    pub async fn resume_hunt(&self, hunt_id: &HuntId) -> Result<Hunt> {
        let bucket = self.bucket(hunt_id);
        let (hunt, planned) = {
            let mut bucket = bucket.lock().await;
            let (hunt, resumed) = self
                .edit_hunt(hunt_id, |hunt| match hunt.state {
                    HuntState::Started => Ok(HuntEdit::Unchanged(None)),
                    HuntState::Stopped => Err(FleetError::InvalidState(format!("hunt {} is stopped", hunt.hunt_id))),
                    HuntState::Paused => {
                        let mut tokens = bucket.clone();
                        tokens.init(hunt.client_rate);
                        hunt.state = HuntState::Started;
                        hunt.pause_reason = None;
                        let planned = Self::plan_starts(hunt, &mut tokens);
                        Ok(HuntEdit::Write(Some((planned, tokens))))
                    }
                })
                .await?;
            let Some((planned, tokens)) = resumed else {
                return Ok(hunt);
            };
            *bucket = tokens;
            info!(hunt_id = %hunt_id, "Resumed hunt");
            (hunt, planned)
        };

        self.launch(&hunt, planned).await?;
        self.read_hunt(hunt_id).await
    }

    /// Stop the hunt for good; queued clients are dropped, running flows continue
    pub async fn stop_hunt(&self, hunt_id: &HuntId) -> Result<Hunt> {
        let bucket = self.bucket(hunt_id);
        let _guard = bucket.lock().await;
        let (hunt, dropped) = self
            .edit_hunt(hunt_id, |hunt| {
                if hunt.state == HuntState::Stopped {
                    return Ok(HuntEdit::Unchanged(None));
                }
                let dropped = hunt.queued_clients.len();
                hunt.state = HuntState::Stopped;
                hunt.queued_clients.clear();
                Ok(HuntEdit::Write(Some(dropped)))
            })
            .await?;
        if let Some(dropped) = dropped {
            info!(hunt_id = %hunt_id, dropped, "Stopped hunt");
        }
        Ok(hunt)
    }

    fn pause(hunt: &mut Hunt, reason: &str) {
        hunt.state = HuntState::Paused;
        hunt.pause_reason = Some(reason.to_string());
    }

    fn announce_pause(&self, hunt: &Hunt, reason: &str) {
        warn!(hunt_id = %hunt.hunt_id, reason, "Paused hunt");
        self.events.publish(EngineEvent::HuntPaused {
            hunt_id: hunt.hunt_id.clone(),
            reason: reason.to_string(),
        });
    }

    /// Pause a running hunt whose failures crossed the threshold; returns the reason
    fn check_threshold(hunt: &mut Hunt) -> Option<String> {
        if hunt.state != HuntState::Started || !hunt.threshold_reached() {
            return None;
        }
        let reason = format!(
            "{} failures reached the threshold of {}",
            hunt.counters.failures(),
            hunt.failure_threshold.unwrap_or_default()
        );
        Self::pause(hunt, &reason);
        Some(reason)
    }

    /// Account for a hunt flow that reached a terminal state
    async fn record_outcome(&self, hunt_id: &HuntId, flow: &FlowInstance) -> Result<()> {
        let failure = match flow.state {
            FlowState::Running => return Ok(()),
            FlowState::Terminated => None,
            FlowState::Error => Some((
                "failed",
                flow.failure
                    .as_ref()
                    .map(|f| f.message.clone())
                    .unwrap_or_default(),
            )),
            FlowState::Crashed => Some((
                "crashed",
                flow.crash
                    .as_ref()
                    .map(|c| c.crash_message.clone())
                    .unwrap_or_default(),
            )),
        };

        let bucket = self.bucket(hunt_id);
        let _guard = bucket.lock().await;
        let (hunt, paused) = self
            .edit_hunt(hunt_id, |hunt| {
                match flow.state {
                    FlowState::Error => hunt.counters.errors += 1,
                    FlowState::Crashed => hunt.counters.crashes += 1,
                    _ => hunt.counters.completed += 1,
                }
                let paused = if failure.is_some() {
                    Self::check_threshold(hunt)
                } else {
                    None
                };
                Ok(HuntEdit::Write(paused))
            })
            .await?;

        if let Some((what, detail)) = &failure {
            self.notify_failure(&hunt, &flow.client_id, &flow.session_id, what, detail, paused.as_deref())
                .await;
        }
        Ok(())
    }

    async fn record_start_failure(
        &self,
        hunt_id: &HuntId,
        client_id: &ClientId,
        session_id: &SessionId,
        message: &str,
    ) -> Result<()> {
        let bucket = self.bucket(hunt_id);
        let _guard = bucket.lock().await;
        let (hunt, paused) = self
            .edit_hunt(hunt_id, |hunt| {
                hunt.counters.errors += 1;
                Ok(HuntEdit::Write(Self::check_threshold(hunt)))
            })
            .await?;
        self.notify_failure(&hunt, client_id, session_id, "failed to start", message, paused.as_deref())
            .await;
        Ok(())
    }

    /// Hunt alert for one failed client, plus the pause notice when it paused the hunt
    async fn notify_failure(
        &self,
        hunt: &Hunt,
        client_id: &ClientId,
        session_id: &SessionId,
        what: &str,
        detail: &str,
        paused: Option<&str>,
    ) {
        if let Some(target) = &hunt.crash_alert_target {
            let subject = format!("Hunt {}: client {} {}", hunt.hunt_id, client_id, what);
            let body = format!(
                "Flow {} of hunt {} {} on client {}.\n\nClient: {}\nSession: {}\nDetail: {}\n",
                hunt.flow.flow_name,
                hunt.hunt_id,
                what,
                client_id,
                self.alerts.client_link(client_id),
                session_id,
                detail
            );
            self.alerts.send(target, &subject, &body).await;
        }

        if let Some(reason) = paused {
            self.announce_pause(hunt, reason);
            let target = hunt
                .crash_alert_target
                .clone()
                .unwrap_or_else(|| self.alerts.default_target().to_string());
            let subject = format!("Hunt {} paused", hunt.hunt_id);
            let body = format!("Hunt {} was paused: {}\n", hunt.hunt_id, reason);
            self.alerts.send(&target, &subject, &body).await;
        }
    }

    /// Tick all hunts every `interval` until cancelled
    pub fn start_ticker(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.tick_all().await {
                            Ok(started) if started > 0 => debug!(started, "Hunt tick"),
                            Ok(_) => {}
                            Err(e) => warn!("Hunt tick failed: {}", e),
                        }
                    }
                }
            }
            info!("Hunt ticker stopped");
        })
    }
}

/// Forwards terminal transitions of hunt flows to the coordinator
struct HuntObserver {
    coordinator: Weak<HuntCoordinator>,
}

#[async_trait]
impl FlowObserver for HuntObserver {
    async fn flow_finished(&self, flow: &FlowInstance) {
        let Some(hunt_id) = &flow.hunt_id else {
            return;
        };
        // child flows of a hunt flow report to their parent, not to the hunt
        if flow.parent.is_some() {
            return;
        }
        let Some(coordinator) = self.coordinator.upgrade() else {
            return;
        };
        if let Err(e) = coordinator.record_outcome(hunt_id, flow).await {
            warn!(hunt_id = %hunt_id, session_id = %flow.session_id, "Failed to record hunt outcome: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::alerts::MemoryAlertSender;
    use crate::engine::flow::{ActionRegistry, FlowRegistry};
    use crate::engine::storage::{FlowStateStore, InMemoryStorage};
    use crate::models::{ClientRecord, FlowSpec, FlowStatus, MessageEnvelope};
    use serde_json::json;

    struct Harness {
        store: Arc<InMemoryStorage>,
        sink: Arc<MemoryAlertSender>,
        runner: Arc<FlowRunner>,
        hunts: Arc<HuntCoordinator>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryStorage::new());
        let sink = Arc::new(MemoryAlertSender::new());
        let alerts = AlertDispatcher::new(sink.clone(), "sec@example.com", "http://localhost:8000");
        let runner = Arc::new(FlowRunner::new(
            store.clone(),
            Arc::new(FlowRegistry::standard()),
            Arc::new(ActionRegistry::standard()),
            alerts.clone(),
            EventBus::new(),
            Duration::from_secs(30),
        ));
        let hunts = Arc::new(HuntCoordinator::new(runner.clone(), alerts, 20));
        runner.add_observer(hunts.observer()).await;
        Harness {
            store,
            sink,
            runner,
            hunts,
        }
    }

    fn clients(n: u64) -> Vec<ClientId> {
        (0..n).map(ClientId::from_index).collect()
    }

    fn spec(client_ids: Vec<ClientId>, rate: u32) -> HuntSpec {
        HuntSpec {
            description: String::new(),
            flow: FlowSpec::new("ClientActionRunner", json!({"action": "Echo"})),
            client_selection: ClientSelection::Clients { client_ids },
            client_rate: Some(rate),
            crash_alert_target: None,
            failure_threshold: None,
            creator: Some("tester".to_string()),
        }
    }

    impl Harness {
        async fn deliver(&self, envelope: MessageEnvelope) {
            let session = envelope.session_id.clone();
            self.store.enqueue_inbound(envelope).await.unwrap();
            let lease = self
                .store
                .try_lease(&session, Duration::from_secs(30))
                .await
                .unwrap()
                .unwrap();
            self.runner.process_session(&lease).await.unwrap();
            self.store.release_lease(&lease).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_rate_limit_spreads_clients_over_ticks() {
        let h = harness().await;
        let hunt = h.hunts.start_hunt(spec(clients(5), 2)).await.unwrap();
        let hunt_id = hunt.hunt_id.clone();

        assert_eq!(hunt.started_sessions.len(), 2);
        assert_eq!(hunt.queued_clients.len(), 3);
        assert_eq!(h.store.list_flows(None).await.unwrap().len(), 2);

        let dispatch = h.hunts.tick(&hunt_id).await.unwrap();
        assert_eq!(dispatch.started.len(), 2);
        assert_eq!(dispatch.queued, 1);

        let dispatch = h.hunts.tick(&hunt_id).await.unwrap();
        assert_eq!(dispatch.started.len(), 1);
        assert_eq!(dispatch.queued, 0);

        let stats = h.hunts.hunt_stats(&hunt_id).await.unwrap();
        assert_eq!(stats.started, 5);
        assert_eq!(stats.queued, 0);

        let flows = h.store.list_flows(None).await.unwrap();
        assert_eq!(flows.len(), 5);
        assert!(flows.iter().all(|f| f.hunt_id.as_ref() == Some(&hunt_id)));
        assert!(flows.iter().all(|f| f.creator.as_deref() == Some("tester")));
    }

    #[tokio::test]
    async fn test_hunts_have_independent_buckets() {
        let h = harness().await;
        let first = h.hunts.start_hunt(spec(clients(3), 1)).await.unwrap();
        let second = h.hunts.start_hunt(spec(clients(3), 1)).await.unwrap();

        assert_eq!(first.started_sessions.len(), 1);
        assert_eq!(second.started_sessions.len(), 1);
        assert_eq!(h.hunts.tick_all().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_known_clients_are_not_started_twice() {
        let h = harness().await;
        let hunt = h.hunts.start_hunt(spec(clients(2), 0)).await.unwrap();
        assert_eq!(hunt.started_sessions.len(), 2);

        let dispatch = h.hunts.start_clients(&hunt.hunt_id, clients(3)).await.unwrap();
        assert_eq!(dispatch.started.len(), 1);
        assert_eq!(h.store.list_flows(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_label_selection() {
        let h = harness().await;
        h.store
            .write_client(ClientRecord::new(ClientId::from_index(0)).with_label("linux"))
            .await
            .unwrap();
        h.store
            .write_client(ClientRecord::new(ClientId::from_index(1)).with_label("windows"))
            .await
            .unwrap();

        let mut spec = spec(Vec::new(), 0);
        spec.client_selection = ClientSelection::Label {
            label: "linux".to_string(),
        };
        let hunt = h.hunts.start_hunt(spec).await.unwrap();
        assert_eq!(hunt.started_sessions.len(), 1);
        assert!(hunt.started_sessions.contains_key(&ClientId::from_index(0)));
    }

    #[tokio::test]
    async fn test_invalid_flow_creates_no_hunt() {
        let h = harness().await;
        let mut bad = spec(clients(1), 1);
        bad.flow = FlowSpec::new("NoSuchFlow", json!({}));
        assert!(matches!(
            h.hunts.start_hunt(bad).await,
            Err(FleetError::UnknownFlowClass(_))
        ));
        assert!(h.hunts.list_hunts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_crash_alerts_hunt_target_before_default() {
        let h = harness().await;
        let mut spec = spec(clients(1), 0);
        spec.crash_alert_target = Some("ops@example.com".to_string());
        let hunt = h.hunts.start_hunt(spec).await.unwrap();
        let session = hunt.started_sessions[&ClientId::from_index(0)].clone();

        h.deliver(MessageEnvelope::status(session.clone(), 1, 0, FlowStatus::client_killed()))
            .await;

        let alerts = h.sink.alerts().await;
        let targets: Vec<&str> = alerts.iter().map(|a| a.target.as_str()).collect();
        assert_eq!(targets, vec!["ops@example.com", "sec@example.com"]);

        let stats = h.hunts.hunt_stats(&hunt.hunt_id).await.unwrap();
        assert_eq!(stats.crashes, 1);
        assert_eq!(stats.state, HuntState::Started);
    }

    #[tokio::test]
    async fn test_failure_threshold_pauses_hunt() {
        let h = harness().await;
        let mut events = h.runner.events().subscribe();
        let mut spec = spec(clients(3), 2);
        spec.failure_threshold = Some(1);
        let hunt = h.hunts.start_hunt(spec).await.unwrap();
        let hunt_id = hunt.hunt_id.clone();
        let failing = hunt.started_sessions[&ClientId::from_index(0)].clone();
        let running = hunt.started_sessions[&ClientId::from_index(1)].clone();

        h.deliver(MessageEnvelope::error(failing, 1, 0, "access denied")).await;

        let stats = h.hunts.hunt_stats(&hunt_id).await.unwrap();
        assert_eq!(stats.state, HuntState::Paused);
        assert_eq!(stats.errors, 1);

        // paused: the tick starts nothing, the running flow is untouched
        let dispatch = h.hunts.tick(&hunt_id).await.unwrap();
        assert!(dispatch.started.is_empty());
        assert_eq!(dispatch.queued, 1);
        assert!(h.runner.read_flow(&running).await.unwrap().is_running());

        let mut paused = false;
        while let Ok(event) = events.try_recv() {
            paused |= matches!(event, EngineEvent::HuntPaused { .. });
        }
        assert!(paused);

        // default target hears about the pause
        let alerts = h.sink.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].subject.contains("paused"));

        let resumed = h.hunts.resume_hunt(&hunt_id).await.unwrap();
        assert_eq!(resumed.state, HuntState::Started);
    }

    #[tokio::test]
    async fn test_completed_flows_are_counted() {
        let h = harness().await;
        let hunt = h.hunts.start_hunt(spec(clients(1), 0)).await.unwrap();
        let session = hunt.started_sessions[&ClientId::from_index(0)].clone();

        h.deliver(MessageEnvelope::status(session, 1, 0, FlowStatus::ok())).await;

        let stats = h.hunts.hunt_stats(&hunt.hunt_id).await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.errors + stats.crashes, 0);
    }

    #[tokio::test]
    async fn test_stop_drops_queue_and_blocks_new_clients() {
        let h = harness().await;
        let hunt = h.hunts.start_hunt(spec(clients(3), 1)).await.unwrap();

        let stopped = h.hunts.stop_hunt(&hunt.hunt_id).await.unwrap();
        assert_eq!(stopped.state, HuntState::Stopped);
        assert!(stopped.queued_clients.is_empty());

        assert!(matches!(
            h.hunts.start_clients(&hunt.hunt_id, clients(5)).await,
            Err(FleetError::InvalidState(_))
        ));
        assert!(matches!(
            h.hunts.resume_hunt(&hunt.hunt_id).await,
            Err(FleetError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_edit_is_reapplied_after_a_concurrent_write() {
        let h = harness().await;
        let hunt = h.hunts.start_hunt(spec(Vec::new(), 0)).await.unwrap();

        let mut attempts = 0;
        let (edited, ()) = h
            .hunts
            .edit_hunt(&hunt.hunt_id, |hunt| {
                attempts += 1;
                if attempts == 1 {
                    // another server records a completion between this read and the write
                    let mut other = hunt.clone();
                    other.counters.completed += 1;
                    futures::executor::block_on(h.store.write_hunt(other)).unwrap();
                }
                hunt.counters.errors += 1;
                Ok(HuntEdit::Write(()))
            })
            .await
            .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(edited.counters.completed, 1);
        assert_eq!(edited.counters.errors, 1);
        assert_eq!(edited.version, 2);
    }

    #[tokio::test]
    async fn test_edit_gives_up_under_constant_contention() {
        let h = harness().await;
        let hunt = h.hunts.start_hunt(spec(Vec::new(), 0)).await.unwrap();

        let mut attempts = 0;
        let result = h
            .hunts
            .edit_hunt(&hunt.hunt_id, |hunt| {
                attempts += 1;
                futures::executor::block_on(h.store.write_hunt(hunt.clone())).unwrap();
                Ok(HuntEdit::Write(()))
            })
            .await;

        assert!(matches!(result, Err(FleetError::ConcurrentModification { .. })));
        assert_eq!(attempts, HUNT_WRITE_ATTEMPTS);
    }
}
