// Flow runner - advances flow instances as their responses complete

//! # Flow Runner
//!
//! The runner owns every state transition of a [`FlowInstance`]. Each entry
//! point reads the flow, mutates a private copy and writes it back with one
//! store commit:
//!
//! - [`FlowRunner::start_flow`]: validate args, run the `Start` continuation,
//!   create the flow
//! - [`FlowRunner::process_session`]: fold a leased session's queued envelopes
//!   into the outstanding requests and run every continuation whose request is
//!   complete
//! - [`FlowRunner::cancel_flow`]: operator termination
//!
//! ## Correlation Rules
//!
//! For each envelope of a leased session:
//!
//! ```text
//! request not outstanding            -> discard (unknown or already completed)
//! request already aborted            -> discard
//! STATUS, request already has one    -> discard (duplicate)
//! STATUS                             -> record, accumulate resource usage
//! ERROR                              -> record, aborts the request
//! OK/ITERATOR, id already recorded   -> discard (duplicate)
//! OK/ITERATOR, id >= STATUS id       -> discard (after terminal record)
//! OK/ITERATOR                        -> record
//! ```
//!
//! Completed requests are then delivered in ascending request id order; a
//! request that is still incomplete holds back every later one. A STATUS
//! reporting `CLIENT_KILLED` on any request crashes the flow instead: no
//! continuation runs, one crash record is written and the crash alert fires.
//!
//! ## Side Effects After Commit
//!
//! Alerts, crash history, engine events and observer callbacks happen only
//! after the commit succeeded. A commit that loses its lease changes nothing,
//! and the retried cycle produces the side effects exactly once.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::alerts::AlertDispatcher;
use super::crashes::CrashReporter;
use super::events::{EngineEvent, EventBus};
use super::flow::{
    ActionRegistry, ChildStart, FlowContext, FlowEffects, FlowRegistry, PendingAlert, Responses,
    START_STATE,
};
use super::storage::{ClientStore, FleetStore, FlowCommit, FlowStateStore, SessionLease};
use crate::models::{
    ClientId, ClientRecord, CrashRecord, EnvelopeStatus, FlowFailure, FlowId, FlowInstance, FlowStartRequest,
    FlowState, FlowStatus, MessageEnvelope, ParentLink, SessionId, StatusCode, CLIENT_CRASH_TYPE,
};
use crate::{FleetError, Result};

const CLIENT_KILLED_MESSAGE: &str = "Client killed during transaction";

/// Callback for flows reaching a terminal state
///
/// Invoked once per transition, after the transition was committed.
#[async_trait]
pub trait FlowObserver: Send + Sync {
    async fn flow_finished(&self, flow: &FlowInstance);
}

/// What one `process_session` call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Nothing was queued
    Idle,
    /// No flow exists for the session; the envelopes were dropped
    Orphaned { dropped: usize },
    /// The flow was already terminal; the envelopes were dropped
    AlreadyTerminal { dropped: usize },
    Advanced { state: FlowState },
}

pub struct FlowRunner {
    store: Arc<dyn FleetStore>,
    flows: Arc<FlowRegistry>,
    actions: Arc<ActionRegistry>,
    alerts: AlertDispatcher,
    crashes: CrashReporter,
    events: EventBus,
    observers: RwLock<Vec<Arc<dyn FlowObserver>>>,
    lease_ttl: Duration,
}

impl FlowRunner {
    pub fn new(
        store: Arc<dyn FleetStore>,
        flows: Arc<FlowRegistry>,
        actions: Arc<ActionRegistry>,
        alerts: AlertDispatcher,
        events: EventBus,
        lease_ttl: Duration,
    ) -> Self {
        let crashes = CrashReporter::new(store.clone(), alerts.clone());
        Self {
            store,
            flows,
            actions,
            alerts,
            crashes,
            events,
            observers: RwLock::new(Vec::new()),
            lease_ttl,
        }
    }

    pub async fn add_observer(&self, observer: Arc<dyn FlowObserver>) {
        self.observers.write().await.push(observer);
    }

    pub fn store(&self) -> &Arc<dyn FleetStore> {
        &self.store
    }

    pub fn flows(&self) -> &FlowRegistry {
        &self.flows
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Flow record of a session
    ///
    /// ## Errors
    /// - `FlowNotFound` when the session has no flow
    pub async fn read_flow(&self, session_id: &SessionId) -> Result<FlowInstance> {
        self.store
            .read_flow_state(session_id)
            .await?
            .ok_or_else(|| FleetError::FlowNotFound(session_id.to_string()))
    }

    /// Create a flow and run its `Start` continuation
    ///
    /// Unknown classes and invalid arguments are rejected before anything is
    /// written. A `Start` continuation that fails leaves the flow in ERROR.
    pub async fn start_flow(&self, request: FlowStartRequest) -> Result<FlowInstance> {
        self.flows.validate(&request.flow)?;

        let session_id = match &request.session_id {
            Some(session_id) => {
                Self::check_session_owner(session_id, &request.client_id)?;
                session_id.clone()
            }
            None => SessionId::for_flow(&request.client_id, &FlowId::random()),
        };
        let mut flow = FlowInstance::new(session_id, request.client_id.clone(), &request.flow);
        flow.hunt_id = request.hunt_id;
        flow.creator = request.creator;

        let client = self.store.read_client(&flow.client_id).await?;
        let mut effects = self.run_start(&mut flow, client.as_ref());
        let children = std::mem::take(&mut effects.children);
        let new_flows = self.start_children(&flow, client.as_ref(), children, &mut effects);
        Self::finish_if_idle(&mut flow, &mut effects);

        let commit = FlowCommit {
            flow,
            acked: Vec::new(),
            outbound: effects.outbound,
            new_flows: new_flows.clone(),
            notifications: effects.notifications,
        };
        let created = self.store.create_flow(commit).await?;
        info!(
            session_id = %created.session_id,
            client_id = %created.client_id,
            flow_name = %created.flow_name,
            state = %created.state,
            "Started flow"
        );

        self.events.publish(EngineEvent::started(&created));
        self.after_commit(&created, &new_flows, effects.alerts, None).await;
        Ok(created)
    }

    /// An explicit session must be a top-level flow session of the client
    /// the flow runs on
    fn check_session_owner(session_id: &SessionId, client_id: &ClientId) -> Result<()> {
        if session_id.is_well_known() {
            return Err(FleetError::InvalidInput(format!(
                "{} is reserved for a well-known handler",
                session_id
            )));
        }
        if session_id.client_id().as_ref() != Some(client_id) {
            return Err(FleetError::InvalidInput(format!(
                "session {} does not belong to {}",
                session_id, client_id
            )));
        }
        if session_id.parent().is_some() {
            return Err(FleetError::InvalidInput(format!(
                "session {} is a child session",
                session_id
            )));
        }
        Ok(())
    }

    /// Advance the flow of a leased session with everything queued for it
    ///
    /// ## Errors
    /// - `ConcurrentModification` when the lease was lost; nothing was
    ///   written and the queued envelopes stay for a retry
    pub async fn process_session(&self, lease: &SessionLease) -> Result<SessionOutcome> {
        let session_id = &lease.session_id;
        let messages = self.store.fetch_inbound(lease).await?;
        if messages.is_empty() {
            return Ok(SessionOutcome::Idle);
        }
        let acked: Vec<String> = messages.iter().map(|m| m.message_id.clone()).collect();

        let Some(mut flow) = self.store.read_flow_state(session_id).await? else {
            warn!(
                session_id = %session_id,
                count = acked.len(),
                "Dropping orphaned delivery: session has no flow"
            );
            self.store.ack_inbound(lease, &acked).await?;
            return Ok(SessionOutcome::Orphaned { dropped: acked.len() });
        };

        if flow.state.is_terminal() {
            debug!(
                session_id = %session_id,
                state = %flow.state,
                count = acked.len(),
                "Dropping delivery for finished flow"
            );
            self.store.ack_inbound(lease, &acked).await?;
            return Ok(SessionOutcome::AlreadyTerminal { dropped: acked.len() });
        }

        for message in messages {
            Self::record_envelope(&mut flow, message.envelope);
        }

        let client = self.store.read_client(&flow.client_id).await?;
        let mut effects = FlowEffects::default();
        let mut crash = None;

        if let Some(request_id) = Self::killed_request(&flow) {
            crash = Some(Self::mark_crashed(&mut flow, request_id));
        } else {
            self.run_completed_requests(&mut flow, client.as_ref(), &mut effects);
        }

        let children = std::mem::take(&mut effects.children);
        let new_flows = self.start_children(&flow, client.as_ref(), children, &mut effects);
        Self::finish_if_idle(&mut flow, &mut effects);
        flow.touch();

        let commit = FlowCommit {
            flow,
            acked,
            outbound: effects.outbound,
            new_flows: new_flows.clone(),
            notifications: effects.notifications,
        };
        let committed = self.store.write_flow_state(lease, commit).await?;

        if committed.state.is_terminal() {
            info!(
                session_id = %committed.session_id,
                client_id = %committed.client_id,
                state = %committed.state,
                "Flow finished"
            );
        }
        self.after_commit(&committed, &new_flows, effects.alerts, crash).await;
        Ok(SessionOutcome::Advanced {
            state: committed.state,
        })
    }

    /// Terminate a flow out-of-band; envelopes delivered later are dropped
    ///
    /// Cancelling a finished flow returns it unchanged.
    ///
    /// ## Errors
    /// - `ConcurrentModification` while a worker holds the session; retry
    /// - `FlowNotFound`
    pub async fn cancel_flow(&self, session_id: &SessionId, reason: &str) -> Result<FlowInstance> {
        let lease = self
            .store
            .try_lease(session_id, self.lease_ttl)
            .await?
            .ok_or_else(|| FleetError::ConcurrentModification {
                key: session_id.to_string(),
            })?;

        let result = self.cancel_leased(&lease, reason).await;
        if let Err(e) = self.store.release_lease(&lease).await {
            warn!(session_id = %session_id, "Failed to release lease after cancel: {}", e);
        }
        result
    }

    async fn cancel_leased(&self, lease: &SessionLease, reason: &str) -> Result<FlowInstance> {
        let mut flow = self.read_flow(&lease.session_id).await?;
        if flow.state.is_terminal() {
            return Ok(flow);
        }

        flow.state = FlowState::Terminated;
        flow.termination_reason = Some(reason.to_string());
        flow.outstanding.clear();
        flow.log(format!("Cancelled: {}", reason));
        let mut effects = FlowEffects::default();
        Self::finish_if_idle(&mut flow, &mut effects);
        flow.touch();

        let mut commit = FlowCommit::new(flow);
        commit.notifications = effects.notifications;
        let committed = self.store.write_flow_state(lease, commit).await?;
        info!(session_id = %committed.session_id, reason, "Cancelled flow");

        self.after_commit(&committed, &[], Vec::new(), None).await;
        Ok(committed)
    }

    /// Fold one envelope into the outstanding request it answers
    fn record_envelope(flow: &mut FlowInstance, envelope: MessageEnvelope) {
        let session_id = flow.session_id.clone();
        let request_id = envelope.request_id;
        let response_id = envelope.response_id;

        let Some(request) = flow.outstanding.get_mut(&request_id) else {
            debug!(
                session_id = %session_id,
                request_id,
                response_id,
                "Discarding response for unknown or completed request"
            );
            return;
        };
        if request.error.is_some() {
            debug!(session_id = %session_id, request_id, response_id, "Discarding response for aborted request");
            return;
        }

        match &envelope.status {
            EnvelopeStatus::Status(status) => {
                if request.status.is_some() {
                    debug!(session_id = %session_id, request_id, response_id, "Discarding duplicate STATUS");
                    return;
                }
                let cpu = status.cpu_time_used;
                let network_bytes = status.network_bytes_sent;
                // replies numbered at or after the terminal record cannot belong to it
                request.responses.retain(|id, _| *id < response_id);
                request.status = Some(envelope);

                flow.cpu_time_used.user_cpu_time += cpu.user_cpu_time;
                flow.cpu_time_used.system_cpu_time += cpu.system_cpu_time;
                flow.network_bytes_sent += network_bytes;
            }
            EnvelopeStatus::Error { message } => {
                debug!(session_id = %session_id, request_id, "Request aborted by client: {}", message);
                request.error = Some(envelope);
            }
            EnvelopeStatus::Ok | EnvelopeStatus::Iterator => {
                if let Some(status) = &request.status {
                    if response_id >= status.response_id {
                        debug!(session_id = %session_id, request_id, response_id, "Discarding response after STATUS");
                        return;
                    }
                }
                if request.responses.contains_key(&response_id) {
                    debug!(session_id = %session_id, request_id, response_id, "Discarding duplicate response");
                    return;
                }
                request.responses.insert(response_id, envelope);
            }
        }
    }

    /// First request whose STATUS reports the client died
    fn killed_request(flow: &FlowInstance) -> Option<u64> {
        flow.outstanding.values().find_map(|request| {
            let status = request.status.as_ref()?.flow_status()?;
            (status.code == StatusCode::ClientKilled).then_some(request.request_id)
        })
    }

    fn mark_crashed(flow: &mut FlowInstance, request_id: u64) -> CrashRecord {
        let status = flow
            .outstanding
            .get(&request_id)
            .and_then(|request| request.status.as_ref())
            .and_then(|envelope| envelope.flow_status())
            .cloned()
            .unwrap_or_else(FlowStatus::client_killed);

        let message = status
            .error_message
            .clone()
            .unwrap_or_else(|| CLIENT_KILLED_MESSAGE.to_string());
        let mut crash = CrashRecord::new(
            flow.client_id.clone(),
            Some(flow.session_id.clone()),
            CLIENT_CRASH_TYPE,
            message,
        );
        crash.backtrace = status.backtrace;

        let detected = FleetError::CrashDetected {
            client_id: flow.client_id.to_string(),
            session_id: flow.session_id.to_string(),
        };
        warn!(request_id, "{}", detected);
        flow.state = FlowState::Crashed;
        flow.failure = Some(FlowFailure {
            message: detected.to_string(),
            context: Some(format!("request {}", request_id)),
            backtrace: crash.backtrace.clone(),
        });
        flow.crash = Some(crash.clone());
        flow.outstanding.clear();
        flow.log(format!("Client crashed while processing request {}", request_id));
        crash
    }

    /// Deliver completed requests in request id order
    fn run_completed_requests(
        &self,
        flow: &mut FlowInstance,
        client: Option<&ClientRecord>,
        effects: &mut FlowEffects,
    ) {
        let descriptor = match self.flows.get(&flow.flow_name) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!(session_id = %flow.session_id, "Cannot resume flow: {}", e);
                flow.fail(e.to_string(), None);
                return;
            }
        };

        while flow.is_running() {
            let Some((&request_id, request)) = flow.outstanding.iter().next() else {
                break;
            };
            if !request.is_complete() {
                break;
            }
            let Some(request) = flow.outstanding.remove(&request_id) else {
                break;
            };

            let state = request.next_state.clone();
            let responses = Responses::from_request(request);
            let succeeded = responses.success();
            let args = flow.args.clone();
            flow.current_state = state.clone();

            let session = flow.session_id.clone();
            let mut ctx = FlowContext::new(flow, client, &self.actions);
            let result = Self::guarded(&session, &state, || {
                if succeeded {
                    descriptor.resume(&mut ctx, &args, &state, responses)
                } else {
                    descriptor.on_request_error(&mut ctx, &args, &state, responses)
                }
            });
            let step = ctx.into_effects();

            match result {
                Ok(()) => {
                    debug!(session_id = %flow.session_id, request_id, continuation = %state, "Continuation completed");
                    effects.merge(step);
                }
                Err(e) => {
                    error!(
                        session_id = %flow.session_id,
                        request_id,
                        continuation = %state,
                        "Continuation failed: {}",
                        e
                    );
                    flow.fail(e.to_string(), Some(state));
                    // requests issued earlier in this cycle have no one left to answer
                    effects.outbound.clear();
                    effects.children.clear();
                }
            }
        }
    }

    /// Run the `Start` continuation; a failure leaves the flow in ERROR and
    /// discards everything the continuation produced
    fn run_start(&self, flow: &mut FlowInstance, client: Option<&ClientRecord>) -> FlowEffects {
        let descriptor = match self.flows.get(&flow.flow_name) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                flow.fail(e.to_string(), Some(START_STATE.to_string()));
                return FlowEffects::default();
            }
        };

        let args = flow.args.clone();
        let session = flow.session_id.clone();
        let mut ctx = FlowContext::new(flow, client, &self.actions);
        let result = Self::guarded(&session, START_STATE, || descriptor.start(&mut ctx, &args));
        let effects = ctx.into_effects();

        match result {
            Ok(()) => effects,
            Err(e) => {
                error!(session_id = %flow.session_id, "Start continuation failed: {}", e);
                flow.fail(e.to_string(), Some(START_STATE.to_string()));
                FlowEffects::default()
            }
        }
    }

    /// Run a continuation, turning a panic into a `Continuation` error
    ///
    /// A panicking continuation must fail its flow like any other error;
    /// left to unwind it would kill the dispatch task and the session would be
    /// leased and replayed forever.
    fn guarded<F>(session_id: &SessionId, continuation: &str, run: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        catch_unwind(AssertUnwindSafe(run)).unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(FleetError::Continuation {
                session_id: session_id.to_string(),
                continuation: continuation.to_string(),
                message: format!("panicked: {}", message),
            })
        })
    }

    /// Build and start every child flow requested in this cycle, including
    /// grandchildren started by the children's own `Start`
    fn start_children(
        &self,
        origin: &FlowInstance,
        client: Option<&ClientRecord>,
        pending: Vec<ChildStart>,
        effects: &mut FlowEffects,
    ) -> Vec<FlowInstance> {
        let mut queue: VecDeque<ChildStart> = pending.into();
        let mut created = Vec::new();

        while let Some(start) = queue.pop_front() {
            let mut child = FlowInstance::new(start.session_id, origin.client_id.clone(), &start.flow);
            child.parent = Some(ParentLink {
                session_id: start.parent_session_id,
                request_id: start.request_id,
                next_response_id: 0,
            });
            child.hunt_id = origin.hunt_id.clone();
            child.creator = origin.creator.clone();

            let mut child_effects = self.run_start(&mut child, client);
            queue.extend(child_effects.children.drain(..));
            Self::finish_if_idle(&mut child, &mut child_effects);
            effects.merge(child_effects);

            debug!(session_id = %child.session_id, flow_name = %child.flow_name, "Started child flow");
            created.push(child);
        }
        created
    }

    /// Terminate a running flow with nothing left to wait for, and tell the
    /// parent about a flow that just finished
    ///
    /// Callers invoke this once per cycle, on a flow that was running when the
    /// cycle began.
    fn finish_if_idle(flow: &mut FlowInstance, effects: &mut FlowEffects) {
        if flow.is_running() && flow.outstanding.is_empty() {
            flow.state = FlowState::Terminated;
        }
        if flow.state.is_terminal() {
            if let Some(envelope) = Self::parent_status(flow) {
                effects.notifications.push(envelope);
            }
        }
    }

    /// Terminal STATUS for the parent of a finished child flow
    fn parent_status(flow: &mut FlowInstance) -> Option<MessageEnvelope> {
        let mut status = match (flow.state, &flow.termination_reason) {
            (FlowState::Running, _) => return None,
            (FlowState::Terminated, None) => FlowStatus::ok(),
            (FlowState::Terminated, Some(reason)) => {
                FlowStatus::error(StatusCode::GenericError, format!("Child flow cancelled: {}", reason))
            }
            (FlowState::Error, _) => FlowStatus::error(
                StatusCode::GenericError,
                flow.failure
                    .as_ref()
                    .map(|f| f.message.clone())
                    .unwrap_or_else(|| "Child flow failed".to_string()),
            ),
            (FlowState::Crashed, _) => {
                FlowStatus::error(StatusCode::GenericError, "Child flow crashed")
            }
        };
        status.cpu_time_used = flow.cpu_time_used;
        status.network_bytes_sent = flow.network_bytes_sent;
        status.child_session_id = Some(flow.session_id.clone());

        let client_id = flow.client_id.clone();
        let parent = flow.parent.as_mut()?;
        let envelope = MessageEnvelope::status(
            parent.session_id.clone(),
            parent.request_id,
            parent.next_response_id,
            status,
        )
        .with_source(client_id);
        parent.next_response_id += 1;
        Some(envelope)
    }

    /// External side effects of a committed cycle, in order: flow alerts,
    /// crash history, events, observers (hunt alerts), default crash alert
    async fn after_commit(
        &self,
        flow: &FlowInstance,
        children: &[FlowInstance],
        alerts: Vec<PendingAlert>,
        crash: Option<CrashRecord>,
    ) {
        for child in children {
            self.events.publish(EngineEvent::started(child));
            if let Some(event) = EngineEvent::finished(child) {
                self.events.publish(event);
            }
        }

        for alert in alerts {
            let target = alert
                .target
                .unwrap_or_else(|| self.alerts.default_target().to_string());
            self.alerts.send(&target, &alert.subject, &alert.body).await;
        }

        if let Some(crash) = &crash {
            if let Err(e) = self.crashes.record(crash).await {
                error!(session_id = %flow.session_id, "Failed to write crash record: {}", e);
            }
        }

        if flow.state.is_terminal() {
            if let Some(event) = EngineEvent::finished(flow) {
                self.events.publish(event);
            }
            let observers = self.observers.read().await.clone();
            for observer in observers {
                observer.flow_finished(flow).await;
            }
        }

        if let Some(crash) = &crash {
            self.crashes.alert(crash, Some(flow)).await;
        }
    }
}
