// Flow instance - persisted state of one running unit of work on one agent

//! # Flow Instance Model
//!
//! A [`FlowInstance`] is the durable record of a state machine that runs
//! against a single agent. Between requests the flow does not exist in memory
//! at all: it is "suspended" as this record in the flow state store, and the
//! worker loop rehydrates it when the agent's replies arrive.
//!
//! ```text
//!             start()
//!                |
//!                v
//!   +------> [Running] --continuation issues requests--+
//!   |            |                                      |
//!   +------------+--------------------------------------+
//!                |
//!      +---------+-----------+--------------------+
//!      |                     |                    |
//!  no requests left    continuation failed   CLIENT_KILLED status
//!      v                     v                    v
//! [Terminated]           [Error]             [Crashed]
//! ```
//!
//! Terminal states never change again.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::crash::CrashRecord;
use super::ids::{ClientId, HuntId, SessionId};
use super::message::{CpuUsage, MessageEnvelope, Payload};

/// Maximum number of log lines kept on a flow record
pub const MAX_FLOW_LOG_ENTRIES: usize = 100;

/// Lifecycle state of a flow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    Running,
    Error,
    Crashed,
    Terminated,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FlowState::Running)
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FlowState::Running => "RUNNING",
            FlowState::Error => "ERROR",
            FlowState::Crashed => "CRASHED",
            FlowState::Terminated => "TERMINATED",
        };
        write!(f, "{}", label)
    }
}

/// Flow class plus its typed arguments, as supplied by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSpec {
    pub flow_name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl FlowSpec {
    pub fn new<S: Into<String>>(flow_name: S, args: serde_json::Value) -> Self {
        Self {
            flow_name: flow_name.into(),
            args,
        }
    }
}

/// Everything needed to start one flow on one client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStartRequest {
    pub client_id: ClientId,
    pub flow: FlowSpec,
    /// Explicit session, used by hunts; a fresh one is allocated otherwise.
    /// Never taken from the wire.
    #[serde(skip)]
    pub session_id: Option<SessionId>,
    /// Set by the hunt coordinator only
    #[serde(skip)]
    pub hunt_id: Option<HuntId>,
    #[serde(default)]
    pub creator: Option<String>,
}

impl FlowStartRequest {
    pub fn new(client_id: ClientId, flow: FlowSpec) -> Self {
        Self {
            client_id,
            flow,
            session_id: None,
            hunt_id: None,
            creator: None,
        }
    }
}

/// Back-reference from a child flow to the request its parent is waiting on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentLink {
    pub session_id: SessionId,
    pub request_id: u64,
    /// Next response id to use when replying to the parent
    #[serde(default)]
    pub next_response_id: u64,
}

/// A request the flow issued and is still waiting on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutstandingRequest {
    pub request_id: u64,
    /// Continuation to invoke once the response set is complete
    pub next_state: String,
    /// Agent action, `None` when the request is a child flow
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub child_session: Option<SessionId>,
    pub issued_at: DateTime<Utc>,
    /// Accumulated replies keyed by response id
    #[serde(default)]
    pub responses: BTreeMap<u64, MessageEnvelope>,
    /// Terminal STATUS record once seen
    #[serde(default)]
    pub status: Option<MessageEnvelope>,
    /// First ERROR record, which aborts the request
    #[serde(default)]
    pub error: Option<MessageEnvelope>,
}

impl OutstandingRequest {
    pub fn new(request_id: u64, next_state: String, action: Option<String>) -> Self {
        Self {
            request_id,
            next_state,
            action,
            child_session: None,
            issued_at: Utc::now(),
            responses: BTreeMap::new(),
            status: None,
            error: None,
        }
    }

    /// Complete when aborted by an error, or when the STATUS record arrived
    /// and every response id before it is present
    pub fn is_complete(&self) -> bool {
        if self.error.is_some() {
            return true;
        }
        match &self.status {
            Some(status) => (0..status.response_id).all(|id| self.responses.contains_key(&id)),
            None => false,
        }
    }
}

/// One log line written by a continuation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Failure detail kept on ERROR flows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowFailure {
    pub message: String,
    /// Continuation or request the failure was raised in
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub backtrace: Option<String>,
}

/// Persisted state of one flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInstance {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub flow_name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    pub state: FlowState,
    /// Continuation the flow is currently waiting in
    pub current_state: String,
    pub next_request_id: u64,
    #[serde(default)]
    pub outstanding: BTreeMap<u64, OutstandingRequest>,
    #[serde(default)]
    pub parent: Option<ParentLink>,
    #[serde(default)]
    pub hunt_id: Option<HuntId>,
    #[serde(default)]
    pub creator: Option<String>,
    /// Replies the flow produced
    #[serde(default)]
    pub results: Vec<Payload>,
    /// Flow class private data carried between continuations
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub logs: Vec<FlowLogEntry>,
    #[serde(default)]
    pub failure: Option<FlowFailure>,
    #[serde(default)]
    pub crash: Option<CrashRecord>,
    #[serde(default)]
    pub termination_reason: Option<String>,
    #[serde(default)]
    pub cpu_time_used: CpuUsage,
    #[serde(default)]
    pub network_bytes_sent: u64,
    /// Bumped on every persisted mutation; the store compares it on write
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowInstance {
    pub fn new(session_id: SessionId, client_id: ClientId, flow: &FlowSpec) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            client_id,
            flow_name: flow.flow_name.clone(),
            args: flow.args.clone(),
            state: FlowState::Running,
            current_state: "Start".to_string(),
            next_request_id: 1,
            outstanding: BTreeMap::new(),
            parent: None,
            hunt_id: None,
            creator: None,
            results: Vec::new(),
            data: serde_json::Value::Null,
            logs: Vec::new(),
            failure: None,
            crash: None,
            termination_reason: None,
            cpu_time_used: CpuUsage::default(),
            network_bytes_sent: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == FlowState::Running
    }

    /// Allocate the next request id of this session
    pub fn allocate_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    pub fn log<S: Into<String>>(&mut self, message: S) {
        self.logs.push(FlowLogEntry {
            timestamp: Utc::now(),
            message: message.into(),
        });
        if self.logs.len() > MAX_FLOW_LOG_ENTRIES {
            let excess = self.logs.len() - MAX_FLOW_LOG_ENTRIES;
            self.logs.drain(..excess);
        }
    }

    /// Move to ERROR, keeping the first failure
    pub fn fail<S: Into<String>>(&mut self, message: S, context: Option<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = FlowState::Error;
        self.failure = Some(FlowFailure {
            message: message.into(),
            context,
            backtrace: None,
        });
        self.outstanding.clear();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::{FlowStatus, MessageEnvelope};
    use serde_json::json;

    fn flow() -> FlowInstance {
        let client = ClientId::from_index(0);
        FlowInstance::new(
            SessionId::from("C.1000000000000000/flows/F.1"),
            client,
            &FlowSpec::new("ClientActionRunner", json!({"action": "Echo"})),
        )
    }

    #[test]
    fn test_request_ids_are_monotonic() {
        let mut flow = flow();
        assert_eq!(flow.allocate_request_id(), 1);
        assert_eq!(flow.allocate_request_id(), 2);
        assert_eq!(flow.next_request_id, 3);
    }

    #[test]
    fn test_request_completion_needs_contiguous_responses() {
        let session = SessionId::from("C.1000000000000000/flows/F.1");
        let mut request = OutstandingRequest::new(1, "End".to_string(), Some("Echo".to_string()));
        assert!(!request.is_complete());

        request.status = Some(MessageEnvelope::status(session.clone(), 1, 2, FlowStatus::ok()));
        assert!(!request.is_complete());

        request
            .responses
            .insert(1, MessageEnvelope::response(session.clone(), 1, 1, Payload::empty()));
        assert!(!request.is_complete());

        request
            .responses
            .insert(0, MessageEnvelope::response(session, 1, 0, Payload::empty()));
        assert!(request.is_complete());
    }

    #[test]
    fn test_fail_keeps_first_failure_and_clears_requests() {
        let mut flow = flow();
        flow.outstanding
            .insert(1, OutstandingRequest::new(1, "End".to_string(), None));
        flow.fail("first", None);
        flow.fail("second", None);

        assert_eq!(flow.state, FlowState::Error);
        assert_eq!(flow.failure.as_ref().unwrap().message, "first");
        assert!(flow.outstanding.is_empty());
    }

    #[test]
    fn test_log_is_bounded() {
        let mut flow = flow();
        for i in 0..(MAX_FLOW_LOG_ENTRIES + 5) {
            flow.log(format!("line {}", i));
        }
        assert_eq!(flow.logs.len(), MAX_FLOW_LOG_ENTRIES);
        assert_eq!(flow.logs[0].message, "line 5");
    }
}
