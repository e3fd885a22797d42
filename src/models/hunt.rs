// Hunt - a campaign running the same flow across many clients

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::flow::FlowSpec;
use super::ids::{ClientId, HuntId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HuntState {
    Started,
    /// No new clients are dispatched; running child flows continue
    Paused,
    Stopped,
}

impl std::fmt::Display for HuntState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HuntState::Started => "STARTED",
            HuntState::Paused => "PAUSED",
            HuntState::Stopped => "STOPPED",
        };
        write!(f, "{}", label)
    }
}

/// Which clients a hunt targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientSelection {
    /// Every known client
    All,
    /// An explicit list
    Clients { client_ids: Vec<ClientId> },
    /// Clients carrying a label
    Label { label: String },
}

impl Default for ClientSelection {
    fn default() -> Self {
        ClientSelection::Clients {
            client_ids: Vec::new(),
        }
    }
}

/// Caller-supplied hunt definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuntSpec {
    #[serde(default)]
    pub description: String,
    pub flow: FlowSpec,
    #[serde(default)]
    pub client_selection: ClientSelection,
    /// Clients started per tick; `0` disables rate limiting
    #[serde(default)]
    pub client_rate: Option<u32>,
    /// Hunt-specific crash/error alert target, alerted before the fleet default
    #[serde(default)]
    pub crash_alert_target: Option<String>,
    /// Failures (errors + crashes) after which the hunt pauses
    #[serde(default)]
    pub failure_threshold: Option<u64>,
    #[serde(default)]
    pub creator: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HuntCounters {
    pub started: u64,
    pub completed: u64,
    pub errors: u64,
    pub crashes: u64,
}

impl HuntCounters {
    pub fn failures(&self) -> u64 {
        self.errors + self.crashes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hunt {
    pub hunt_id: HuntId,
    #[serde(default)]
    pub description: String,
    pub flow: FlowSpec,
    pub client_selection: ClientSelection,
    pub client_rate: u32,
    #[serde(default)]
    pub crash_alert_target: Option<String>,
    #[serde(default)]
    pub failure_threshold: Option<u64>,
    pub state: HuntState,
    /// Child sessions the hunt created, one per client
    #[serde(default)]
    pub started_sessions: BTreeMap<ClientId, SessionId>,
    /// Clients deferred by the rate limit, in arrival order
    #[serde(default)]
    pub queued_clients: VecDeque<ClientId>,
    #[serde(default)]
    pub counters: HuntCounters,
    #[serde(default)]
    pub pause_reason: Option<String>,
    #[serde(default)]
    pub creator: Option<String>,
    /// Bumped by every successful write; a write carrying an older version is refused
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Hunt {
    pub fn from_spec(hunt_id: HuntId, spec: HuntSpec, default_rate: u32) -> Self {
        let now = Utc::now();
        Self {
            hunt_id,
            description: spec.description,
            flow: spec.flow,
            client_selection: spec.client_selection,
            client_rate: spec.client_rate.unwrap_or(default_rate),
            crash_alert_target: spec.crash_alert_target,
            failure_threshold: spec.failure_threshold,
            state: HuntState::Started,
            started_sessions: BTreeMap::new(),
            queued_clients: VecDeque::new(),
            counters: HuntCounters::default(),
            pause_reason: None,
            creator: spec.creator,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the client was already started or is waiting in the queue
    pub fn knows_client(&self, client_id: &ClientId) -> bool {
        self.started_sessions.contains_key(client_id) || self.queued_clients.contains(client_id)
    }

    pub fn threshold_reached(&self) -> bool {
        match self.failure_threshold {
            Some(threshold) => self.counters.failures() >= threshold,
            None => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.client_rate > 0
    }
}
