// Event bus for in-process observers of flow and hunt lifecycle

//! # Event System
//!
//! The runner and the hunt coordinator publish an [`EngineEvent`] after every
//! committed lifecycle transition. Subscribers (the server's log task, tests)
//! receive them over a tokio broadcast channel; publishing never blocks and
//! never fails when nobody listens.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{ClientId, FlowInstance, FlowState, HuntId, SessionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    FlowStarted {
        session_id: SessionId,
        client_id: ClientId,
        flow_name: String,
        hunt_id: Option<HuntId>,
    },
    FlowTerminated {
        session_id: SessionId,
    },
    FlowErrored {
        session_id: SessionId,
        message: String,
    },
    FlowCrashed {
        session_id: SessionId,
        client_id: ClientId,
    },
    HuntPaused {
        hunt_id: HuntId,
        reason: String,
    },
}

impl EngineEvent {
    /// Event for a flow that just reached a terminal state
    pub fn finished(flow: &FlowInstance) -> Option<Self> {
        match flow.state {
            FlowState::Running => None,
            FlowState::Terminated => Some(EngineEvent::FlowTerminated {
                session_id: flow.session_id.clone(),
            }),
            FlowState::Error => Some(EngineEvent::FlowErrored {
                session_id: flow.session_id.clone(),
                message: flow
                    .failure
                    .as_ref()
                    .map(|f| f.message.clone())
                    .unwrap_or_default(),
            }),
            FlowState::Crashed => Some(EngineEvent::FlowCrashed {
                session_id: flow.session_id.clone(),
                client_id: flow.client_id.clone(),
            }),
        }
    }

    pub fn started(flow: &FlowInstance) -> Self {
        EngineEvent::FlowStarted {
            session_id: flow.session_id.clone(),
            client_id: flow.client_id.clone(),
            flow_name: flow.flow_name.clone(),
            hunt_id: flow.hunt_id.clone(),
        }
    }
}

/// Event bus for publishing and subscribing to engine events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000); // Buffer up to 1000 events
        Self { sender }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: EngineEvent) {
        debug!(?event, "Engine event");
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
