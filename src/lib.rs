// Fleet Orchestrator - Rust Edition
// The control plane that issues flows to intermittently-online agents and
// coordinates hunts across the fleet

//! # Fleet Orchestrator Library
//!
//! This is the library crate of the fleet orchestrator: the flow/hunt
//! orchestration engine of a remote-investigation platform. The server issues
//! units of work ("flows") to agents, correlates their asynchronous replies and
//! runs campaigns ("hunts") that start the same flow across many agents under
//! rate and failure limits.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`MessageEnvelope`]: The unit exchanged between server and agent
//! - [`FlowInstance`]: Persisted state machine of one flow on one agent
//! - [`CrashRecord`]: Evidence that an agent died mid-request
//! - [`Hunt`]: A fleet-wide campaign
//!
//! ### Engine
//! - [`FlowStateStore`]: The single source of truth for flow state, inbound
//!   queues and per-session leases ([`InMemoryStorage`], [`NATSStorage`])
//! - [`FlowRunner`]: Advances a flow when a request's responses are complete
//! - [`Worker`]: Leases ready sessions and dispatches them with bounded
//!   concurrency
//! - [`WellKnownRegistry`]: Stateless handlers bound to reserved sessions
//! - [`HuntCoordinator`]: Fans flows out to clients under a per-hunt token
//!   bucket and pauses hunts that cross their failure threshold
//!
//! ### Server
//! An axum HTTP surface for operators and for the agent transport.
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users don't need to know the
//! internal module structure. Instead of
//! `use fleet_orchestrator::engine::runner::FlowRunner`, users can write
//! `use fleet_orchestrator::FlowRunner`.

// Core domain models (storage-agnostic)
pub mod models;

// Orchestration engine: stores, runner, worker, handlers, hunts
pub mod engine;

// Layered settings
pub mod config;

// HTTP server
pub mod server;

pub use models::{
    AgentRequest, ClientId, ClientRecord, CrashRecord, EnvelopeStatus, FlowInstance, FlowSpec,
    FlowStartRequest, FlowState, FlowStatus, Hunt, HuntId, HuntSpec, HuntState, MessageEnvelope,
    Payload, SessionId, StatusCode,
};

pub use engine::{
    alerts::{AlertDispatcher, AlertSender, LogAlertSender, MemoryAlertSender, WebhookAlertSender},
    flow::{ActionRegistry, FlowRegistry},
    handlers::WellKnownRegistry,
    hunts::HuntCoordinator,
    nats_storage::{NATSStorage, NATSStorageConfig},
    runner::FlowRunner,
    storage::{ClientStore, FlowStateStore, HuntStore, InMemoryStorage},
    worker::{Worker, WorkerConfig},
    FleetEngine,
};

pub use crate::config::Settings;

pub use server::{HttpServer, HttpServerBuilder};

// Core error types
use thiserror::Error;

/// Error taxonomy of the orchestration engine
///
/// Per-session errors never take down the worker loop: the runner converts
/// them into a terminal flow state and the worker logs them.
#[derive(Error, Debug)]
pub enum FleetError {
    /// Malformed, duplicate or out-of-order envelope; discarded and logged
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A continuation asked for an action the agent class does not support
    #[error("Invalid action {action} requested by flow {flow}")]
    InvalidAction { action: String, flow: String },

    /// Uncaught failure inside a continuation
    #[error("Continuation {continuation} of {session_id} failed: {message}")]
    Continuation {
        session_id: String,
        continuation: String,
        message: String,
    },

    /// Agent process died while a request was in flight
    #[error("Client {client_id} crashed during {session_id}")]
    CrashDetected {
        client_id: String,
        session_id: String,
    },

    /// The session lease was lost before write-back, or a versioned record
    /// moved under a read-modify-write
    #[error("Concurrent modification of {key}")]
    ConcurrentModification { key: String },

    /// Hunt fan-out deferred to a later tick
    #[error("Rate limit exceeded for hunt {hunt_id}")]
    RateLimitExceeded { hunt_id: String },

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Hunt not found: {0}")]
    HuntNotFound(String),

    #[error("Unknown flow class: {0}")]
    UnknownFlowClass(String),

    #[error("Invalid arguments for {flow}: {message}")]
    InvalidArgs { flow: String, message: String },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Storage-related errors
    /// Using anyhow::Error for flexible error handling with NATS and other storage backends
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Alert delivery failed: {0}")]
    Alert(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::ConcurrentModification { .. } | FleetError::Storage(_)
        )
    }
}

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        FleetError::Internal(err.to_string())
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, FleetError>;
