// Core domain models for the fleet orchestrator
// These are the plain, storage-agnostic data structures

//! # Domain Models Module
//!
//! This module contains the data the orchestration engine persists and
//! exchanges with agents. Nothing in here performs I/O; the engine layer
//! (`crate::engine`) owns all behaviour.
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a flat API. Users can
//! import `use fleet_orchestrator::models::FlowInstance` instead of
//! `use fleet_orchestrator::models::flow::FlowInstance`.

// Identifiers: ClientId, SessionId, FlowId, HuntId
pub mod ids;

// Envelopes, payloads, status records and outbound agent requests
pub mod message;

// FlowInstance - the persisted state machine of one flow
pub mod flow;

// Crash records and client records
pub mod crash;

// Hunt definitions and state
pub mod hunt;

// Client statistics samples
pub mod stats;

pub use ids::{ClientId, FlowId, HuntId, SessionId};

pub use message::{
    AgentRequest, AuthState, CpuUsage, EnvelopeStatus, FlowStatus, MessageEnvelope, Payload,
    StatusCode,
};

pub use flow::{
    FlowFailure, FlowInstance, FlowLogEntry, FlowSpec, FlowStartRequest, FlowState,
    OutstandingRequest, ParentLink,
};

pub use crash::{
    ClientInfo, ClientRecord, CrashRecord, StartupInfo, CLIENT_CRASH_TYPE, MONITOR_CLIENT_NAME,
    NANNY_MESSAGE_TYPE,
};

pub use hunt::{ClientSelection, Hunt, HuntCounters, HuntSpec, HuntState};

pub use stats::{ClientStats, CpuSample, IoSample, DEFAULT_SAMPLE_INTERVAL_US};
