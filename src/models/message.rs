// Message envelopes - the atomic unit exchanged between server and agent

//! # Message Envelopes
//!
//! Agents answer requests asynchronously. Every reply is wrapped in a
//! [`MessageEnvelope`] that carries the correlation key of the request it
//! answers: `(session_id, request_id, response_id)`.
//!
//! For one request the agent sends zero or more `Ok`/`Iterator` envelopes with
//! response ids `0, 1, 2, ...` and terminates the sequence with exactly one
//! `Status` envelope whose response id is the number of replies that preceded
//! it. An `Error` envelope aborts the request.
//!
//! Payloads are opaque typed blobs: a type name plus bytes. The engine never
//! interprets them except through [`Payload::decode`] when a flow asks for it.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};

use super::ids::{ClientId, SessionId};
use crate::{FleetError, Result};

/// Whether the transport authenticated the envelope's source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
}

impl Default for AuthState {
    fn default() -> Self {
        AuthState::Unauthenticated
    }
}

/// Opaque typed payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub type_name: String,
    #[serde(serialize_with = "encode_blob", deserialize_with = "decode_blob")]
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new<S: Into<String>>(type_name: S, data: Vec<u8>) -> Self {
        Self {
            type_name: type_name.into(),
            data,
        }
    }

    /// Encode a serde value as the payload body
    pub fn json<S: Into<String>, T: Serialize>(type_name: S, value: &T) -> Result<Self> {
        Ok(Self::new(type_name, serde_json::to_vec(value)?))
    }

    /// Plain text payload (`DataBlob` in agent terms)
    pub fn text(text: &str) -> Self {
        Self::new("DataBlob", text.as_bytes().to_vec())
    }

    pub fn empty() -> Self {
        Self::new("Empty", Vec::new())
    }

    /// Decode the body as JSON into `T`
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.data).map_err(|e| {
            FleetError::Protocol(format!(
                "payload of type {} does not decode: {}",
                self.type_name, e
            ))
        })
    }

    /// Body as UTF-8 text, lossy
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

fn encode_blob<S: Serializer>(data: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
}

fn decode_blob<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    STANDARD.decode(raw).map_err(serde::de::Error::custom)
}

/// Final outcome code reported by the agent in a STATUS record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    GenericError,
    IoError,
    /// The agent process died while the request was in flight
    ClientKilled,
    CpuLimitExceeded,
    NetworkLimitExceeded,
    WorkerStuck,
}

impl StatusCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, StatusCode::Ok)
    }
}

/// CPU time the agent spent on a request, in seconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub user_cpu_time: f64,
    pub system_cpu_time: f64,
}

impl CpuUsage {
    pub fn total(&self) -> f64 {
        self.user_cpu_time + self.system_cpu_time
    }
}

/// Terminal STATUS record: final outcome and resource usage of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStatus {
    pub code: StatusCode,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub backtrace: Option<String>,
    #[serde(default)]
    pub cpu_time_used: CpuUsage,
    #[serde(default)]
    pub network_bytes_sent: u64,
    /// Set when the status reports the end of a child flow
    #[serde(default)]
    pub child_session_id: Option<SessionId>,
}

impl FlowStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            error_message: None,
            backtrace: None,
            cpu_time_used: CpuUsage::default(),
            network_bytes_sent: 0,
            child_session_id: None,
        }
    }

    pub fn error<S: Into<String>>(code: StatusCode, message: S) -> Self {
        Self {
            error_message: Some(message.into()),
            code,
            ..Self::ok()
        }
    }

    pub fn client_killed() -> Self {
        Self::error(StatusCode::ClientKilled, "Client killed during transaction")
    }
}

/// Status marker carried by every envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeStatus {
    /// Partial result of a streaming request
    Iterator,
    /// Ordinary reply
    Ok,
    /// Reply that aborts the request
    Error { message: String },
    /// Terminal record of the request
    Status(FlowStatus),
}

/// One message unit exchanged between server and agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub session_id: SessionId,
    pub request_id: u64,
    pub response_id: u64,
    pub status: EnvelopeStatus,
    #[serde(default)]
    pub payload: Option<Payload>,
    #[serde(default)]
    pub auth_state: AuthState,
    #[serde(default)]
    pub source: Option<ClientId>,
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    /// Ordinary `Ok` reply
    pub fn response(session_id: SessionId, request_id: u64, response_id: u64, payload: Payload) -> Self {
        Self {
            session_id,
            request_id,
            response_id,
            status: EnvelopeStatus::Ok,
            payload: Some(payload),
            auth_state: AuthState::Authenticated,
            source: None,
            timestamp: Utc::now(),
        }
    }

    /// Terminal STATUS record for a request
    pub fn status(session_id: SessionId, request_id: u64, response_id: u64, status: FlowStatus) -> Self {
        Self {
            session_id,
            request_id,
            response_id,
            status: EnvelopeStatus::Status(status),
            payload: None,
            auth_state: AuthState::Authenticated,
            source: None,
            timestamp: Utc::now(),
        }
    }

    /// Reply that aborts the request
    pub fn error<S: Into<String>>(session_id: SessionId, request_id: u64, response_id: u64, message: S) -> Self {
        Self {
            session_id,
            request_id,
            response_id,
            status: EnvelopeStatus::Error {
                message: message.into(),
            },
            payload: None,
            auth_state: AuthState::Authenticated,
            source: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: ClientId) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_status(mut self, status: EnvelopeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_status(&self) -> bool {
        matches!(self.status, EnvelopeStatus::Status(_))
    }

    pub fn flow_status(&self) -> Option<&FlowStatus> {
        match &self.status {
            EnvelopeStatus::Status(status) => Some(status),
            _ => None,
        }
    }
}

/// Outbound unit of work queued for delivery to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub request_id: u64,
    /// Name of the agent-side action to invoke
    pub action: String,
    pub args: Payload,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    #[serde(default)]
    pub network_bytes_limit: Option<u64>,
}
