// Identifiers for clients, flows, sessions and hunts
//
// ## Session Naming
//
// Every envelope exchanged with an agent is correlated by its session id.
// Session ids are plain strings with a small amount of structure:
//
// ```text
// C.1000000000000000/flows/F.1A2B3C4D              flow started directly
// C.1000000000000000/flows/H.99AA00FF              flow started by hunt H.99AA00FF
// C.1000000000000000/flows/F.1A2B3C4D/F.0000BEEF   child flow nested under its parent
// W/NannyMessage                                   well-known (stateless) handler
// ```
//
// The client namespace is always the first path segment of a flow session, so
// the owning client can be recovered from the session id alone.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{FleetError, Result};

const WELL_KNOWN_PREFIX: &str = "W/";
const FLOWS_SEGMENT: &str = "/flows/";

/// Identity of one agent in the fleet, e.g. `C.1000000000000000`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    /// Parse and validate a client id (`C.` followed by 16 hex digits)
    ///
    /// ```rust
    /// # use fleet_orchestrator::ClientId;
    /// assert!(ClientId::parse("C.1000000000000000").is_ok());
    /// assert!(ClientId::parse("bogus").is_err());
    /// ```
    pub fn parse(raw: &str) -> Result<Self> {
        let hex = raw.strip_prefix("C.").ok_or_else(|| {
            FleetError::InvalidInput(format!("client id must start with 'C.': {}", raw))
        })?;
        if hex.len() != 16 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FleetError::InvalidInput(format!(
                "client id must carry 16 hex digits: {}",
                raw
            )));
        }
        Ok(ClientId(raw.to_string()))
    }

    /// Build the canonical client id for a numeric index (used by fixtures)
    pub fn from_index(index: u64) -> Self {
        ClientId(format!("C.{:016X}", 0x1000_0000_0000_0000u64 + index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Short flow identifier, unique within one client's namespace (`F.1A2B3C4D`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl FlowId {
    pub fn random() -> Self {
        let value: u32 = rand::thread_rng().gen();
        FlowId(format!("F.{:08X}", value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hunt identifier (`H.99AA00FF`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HuntId(pub String);

impl HuntId {
    pub fn random() -> Self {
        let value: u32 = rand::thread_rng().gen();
        HuntId(format!("H.{:08X}", value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for HuntId {
    fn from(s: &str) -> Self {
        HuntId(s.to_string())
    }
}

impl std::fmt::Display for HuntId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation key for every envelope that belongs to one flow instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Session of a flow started directly on a client
    pub fn for_flow(client_id: &ClientId, flow_id: &FlowId) -> Self {
        SessionId(format!("{}{}{}", client_id, FLOWS_SEGMENT, flow_id))
    }

    /// Session of the flow a hunt runs on one client
    pub fn for_hunt(client_id: &ClientId, hunt_id: &HuntId) -> Self {
        SessionId(format!("{}{}{}", client_id, FLOWS_SEGMENT, hunt_id))
    }

    /// Session of a child flow, nested under its parent
    pub fn child(&self, flow_id: &FlowId) -> Self {
        SessionId(format!("{}/{}", self.0, flow_id))
    }

    /// Reserved session of a well-known handler
    pub fn well_known(name: &str) -> Self {
        SessionId(format!("{}{}", WELL_KNOWN_PREFIX, name))
    }

    pub fn is_well_known(&self) -> bool {
        self.0.starts_with(WELL_KNOWN_PREFIX)
    }

    /// Handler name for well-known sessions
    pub fn well_known_name(&self) -> Option<&str> {
        self.0.strip_prefix(WELL_KNOWN_PREFIX)
    }

    /// Owning client, recovered from the first path segment
    pub fn client_id(&self) -> Option<ClientId> {
        if self.is_well_known() {
            return None;
        }
        let (client, _) = self.0.split_once(FLOWS_SEGMENT)?;
        ClientId::parse(client).ok()
    }

    /// Session of the parent flow, if this is a nested child session
    pub fn parent(&self) -> Option<SessionId> {
        let (_, flow_path) = self.0.split_once(FLOWS_SEGMENT)?;
        if !flow_path.contains('/') {
            return None;
        }
        let cut = self.0.rfind('/')?;
        Some(SessionId(self.0[..cut].to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        SessionId(s)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
