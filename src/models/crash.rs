// Crash records and client records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ClientId, SessionId};

/// Crash type used when a STATUS record reports CLIENT_KILLED
pub const CLIENT_CRASH_TYPE: &str = "Client Crash";
/// Crash type used for out-of-band nanny (liveness) messages
pub const NANNY_MESSAGE_TYPE: &str = "Nanny Message";
/// Client name recorded on crashes detected by the server side monitor
pub const MONITOR_CLIENT_NAME: &str = "Fleet Monitor";

/// Build information an agent reports about itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_name: String,
    #[serde(default)]
    pub client_version: u32,
    #[serde(default)]
    pub client_description: String,
    #[serde(default)]
    pub build_time: String,
}

impl ClientInfo {
    pub fn monitor() -> Self {
        Self {
            client_name: MONITOR_CLIENT_NAME.to_string(),
            ..Self::default()
        }
    }
}

/// Durable evidence that an agent terminated abnormally
///
/// Immutable once written. Stored in the per-client crash history, as the
/// client's last crash, and linked to the originating flow when there is one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub client_id: ClientId,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub crash_type: String,
    pub crash_message: String,
    pub client_info: ClientInfo,
    #[serde(default)]
    pub backtrace: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CrashRecord {
    pub fn new<T: Into<String>, M: Into<String>>(
        client_id: ClientId,
        session_id: Option<SessionId>,
        crash_type: T,
        crash_message: M,
    ) -> Self {
        Self {
            client_id,
            session_id,
            crash_type: crash_type.into(),
            crash_message: crash_message.into(),
            client_info: ClientInfo::monitor(),
            backtrace: None,
            timestamp: Utc::now(),
        }
    }
}

/// Startup report an agent sends each time it boots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupInfo {
    pub client_info: ClientInfo,
    /// Seconds since epoch
    pub boot_time: i64,
}

/// What the server knows about one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: ClientId,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub startup: Option<StartupInfo>,
    #[serde(default)]
    pub last_crash: Option<CrashRecord>,
    /// True when the record was created only because a message arrived
    #[serde(default)]
    pub placeholder: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ClientRecord {
    pub fn new(client_id: ClientId) -> Self {
        let now = Utc::now();
        Self {
            client_id,
            hostname: None,
            os: None,
            labels: Vec::new(),
            startup: None,
            last_crash: None,
            placeholder: false,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Minimal record for a client we only know from an incoming message
    pub fn placeholder(client_id: ClientId) -> Self {
        Self {
            placeholder: true,
            ..Self::new(client_id)
        }
    }

    pub fn with_hostname<S: Into<String>>(mut self, hostname: S) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_label<S: Into<String>>(mut self, label: S) -> Self {
        self.labels.push(label.into());
        self
    }

    /// Hostname when known, client id otherwise
    pub fn display_name(&self) -> String {
        self.hostname
            .clone()
            .unwrap_or_else(|| self.client_id.to_string())
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_record_defaults_to_monitor_info() {
        let crash = CrashRecord::new(
            ClientId::from_index(0),
            None,
            CLIENT_CRASH_TYPE,
            "Client killed during transaction",
        );
        assert_eq!(crash.client_info.client_name, MONITOR_CLIENT_NAME);
        assert_eq!(crash.crash_type, "Client Crash");
    }

    #[test]
    fn test_display_name_falls_back_to_client_id() {
        let record = ClientRecord::placeholder(ClientId::from_index(1));
        assert!(record.placeholder);
        assert_eq!(record.display_name(), "C.1000000000000001");

        let named = ClientRecord::new(ClientId::from_index(1)).with_hostname("Host-1.example.com");
        assert_eq!(named.display_name(), "Host-1.example.com");
    }
}
