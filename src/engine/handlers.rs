// Well-known handlers - stateless processing of reserved sessions

//! # Well-Known Handlers
//!
//! Agents send some messages outside of any flow: crash notices, nanny
//! (liveness) messages, interactive alerts and startup reports. They arrive on
//! reserved sessions named `W/<handler>` and are handled one envelope at a
//! time, without a persisted state machine.
//!
//! | Session           | Effect                                           |
//! |-------------------|--------------------------------------------------|
//! | `W/ClientCrash`   | crash record + default alert                     |
//! | `W/NannyMessage`  | "Nanny Message" crash record + default alert     |
//! | `W/ClientAlert`   | default alert                                    |
//! | `W/Startup`       | client record update when the startup info moved |
//!
//! A malformed envelope is logged and skipped; the rest of the batch is still
//! handled and every envelope is acknowledged.
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects in a Map
//! The registry stores `Arc<dyn WellKnownHandler>` keyed by name. `async_trait`
//! makes the async `handle` method object-safe by boxing the returned future.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::alerts::AlertDispatcher;
use super::crashes::CrashReporter;
use super::storage::{ClientStore, FleetStore, FlowStateStore, SessionLease};
use crate::models::{
    ClientId, ClientInfo, ClientRecord, CrashRecord, FlowStatus, MessageEnvelope, SessionId,
    StartupInfo, CLIENT_CRASH_TYPE, NANNY_MESSAGE_TYPE,
};
use crate::{FleetError, Result};

pub const CLIENT_CRASH_HANDLER: &str = "ClientCrash";
pub const NANNY_MESSAGE_HANDLER: &str = "NannyMessage";
pub const CLIENT_ALERT_HANDLER: &str = "ClientAlert";
pub const STARTUP_HANDLER: &str = "Startup";

#[async_trait]
pub trait WellKnownHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handle one envelope; `client_id` is the authenticated source
    async fn handle(&self, client_id: &ClientId, envelope: &MessageEnvelope) -> Result<()>;
}

/// Out-of-band crash notice an agent sends after restarting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrashNotice {
    /// Session that was active when the agent died
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub status: Option<FlowStatus>,
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
}

/// Crash notices arriving on `W/ClientCrash`
pub struct ClientCrashHandler {
    crashes: CrashReporter,
}

#[async_trait]
impl WellKnownHandler for ClientCrashHandler {
    fn name(&self) -> &'static str {
        CLIENT_CRASH_HANDLER
    }

    async fn handle(&self, client_id: &ClientId, envelope: &MessageEnvelope) -> Result<()> {
        // an empty payload is still a crash, just without details
        let notice: CrashNotice = match &envelope.payload {
            Some(payload) if !payload.data.is_empty() => payload.decode()?,
            _ => CrashNotice::default(),
        };

        let status = notice.status.unwrap_or_else(FlowStatus::client_killed);
        let message = status
            .error_message
            .unwrap_or_else(|| "Client killed during transaction".to_string());
        let mut crash = CrashRecord::new(client_id.clone(), notice.session_id, CLIENT_CRASH_TYPE, message);
        crash.backtrace = status.backtrace;
        if let Some(info) = notice.client_info {
            crash.client_info = info;
        }

        self.crashes.report(&crash, None).await
    }
}

/// Nanny (liveness watchdog) messages arriving on `W/NannyMessage`
pub struct NannyMessageHandler {
    crashes: CrashReporter,
}

#[async_trait]
impl WellKnownHandler for NannyMessageHandler {
    fn name(&self) -> &'static str {
        NANNY_MESSAGE_HANDLER
    }

    async fn handle(&self, client_id: &ClientId, envelope: &MessageEnvelope) -> Result<()> {
        let message = text_payload(envelope)?;
        let crash = CrashRecord::new(client_id.clone(), None, NANNY_MESSAGE_TYPE, message);
        self.crashes.report(&crash, None).await
    }
}

/// Interactive alerts arriving on `W/ClientAlert`
pub struct ClientAlertHandler {
    store: Arc<dyn FleetStore>,
    alerts: AlertDispatcher,
}

#[async_trait]
impl WellKnownHandler for ClientAlertHandler {
    fn name(&self) -> &'static str {
        CLIENT_ALERT_HANDLER
    }

    async fn handle(&self, client_id: &ClientId, envelope: &MessageEnvelope) -> Result<()> {
        let message = text_payload(envelope)?;
        let client = self.store.read_client(client_id).await?;
        let hostname = client
            .as_ref()
            .map(ClientRecord::display_name)
            .unwrap_or_else(|| client_id.to_string());

        let subject = format!("Client {} ({}) sent an alert", client_id, hostname);
        let body = format!(
            "Client {} ({}) sent an alert.\n\nClient: {}\nMessage: {}\n",
            client_id,
            hostname,
            self.alerts.client_link(client_id),
            message
        );
        self.alerts.send_default(&subject, &body).await;
        Ok(())
    }
}

/// Startup reports arriving on `W/Startup`
pub struct StartupHandler {
    store: Arc<dyn FleetStore>,
}

#[async_trait]
impl WellKnownHandler for StartupHandler {
    fn name(&self) -> &'static str {
        STARTUP_HANDLER
    }

    async fn handle(&self, client_id: &ClientId, envelope: &MessageEnvelope) -> Result<()> {
        let payload = envelope
            .payload
            .as_ref()
            .ok_or_else(|| FleetError::Protocol("startup message without payload".to_string()))?;
        let startup: StartupInfo = payload.decode()?;

        let mut client = self.store.ensure_client(client_id).await?;
        if client.startup.as_ref() == Some(&startup) {
            debug!(client_id = %client_id, "Startup info unchanged");
            return Ok(());
        }

        info!(
            client_id = %client_id,
            boot_time = startup.boot_time,
            client_name = %startup.client_info.client_name,
            "Client started"
        );
        client.startup = Some(startup);
        client.last_seen = chrono::Utc::now();
        self.store.write_client(client).await
    }
}

fn text_payload(envelope: &MessageEnvelope) -> Result<String> {
    envelope
        .payload
        .as_ref()
        .map(|payload| payload.as_text())
        .ok_or_else(|| FleetError::Protocol("message without payload".to_string()))
}

/// Maps reserved session names to their handlers
pub struct WellKnownRegistry {
    store: Arc<dyn FleetStore>,
    handlers: HashMap<String, Arc<dyn WellKnownHandler>>,
}

impl WellKnownRegistry {
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    /// Registry with the four built-in handlers
    pub fn standard(store: Arc<dyn FleetStore>, alerts: AlertDispatcher) -> Self {
        let crashes = CrashReporter::new(store.clone(), alerts.clone());
        let mut registry = Self::new(store.clone());
        registry
            .register(Arc::new(ClientCrashHandler {
                crashes: crashes.clone(),
            }))
            .register(Arc::new(NannyMessageHandler { crashes }))
            .register(Arc::new(ClientAlertHandler {
                store: store.clone(),
                alerts,
            }))
            .register(Arc::new(StartupHandler { store }));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn WellKnownHandler>) -> &mut Self {
        self.handlers.insert(handler.name().to_string(), handler);
        self
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<dyn WellKnownHandler>> {
        session_id
            .well_known_name()
            .and_then(|name| self.handlers.get(name).cloned())
    }

    pub fn handles(&self, session_id: &SessionId) -> bool {
        self.get(session_id).is_some()
    }

    /// Handle every envelope queued for a well-known session, then ack them
    ///
    /// Returns the number of envelopes handled successfully.
    pub async fn process_session(&self, lease: &SessionLease) -> Result<usize> {
        let handler = self.get(&lease.session_id).ok_or_else(|| {
            FleetError::Internal(format!("no handler for session {}", lease.session_id))
        })?;

        let messages = self.store.fetch_inbound(lease).await?;
        let mut handled = 0;
        for message in &messages {
            match self.dispatch(handler.as_ref(), &message.envelope).await {
                Ok(()) => handled += 1,
                Err(e) => warn!(
                    session_id = %lease.session_id,
                    message_id = %message.message_id,
                    "Well-known handler {} failed: {}",
                    handler.name(),
                    e
                ),
            }
        }

        let acked: Vec<String> = messages.into_iter().map(|m| m.message_id).collect();
        self.store.ack_inbound(lease, &acked).await?;
        Ok(handled)
    }

    async fn dispatch(&self, handler: &dyn WellKnownHandler, envelope: &MessageEnvelope) -> Result<()> {
        let client_id = envelope
            .source
            .clone()
            .ok_or_else(|| FleetError::Protocol("well-known message without source".to_string()))?;
        // the client may be unknown to us until now
        self.store.ensure_client(&client_id).await?;
        handler.handle(&client_id, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::alerts::MemoryAlertSender;
    use crate::engine::storage::InMemoryStorage;
    use crate::models::{AuthState, Payload};
    use std::time::Duration;

    struct Harness {
        store: Arc<InMemoryStorage>,
        sink: Arc<MemoryAlertSender>,
        registry: WellKnownRegistry,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStorage::new());
        let sink = Arc::new(MemoryAlertSender::new());
        let alerts = AlertDispatcher::new(sink.clone(), "sec@example.com", "http://localhost:8000");
        let registry = WellKnownRegistry::standard(store.clone(), alerts);
        Harness { store, sink, registry }
    }

    fn message(handler: &str, client_id: &ClientId, payload: Payload) -> MessageEnvelope {
        let mut envelope = MessageEnvelope::response(SessionId::well_known(handler), 0, 123, payload)
            .with_source(client_id.clone());
        envelope.auth_state = AuthState::Authenticated;
        envelope
    }

    impl Harness {
        async fn deliver(&self, envelopes: Vec<MessageEnvelope>) -> usize {
            let session = envelopes[0].session_id.clone();
            for envelope in envelopes {
                self.store.enqueue_inbound(envelope).await.unwrap();
            }
            let lease = self
                .store
                .try_lease(&session, Duration::from_secs(30))
                .await
                .unwrap()
                .unwrap();
            let handled = self.registry.process_session(&lease).await.unwrap();
            self.store.release_lease(&lease).await.unwrap();
            assert_eq!(self.store.pending_inbound(&session).await, 0);
            handled
        }
    }

    #[tokio::test]
    async fn test_nanny_message_records_crash_and_alerts() {
        let h = harness();
        let client_id = ClientId::from_index(0);
        h.store
            .write_client(ClientRecord::new(client_id.clone()).with_hostname("Host-0.example.com"))
            .await
            .unwrap();

        h.deliver(vec![message(NANNY_MESSAGE_HANDLER, &client_id, Payload::text("Oh no!"))])
            .await;

        let alerts = h.sink.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].target, "sec@example.com");
        assert!(alerts[0].subject.contains("C.1000000000000000"));
        assert!(alerts[0].body.contains("Oh no!"));

        let crashes = h.store.list_client_crashes(&client_id).await.unwrap();
        assert_eq!(crashes.len(), 1);
        assert_eq!(crashes[0].client_info.client_name, "Fleet Monitor");
        assert_eq!(crashes[0].crash_type, "Nanny Message");
        assert_eq!(crashes[0].crash_message, "Oh no!");
    }

    #[tokio::test]
    async fn test_client_alert_sends_default_alert_only() {
        let h = harness();
        let client_id = ClientId::from_index(0);

        h.deliver(vec![message(CLIENT_ALERT_HANDLER, &client_id, Payload::text("Oh no!"))])
            .await;

        let alerts = h.sink.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].subject.contains("C.1000000000000000"));
        assert!(alerts[0].body.contains("Oh no!"));
        assert!(h.store.list_client_crashes(&client_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_client_gets_placeholder_record() {
        let h = harness();
        let client_id = ClientId::from_index(7);

        h.deliver(vec![message(CLIENT_ALERT_HANDLER, &client_id, Payload::text("hello"))])
            .await;

        let record = h.store.read_client(&client_id).await.unwrap().unwrap();
        assert!(record.placeholder);
    }

    #[tokio::test]
    async fn test_client_crash_notice_links_session() {
        let h = harness();
        let client_id = ClientId::from_index(0);
        let session = SessionId::from("C.1000000000000000/flows/F.00000001");
        let notice = CrashNotice {
            session_id: Some(session.clone()),
            status: Some(FlowStatus::client_killed()),
            client_info: None,
        };

        h.deliver(vec![message(
            CLIENT_CRASH_HANDLER,
            &client_id,
            Payload::json("CrashNotice", &notice).unwrap(),
        )])
        .await;

        let crashes = h.store.list_flow_crashes(&session).await.unwrap();
        assert_eq!(crashes.len(), 1);
        assert_eq!(crashes[0].crash_message, "Client killed during transaction");
        assert_eq!(h.sink.alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_startup_writes_only_on_change() {
        let h = harness();
        let client_id = ClientId::from_index(0);
        let startup = StartupInfo {
            client_info: ClientInfo {
                client_name: "fleet-agent".to_string(),
                client_version: 3,
                ..ClientInfo::default()
            },
            boot_time: 1_700_000_000,
        };
        let payload = Payload::json("StartupInfo", &startup).unwrap();

        h.deliver(vec![message(STARTUP_HANDLER, &client_id, payload.clone())]).await;
        let first = h.store.read_client(&client_id).await.unwrap().unwrap();
        assert_eq!(first.startup.as_ref(), Some(&startup));

        // identical info leaves the record untouched
        h.deliver(vec![message(STARTUP_HANDLER, &client_id, payload)]).await;
        let second = h.store.read_client(&client_id).await.unwrap().unwrap();
        assert_eq!(second, first);

        let rebooted = StartupInfo {
            boot_time: startup.boot_time + 600,
            ..startup
        };
        h.deliver(vec![message(
            STARTUP_HANDLER,
            &client_id,
            Payload::json("StartupInfo", &rebooted).unwrap(),
        )])
        .await;
        let third = h.store.read_client(&client_id).await.unwrap().unwrap();
        assert_eq!(third.startup.unwrap().boot_time, 1_700_000_600);
    }

    #[tokio::test]
    async fn test_malformed_envelope_does_not_fail_batch() {
        let h = harness();
        let client_id = ClientId::from_index(0);
        let mut sourceless = message(CLIENT_ALERT_HANDLER, &client_id, Payload::text("lost"));
        sourceless.source = None;

        let handled = h
            .deliver(vec![
                sourceless,
                message(CLIENT_ALERT_HANDLER, &client_id, Payload::text("kept")),
            ])
            .await;

        assert_eq!(handled, 1);
        let alerts = h.sink.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].body.contains("kept"));
    }
}
