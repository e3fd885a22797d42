// Crash reporting - persist crash records and alert on them

use std::sync::Arc;

use tracing::{info, warn};

use super::alerts::AlertDispatcher;
use super::storage::{ClientStore, FleetStore};
use crate::models::{ClientRecord, CrashRecord, FlowInstance};
use crate::Result;

/// Writes crash records and sends the fleet-wide crash alert
#[derive(Clone)]
pub struct CrashReporter {
    store: Arc<dyn FleetStore>,
    alerts: AlertDispatcher,
}

impl CrashReporter {
    pub fn new(store: Arc<dyn FleetStore>, alerts: AlertDispatcher) -> Self {
        Self { store, alerts }
    }

    /// Append to the client's history and set it as the client's last crash
    pub async fn record(&self, crash: &CrashRecord) -> Result<()> {
        info!(
            client_id = %crash.client_id,
            session_id = ?crash.session_id,
            crash_type = %crash.crash_type,
            "Recording client crash"
        );
        self.store.write_crash(crash.clone()).await
    }

    /// Alert the fleet default target about a crash
    pub async fn alert(&self, crash: &CrashRecord, flow: Option<&FlowInstance>) {
        let client = match self.store.read_client(&crash.client_id).await {
            Ok(client) => client,
            Err(e) => {
                warn!(client_id = %crash.client_id, "Could not read client for crash alert: {}", e);
                None
            }
        };
        let (subject, body) = self.compose(crash, client.as_ref(), flow);
        self.alerts.send_default(&subject, &body).await;
    }

    /// Record and alert
    pub async fn report(&self, crash: &CrashRecord, flow: Option<&FlowInstance>) -> Result<()> {
        self.record(crash).await?;
        self.alert(crash, flow).await;
        Ok(())
    }

    fn compose(
        &self,
        crash: &CrashRecord,
        client: Option<&ClientRecord>,
        flow: Option<&FlowInstance>,
    ) -> (String, String) {
        let hostname = client
            .and_then(|c| c.hostname.clone())
            .unwrap_or_else(|| "unknown host".to_string());

        let subject = format!("Client {} ({}) reported a crash: {}", crash.client_id, hostname, crash.crash_type);

        let mut body = format!(
            "Client {} ({}) reported a crash.\n\nClient: {}\nType: {}\nMessage: {}\n",
            crash.client_id,
            hostname,
            self.alerts.client_link(&crash.client_id),
            crash.crash_type,
            crash.crash_message,
        );
        if let Some(session_id) = &crash.session_id {
            body.push_str(&format!("Session: {}\n", session_id));
        }
        if let Some(flow) = flow {
            body.push_str(&format!(
                "Flow: {} (state {}, waiting in {})\n",
                flow.flow_name, flow.state, flow.current_state
            ));
        }
        if let Some(backtrace) = &crash.backtrace {
            body.push_str(&format!("\nBacktrace:\n{}\n", backtrace));
        }
        (subject, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::alerts::MemoryAlertSender;
    use crate::engine::storage::InMemoryStorage;
    use crate::models::{ClientId, SessionId, CLIENT_CRASH_TYPE};

    #[tokio::test]
    async fn test_report_writes_history_and_alerts_default_target() {
        let store = Arc::new(InMemoryStorage::new());
        let sink = Arc::new(MemoryAlertSender::new());
        let reporter = CrashReporter::new(
            store.clone(),
            AlertDispatcher::new(sink.clone(), "sec@example.com", "http://localhost:8000"),
        );

        let client_id = ClientId::from_index(0);
        store
            .write_client(ClientRecord::new(client_id.clone()).with_hostname("Host-0.example.com"))
            .await
            .unwrap();

        let crash = CrashRecord::new(
            client_id.clone(),
            Some(SessionId::from("C.1000000000000000/flows/F.00000001")),
            CLIENT_CRASH_TYPE,
            "Client killed during transaction",
        );
        reporter.report(&crash, None).await.unwrap();

        assert_eq!(store.list_client_crashes(&client_id).await.unwrap().len(), 1);
        let alerts = sink.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].target, "sec@example.com");
        assert!(alerts[0].subject.contains("C.1000000000000000"));
        assert!(alerts[0].body.contains("Host-0.example.com"));
        assert!(alerts[0]
            .body
            .contains("http://localhost:8000/#/clients/C.1000000000000000"));
        assert!(alerts[0].body.contains("C.1000000000000000/flows/F.00000001"));
    }
}
