// Alert collaborator - the only push notification the engine emits

//! # Alerts
//!
//! The engine alerts on client crashes, nanny (liveness) messages, client
//! alerts, hunt failures and hunt threshold breaches. Delivery is delegated to
//! an [`AlertSender`] injected at construction:
//!
//! - [`LogAlertSender`]: writes alerts to the tracing log
//! - [`WebhookAlertSender`]: POSTs a JSON document to an HTTP endpoint
//! - [`MemoryAlertSender`]: keeps alerts in memory for assertions
//!
//! [`AlertDispatcher`] wraps the sender with the fleet's default target and
//! swallows delivery failures: an alert that cannot be sent is logged and never
//! fails the flow that raised it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::AlertSettings;
use crate::models::ClientId;
use crate::{FleetError, Result};

/// One delivered alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub target: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send_alert(&self, target: &str, subject: &str, body: &str) -> Result<()>;
}

/// Logs alerts instead of delivering them
#[derive(Debug, Default)]
pub struct LogAlertSender;

#[async_trait]
impl AlertSender for LogAlertSender {
    async fn send_alert(&self, target: &str, subject: &str, body: &str) -> Result<()> {
        info!(target_address = target, subject, "ALERT: {}", body);
        Ok(())
    }
}

/// Delivers alerts as JSON POSTs
pub struct WebhookAlertSender {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSender {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertSender for WebhookAlertSender {
    async fn send_alert(&self, target: &str, subject: &str, body: &str) -> Result<()> {
        let alert = Alert {
            target: target.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&alert)
            .send()
            .await
            .map_err(|e| FleetError::Alert(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(FleetError::Alert(format!(
                "Webhook returned status {}: {}",
                status, error_text
            )));
        }
        Ok(())
    }
}

/// Records alerts in memory, in delivery order
#[derive(Debug, Default)]
pub struct MemoryAlertSender {
    alerts: Mutex<Vec<Alert>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryAlertSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }

    /// Make every following delivery fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl AlertSender for MemoryAlertSender {
    async fn send_alert(&self, target: &str, subject: &str, body: &str) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(FleetError::Alert("alert sink unavailable".to_string()));
        }
        self.alerts.lock().await.push(Alert {
            target: target.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

/// Sender plus fleet-wide alert policy
#[derive(Clone)]
pub struct AlertDispatcher {
    sender: Arc<dyn AlertSender>,
    default_target: String,
    ui_base_url: String,
}

impl AlertDispatcher {
    pub fn new<T: Into<String>, U: Into<String>>(
        sender: Arc<dyn AlertSender>,
        default_target: T,
        ui_base_url: U,
    ) -> Self {
        Self {
            sender,
            default_target: default_target.into(),
            ui_base_url: ui_base_url.into(),
        }
    }

    /// Webhook sender when a URL is configured, log sender otherwise
    pub fn from_settings(settings: &AlertSettings) -> Self {
        let sender: Arc<dyn AlertSender> = match &settings.webhook_url {
            Some(url) => Arc::new(WebhookAlertSender::new(url.clone())),
            None => Arc::new(LogAlertSender),
        };
        Self::new(sender, settings.default_target.clone(), settings.ui_base_url.clone())
    }

    pub fn default_target(&self) -> &str {
        &self.default_target
    }

    /// Link to the client's page in the operator UI
    pub fn client_link(&self, client_id: &ClientId) -> String {
        format!("{}/#/clients/{}", self.ui_base_url, client_id)
    }

    /// Send one alert; failures are logged and reported as `false`
    pub async fn send(&self, target: &str, subject: &str, body: &str) -> bool {
        match self.sender.send_alert(target, subject, body).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target_address = target, subject, "Failed to send alert: {}", e);
                false
            }
        }
    }

    pub async fn send_default(&self, subject: &str, body: &str) -> bool {
        let target = self.default_target.clone();
        self.send(&target, subject, body).await
    }
}
