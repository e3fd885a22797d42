// Layered settings for the orchestrator
//
// Sources, lowest precedence first:
//   1. built-in defaults (every field has one)
//   2. optional TOML file, path from FLEET_CONFIG (default: fleet.toml)
//   3. environment variables, FLEET__SECTION__KEY (e.g. FLEET__WORKER__LEASE_TTL_SECS)

use std::time::Duration;

use serde::Deserialize;

use crate::Result;

pub const CONFIG_PATH_ENV: &str = "FLEET_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "fleet.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub hunts: HuntSettings,
    #[serde(default)]
    pub alerts: AlertSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_idle_backoff_min_ms")]
    pub idle_backoff_min_ms: u64,
    #[serde(default = "default_idle_backoff_max_ms")]
    pub idle_backoff_max_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_concurrent_sessions(),
            lease_ttl_secs: default_lease_ttl_secs(),
            idle_backoff_min_ms: default_idle_backoff_min_ms(),
            idle_backoff_max_ms: default_idle_backoff_max_ms(),
        }
    }
}

impl WorkerSettings {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HuntSettings {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Clients started per tick when a hunt does not set its own rate
    #[serde(default = "default_client_rate")]
    pub default_client_rate: u32,
}

impl Default for HuntSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            default_client_rate: default_client_rate(),
        }
    }
}

impl HuntSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertSettings {
    /// Fleet-wide target for crash and liveness alerts
    #[serde(default = "default_alert_target")]
    pub default_target: String,
    /// When unset alerts are only logged
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Base of the links embedded in alert bodies
    #[serde(default = "default_ui_base_url")]
    pub ui_base_url: String,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            default_target: default_alert_target(),
            webhook_url: None,
            ui_base_url: default_ui_base_url(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Nats,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_nats_urls")]
    pub nats_urls: Vec<String>,
    #[serde(default = "default_bucket_prefix")]
    pub bucket_prefix: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            nats_urls: default_nats_urls(),
            bucket_prefix: default_bucket_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: true,
        }
    }
}

impl Settings {
    /// Load defaults, then the config file (if any), then the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("FLEET")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("storage.nats_urls")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Settings>()?;
        Ok(settings.normalize())
    }

    fn normalize(mut self) -> Self {
        self.alerts.webhook_url = self.alerts.webhook_url.take().and_then(|url| {
            let trimmed = url.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        });
        self.alerts.ui_base_url = self.alerts.ui_base_url.trim_end_matches('/').to_string();
        if self.worker.idle_backoff_max_ms < self.worker.idle_backoff_min_ms {
            self.worker.idle_backoff_max_ms = self.worker.idle_backoff_min_ms;
        }
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn default_max_concurrent_sessions() -> usize {
    16
}

fn default_lease_ttl_secs() -> u64 {
    60
}

fn default_idle_backoff_min_ms() -> u64 {
    50
}

fn default_idle_backoff_max_ms() -> u64 {
    2000
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_client_rate() -> u32 {
    20
}

fn default_alert_target() -> String {
    "fleet-alerts@localhost".to_string()
}

fn default_ui_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_backend() -> StorageBackend {
    StorageBackend::Memory
}

fn default_nats_urls() -> Vec<String> {
    vec!["nats://localhost:4222".to_string()]
}

fn default_bucket_prefix() -> String {
    "fleet".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let settings = Settings::load_from("definitely-missing-fleet-config").unwrap();
        assert_eq!(settings.worker.max_concurrent_sessions, 16);
        assert_eq!(settings.worker.lease_ttl(), Duration::from_secs(60));
        assert_eq!(settings.hunts.default_client_rate, 20);
        assert_eq!(settings.alerts.default_target, "fleet-alerts@localhost");
        assert_eq!(settings.storage.backend, StorageBackend::Memory);
        assert_eq!(settings.server.port, 4000);
    }

    #[test]
    fn test_normalize_trims_values() {
        let mut settings = Settings::default();
        settings.alerts.webhook_url = Some("   ".to_string());
        settings.alerts.ui_base_url = "https://fleet.example.com/".to_string();
        settings.worker.idle_backoff_min_ms = 500;
        settings.worker.idle_backoff_max_ms = 10;

        let settings = settings.normalize();
        assert!(settings.alerts.webhook_url.is_none());
        assert_eq!(settings.alerts.ui_base_url, "https://fleet.example.com");
        assert_eq!(settings.worker.idle_backoff_max_ms, 500);
    }
}
