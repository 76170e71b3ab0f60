//! Gateway + core configuration. Load from TOML file or environment.

use crate::shared::RiskLevel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Global application configuration. Precedence: defaults, then the TOML file
/// named by `HAVEN_CONFIG` (or `config/gateway.toml`), then `HAVEN__*` env vars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HavenConfig {
    /// Application identity used in logs and the health endpoint.
    pub app_name: String,
    /// HTTP port for the gateway.
    pub port: u16,
    /// Base directory for the Sled store and data files.
    pub storage_path: String,

    /// Replace stored/exposed user messages with a placeholder, process-wide.
    #[serde(default)]
    pub redact_messages: bool,

    /// Seconds an alert may sit unacknowledged before re-notification.
    #[serde(default = "default_escalation_window_secs")]
    pub escalation_window_secs: u64,
    /// Escalation rounds before the alert is parked for manual review.
    #[serde(default = "default_max_escalation_rounds")]
    pub max_escalation_rounds: u32,

    /// Minimum risk level that opens an alert ("low".."critical").
    #[serde(default = "default_alert_level")]
    pub alert_level: String,

    /// Crisis hotline appended to every critical-level reply.
    #[serde(default = "default_hotline")]
    pub hotline: String,

    /// Webhook notification target. `HAVEN_WEBHOOK_URL` overrides.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// SMS relay endpoint; the SMS channel is not registered when unset.
    #[serde(default)]
    pub sms_gateway_url: Option<String>,

    /// SMTP relay host for the email channel (requires the `email` feature).
    #[serde(default)]
    pub smtp_relay: Option<String>,
    #[serde(default)]
    pub email_from: Option<String>,
    #[serde(default)]
    pub email_to: Option<String>,

    /// Directory holding `crisis_lexicon.toml`; defaults to
    /// `<storage_path>/data`.
    #[serde(default)]
    pub lexicon_path: Option<String>,
}

fn default_escalation_window_secs() -> u64 {
    300
}

fn default_max_escalation_rounds() -> u32 {
    3
}

fn default_alert_level() -> String {
    "high".to_string()
}

fn default_hotline() -> String {
    // National psychological crisis line (Vietnam), with 115 for emergencies.
    "1800 599 920".to_string()
}

impl Default for HavenConfig {
    fn default() -> Self {
        Self {
            app_name: "Haven Gateway".to_string(),
            port: 8002,
            storage_path: "./data".to_string(),
            redact_messages: false,
            escalation_window_secs: default_escalation_window_secs(),
            max_escalation_rounds: default_max_escalation_rounds(),
            alert_level: default_alert_level(),
            hotline: default_hotline(),
            webhook_url: None,
            sms_gateway_url: None,
            smtp_relay: None,
            email_from: None,
            email_to: None,
            lexicon_path: None,
        }
    }
}

impl HavenConfig {
    /// Load config from file and environment. Precedence: env `HAVEN_CONFIG`
    /// path > `config/gateway.toml` > defaults, then `HAVEN__*` overrides.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("HAVEN_CONFIG").unwrap_or_else(|_| "config/gateway".to_string());
        let builder = config::Config::builder()
            .set_default("app_name", "Haven Gateway")?
            .set_default("port", 8002_i64)?
            .set_default("storage_path", "./data")?
            .set_default("redact_messages", false)?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("HAVEN").separator("__"))
            .build()?;

        built.try_deserialize()
    }

    pub fn escalation_window(&self) -> Duration {
        Duration::from_secs(self.escalation_window_secs.max(1))
    }

    /// Risk level at and above which an alert is opened.
    pub fn alert_threshold(&self) -> RiskLevel {
        RiskLevel::parse_or_high(&self.alert_level)
    }

    /// Webhook target with the environment override applied.
    pub fn effective_webhook_url(&self) -> Option<String> {
        std::env::var("HAVEN_WEBHOOK_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.webhook_url.clone())
            .filter(|s| !s.trim().is_empty())
    }
}
