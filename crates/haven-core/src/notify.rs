//! Notification fan-out for new and escalated alerts.
//!
//! Every configured channel runs in its own task: one channel failing, timing
//! out, or panicking never stops the others and never fails alert creation.
//! Each attempt produces a [`ChannelOutcome`] that the lifecycle manager
//! appends to the alert for audit. Payloads carry the message digest, never
//! raw text.

use crate::alerts::AlertEvent;
use crate::config::HavenConfig;
use crate::shared::{ChannelOutcome, CriticalAlert};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// One delivery target. `deliver` returns a human-readable detail on success
/// and a reason on failure; the dispatcher records both.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, alert: &CriticalAlert, escalated: bool) -> Result<String, String>;
}

/// Fans an alert out to all channels independently.
pub struct NotificationDispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl NotificationDispatcher {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>) -> Arc<Self> {
        Arc::new(Self { channels })
    }

    /// Builds the channel set from configuration: the on-call roster push is
    /// always on; webhook, SMS, and email join when configured.
    pub fn from_config(cfg: &HavenConfig, events: broadcast::Sender<AlertEvent>) -> Arc<Self> {
        let mut channels: Vec<Arc<dyn NotificationChannel>> =
            vec![Arc::new(RosterChannel::new(events))];
        if let Some(url) = cfg.effective_webhook_url() {
            channels.push(Arc::new(WebhookChannel::new(url)));
        }
        if let Some(url) = cfg.sms_gateway_url.clone().filter(|s| !s.trim().is_empty()) {
            channels.push(Arc::new(SmsChannel::new(url)));
        }
        #[cfg(feature = "email")]
        if let (Some(relay), Some(from), Some(to)) = (
            cfg.smtp_relay.clone(),
            cfg.email_from.clone(),
            cfg.email_to.clone(),
        ) {
            channels.push(Arc::new(EmailChannel::new(relay, from, to)));
        }
        Self::new(channels)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    /// Runs every channel concurrently and collects all outcomes. Never
    /// errors; a panicking channel is recorded as a failed outcome.
    pub async fn dispatch(&self, alert: &CriticalAlert, escalated: bool) -> Vec<ChannelOutcome> {
        let mut handles = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let channel = Arc::clone(channel);
            let alert = alert.clone();
            let name = channel.name().to_string();
            handles.push((
                name,
                tokio::spawn(async move { channel.deliver(&alert, escalated).await }),
            ));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(detail)) => {
                    info!(target: "haven::notify", channel = %name, alert_id = %alert.id, escalated, "notification delivered");
                    ChannelOutcome {
                        channel: name,
                        delivered: true,
                        detail,
                        at: Utc::now(),
                    }
                }
                Ok(Err(reason)) => {
                    warn!(target: "haven::notify", channel = %name, alert_id = %alert.id, %reason, "notification channel failed");
                    ChannelOutcome {
                        channel: name,
                        delivered: false,
                        detail: reason,
                        at: Utc::now(),
                    }
                }
                Err(e) => {
                    warn!(target: "haven::notify", channel = %name, alert_id = %alert.id, "notification channel panicked: {}", e);
                    ChannelOutcome {
                        channel: name,
                        delivered: false,
                        detail: format!("channel task failed: {}", e),
                        at: Utc::now(),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

// -----------------------------------------------------------------------------
// On-call roster push
// -----------------------------------------------------------------------------

/// Pushes creation/escalation events onto the realtime feed every connected
/// clinician console subscribes to. No subscribers means nobody on call, and
/// that is an audit-worthy failure, not a silent success.
pub struct RosterChannel {
    events: broadcast::Sender<AlertEvent>,
}

impl RosterChannel {
    pub fn new(events: broadcast::Sender<AlertEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl NotificationChannel for RosterChannel {
    fn name(&self) -> &str {
        "oncall_roster"
    }

    async fn deliver(&self, alert: &CriticalAlert, escalated: bool) -> Result<String, String> {
        let event = if escalated {
            AlertEvent::Escalated {
                alert_id: alert.id.clone(),
                round: alert.escalation_round,
                risk_level: alert.risk_level,
                risk_type: alert.risk_type,
            }
        } else {
            AlertEvent::Created {
                alert: alert.clone(),
            }
        };
        match self.events.send(event) {
            Ok(n) => Ok(format!("pushed to {} on-call subscriber(s)", n)),
            Err(_) => Err("no on-call subscribers connected".to_string()),
        }
    }
}

// -----------------------------------------------------------------------------
// Webhook
// -----------------------------------------------------------------------------

#[derive(serde::Serialize)]
struct WebhookPayload<'a> {
    alert_id: &'a str,
    risk_type: &'a str,
    risk_level: &'a str,
    escalated: bool,
    escalation_round: u32,
    message_digest: &'a str,
    detected_keywords: &'a [String],
}

/// POSTs a digest-only summary to an external paging endpoint.
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { url, client }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &CriticalAlert, escalated: bool) -> Result<String, String> {
        let payload = WebhookPayload {
            alert_id: &alert.id,
            risk_type: alert.risk_type.as_str(),
            risk_level: alert.risk_level.as_str(),
            escalated,
            escalation_round: alert.escalation_round,
            message_digest: &alert.moderation.message_digest,
            detected_keywords: &alert.detected_keywords,
        };
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => Ok(format!("webhook {}", resp.status())),
            Ok(resp) => Err(format!("webhook returned {}", resp.status())),
            Err(e) => Err(format!("webhook POST failed: {}", e)),
        }
    }
}

// -----------------------------------------------------------------------------
// SMS relay
// -----------------------------------------------------------------------------

/// POSTs a short page to an SMS gateway. Registered only when configured.
pub struct SmsChannel {
    gateway_url: String,
    client: reqwest::Client,
}

impl SmsChannel {
    pub fn new(gateway_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            gateway_url,
            client,
        }
    }
}

#[async_trait]
impl NotificationChannel for SmsChannel {
    fn name(&self) -> &str {
        "sms"
    }

    async fn deliver(&self, alert: &CriticalAlert, escalated: bool) -> Result<String, String> {
        let text = format!(
            "{} {} alert {} ({})",
            if escalated { "ESCALATED" } else { "NEW" },
            alert.risk_level.as_str(),
            alert.id,
            alert.risk_type.as_str()
        );
        let body = serde_json::json!({ "text": text });
        match self
            .client
            .post(&self.gateway_url)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => Ok(format!("sms gateway {}", resp.status())),
            Ok(resp) => Err(format!("sms gateway returned {}", resp.status())),
            Err(e) => Err(format!("sms POST failed: {}", e)),
        }
    }
}

// -----------------------------------------------------------------------------
// Email (feature-gated)
// -----------------------------------------------------------------------------

/// SMTP delivery via lettre. The transport is blocking, so the send runs on
/// the blocking pool.
#[cfg(feature = "email")]
pub struct EmailChannel {
    relay: String,
    from: String,
    to: String,
}

#[cfg(feature = "email")]
impl EmailChannel {
    pub fn new(relay: String, from: String, to: String) -> Self {
        Self { relay, from, to }
    }
}

#[cfg(feature = "email")]
#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn deliver(&self, alert: &CriticalAlert, escalated: bool) -> Result<String, String> {
        use lettre::{message::Mailbox, Message, SmtpTransport, Transport};

        let from: Mailbox = self
            .from
            .parse()
            .map_err(|e| format!("invalid from address: {}", e))?;
        let to: Mailbox = self
            .to
            .parse()
            .map_err(|e| format!("invalid to address: {}", e))?;
        let subject = format!(
            "[haven] {} {} alert {}",
            if escalated { "escalated" } else { "new" },
            alert.risk_level.as_str(),
            alert.id
        );
        let body = format!(
            "Alert {}\nrisk: {} ({})\nround: {}\ndigest: {}\nkeywords: {}\n",
            alert.id,
            alert.risk_level.as_str(),
            alert.risk_type.as_str(),
            alert.escalation_round,
            alert.moderation.message_digest,
            alert.detected_keywords.join(", ")
        );
        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .body(body)
            .map_err(|e| format!("email build failed: {}", e))?;

        let relay = self.relay.clone();
        tokio::task::spawn_blocking(move || {
            let mailer = SmtpTransport::relay(&relay)
                .map_err(|e| format!("smtp relay: {}", e))?
                .build();
            mailer
                .send(&email)
                .map(|_| ())
                .map_err(|e| format!("smtp send: {}", e))
        })
        .await
        .map_err(|e| format!("smtp task failed: {}", e))??;
        Ok("smtp accepted".to_string())
    }
}
