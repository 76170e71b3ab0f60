//! Shared types used across the crisis core and the gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Placeholder stored in place of the raw user message when process-wide
/// redaction is enabled. The one-way digest remains available regardless.
pub const REDACTED_PLACEHOLDER: &str = "[REDACTED_MESSAGE]";

// -----------------------------------------------------------------------------
// Risk classification
// -----------------------------------------------------------------------------

/// Discrete risk classification derived from fused signals.
/// Variant order is the severity order; comparisons rely on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    /// Maps a clamped [0,100] score to a level. Combination overrides and
    /// category floors are applied on top of this by the scorer.
    pub fn from_score(score: f32) -> Self {
        if score >= 70.0 {
            Self::Critical
        } else if score >= 50.0 {
            Self::High
        } else if score >= 25.0 {
            Self::Moderate
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parses a config-supplied level name. Unknown values fall back to High
    /// so a typo in configuration can only make alerting more sensitive.
    pub fn parse_or_high(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "moderate" => Self::Moderate,
            "critical" => Self::Critical,
            _ => Self::High,
        }
    }
}

/// Crisis taxonomy for an alert. Determines the active-alert key together
/// with user and session ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskType {
    Suicidal,
    SelfHarm,
    Violence,
    Psychosis,
}

impl RiskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suicidal => "suicidal",
            Self::SelfHarm => "self_harm",
            Self::Violence => "violence",
            Self::Psychosis => "psychosis",
        }
    }
}

/// One risk category a message can hit. Weights and term lists live in the
/// rule table, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCategory {
    DirectIntent,
    Plan,
    Means,
    Timeframe,
    Farewell,
    SelfInjury,
    Ideation,
    Slang,
    Violence,
    Psychosis,
}

impl SignalCategory {
    /// The crisis taxonomy this category maps to when it dominates a message.
    pub fn risk_type(&self) -> RiskType {
        match self {
            Self::SelfInjury => RiskType::SelfHarm,
            Self::Violence => RiskType::Violence,
            Self::Psychosis => RiskType::Psychosis,
            _ => RiskType::Suicidal,
        }
    }
}

// -----------------------------------------------------------------------------
// Moderation output
// -----------------------------------------------------------------------------

/// A typed, confidence-scored hit for one risk category within a message.
/// Produced fresh per message; never persisted beyond the alert referencing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationSignal {
    /// Rule-table version that produced this hit (e.g. "vi-crisis-2025.08").
    pub source: String,
    pub category: SignalCategory,
    /// Effective confidence in [0,1], after any negation discount.
    pub confidence: f32,
    pub matched_terms: Vec<String>,
    /// A negation marker governed this match. The signal is kept, discounted,
    /// so a clinician-reviewable trace remains.
    #[serde(default)]
    pub negated: bool,
}

/// Result of scoring one inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationResult {
    pub risk_level: RiskLevel,
    /// Fused score in [0,100].
    pub risk_score: f32,
    /// Dominant crisis taxonomy, when any credible signal was present.
    pub risk_type: Option<RiskType>,
    pub signals: Vec<ModerationSignal>,
    pub normalized_text: String,
    /// Lowercase-hex SHA-256 of the raw message. Stable and one-way, so
    /// downstream logging and alerting never need to retain raw text.
    pub message_digest: String,
}

impl ModerationResult {
    /// Result for an empty or fully stripped message.
    pub fn empty(message_digest: String) -> Self {
        Self {
            risk_level: RiskLevel::Low,
            risk_score: 0.0,
            risk_type: None,
            signals: Vec::new(),
            normalized_text: String::new(),
            message_digest,
        }
    }

    /// Compact snapshot embedded in an alert for audit.
    pub fn summary(&self) -> ModerationSummary {
        ModerationSummary {
            source: self
                .signals
                .first()
                .map(|s| s.source.clone())
                .unwrap_or_default(),
            risk_score: self.risk_score,
            risk_level: self.risk_level,
            signal_count: self.signals.len(),
            message_digest: self.message_digest.clone(),
        }
    }
}

/// Compressed moderation snapshot retained on the alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationSummary {
    /// Rule-table version behind the triggering result.
    #[serde(default)]
    pub source: String,
    pub risk_score: f32,
    pub risk_level: RiskLevel,
    pub signal_count: usize,
    pub message_digest: String,
}

// -----------------------------------------------------------------------------
// Alerts
// -----------------------------------------------------------------------------

/// Lifecycle status of a critical alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }
}

/// Audit record of one notification channel attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub channel: String,
    pub delivered: bool,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// The central crisis entity. Created when a qualifying moderation result
/// arrives; mutated only by acknowledge, resolve, and the escalation timer;
/// retained forever (resolution only removes it from the active index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalAlert {
    /// Unique, generated at creation, never reused.
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub risk_level: RiskLevel,
    pub risk_type: RiskType,
    /// Raw text or [`REDACTED_PLACEHOLDER`], per the process-wide policy.
    pub user_message: String,
    pub detected_keywords: Vec<String>,
    pub status: AlertStatus,
    /// Escalation rounds fired so far while unacknowledged.
    #[serde(default)]
    pub escalation_round: u32,
    /// Per-channel fan-out outcomes, appended as deliveries complete.
    #[serde(default)]
    pub notifications: Vec<ChannelOutcome>,
    pub moderation: ModerationSummary,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl CriticalAlert {
    /// An alert is active until it is resolved.
    pub fn is_active(&self) -> bool {
        self.status != AlertStatus::Resolved
    }
}

/// Counts exposed by the stats endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertStats {
    pub total: usize,
    pub pending: usize,
    pub acknowledged: usize,
    pub resolved: usize,
    pub by_risk_type: BTreeMap<String, usize>,
}

// -----------------------------------------------------------------------------
// Clinicians
// -----------------------------------------------------------------------------

/// Availability of a clinician console session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClinicianAvailability {
    Available,
    Busy,
    Offline,
}

impl ClinicianAvailability {
    /// Parses a wire value; anything unrecognized reads as offline.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "available" => Self::Available,
            "busy" => Self::Busy,
            _ => Self::Offline,
        }
    }
}

/// A clinician known to the realtime bridge. Bound to at most one alert at a
/// time; no multiplexed interventions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClinicianSession {
    pub clinician_id: String,
    pub name: String,
    pub availability: ClinicianAvailability,
    #[serde(default)]
    pub active_alert_id: Option<String>,
}
