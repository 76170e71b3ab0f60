//! Clinician outcome notes, persisted for offline quality review.
//!
//! Secondary path: nothing here sits on the crisis hot path, and a write
//! failure is reported to the caller instead of being retried.

use crate::alerts::store::{AlertStore, FEEDBACK_TREE};
use crate::error::{HavenError, HavenResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// One outcome note for a handled alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub alert_id: String,
    pub clinician_id: String,
    /// Short outcome tag, e.g. "stabilized", "referred", "false_positive".
    pub outcome: String,
    #[serde(default)]
    pub notes: String,
    pub recorded_at: DateTime<Utc>,
}

/// Writes outcome notes through the alert store.
pub struct FeedbackSink {
    store: Arc<AlertStore>,
}

impl FeedbackSink {
    pub fn new(store: Arc<AlertStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// Records one note, keyed by alert and timestamp so repeated feedback
    /// for the same alert never overwrites earlier notes.
    pub fn record(
        &self,
        alert_id: &str,
        clinician_id: &str,
        outcome: &str,
        notes: &str,
    ) -> HavenResult<FeedbackRecord> {
        if alert_id.trim().is_empty() || clinician_id.trim().is_empty() {
            return Err(HavenError::Validation(
                "alert_id and clinician_id are required".into(),
            ));
        }
        if outcome.trim().is_empty() {
            return Err(HavenError::Validation("outcome is required".into()));
        }
        let record = FeedbackRecord {
            alert_id: alert_id.to_string(),
            clinician_id: clinician_id.to_string(),
            outcome: outcome.trim().to_string(),
            notes: notes.to_string(),
            recorded_at: Utc::now(),
        };
        let key = format!(
            "{}/{}",
            record.alert_id,
            record.recorded_at.timestamp_millis()
        );
        self.store.put_json(FEEDBACK_TREE, &key, &record)?;
        info!(
            target: "haven::feedback",
            alert_id,
            clinician_id,
            outcome = %record.outcome,
            "outcome feedback recorded"
        );
        Ok(record)
    }

    /// Number of notes retained (disk or fallback).
    pub fn count(&self) -> usize {
        self.store.count(FEEDBACK_TREE)
    }
}
