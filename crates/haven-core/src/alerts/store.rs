//! Durable retention behind the alert lifecycle.
//!
//! Resolved alerts, intervention transcripts, clinician feedback, and the
//! manual-review queue are written to Sled trees under the storage directory.
//! When the database cannot be opened the store degrades to an in-memory map:
//! the user-facing chat path must keep working even with the disk gone, and
//! the degradation is logged loudly instead of surfacing to callers.

use crate::error::{HavenError, HavenResult};
use crate::shared::CriticalAlert;
use dashmap::DashMap;
use serde::Serialize;
use std::path::Path;
use tracing::{error, info};

pub const ALERTS_TREE: &str = "alerts";
pub const TRANSCRIPTS_TREE: &str = "transcripts";
pub const FEEDBACK_TREE: &str = "feedback";
pub const REVIEW_TREE: &str = "review_queue";

struct Trees {
    db: sled::Db,
    alerts: sled::Tree,
    transcripts: sled::Tree,
    feedback: sled::Tree,
    review: sled::Tree,
}

/// Sled-backed store with an in-memory fallback.
pub struct AlertStore {
    trees: Option<Trees>,
    /// Fallback retention, keyed `tree/key`. Populated only in degraded mode.
    fallback: DashMap<String, Vec<u8>>,
}

impl AlertStore {
    /// Opens the store under `<storage_path>/haven_store`. An open failure
    /// degrades to in-memory retention and is logged at error level.
    pub fn open(storage_path: &str) -> Self {
        let path = Path::new(storage_path).join("haven_store");
        match sled::open(&path).and_then(|db| {
            let alerts = db.open_tree(ALERTS_TREE)?;
            let transcripts = db.open_tree(TRANSCRIPTS_TREE)?;
            let feedback = db.open_tree(FEEDBACK_TREE)?;
            let review = db.open_tree(REVIEW_TREE)?;
            Ok(Trees {
                db,
                alerts,
                transcripts,
                feedback,
                review,
            })
        }) {
            Ok(trees) => {
                info!(target: "haven::store", "alert store open at {}", path.display());
                Self {
                    trees: Some(trees),
                    fallback: DashMap::new(),
                }
            }
            Err(e) => {
                error!(
                    target: "haven::store",
                    "ALERT STORE UNAVAILABLE ({}); degrading to in-memory retention, \
                     resolved alerts will not survive a restart",
                    e
                );
                Self {
                    trees: None,
                    fallback: DashMap::new(),
                }
            }
        }
    }

    /// In-memory store, used by tests and by explicit degraded startup.
    pub fn in_memory() -> Self {
        Self {
            trees: None,
            fallback: DashMap::new(),
        }
    }

    /// True when writes reach disk.
    pub fn is_durable(&self) -> bool {
        self.trees.is_some()
    }

    fn tree(&self, name: &str) -> Option<&sled::Tree> {
        let trees = self.trees.as_ref()?;
        match name {
            ALERTS_TREE => Some(&trees.alerts),
            TRANSCRIPTS_TREE => Some(&trees.transcripts),
            FEEDBACK_TREE => Some(&trees.feedback),
            REVIEW_TREE => Some(&trees.review),
            _ => None,
        }
    }

    /// Serializes and writes one record. In degraded mode the record lands in
    /// the in-memory map and the call still succeeds.
    pub fn put_json<T: Serialize>(&self, tree: &str, key: &str, value: &T) -> HavenResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| HavenError::PersistenceUnavailable(e.to_string()))?;
        match self.tree(tree) {
            Some(t) => {
                t.insert(key.as_bytes(), bytes)
                    .map_err(|e| HavenError::PersistenceUnavailable(e.to_string()))?;
                Ok(())
            }
            None => {
                self.fallback.insert(format!("{}/{}", tree, key), bytes);
                Ok(())
            }
        }
    }

    /// Reads one record back, from disk or the fallback map.
    pub fn get_raw(&self, tree: &str, key: &str) -> Option<Vec<u8>> {
        match self.tree(tree) {
            Some(t) => t.get(key.as_bytes()).ok().flatten().map(|v| v.to_vec()),
            None => self
                .fallback
                .get(&format!("{}/{}", tree, key))
                .map(|v| v.clone()),
        }
    }

    /// Number of records in a tree (disk or fallback).
    pub fn count(&self, tree: &str) -> usize {
        match self.tree(tree) {
            Some(t) => t.len(),
            None => self
                .fallback
                .iter()
                .filter(|e| e.key().starts_with(&format!("{}/", tree)))
                .count(),
        }
    }

    /// Writes the current snapshot of an alert, keyed by id.
    pub fn record_alert(&self, alert: &CriticalAlert) -> HavenResult<()> {
        self.put_json(ALERTS_TREE, &alert.id, alert)
    }

    /// Parks an alert snapshot in the manual-review queue.
    pub fn push_review(&self, alert: &CriticalAlert) -> HavenResult<()> {
        self.put_json(REVIEW_TREE, &alert.id, alert)
    }

    /// Flushes pending writes; called on graceful shutdown.
    pub fn flush(&self) {
        if let Some(trees) = &self.trees {
            if let Err(e) = trees.db.flush() {
                error!(target: "haven::store", "flush failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{
        AlertStatus, CriticalAlert, ModerationSummary, RiskLevel, RiskType,
    };
    use chrono::Utc;

    fn sample(id: &str) -> CriticalAlert {
        CriticalAlert {
            id: id.to_string(),
            user_id: "u1".into(),
            session_id: "s1".into(),
            created_at: Utc::now(),
            risk_level: RiskLevel::Critical,
            risk_type: RiskType::Suicidal,
            user_message: "x".into(),
            detected_keywords: vec![],
            status: AlertStatus::Pending,
            escalation_round: 0,
            notifications: vec![],
            moderation: ModerationSummary {
                source: "test".into(),
                risk_score: 80.0,
                risk_level: RiskLevel::Critical,
                signal_count: 1,
                message_digest: "d".into(),
            },
            acknowledged_by: None,
            acknowledged_at: None,
            notes: None,
            resolution: None,
            resolved_at: None,
        }
    }

    #[test]
    fn durable_store_round_trips_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let store = AlertStore::open(dir.path().to_str().unwrap());
        assert!(store.is_durable());
        store.record_alert(&sample("a-1")).unwrap();
        let raw = store.get_raw(ALERTS_TREE, "a-1").expect("record on disk");
        let back: CriticalAlert = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back.id, "a-1");
        assert_eq!(store.count(ALERTS_TREE), 1);
        store.flush();
    }

    #[test]
    fn degraded_store_still_accepts_writes() {
        let store = AlertStore::in_memory();
        assert!(!store.is_durable());
        store.record_alert(&sample("a-2")).unwrap();
        store.push_review(&sample("a-2")).unwrap();
        assert_eq!(store.count(ALERTS_TREE), 1);
        assert_eq!(store.count(REVIEW_TREE), 1);
        assert!(store.get_raw(ALERTS_TREE, "a-2").is_some());
    }
}
