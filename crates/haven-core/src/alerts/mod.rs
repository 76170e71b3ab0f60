//! Critical-alert lifecycle: the sole source of truth for "is a human
//! currently responsible for this user".
//!
//! State machine per alert: `pending -> acknowledged -> resolved`, with
//! `pending -> resolved` allowed, plus an internal escalation sub-transition
//! that re-triggers notification without changing the visible status.
//!
//! Concurrency discipline: every alert lives behind its own `Mutex`, so
//! transitions on one alert are serialized while unrelated alerts proceed in
//! parallel. No lock is held across an await: handlers collect what must be
//! done under the lock, drop it, then perform I/O. Escalation timers are
//! cancellable handles owned by the alert entry; a fire that races a cancel
//! checks status and generation and backs off.

pub mod store;

use crate::bridge::RealtimeBridge;
use crate::error::{HavenError, HavenResult};
use crate::notify::NotificationDispatcher;
use crate::shared::{
    AlertStats, AlertStatus, ChannelOutcome, CriticalAlert, ModerationResult, ModerationSummary,
    RiskLevel, RiskType, REDACTED_PLACEHOLDER,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use store::AlertStore;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

// -----------------------------------------------------------------------------
// Events (the realtime hitl_alert feed)
// -----------------------------------------------------------------------------

/// Events broadcast to every connected clinician console. Creation and
/// escalation events originate from the on-call roster notification channel;
/// the rest are emitted directly by the lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AlertEvent {
    Created {
        alert: CriticalAlert,
    },
    Escalated {
        alert_id: String,
        round: u32,
        risk_level: RiskLevel,
        risk_type: RiskType,
    },
    ManualReview {
        alert_id: String,
        rounds: u32,
    },
    Acknowledged {
        alert_id: String,
        clinician_id: String,
    },
    Resolved {
        alert_id: String,
    },
}

// -----------------------------------------------------------------------------
// Inputs and internals
// -----------------------------------------------------------------------------

/// What the moderation pipeline hands over when an alert is warranted.
#[derive(Debug, Clone)]
pub struct AlertDetails {
    pub risk_type: RiskType,
    pub risk_level: RiskLevel,
    pub user_message: String,
    pub detected_keywords: Vec<String>,
    pub moderation: ModerationSummary,
}

impl AlertDetails {
    /// Builds details from a scored message. Callers only reach this when the
    /// level met the alert threshold, so a missing taxonomy defaults to the
    /// most conservative routing.
    pub fn from_result(result: &ModerationResult, raw_message: &str) -> Self {
        let mut keywords: Vec<String> = Vec::new();
        for s in &result.signals {
            for t in &s.matched_terms {
                if !keywords.contains(t) {
                    keywords.push(t.clone());
                }
            }
        }
        Self {
            risk_type: result.risk_type.unwrap_or(RiskType::Suicidal),
            risk_level: result.risk_level,
            user_message: raw_message.to_string(),
            detected_keywords: keywords,
            moderation: result.summary(),
        }
    }
}

/// Active-alert key: one non-resolved alert per user, session, and taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ActiveKey {
    user_id: String,
    session_id: String,
    risk_type: RiskType,
}

/// Cancellable escalation handle. Owned by the alert entry; aborted exactly
/// once on any terminal transition. The generation counter lets a fire that
/// already left the timer queue detect that it was superseded.
struct EscalationTimer {
    handle: JoinHandle<()>,
    generation: u64,
}

impl EscalationTimer {
    fn cancel(self) {
        self.handle.abort();
    }
}

struct AlertEntry {
    alert: CriticalAlert,
    timer: Option<EscalationTimer>,
    timer_generation: u64,
}

/// Tuning for the lifecycle manager.
#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub escalation_window: Duration,
    pub max_escalation_rounds: u32,
    pub redact_messages: bool,
}

impl AlertSettings {
    pub fn from_config(cfg: &crate::config::HavenConfig) -> Self {
        Self {
            escalation_window: cfg.escalation_window(),
            max_escalation_rounds: cfg.max_escalation_rounds,
            redact_messages: cfg.redact_messages,
        }
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            escalation_window: Duration::from_secs(300),
            max_escalation_rounds: 3,
            redact_messages: false,
        }
    }
}

// -----------------------------------------------------------------------------
// Manager
// -----------------------------------------------------------------------------

/// Owns every alert and its timer. Alerts are never destroyed; resolution
/// removes them from the active index only.
pub struct AlertManager {
    alerts: DashMap<String, Arc<Mutex<AlertEntry>>>,
    active: DashMap<ActiveKey, String>,
    review: DashMap<String, DateTime<Utc>>,
    store: Arc<AlertStore>,
    dispatcher: Arc<NotificationDispatcher>,
    bridge: Arc<RealtimeBridge>,
    events: broadcast::Sender<AlertEvent>,
    settings: AlertSettings,
}

impl AlertManager {
    pub fn new(
        settings: AlertSettings,
        store: Arc<AlertStore>,
        dispatcher: Arc<NotificationDispatcher>,
        bridge: Arc<RealtimeBridge>,
        events: broadcast::Sender<AlertEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            alerts: DashMap::new(),
            active: DashMap::new(),
            review: DashMap::new(),
            store,
            dispatcher,
            bridge,
            events,
            settings,
        })
    }

    /// Subscribe to the hitl_alert feed.
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.events.subscribe()
    }

    /// Opens an alert, or returns the existing active one for the same
    /// `(user, session, taxonomy)` key. Notification fan-out is spawned, not
    /// awaited: creation never blocks on delivery. A persistence fault is
    /// logged at paging level and never fails the call.
    pub async fn create_critical_alert(
        self: &Arc<Self>,
        user_id: &str,
        session_id: &str,
        details: AlertDetails,
    ) -> HavenResult<CriticalAlert> {
        if user_id.trim().is_empty() || session_id.trim().is_empty() {
            return Err(HavenError::Validation(
                "user_id and session_id are required".into(),
            ));
        }
        let key = ActiveKey {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            risk_type: details.risk_type,
        };

        // Reuse the active alert for this key when there is one. The index
        // ref is cloned out immediately so no shard lock survives this line.
        let existing_id = self.active.get(&key).map(|r| r.value().clone());
        if let Some(existing_id) = existing_id {
            let existing_entry = self.alerts.get(&existing_id).map(|r| Arc::clone(r.value()));
            if let Some(entry) = existing_entry {
                let mut guard = entry.lock().await;
                if guard.alert.is_active() {
                    for kw in &details.detected_keywords {
                        if !guard.alert.detected_keywords.contains(kw) {
                            guard.alert.detected_keywords.push(kw.clone());
                        }
                    }
                    // Supersede in place: the worse assessment wins.
                    if details.risk_level > guard.alert.risk_level {
                        guard.alert.risk_level = details.risk_level;
                    }
                    guard.alert.moderation = details.moderation.clone();
                    let snapshot = guard.alert.clone();
                    drop(guard);
                    self.persist(&snapshot);
                    info!(
                        target: "haven::alerts",
                        alert_id = %snapshot.id,
                        "repeat crisis message folded into active alert"
                    );
                    return Ok(snapshot);
                }
            }
            // Stale index entry for a resolved alert; fall through and create.
            self.active.remove(&key);
        }

        let user_message = if self.settings.redact_messages {
            REDACTED_PLACEHOLDER.to_string()
        } else {
            details.user_message.clone()
        };
        let alert = CriticalAlert {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            risk_level: details.risk_level,
            risk_type: details.risk_type,
            user_message,
            detected_keywords: details.detected_keywords,
            status: AlertStatus::Pending,
            escalation_round: 0,
            notifications: Vec::new(),
            moderation: details.moderation,
            acknowledged_by: None,
            acknowledged_at: None,
            notes: None,
            resolution: None,
            resolved_at: None,
        };

        let entry = Arc::new(Mutex::new(AlertEntry {
            alert: alert.clone(),
            timer: None,
            timer_generation: 0,
        }));
        self.alerts.insert(alert.id.clone(), Arc::clone(&entry));
        self.active.insert(key, alert.id.clone());
        self.persist(&alert);
        info!(
            target: "haven::alerts",
            alert_id = %alert.id,
            risk_type = alert.risk_type.as_str(),
            risk_level = alert.risk_level.as_str(),
            "critical alert opened"
        );

        {
            let mut guard = entry.lock().await;
            self.arm_escalation(alert.id.clone(), &mut guard);
        }

        let mgr = Arc::clone(self);
        let dispatch_alert = alert.clone();
        tokio::spawn(async move {
            let outcomes = mgr.dispatcher.dispatch(&dispatch_alert, false).await;
            mgr.append_outcomes(&dispatch_alert.id, outcomes).await;
        });

        Ok(alert)
    }

    /// A clinician takes responsibility. Cancels the escalation timer and
    /// binds the clinician through the realtime bridge. Re-acknowledgment by
    /// the same clinician is a no-op success.
    pub async fn acknowledge_alert(
        &self,
        alert_id: &str,
        clinician_id: &str,
        notes: Option<String>,
    ) -> HavenResult<CriticalAlert> {
        if clinician_id.trim().is_empty() {
            return Err(HavenError::Validation("clinician_id is required".into()));
        }
        let entry = self.entry(alert_id)?;
        let mut guard = entry.lock().await;
        match guard.alert.status {
            AlertStatus::Resolved => {
                return Err(HavenError::InvalidState(format!(
                    "alert {} is already resolved",
                    alert_id
                )));
            }
            AlertStatus::Acknowledged => {
                return if guard.alert.acknowledged_by.as_deref() == Some(clinician_id) {
                    Ok(guard.alert.clone())
                } else {
                    Err(HavenError::InvalidState(format!(
                        "alert {} is already acknowledged by {}",
                        alert_id,
                        guard.alert.acknowledged_by.as_deref().unwrap_or("unknown")
                    )))
                };
            }
            AlertStatus::Pending => {}
        }

        // Bind first so a busy clinician cannot half-acknowledge.
        self.bridge.join_intervention(clinician_id, alert_id)?;

        Self::cancel_timer(&mut guard);
        guard.alert.status = AlertStatus::Acknowledged;
        guard.alert.acknowledged_by = Some(clinician_id.to_string());
        guard.alert.acknowledged_at = Some(Utc::now());
        if let Some(n) = notes {
            guard.alert.notes = Some(n);
        }
        let snapshot = guard.alert.clone();
        drop(guard);

        self.persist(&snapshot);
        let _ = self.events.send(AlertEvent::Acknowledged {
            alert_id: snapshot.id.clone(),
            clinician_id: clinician_id.to_string(),
        });
        info!(
            target: "haven::alerts",
            alert_id = %snapshot.id,
            clinician_id,
            "alert acknowledged, escalation cancelled"
        );
        Ok(snapshot)
    }

    /// Closes the case, from pending or acknowledged. Releases the clinician
    /// binding, persists the intervention transcript, and drops the alert
    /// from the active index while retaining it for audit.
    pub async fn resolve_alert(
        &self,
        alert_id: &str,
        resolution: &str,
    ) -> HavenResult<CriticalAlert> {
        if resolution.trim().is_empty() {
            return Err(HavenError::Validation("resolution is required".into()));
        }
        let entry = self.entry(alert_id)?;
        let mut guard = entry.lock().await;
        if guard.alert.status == AlertStatus::Resolved {
            return Err(HavenError::InvalidState(format!(
                "alert {} is already resolved",
                alert_id
            )));
        }

        Self::cancel_timer(&mut guard);
        guard.alert.status = AlertStatus::Resolved;
        guard.alert.resolution = Some(resolution.to_string());
        guard.alert.resolved_at = Some(Utc::now());
        let snapshot = guard.alert.clone();
        drop(guard);

        self.active.remove(&ActiveKey {
            user_id: snapshot.user_id.clone(),
            session_id: snapshot.session_id.clone(),
            risk_type: snapshot.risk_type,
        });
        self.review.remove(alert_id);

        if let Some((clinician_id, transcript)) = self.bridge.release(alert_id) {
            info!(
                target: "haven::alerts",
                alert_id,
                clinician_id = %clinician_id,
                "clinician released from intervention"
            );
            if !transcript.is_empty() {
                if let Err(e) =
                    self.store
                        .put_json(store::TRANSCRIPTS_TREE, alert_id, &transcript)
                {
                    warn!(target: "haven::alerts", alert_id, "transcript not persisted: {}", e);
                }
            }
        }

        self.persist(&snapshot);
        let _ = self.events.send(AlertEvent::Resolved {
            alert_id: snapshot.id.clone(),
        });
        info!(target: "haven::alerts", alert_id, "alert resolved");
        Ok(snapshot)
    }

    /// Resolve plus the user-facing goodbye: tells the user session that
    /// human assistance has ended before tearing the relay down.
    pub async fn close_intervention(
        &self,
        alert_id: &str,
        notes: &str,
    ) -> HavenResult<CriticalAlert> {
        self.bridge.announce_close(alert_id);
        self.resolve_alert(alert_id, notes).await
    }

    /// Escalation timer body. Re-checks status and generation under the entry
    /// lock so a fire that raced a cancel or terminal transition is a no-op.
    async fn escalation_fired(self: Arc<Self>, alert_id: String, generation: u64) {
        let Some(entry) = self.alerts.get(&alert_id).map(|r| Arc::clone(r.value())) else {
            return;
        };

        let dispatch_snapshot = {
            let mut guard = entry.lock().await;
            if guard.timer_generation != generation || guard.alert.status != AlertStatus::Pending {
                return;
            }
            guard.timer = None;
            guard.alert.escalation_round += 1;
            if guard.alert.escalation_round > self.settings.max_escalation_rounds {
                let snapshot = guard.alert.clone();
                drop(guard);
                error!(
                    target: "haven::alerts",
                    alert_id = %snapshot.id,
                    rounds = snapshot.escalation_round - 1,
                    "NO RESPONDER: escalation rounds exhausted, alert parked for manual review"
                );
                self.review.insert(snapshot.id.clone(), Utc::now());
                if let Err(e) = self.store.push_review(&snapshot) {
                    warn!(target: "haven::alerts", "review queue not persisted: {}", e);
                }
                self.persist(&snapshot);
                let _ = self.events.send(AlertEvent::ManualReview {
                    alert_id: snapshot.id.clone(),
                    rounds: snapshot.escalation_round - 1,
                });
                None
            } else {
                self.arm_escalation(alert_id.clone(), &mut guard);
                let snapshot = guard.alert.clone();
                drop(guard);
                warn!(
                    target: "haven::alerts",
                    alert_id = %snapshot.id,
                    round = snapshot.escalation_round,
                    "alert unacknowledged, escalating"
                );
                self.persist(&snapshot);
                let _ = self.events.send(AlertEvent::Escalated {
                    alert_id: snapshot.id.clone(),
                    round: snapshot.escalation_round,
                    risk_level: snapshot.risk_level,
                    risk_type: snapshot.risk_type,
                });
                Some(snapshot)
            }
        };

        if let Some(alert) = dispatch_snapshot {
            let outcomes = self.dispatcher.dispatch(&alert, true).await;
            self.append_outcomes(&alert.id, outcomes).await;
        }
    }

    /// Arms (or re-arms) the escalation timer. Caller holds the entry lock.
    fn arm_escalation(self: &Arc<Self>, alert_id: String, entry: &mut AlertEntry) {
        entry.timer_generation += 1;
        let generation = entry.timer_generation;
        let window = self.settings.escalation_window;
        let mgr = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            mgr.escalation_fired(alert_id, generation).await;
        });
        entry.timer = Some(EscalationTimer { handle, generation });
    }

    /// Cancels a live timer exactly once and invalidates in-flight fires.
    fn cancel_timer(entry: &mut AlertEntry) {
        entry.timer_generation += 1;
        if let Some(timer) = entry.timer.take() {
            timer.cancel();
        }
    }

    /// Appends notification outcomes to the alert's audit trail.
    async fn append_outcomes(&self, alert_id: &str, outcomes: Vec<ChannelOutcome>) {
        if outcomes.is_empty() {
            return;
        }
        let Some(entry) = self.alerts.get(alert_id).map(|r| Arc::clone(r.value())) else {
            return;
        };
        let snapshot = {
            let mut guard = entry.lock().await;
            guard.alert.notifications.extend(outcomes);
            guard.alert.clone()
        };
        self.persist(&snapshot);
    }

    fn entry(&self, alert_id: &str) -> HavenResult<Arc<Mutex<AlertEntry>>> {
        self.alerts
            .get(alert_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| HavenError::NotFound(format!("alert {}", alert_id)))
    }

    /// Best-effort durable write. Loses the write, not the alert: the
    /// in-memory record stays authoritative and the failure is paged.
    fn persist(&self, alert: &CriticalAlert) {
        if let Err(e) = self.store.record_alert(alert) {
            error!(
                target: "haven::alerts",
                alert_id = %alert.id,
                "CRITICAL ALERT NOT PERSISTED: {} (continuing in-memory)",
                e
            );
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn get_alert(&self, alert_id: &str) -> Option<CriticalAlert> {
        let entry = self.alerts.get(alert_id).map(|r| Arc::clone(r.value()))?;
        let guard = entry.lock().await;
        Some(guard.alert.clone())
    }

    /// Every alert whose status is not resolved.
    pub async fn active_alerts(&self) -> Vec<CriticalAlert> {
        let ids: Vec<String> = self.active.iter().map(|r| r.value().clone()).collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(alert) = self.get_alert(&id).await {
                if alert.is_active() {
                    out.push(alert);
                }
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Counts by status and crisis taxonomy, over the full retained history.
    pub async fn stats(&self) -> AlertStats {
        let entries: Vec<Arc<Mutex<AlertEntry>>> =
            self.alerts.iter().map(|r| Arc::clone(r.value())).collect();
        let mut stats = AlertStats::default();
        for entry in entries {
            let guard = entry.lock().await;
            stats.total += 1;
            match guard.alert.status {
                AlertStatus::Pending => stats.pending += 1,
                AlertStatus::Acknowledged => stats.acknowledged += 1,
                AlertStatus::Resolved => stats.resolved += 1,
            }
            *stats
                .by_risk_type
                .entry(guard.alert.risk_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    /// Alerts parked after exhausting their escalation rounds.
    pub async fn review_queue(&self) -> Vec<CriticalAlert> {
        let ids: Vec<String> = self.review.iter().map(|r| r.key().clone()).collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(alert) = self.get_alert(&id).await {
                out.push(alert);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }
}
