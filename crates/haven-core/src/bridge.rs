//! Realtime bridge: pairs a clinician console with a user's live chat session
//! and relays messages both ways for the life of the intervention.
//!
//! Each direction is its own broadcast channel, so ordering within one sender
//! is preserved end to end. Every relayed message is also appended to a
//! per-intervention transcript; subscribers get the transcript replayed
//! before live delivery, which is what makes delivery at-least-once for
//! consoles that attach late or reconnect.
//!
//! Binding discipline: the binding table is keyed by alert id and mutated
//! through the entry API, the clinician table through per-key `get_mut`, so
//! two rival joins serialize on the keys they actually touch.

use crate::error::{HavenError, HavenResult};
use crate::shared::{ClinicianAvailability, ClinicianSession};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Buffered messages per relay direction before a slow console starts lagging.
const RELAY_CAPACITY: usize = 256;

/// Origin of a relayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelaySender {
    User,
    Clinician,
    System,
}

/// One message crossing the bridge, timestamped at relay time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub alert_id: String,
    pub sender: RelaySender,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// The two directed channels plus the shared transcript for one intervention.
struct InterventionRelay {
    to_user: broadcast::Sender<RelayMessage>,
    to_clinician: broadcast::Sender<RelayMessage>,
    transcript: Mutex<Vec<RelayMessage>>,
}

impl InterventionRelay {
    fn new() -> Self {
        let (to_user, _) = broadcast::channel(RELAY_CAPACITY);
        let (to_clinician, _) = broadcast::channel(RELAY_CAPACITY);
        Self {
            to_user,
            to_clinician,
            transcript: Mutex::new(Vec::new()),
        }
    }
}

/// Which side of the relay a subscriber sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySide {
    User,
    Clinician,
}

/// Clinician registry, alert bindings, and live relays.
pub struct RealtimeBridge {
    clinicians: DashMap<String, ClinicianSession>,
    /// alert_id -> clinician_id
    bindings: DashMap<String, String>,
    relays: DashMap<String, Arc<InterventionRelay>>,
}

impl Default for RealtimeBridge {
    fn default() -> Self {
        Self {
            clinicians: DashMap::new(),
            bindings: DashMap::new(),
            relays: DashMap::new(),
        }
    }
}

impl RealtimeBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // -------------------------------------------------------------------------
    // Clinician registry
    // -------------------------------------------------------------------------

    /// Registers (or re-registers) a clinician console as available.
    pub fn register_clinician(&self, clinician_id: &str, name: &str) -> HavenResult<ClinicianSession> {
        if clinician_id.trim().is_empty() {
            return Err(HavenError::Validation("clinician_id is required".into()));
        }
        // Re-registration keeps a live binding intact (console reconnect).
        let existing_binding = self
            .clinicians
            .get(clinician_id)
            .and_then(|s| s.active_alert_id.clone());
        let session = ClinicianSession {
            clinician_id: clinician_id.to_string(),
            name: name.to_string(),
            availability: if existing_binding.is_some() {
                ClinicianAvailability::Busy
            } else {
                ClinicianAvailability::Available
            },
            active_alert_id: existing_binding,
        };
        self.clinicians
            .insert(clinician_id.to_string(), session.clone());
        info!(target: "haven::bridge", clinician_id, "clinician registered");
        Ok(session)
    }

    /// Updates availability. Going offline while bound releases the binding
    /// and leaves the alert acknowledged; the on-call process takes it from
    /// there.
    pub fn set_availability(
        &self,
        clinician_id: &str,
        availability: ClinicianAvailability,
    ) -> HavenResult<ClinicianSession> {
        let mut session = self
            .clinicians
            .get_mut(clinician_id)
            .ok_or_else(|| HavenError::NotFound(format!("clinician {}", clinician_id)))?;
        if availability == ClinicianAvailability::Offline {
            if let Some(alert_id) = session.active_alert_id.take() {
                drop(session);
                warn!(
                    target: "haven::bridge",
                    clinician_id,
                    alert_id = %alert_id,
                    "clinician went offline mid-intervention, binding released"
                );
                self.bindings.remove(&alert_id);
                self.send_system(&alert_id, RelaySide::User,
                    "Chuyên viên tạm thời mất kết nối. Bạn vẫn đang được theo dõi và hỗ trợ.");
                let mut session = self
                    .clinicians
                    .get_mut(clinician_id)
                    .ok_or_else(|| HavenError::NotFound(format!("clinician {}", clinician_id)))?;
                session.availability = ClinicianAvailability::Offline;
                return Ok(session.clone());
            }
        }
        session.availability = availability;
        Ok(session.clone())
    }

    pub fn clinician(&self, clinician_id: &str) -> Option<ClinicianSession> {
        self.clinicians.get(clinician_id).map(|s| s.clone())
    }

    pub fn clinicians(&self) -> Vec<ClinicianSession> {
        self.clinicians.iter().map(|s| s.clone()).collect()
    }

    // -------------------------------------------------------------------------
    // Binding
    // -------------------------------------------------------------------------

    /// Pairs a clinician with an alert. Idempotent for the same pair;
    /// `Conflict` when the alert already belongs to someone else or the
    /// clinician is busy on another alert.
    pub fn join_intervention(&self, clinician_id: &str, alert_id: &str) -> HavenResult<()> {
        if clinician_id.trim().is_empty() {
            return Err(HavenError::Validation("clinician_id is required".into()));
        }

        // Reserve the clinician first, atomically per clinician.
        {
            let mut session = self
                .clinicians
                .get_mut(clinician_id)
                .ok_or_else(|| HavenError::NotFound(format!("clinician {}", clinician_id)))?;
            match session.active_alert_id.as_deref() {
                Some(bound) if bound == alert_id => return Ok(()),
                Some(bound) => {
                    return Err(HavenError::Conflict(format!(
                        "clinician {} is already handling alert {}",
                        clinician_id, bound
                    )));
                }
                None => {
                    session.availability = ClinicianAvailability::Busy;
                    session.active_alert_id = Some(alert_id.to_string());
                }
            }
        }

        // Then claim the alert; roll the reservation back on conflict.
        match self.bindings.entry(alert_id.to_string()) {
            Entry::Occupied(o) if o.get() == clinician_id => {}
            Entry::Occupied(o) => {
                let other = o.get().clone();
                if let Some(mut session) = self.clinicians.get_mut(clinician_id) {
                    session.availability = ClinicianAvailability::Available;
                    session.active_alert_id = None;
                }
                return Err(HavenError::Conflict(format!(
                    "alert {} is already handled by {}",
                    alert_id, other
                )));
            }
            Entry::Vacant(v) => {
                v.insert(clinician_id.to_string());
            }
        }

        self.relays
            .entry(alert_id.to_string())
            .or_insert_with(|| Arc::new(InterventionRelay::new()));
        self.send_system(
            alert_id,
            RelaySide::User,
            "Một chuyên viên hỗ trợ đã tham gia cuộc trò chuyện với bạn.",
        );
        info!(target: "haven::bridge", clinician_id, alert_id, "intervention joined");
        Ok(())
    }

    /// Clinician currently bound to an alert, if any.
    pub fn bound_clinician(&self, alert_id: &str) -> Option<String> {
        self.bindings.get(alert_id).map(|r| r.value().clone())
    }

    /// Tears the binding down and returns the clinician plus the transcript.
    /// The relay is dropped; subscribers see their streams end.
    pub fn release(&self, alert_id: &str) -> Option<(String, Vec<RelayMessage>)> {
        let clinician_id = self.bindings.remove(alert_id).map(|(_, v)| v);
        let transcript = self
            .relays
            .remove(alert_id)
            .map(|(_, relay)| {
                relay
                    .transcript
                    .lock()
                    .map(|t| t.clone())
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        let clinician_id = clinician_id?;
        if let Some(mut session) = self.clinicians.get_mut(&clinician_id) {
            session.availability = ClinicianAvailability::Available;
            session.active_alert_id = None;
        }
        Some((clinician_id, transcript))
    }

    /// Tells the user side that human assistance has ended. Called before the
    /// relay is torn down on close.
    pub fn announce_close(&self, alert_id: &str) {
        self.send_system(
            alert_id,
            RelaySide::User,
            "Phiên hỗ trợ trực tiếp đã kết thúc. Bạn luôn có thể quay lại khi cần.",
        );
    }

    // -------------------------------------------------------------------------
    // Relay
    // -------------------------------------------------------------------------

    /// Message typed by the bound clinician, delivered to the user session.
    pub fn relay_from_clinician(&self, alert_id: &str, text: &str) -> HavenResult<RelayMessage> {
        self.relay(alert_id, RelaySender::Clinician, RelaySide::User, text)
    }

    /// Message typed by the user, delivered to the clinician console.
    pub fn relay_from_user(&self, alert_id: &str, text: &str) -> HavenResult<RelayMessage> {
        self.relay(alert_id, RelaySender::User, RelaySide::Clinician, text)
    }

    fn relay(
        &self,
        alert_id: &str,
        sender: RelaySender,
        side: RelaySide,
        text: &str,
    ) -> HavenResult<RelayMessage> {
        if text.trim().is_empty() {
            return Err(HavenError::Validation("message text is required".into()));
        }
        let relay = self
            .relays
            .get(alert_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| HavenError::NotFound(format!("no live intervention for alert {}", alert_id)))?;
        let message = RelayMessage {
            alert_id: alert_id.to_string(),
            sender,
            text: text.to_string(),
            sent_at: Utc::now(),
        };
        if let Ok(mut transcript) = relay.transcript.lock() {
            transcript.push(message.clone());
        }
        let tx = match side {
            RelaySide::User => &relay.to_user,
            RelaySide::Clinician => &relay.to_clinician,
        };
        // No live subscriber is fine: the transcript replays on attach.
        let _ = tx.send(message.clone());
        Ok(message)
    }

    fn send_system(&self, alert_id: &str, side: RelaySide, text: &str) {
        let Some(relay) = self.relays.get(alert_id).map(|r| Arc::clone(r.value())) else {
            return;
        };
        let message = RelayMessage {
            alert_id: alert_id.to_string(),
            sender: RelaySender::System,
            text: text.to_string(),
            sent_at: Utc::now(),
        };
        if let Ok(mut transcript) = relay.transcript.lock() {
            transcript.push(message.clone());
        }
        let tx = match side {
            RelaySide::User => &relay.to_user,
            RelaySide::Clinician => &relay.to_clinician,
        };
        let _ = tx.send(message);
    }

    /// Snapshot of the transcript so far plus a live receiver for one side.
    /// Replay-then-live is the at-least-once guarantee for late attachers.
    pub fn subscribe(
        &self,
        alert_id: &str,
        side: RelaySide,
    ) -> HavenResult<(Vec<RelayMessage>, broadcast::Receiver<RelayMessage>)> {
        let relay = self
            .relays
            .get(alert_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| HavenError::NotFound(format!("no live intervention for alert {}", alert_id)))?;
        let rx = match side {
            RelaySide::User => relay.to_user.subscribe(),
            RelaySide::Clinician => relay.to_clinician.subscribe(),
        };
        let snapshot = relay
            .transcript
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default();
        Ok((snapshot, rx))
    }
}
