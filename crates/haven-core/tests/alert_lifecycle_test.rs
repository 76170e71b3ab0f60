//! Integration test: alert lifecycle — verifies the state machine, the
//! active-alert invariant, the escalation timer, and the error taxonomy.
//!
//! ## Scenarios
//! 1. Creating twice for the same (user, session, taxonomy) reuses the alert.
//! 2. Acknowledgment cancels escalation: no re-notification fires afterwards.
//! 3. An unacknowledged alert escalates, then parks for manual review after
//!    its bounded rounds run out.
//! 4. Resolve works from pending and from acknowledged; terminal transitions
//!    fail with InvalidState; unknown ids fail with NotFound.
//! 5. Redaction replaces the stored message while the digest survives.
//! 6. Notification outcomes land on the alert for audit.
//!
//! Timers run under the paused tokio clock, so windows elapse deterministically.

use haven_core::{
    AlertDetails, AlertEvent, AlertManager, AlertSettings, AlertStatus, AlertStore, HavenError,
    ModerationPipeline, NotificationChannel, NotificationDispatcher, RealtimeBridge, RiskLevel,
    CriticalAlert, REDACTED_PLACEHOLDER,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Test double: counts deliveries instead of sending anything
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CountingChannel {
    created: AtomicUsize,
    escalated: AtomicUsize,
}

#[async_trait::async_trait]
impl NotificationChannel for CountingChannel {
    fn name(&self) -> &str {
        "counting"
    }

    async fn deliver(&self, _alert: &CriticalAlert, escalated: bool) -> Result<String, String> {
        if escalated {
            self.escalated.fetch_add(1, Ordering::SeqCst);
        } else {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
        Ok("counted".to_string())
    }
}

struct Harness {
    manager: Arc<AlertManager>,
    bridge: Arc<RealtimeBridge>,
    channel: Arc<CountingChannel>,
    events: broadcast::Sender<AlertEvent>,
}

fn harness(window: Duration, rounds: u32, redact: bool) -> Harness {
    let store = Arc::new(AlertStore::in_memory());
    let bridge = RealtimeBridge::new();
    let (events, _) = broadcast::channel(64);
    let channel = Arc::new(CountingChannel::default());
    let dispatcher =
        NotificationDispatcher::new(vec![Arc::clone(&channel) as Arc<dyn NotificationChannel>]);
    let manager = AlertManager::new(
        AlertSettings {
            escalation_window: window,
            max_escalation_rounds: rounds,
            redact_messages: redact,
        },
        store,
        dispatcher,
        Arc::clone(&bridge),
        events.clone(),
    );
    Harness {
        manager,
        bridge,
        channel,
        events,
    }
}

fn details(message: &str) -> AlertDetails {
    let result = ModerationPipeline::new().score(message);
    assert!(result.risk_level >= RiskLevel::High, "fixture must qualify");
    AlertDetails::from_result(&result, message)
}

// ===========================================================================
// Test 1: active-alert invariant
// ===========================================================================

#[tokio::test]
async fn repeated_create_reuses_the_active_alert() {
    let h = harness(Duration::from_secs(300), 3, false);
    let a = h
        .manager
        .create_critical_alert("u1", "s1", details("Tôi muốn chết"))
        .await
        .unwrap();
    let b = h
        .manager
        .create_critical_alert("u1", "s1", details("Tôi muốn tự tử đêm nay"))
        .await
        .unwrap();
    assert_eq!(a.id, b.id, "no duplicate active alerts per key");
    assert!(b.detected_keywords.len() >= a.detected_keywords.len());

    let stats = h.manager.stats().await;
    assert_eq!(stats.total, 1);
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn resolve_frees_the_key_for_a_new_alert() {
    let h = harness(Duration::from_secs(300), 3, false);
    let a = h
        .manager
        .create_critical_alert("u1", "s1", details("Tôi muốn chết"))
        .await
        .unwrap();
    h.manager.resolve_alert(&a.id, "handled").await.unwrap();

    let b = h
        .manager
        .create_critical_alert("u1", "s1", details("Tôi muốn chết"))
        .await
        .unwrap();
    assert_ne!(a.id, b.id);
    assert_eq!(h.manager.active_alerts().await.len(), 1);
    assert_eq!(h.manager.stats().await.total, 2);
}

// ===========================================================================
// Test 2: acknowledgment cancels escalation
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn acknowledge_before_window_stops_escalation() {
    let h = harness(Duration::from_secs(60), 3, false);
    h.bridge.register_clinician("dr-a", "Dr. An").unwrap();

    let alert = h
        .manager
        .create_critical_alert("u1", "s1", details("Tôi muốn chết"))
        .await
        .unwrap();
    let acked = h
        .manager
        .acknowledge_alert(&alert.id, "dr-a", Some("on it".into()))
        .await
        .unwrap();
    assert_eq!(acked.status, AlertStatus::Acknowledged);
    assert_eq!(acked.acknowledged_by.as_deref(), Some("dr-a"));

    // Let several windows elapse; the cancelled timer must stay silent.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.channel.escalated.load(Ordering::SeqCst), 0);
    assert_eq!(h.channel.created.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn reacknowledge_is_idempotent_for_the_same_clinician() {
    let h = harness(Duration::from_secs(60), 3, false);
    h.bridge.register_clinician("dr-a", "Dr. An").unwrap();
    let alert = h
        .manager
        .create_critical_alert("u1", "s1", details("Tôi muốn chết"))
        .await
        .unwrap();
    h.manager
        .acknowledge_alert(&alert.id, "dr-a", None)
        .await
        .unwrap();
    h.manager
        .acknowledge_alert(&alert.id, "dr-a", None)
        .await
        .unwrap();

    h.bridge.register_clinician("dr-b", "Dr. Binh").unwrap();
    let err = h
        .manager
        .acknowledge_alert(&alert.id, "dr-b", None)
        .await
        .unwrap_err();
    assert!(matches!(err, HavenError::InvalidState(_)));
}

// ===========================================================================
// Test 3: escalation and the manual-review backstop
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn unacknowledged_alert_escalates_then_parks() {
    let h = harness(Duration::from_secs(10), 2, false);
    let mut rx = h.events.subscribe();

    let alert = h
        .manager
        .create_critical_alert("u1", "s1", details("Tôi muốn chết"))
        .await
        .unwrap();

    // 2 escalation rounds, then the third expiry parks the alert.
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(h.channel.escalated.load(Ordering::SeqCst), 2);
    let parked = h.manager.review_queue().await;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].id, alert.id);
    // Parked, not resolved: a human still owes this user a response.
    assert_eq!(parked[0].status, AlertStatus::Pending);

    let mut saw_manual_review = false;
    while let Ok(ev) = rx.try_recv() {
        if matches!(ev, AlertEvent::ManualReview { .. }) {
            saw_manual_review = true;
        }
    }
    assert!(saw_manual_review);
}

// ===========================================================================
// Test 4: error taxonomy
// ===========================================================================

#[tokio::test]
async fn resolve_and_acknowledge_error_paths() {
    let h = harness(Duration::from_secs(300), 3, false);
    h.bridge.register_clinician("dr-a", "Dr. An").unwrap();

    let missing = h.manager.resolve_alert("no-such-id", "done").await;
    assert!(matches!(missing, Err(HavenError::NotFound(_))));

    let alert = h
        .manager
        .create_critical_alert("u1", "s1", details("Tôi muốn chết"))
        .await
        .unwrap();

    let empty_clinician = h.manager.acknowledge_alert(&alert.id, "  ", None).await;
    assert!(matches!(empty_clinician, Err(HavenError::Validation(_))));

    h.manager.resolve_alert(&alert.id, "handled").await.unwrap();

    let twice = h.manager.resolve_alert(&alert.id, "handled").await;
    assert!(matches!(twice, Err(HavenError::InvalidState(_))));

    let ack_resolved = h.manager.acknowledge_alert(&alert.id, "dr-a", None).await;
    assert!(matches!(ack_resolved, Err(HavenError::InvalidState(_))));
}

#[tokio::test]
async fn acknowledge_requires_a_registered_clinician() {
    let h = harness(Duration::from_secs(300), 3, false);
    let alert = h
        .manager
        .create_critical_alert("u1", "s1", details("Tôi muốn chết"))
        .await
        .unwrap();
    let err = h
        .manager
        .acknowledge_alert(&alert.id, "ghost", None)
        .await
        .unwrap_err();
    assert!(matches!(err, HavenError::NotFound(_)));
    // The failed bind must not have consumed the pending state.
    let current = h.manager.get_alert(&alert.id).await.unwrap();
    assert_eq!(current.status, AlertStatus::Pending);
}

// ===========================================================================
// Test 5: redaction
// ===========================================================================

#[tokio::test]
async fn redaction_policy_hides_text_but_keeps_the_digest() {
    let h = harness(Duration::from_secs(300), 3, true);
    let alert = h
        .manager
        .create_critical_alert("u1", "s1", details("Tôi muốn chết"))
        .await
        .unwrap();
    assert_eq!(alert.user_message, REDACTED_PLACEHOLDER);
    assert_eq!(alert.moderation.message_digest.len(), 64);
}

// ===========================================================================
// Test 6: notification audit trail
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn channel_outcomes_are_recorded_on_the_alert() {
    let h = harness(Duration::from_secs(60), 3, false);
    let alert = h
        .manager
        .create_critical_alert("u1", "s1", details("Tôi muốn chết"))
        .await
        .unwrap();

    // Give the spawned fan-out a chance to complete.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let current = h.manager.get_alert(&alert.id).await.unwrap();
    assert_eq!(current.notifications.len(), 1);
    assert!(current.notifications[0].delivered);
    assert_eq!(current.notifications[0].channel, "counting");
}
