//! Integration test: notification fan-out — per-channel isolation and the
//! audit trail of outcomes.
//!
//! ## Scenarios
//! 1. A failing channel never blocks the healthy ones.
//! 2. A panicking channel is recorded as a failed outcome, not a crash.
//! 3. The roster channel fails loudly when nobody is on call and delivers
//!    creation/escalation events when someone is.

use chrono::Utc;
use haven_core::{
    AlertEvent, AlertStatus, ChannelOutcome, CriticalAlert, ModerationPipeline,
    NotificationChannel, NotificationDispatcher, RiskLevel, RiskType, RosterChannel,
};
use std::sync::Arc;
use tokio::sync::broadcast;

fn sample_alert() -> CriticalAlert {
    let result = ModerationPipeline::new().score("Tôi muốn chết");
    CriticalAlert {
        id: "alert-test-1".to_string(),
        user_id: "u1".to_string(),
        session_id: "s1".to_string(),
        created_at: Utc::now(),
        risk_level: RiskLevel::Critical,
        risk_type: RiskType::Suicidal,
        user_message: "Tôi muốn chết".to_string(),
        detected_keywords: vec!["muon chet".to_string()],
        status: AlertStatus::Pending,
        escalation_round: 0,
        notifications: Vec::new(),
        moderation: result.summary(),
        acknowledged_by: None,
        acknowledged_at: None,
        notes: None,
        resolution: None,
        resolved_at: None,
    }
}

struct OkChannel;
struct FailingChannel;
struct PanickingChannel;

#[async_trait::async_trait]
impl NotificationChannel for OkChannel {
    fn name(&self) -> &str {
        "ok"
    }
    async fn deliver(&self, _alert: &CriticalAlert, _escalated: bool) -> Result<String, String> {
        Ok("delivered".to_string())
    }
}

#[async_trait::async_trait]
impl NotificationChannel for FailingChannel {
    fn name(&self) -> &str {
        "failing"
    }
    async fn deliver(&self, _alert: &CriticalAlert, _escalated: bool) -> Result<String, String> {
        Err("endpoint unreachable".to_string())
    }
}

#[async_trait::async_trait]
impl NotificationChannel for PanickingChannel {
    fn name(&self) -> &str {
        "panicking"
    }
    async fn deliver(&self, _alert: &CriticalAlert, _escalated: bool) -> Result<String, String> {
        panic!("channel bug");
    }
}

fn outcome<'a>(outcomes: &'a [ChannelOutcome], channel: &str) -> &'a ChannelOutcome {
    outcomes
        .iter()
        .find(|o| o.channel == channel)
        .unwrap_or_else(|| panic!("missing outcome for {}", channel))
}

#[tokio::test]
async fn one_failing_channel_does_not_block_the_others() {
    let dispatcher = NotificationDispatcher::new(vec![
        Arc::new(FailingChannel),
        Arc::new(OkChannel),
    ]);
    let outcomes = dispatcher.dispatch(&sample_alert(), false).await;
    assert_eq!(outcomes.len(), 2);
    assert!(!outcome(&outcomes, "failing").delivered);
    assert!(outcome(&outcomes, "failing").detail.contains("unreachable"));
    assert!(outcome(&outcomes, "ok").delivered);
}

#[tokio::test]
async fn a_panicking_channel_becomes_a_failed_outcome() {
    let dispatcher = NotificationDispatcher::new(vec![
        Arc::new(PanickingChannel),
        Arc::new(OkChannel),
    ]);
    let outcomes = dispatcher.dispatch(&sample_alert(), true).await;
    assert_eq!(outcomes.len(), 2);
    assert!(!outcome(&outcomes, "panicking").delivered);
    assert!(outcome(&outcomes, "ok").delivered);
}

#[tokio::test]
async fn roster_channel_requires_someone_on_call() {
    let (events, rx) = broadcast::channel(16);
    drop(rx);
    let dispatcher = NotificationDispatcher::new(vec![Arc::new(RosterChannel::new(events))]);
    let outcomes = dispatcher.dispatch(&sample_alert(), false).await;
    assert!(!outcome(&outcomes, "oncall_roster").delivered);
    assert!(outcome(&outcomes, "oncall_roster")
        .detail
        .contains("no on-call subscribers"));
}

#[tokio::test]
async fn roster_channel_pushes_creation_and_escalation_events() {
    let (events, mut rx) = broadcast::channel(16);
    let dispatcher = NotificationDispatcher::new(vec![Arc::new(RosterChannel::new(events))]);

    let outcomes = dispatcher.dispatch(&sample_alert(), false).await;
    assert!(outcome(&outcomes, "oncall_roster").delivered);
    match rx.try_recv().unwrap() {
        AlertEvent::Created { alert } => assert_eq!(alert.id, "alert-test-1"),
        other => panic!("expected Created, got {:?}", other),
    }

    let mut escalated = sample_alert();
    escalated.escalation_round = 2;
    let outcomes = dispatcher.dispatch(&escalated, true).await;
    assert!(outcome(&outcomes, "oncall_roster").delivered);
    match rx.try_recv().unwrap() {
        AlertEvent::Escalated { alert_id, round, .. } => {
            assert_eq!(alert_id, "alert-test-1");
            assert_eq!(round, 2);
        }
        other => panic!("expected Escalated, got {:?}", other),
    }
}
