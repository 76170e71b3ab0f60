//! Integration test: realtime bridge — binding discipline and relay
//! guarantees between a user session and a clinician console.
//!
//! ## Scenarios
//! 1. One clinician per alert and one alert per clinician (Conflict on both).
//! 2. Per-direction ordering is preserved through the relay.
//! 3. Late subscribers get the transcript replayed (at-least-once).
//! 4. Release resets the clinician and tears the relay down.
//! 5. Going offline mid-intervention frees the binding.

use haven_core::{
    ClinicianAvailability, HavenError, RealtimeBridge, RelaySender, RelaySide,
};

#[tokio::test]
async fn binding_conflicts_both_ways() {
    let bridge = RealtimeBridge::new();
    bridge.register_clinician("dr-a", "Dr. An").unwrap();
    bridge.register_clinician("dr-b", "Dr. Binh").unwrap();

    bridge.join_intervention("dr-a", "alert-1").unwrap();
    // Idempotent for the same pair.
    bridge.join_intervention("dr-a", "alert-1").unwrap();

    let other_clinician = bridge.join_intervention("dr-b", "alert-1");
    assert!(matches!(other_clinician, Err(HavenError::Conflict(_))));

    let other_alert = bridge.join_intervention("dr-a", "alert-2");
    assert!(matches!(other_alert, Err(HavenError::Conflict(_))));

    // dr-b stayed clean after the rejected join.
    let b = bridge.clinician("dr-b").unwrap();
    assert_eq!(b.availability, ClinicianAvailability::Available);
    assert!(b.active_alert_id.is_none());

    let a = bridge.clinician("dr-a").unwrap();
    assert_eq!(a.availability, ClinicianAvailability::Busy);
    assert_eq!(a.active_alert_id.as_deref(), Some("alert-1"));
}

#[tokio::test]
async fn unknown_clinician_cannot_join() {
    let bridge = RealtimeBridge::new();
    let err = bridge.join_intervention("ghost", "alert-1").unwrap_err();
    assert!(matches!(err, HavenError::NotFound(_)));
}

#[tokio::test]
async fn relay_preserves_per_direction_order() {
    let bridge = RealtimeBridge::new();
    bridge.register_clinician("dr-a", "Dr. An").unwrap();
    bridge.join_intervention("dr-a", "alert-1").unwrap();

    let (_, mut to_clinician) = bridge.subscribe("alert-1", RelaySide::Clinician).unwrap();

    for i in 0..5 {
        bridge
            .relay_from_user("alert-1", &format!("tin nhắn {}", i))
            .unwrap();
    }
    for i in 0..5 {
        let msg = to_clinician.recv().await.unwrap();
        assert_eq!(msg.sender, RelaySender::User);
        assert_eq!(msg.text, format!("tin nhắn {}", i));
    }
}

#[tokio::test]
async fn late_subscriber_replays_the_transcript() {
    let bridge = RealtimeBridge::new();
    bridge.register_clinician("dr-a", "Dr. An").unwrap();
    bridge.join_intervention("dr-a", "alert-1").unwrap();

    bridge
        .relay_from_clinician("alert-1", "Chào bạn, mình đang ở đây.")
        .unwrap();
    bridge.relay_from_user("alert-1", "cảm ơn bác sĩ").unwrap();

    // The user side sees the join announcement and the clinician message.
    let (replay, _rx) = bridge.subscribe("alert-1", RelaySide::User).unwrap();
    assert!(replay.iter().any(|m| m.sender == RelaySender::System));
    assert!(replay
        .iter()
        .any(|m| m.sender == RelaySender::Clinician && m.text.contains("mình đang ở đây")));
    // Timestamps are monotone within the transcript.
    for pair in replay.windows(2) {
        assert!(pair[0].sent_at <= pair[1].sent_at);
    }
}

#[tokio::test]
async fn release_frees_clinician_and_tears_down_relay() {
    let bridge = RealtimeBridge::new();
    bridge.register_clinician("dr-a", "Dr. An").unwrap();
    bridge.join_intervention("dr-a", "alert-1").unwrap();
    bridge.relay_from_user("alert-1", "xin chào").unwrap();

    let (clinician_id, transcript) = bridge.release("alert-1").unwrap();
    assert_eq!(clinician_id, "dr-a");
    assert!(transcript.iter().any(|m| m.text == "xin chào"));

    let session = bridge.clinician("dr-a").unwrap();
    assert_eq!(session.availability, ClinicianAvailability::Available);
    assert!(session.active_alert_id.is_none());

    let gone = bridge.relay_from_user("alert-1", "còn ai không?");
    assert!(matches!(gone, Err(HavenError::NotFound(_))));
    assert!(bridge.bound_clinician("alert-1").is_none());

    // The freed clinician can pick up the next case.
    bridge.join_intervention("dr-a", "alert-2").unwrap();
}

#[tokio::test]
async fn offline_clinician_releases_the_binding() {
    let bridge = RealtimeBridge::new();
    bridge.register_clinician("dr-a", "Dr. An").unwrap();
    bridge.join_intervention("dr-a", "alert-1").unwrap();

    let session = bridge
        .set_availability("dr-a", ClinicianAvailability::Offline)
        .unwrap();
    assert_eq!(session.availability, ClinicianAvailability::Offline);
    assert!(session.active_alert_id.is_none());
    assert!(bridge.bound_clinician("alert-1").is_none());
}
