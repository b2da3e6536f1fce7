//! Scenario 4: the concurrency cap.

use crate::helpers::{harness_with, wait_for_status};
use az_adapters::FakeStep;
use az_core::{AgentKind, SessionStatus, SpawnError, SpawnRequest};

#[tokio::test]
async fn scenario_4_capacity_cap() {
    let h = harness_with(|config| config.max_concurrent(2));
    h.adapter.script_turn(vec![FakeStep::HangUntilCancelled]);
    h.adapter.script_turn(vec![FakeStep::HangUntilCancelled]);

    let first =
        h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "one")).await.unwrap();
    let second =
        h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "two")).await.unwrap();
    wait_for_status(&h.supervisor, &first.id, SessionStatus::Running).await;
    wait_for_status(&h.supervisor, &second.id, SessionStatus::Running).await;

    // The third concurrent spawn is refused
    let err = h
        .supervisor
        .spawn(SpawnRequest::new(AgentKind::SdkChat, "three"))
        .await
        .unwrap_err();
    assert!(matches!(err, SpawnError::CapacityReached { running: 2, cap: 2 }));

    // Cancelling one reclaims the slot immediately
    assert!(h.supervisor.cancel(&first.id));
    assert_eq!(h.supervisor.live_count(), 1);

    h.adapter.script_simple_completion("fits now");
    let fourth =
        h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "four")).await.unwrap();
    wait_for_status(&h.supervisor, &fourth.id, SessionStatus::Idle).await;
}
