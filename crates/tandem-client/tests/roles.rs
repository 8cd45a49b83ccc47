//! Role state machine against a real session manager.

mod common;

use std::time::Duration;

use serde_json::json;
use tandem_client::{ControlEvent, PeerEvent, RoleChange};
use tandem_common::SyncError;
use tandem_protocol::{reasons, ConflictPolicy, Role};
use tandem_relay::{ManagerConfig, SessionManager};

use common::*;

#[tokio::test]
async fn sole_client_is_granted_control() {
    let manager = manager(ConflictPolicy::default());
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;

    assert!(c1.request_active_role(None).await.unwrap());
    assert_eq!(c1.current_role().await, Role::Active);

    let info = manager.get_session(&session_id).await.unwrap();
    assert_eq!(info.active_connection_id, c1.connection_id().await);
}

#[tokio::test]
async fn later_client_is_declined_first_come_first_served() {
    let manager = manager(ConflictPolicy::FirstComeFirstServed);
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;
    assert!(c1.request_active_role(None).await.unwrap());

    let c2 = connected(&manager, &session_id, "client-2").await;
    let mut c2_control = c2.control_events();
    assert!(!c2.request_active_role(Some("my turn".into())).await.unwrap());

    let declined = wait_for(&mut c2_control, |e| matches!(e, ControlEvent::Declined { .. })).await;
    let ControlEvent::Declined { reason } = declined else {
        unreachable!()
    };
    assert_eq!(reason.as_deref(), Some(reasons::FIRST_COME_FIRST_SERVED));
    assert_eq!(c1.current_role().await, Role::Active);
    assert_eq!(c2.current_role().await, Role::Passive);
}

#[tokio::test]
async fn accepted_offer_moves_control_and_state() {
    let manager = manager(ConflictPolicy::default());
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;
    let c2 = connected(&manager, &session_id, "client-2").await;
    assert!(c1.request_active_role(None).await.unwrap());

    let state = json!({ "step": 5, "title": "Borrowing" });
    c1.send_tutorial_state(state.clone()).await.unwrap();

    let mut c1_roles = c1.role_events();
    let mut c2_control = c2.control_events();
    c1.offer_control_to_other().await.unwrap();

    let offered = wait_for(&mut c2_control, |e| matches!(e, ControlEvent::Offered(_))).await;
    let ControlEvent::Offered(offer) = offered else {
        unreachable!()
    };
    assert_eq!(offer.package.state.as_ref(), Some(&state));
    assert!(offer.package.checksum_matches());
    assert!(offer.accept().await.unwrap());

    assert_eq!(c2.current_role().await, Role::Active);
    assert_eq!(c2.last_state().await, Some(state));

    wait_for(&mut c1_roles, |c| c.current == Role::Passive).await;
    assert_eq!(c1.current_role().await, Role::Passive);
    wait_for(&mut c2_control, |e| matches!(e, ControlEvent::Confirmed)).await;

    let c2_connection = c2.connection_id().await;
    eventually(|| {
        let manager = manager.clone();
        let session_id = session_id.clone();
        let expected = c2_connection.clone();
        async move {
            manager.get_session(&session_id).await.unwrap().active_connection_id == expected
        }
    })
    .await;
}

#[tokio::test]
async fn declined_offer_keeps_roles() {
    let manager = manager(ConflictPolicy::default());
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;
    let c2 = connected(&manager, &session_id, "client-2").await;
    assert!(c1.request_active_role(None).await.unwrap());

    let mut c1_control = c1.control_events();
    let mut c2_control = c2.control_events();
    c1.offer_control_to_other().await.unwrap();
    let ControlEvent::Offered(offer) =
        wait_for(&mut c2_control, |e| matches!(e, ControlEvent::Offered(_))).await
    else {
        unreachable!()
    };
    offer.decline().await.unwrap();

    wait_for(&mut c1_control, |e| matches!(e, ControlEvent::Declined { .. })).await;
    assert_eq!(c1.current_role().await, Role::Active);
    assert_eq!(c2.current_role().await, Role::Passive);
    assert!(matches!(
        c2.accept_control().await,
        Err(SyncError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn user_choice_request_accepted_by_incumbent() {
    let manager = manager(ConflictPolicy::UserChoice);
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;
    let c2 = connected(&manager, &session_id, "client-2").await;
    assert!(c1.request_active_role(None).await.unwrap());
    c1.send_tutorial_state(json!({ "step": 2 })).await.unwrap();

    let mut c1_control = c1.control_events();
    let requester = c2.clone();
    let request = tokio::spawn(async move { requester.request_active_role(None).await });

    let ControlEvent::Requested(incoming) =
        wait_for(&mut c1_control, |e| matches!(e, ControlEvent::Requested(_))).await
    else {
        unreachable!()
    };
    assert_eq!(incoming.request.requester_id, "client-2");

    // A second request while the first is pending is refused locally.
    assert!(matches!(
        c2.request_active_role(None).await,
        Err(SyncError::InvalidOperation(_))
    ));

    assert!(incoming.accept().await.unwrap());
    assert!(request.await.unwrap().unwrap());
    assert_eq!(c1.current_role().await, Role::Passive);
    assert_eq!(c2.current_role().await, Role::Active);
    assert_eq!(c2.last_state().await, Some(json!({ "step": 2 })));
    wait_for(&mut c1_control, |e| matches!(e, ControlEvent::Confirmed)).await;
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let manager = SessionManager::new(ManagerConfig {
        default_policy: ConflictPolicy::UserChoice,
        transfer_decision_timeout: None,
        ..ManagerConfig::default()
    });
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;
    assert!(c1.request_active_role(None).await.unwrap());

    let mut config = config("client-2");
    config.role_transfer_timeout = Duration::from_millis(200);
    let c2 = client(&manager, config);
    c2.connect(RELAY_URL, session_id.as_str()).await.unwrap();
    let mut errors = c2.error_events();

    assert!(!c2.request_active_role(None).await.unwrap());
    assert_eq!(c2.current_role().await, Role::Passive);
    let error = wait_for(&mut errors, |e| matches!(e, SyncError::Timeout(_))).await;
    assert!(matches!(error, SyncError::Timeout(_)));
}

#[tokio::test]
async fn relay_decision_deadline_declines_requester() {
    let manager = SessionManager::new(ManagerConfig {
        default_policy: ConflictPolicy::UserChoice,
        transfer_decision_timeout: Some(Duration::from_millis(100)),
        ..ManagerConfig::default()
    });
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;
    let c2 = connected(&manager, &session_id, "client-2").await;
    assert!(c1.request_active_role(None).await.unwrap());

    let mut c2_control = c2.control_events();
    assert!(!c2.request_active_role(None).await.unwrap());
    let ControlEvent::Declined { reason } =
        wait_for(&mut c2_control, |e| matches!(e, ControlEvent::Declined { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(reason.as_deref(), Some(reasons::DECISION_TIMEOUT));
}

/// Relay with a short decision deadline and clients that outlast it.
fn deadline_manager(policy: ConflictPolicy) -> SessionManager {
    SessionManager::new(ManagerConfig {
        default_policy: policy,
        transfer_decision_timeout: Some(Duration::from_millis(100)),
        ..ManagerConfig::default()
    })
}

async fn active_connection(manager: &SessionManager, session_id: &str) -> Option<String> {
    manager
        .get_session(session_id)
        .await
        .unwrap()
        .active_connection_id
}

#[tokio::test]
async fn offer_accepted_after_relay_deadline_changes_nothing() {
    let manager = deadline_manager(ConflictPolicy::default());
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;
    let c2 = connected(&manager, &session_id, "client-2").await;
    assert!(c1.request_active_role(None).await.unwrap());

    let mut c1_control = c1.control_events();
    let mut c2_control = c2.control_events();
    c1.offer_control_to_other().await.unwrap();
    let ControlEvent::Offered(offer) =
        wait_for(&mut c2_control, |e| matches!(e, ControlEvent::Offered(_))).await
    else {
        unreachable!()
    };

    let ControlEvent::Declined { reason } =
        wait_for(&mut c1_control, |e| matches!(e, ControlEvent::Declined { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(reason.as_deref(), Some(reasons::DECISION_TIMEOUT));
    wait_for(&mut c2_control, |e| matches!(e, ControlEvent::Withdrawn { .. })).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(matches!(
        offer.accept().await,
        Ok(false) | Err(SyncError::InvalidOperation(_))
    ));
    assert_eq!(c1.current_role().await, Role::Active);
    assert_eq!(c2.current_role().await, Role::Passive);
    assert_eq!(
        active_connection(&manager, &session_id).await,
        c1.connection_id().await
    );

    // The relay still routes the incumbent's state.
    let mut c2_states = c2.state_events();
    c1.send_tutorial_state(json!({ "step": 9 })).await.unwrap();
    assert_eq!(wait_for(&mut c2_states, |_| true).await.state, json!({ "step": 9 }));
}

#[tokio::test]
async fn request_accepted_after_relay_deadline_keeps_incumbent() {
    let manager = deadline_manager(ConflictPolicy::UserChoice);
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;
    let c2 = connected(&manager, &session_id, "client-2").await;
    assert!(c1.request_active_role(None).await.unwrap());

    let mut c1_control = c1.control_events();
    assert!(!c2.request_active_role(None).await.unwrap());
    let ControlEvent::Requested(incoming) =
        wait_for(&mut c1_control, |e| matches!(e, ControlEvent::Requested(_))).await
    else {
        unreachable!()
    };
    let ControlEvent::Withdrawn { reason } =
        wait_for(&mut c1_control, |e| matches!(e, ControlEvent::Withdrawn { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(reason.as_deref(), Some(reasons::DECISION_TIMEOUT));

    assert!(matches!(
        incoming.accept().await,
        Ok(false) | Err(SyncError::InvalidOperation(_))
    ));
    assert_eq!(c1.current_role().await, Role::Active);
    assert_eq!(c2.current_role().await, Role::Passive);
    assert_eq!(
        active_connection(&manager, &session_id).await,
        c1.connection_id().await
    );

    // A fresh request reaches the incumbent again, and a timely answer works.
    let requester = c2.clone();
    let retry = tokio::spawn(async move { requester.request_active_role(None).await });
    let ControlEvent::Requested(again) =
        wait_for(&mut c1_control, |e| matches!(e, ControlEvent::Requested(_))).await
    else {
        unreachable!()
    };
    assert!(again.accept().await.unwrap());
    assert!(retry.await.unwrap().unwrap());
    assert_eq!(c1.current_role().await, Role::Passive);
    assert_eq!(c2.current_role().await, Role::Active);
    assert_eq!(
        active_connection(&manager, &session_id).await,
        c2.connection_id().await
    );
}

#[tokio::test]
async fn earlier_client_reclaims_control_first_come_first_served() {
    let manager = manager(ConflictPolicy::FirstComeFirstServed);
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;
    let c2 = connected(&manager, &session_id, "client-2").await;

    // Nobody holds the role yet, so the later client gets it first.
    assert!(c2.request_active_role(None).await.unwrap());
    assert_eq!(c2.current_role().await, Role::Active);

    let mut c2_roles = c2.role_events();
    assert!(c1.request_active_role(Some("I was here first".into())).await.unwrap());
    assert_eq!(c1.current_role().await, Role::Active);

    assert_eq!(
        wait_for(&mut c2_roles, |_| true).await,
        RoleChange {
            previous: Role::Active,
            current: Role::Passive
        }
    );
    assert_eq!(c2.current_role().await, Role::Passive);

    let info = manager.get_session(&session_id).await.unwrap();
    assert_eq!(info.active_connection_id, c1.connection_id().await);
    let c2_connection = c2.connection_id().await.unwrap();
    assert_eq!(info.connection(&c2_connection).unwrap().role, Role::Passive);

    // Only the reclaimed holder's state is routed.
    let mut c1_states = c1.state_events();
    assert!(c2.send_tutorial_state(json!({ "step": 1 })).await.is_err());
    let mut c2_states = c2.state_events();
    c1.send_tutorial_state(json!({ "step": 2 })).await.unwrap();
    assert_eq!(wait_for(&mut c2_states, |_| true).await.state, json!({ "step": 2 }));
    assert!(quiet(&mut c1_states).await);
}

#[tokio::test]
async fn state_round_trips_unchanged() {
    let manager = manager(ConflictPolicy::default());
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;
    let c2 = connected(&manager, &session_id, "client-2").await;
    assert!(c1.request_active_role(None).await.unwrap());

    let mut c2_states = c2.state_events();
    let state = json!({
        "step": 12,
        "files": ["src/main.rs", "Cargo.toml"],
        "cursor": { "line": 40, "column": 7 },
        "note": "ünïcode ✓",
    });
    c1.send_tutorial_state(state.clone()).await.unwrap();

    let update = wait_for(&mut c2_states, |_| true).await;
    assert_eq!(update.state, state);
    assert_eq!(update.from, "client-1");
    assert_eq!(c2.last_state().await, Some(state));
}

#[tokio::test]
async fn passive_client_cannot_send_state() {
    let manager = manager(ConflictPolicy::default());
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;
    let c2 = connected(&manager, &session_id, "client-2").await;

    let mut c2_states = c2.state_events();
    let result = c1.send_tutorial_state(json!({ "step": 1 })).await;
    assert!(matches!(result, Err(SyncError::InvalidOperation(_))));
    assert!(quiet(&mut c2_states).await);
    assert_eq!(c1.last_state().await, None);
}

#[tokio::test]
async fn request_sync_resends_last_state() {
    let manager = manager(ConflictPolicy::default());
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;
    assert!(c1.request_active_role(None).await.unwrap());
    c1.send_tutorial_state(json!({ "step": 3 })).await.unwrap();

    // Joins after the state was sent.
    let c2 = connected(&manager, &session_id, "client-2").await;
    let mut c2_states = c2.state_events();
    c2.request_sync().await.unwrap();

    let update = wait_for(&mut c2_states, |_| true).await;
    assert_eq!(update.state, json!({ "step": 3 }));
}

#[tokio::test]
async fn release_is_a_no_op_while_passive() {
    let manager = manager(ConflictPolicy::default());
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;
    let c2 = connected(&manager, &session_id, "client-2").await;

    let mut c1_roles = c1.role_events();
    let mut c2_control = c2.control_events();
    c1.release_active_role().await.unwrap();
    c1.release_active_role().await.unwrap();
    assert_eq!(c1.current_role().await, Role::Passive);
    assert!(quiet(&mut c1_roles).await);
    assert!(quiet(&mut c2_control).await);
}

#[tokio::test]
async fn release_hands_role_back_to_the_relay() {
    let manager = manager(ConflictPolicy::default());
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;
    let c2 = connected(&manager, &session_id, "client-2").await;
    assert!(c1.request_active_role(None).await.unwrap());

    let mut c1_roles = c1.role_events();
    let mut c2_control = c2.control_events();
    c1.release_active_role().await.unwrap();

    assert_eq!(
        wait_for(&mut c1_roles, |_| true).await,
        RoleChange {
            previous: Role::Active,
            current: Role::Passive
        }
    );
    wait_for(&mut c2_control, |e| matches!(e, ControlEvent::Released)).await;

    // The role is free again, so the other peer is granted directly.
    assert!(c2.request_active_role(None).await.unwrap());
}

#[tokio::test]
async fn peers_see_role_announcements_and_departures() {
    let manager = manager(ConflictPolicy::default());
    let session_id = session(&manager).await;
    let c1 = connected(&manager, &session_id, "client-1").await;
    let mut c1_peers = c1.peer_events();
    let c2 = connected(&manager, &session_id, "client-2").await;

    let joined = wait_for(&mut c1_peers, |e| matches!(e, PeerEvent::Joined { .. })).await;
    assert_eq!(
        joined,
        PeerEvent::Joined {
            connection_id: c2.connection_id().await.unwrap(),
            client_id: None,
        }
    );

    let mut c2_peers = c2.peer_events();
    assert!(c1.request_active_role(None).await.unwrap());
    assert_eq!(
        wait_for(&mut c2_peers, |e| matches!(e, PeerEvent::RoleChanged { .. })).await,
        PeerEvent::RoleChanged { role: Role::Active }
    );

    c1.disconnect().await;
    let left = wait_for(&mut c2_peers, |e| matches!(e, PeerEvent::Left { .. })).await;
    let PeerEvent::Left { last_role, .. } = left else {
        unreachable!()
    };
    assert_eq!(last_role, Role::Active);
}
