use archipel_core::message::ErrorCode;
use archipel_services::{ConnectionState, Event, PeerSource, SecurityAlert, TrustState};
use archipeld::HandshakeError;

use crate::*;

#[tokio::test]
async fn message_reaches_the_peer() {
    let a = spawn_node().await;
    let mut b = spawn_node().await;
    connect(&a, &b).await;

    a.node.send_message(&b.node.id(), "hello from a").await.unwrap();
    let a_id = a.node.id();
    let event = wait_for_event(&mut b.events, "message", |e| {
        matches!(e, Event::MessageReceived { peer, .. } if *peer == a_id)
    })
    .await;
    match event {
        Event::MessageReceived { text, .. } => assert_eq!(text, "hello from a"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn message_without_session_fails() {
    let a = spawn_node().await;
    assert!(a.node.send_message(&[7; 32], "anyone?").await.is_err());
}

/// Connecting twice reuses the existing session.
#[tokio::test]
async fn second_connect_keeps_one_session() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    connect(&a, &b).await;
    connect(&a, &b).await;
    assert_eq!(a.node.sessions().len(), 1);
    assert_eq!(b.node.sessions().len(), 1);
}

/// B dialled A, so B passes A on to C in its PEER_LIST.
#[tokio::test]
async fn peer_list_introduces_known_peers() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let c = spawn_node().await;
    connect(&b, &a).await;
    connect(&c, &b).await;

    let a_id = a.node.id();
    wait_until("c learns a", || c.node.peers().get(&a_id).is_some()).await;
    let record = c.node.peers().get(&a_id).unwrap();
    assert_eq!(record.source, PeerSource::PeerList);
    assert_eq!(record.addr, a.node.local_addr());
}

#[tokio::test]
async fn keepalive_measures_rtt() {
    let tweak = |c: &mut archipel_core::config::ArchipelConfig| c.network.keepalive_interval_secs = 1;
    let a = spawn_node_with(
        archipel_core::Identity::generate(),
        std::sync::Arc::new(archipel_services::MemoryPersistence::default()),
        tweak,
    )
    .await;
    let b = spawn_node().await;
    connect(&a, &b).await;

    let b_id = b.node.id();
    wait_until("rtt sample", || a.node.peers().rtt(&b_id).is_some()).await;
    assert!(a.node.sessions().contains(&b_id));
}

#[tokio::test]
async fn shutdown_closes_the_peer_session() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    connect(&a, &b).await;

    let a_id = a.node.id();
    drop(a);
    wait_until("b notices", || !b.node.sessions().contains(&a_id)).await;
    assert_eq!(b.node.peers().state(&a_id), Some(ConnectionState::Closed));
}

/// A revokes itself: B tears the session down, marks A revoked, and refuses
/// A's next handshake.
#[tokio::test]
async fn self_revocation_ends_sessions_and_blocks_reconnect() {
    let a = spawn_node().await;
    let mut b = spawn_node().await;
    connect(&a, &b).await;
    let (a_id, b_id) = (a.node.id(), b.node.id());

    a.node.revoke_self().await.unwrap();

    wait_for_event(&mut b.events, "revocation alert", |e| {
        matches!(
            e,
            Event::SecurityAlert { peer, alert: SecurityAlert::PeerRevoked } if *peer == a_id
        )
    })
    .await;
    wait_until("sessions torn down", || {
        !a.node.sessions().contains(&b_id) && !b.node.sessions().contains(&a_id)
    })
    .await;
    assert_eq!(b.node.trust().state(&a_id), Some(TrustState::Revoked));
    assert_eq!(b.node.peers().state(&a_id), Some(ConnectionState::Revoked));

    let err = a.node.connect(b.node.local_addr()).await.unwrap_err();
    match err.downcast_ref::<HandshakeError>() {
        Some(HandshakeError::Rejected { code, .. }) => assert_eq!(*code, ErrorCode::Revoked),
        other => panic!("expected a revoked rejection, got {other:?}"),
    }
    assert!(!b.node.sessions().contains(&a_id));
}
