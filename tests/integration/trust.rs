use std::sync::Arc;

use archipel_core::{unix_secs, Identity};
use archipel_services::{
    ConnectionState, Event, MemoryPersistence, SecurityAlert, TrustEntry, TrustState,
};

use crate::*;

/// B pinned a different key for A's identity: the handshake is refused,
/// B raises KeyMismatch, and no session exists on either side.
#[tokio::test]
async fn pinned_key_mismatch_is_refused() {
    let a = spawn_node().await;
    let a_id = a.node.id();

    let stale_pin = TrustEntry {
        identity: a_id,
        pinned_key: [0x55; 32],
        state: TrustState::Trusted,
        first_seen: unix_secs(),
        last_verified: unix_secs(),
        revoked_by: None,
    };
    let mut b = spawn_node_with(
        Identity::generate(),
        Arc::new(MemoryPersistence::with_trust(vec![stale_pin])),
        |_| {},
    )
    .await;

    let result = a.node.connect(b.node.local_addr()).await;
    assert!(result.is_err(), "handshake must fail");

    wait_for_event(&mut b.events, "KeyMismatch alert", |e| {
        matches!(
            e,
            Event::SecurityAlert { peer, alert: SecurityAlert::KeyMismatch } if *peer == a_id
        )
    })
    .await;

    wait_until("b rejects a", || {
        b.node.peers().state(&a_id) == Some(ConnectionState::Rejected)
    })
    .await;
    assert!(a.node.sessions().is_empty());
    assert!(b.node.sessions().is_empty());
    // The pin is never overwritten.
    assert_eq!(b.node.trust().get(&a_id).unwrap().pinned_key, [0x55; 32]);
}

/// First contact pins both keys as Unverified; promotion is explicit.
#[tokio::test]
async fn first_contact_pins_unverified() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    connect(&a, &b).await;

    assert_eq!(a.node.trust().state(&b.node.id()), Some(TrustState::Unverified));
    assert_eq!(b.node.trust().state(&a.node.id()), Some(TrustState::Unverified));

    assert_eq!(a.node.promote(&b.node.id()), Ok(TrustState::Trusted));
    assert_eq!(a.node.trust().counts(), (0, 1, 0));
}

/// Configured trusted peers start out Trusted.
#[tokio::test]
async fn configured_peers_are_pre_trusted() {
    let friend = Identity::generate();
    let friend_hex = friend.node_id_hex();
    let a = spawn_node_with(
        Identity::generate(),
        Arc::new(MemoryPersistence::default()),
        move |c| c.trust.trusted_peers = vec![friend_hex],
    )
    .await;
    assert_eq!(
        a.node.trust().state(&friend.public_id()),
        Some(TrustState::Trusted)
    );
}
