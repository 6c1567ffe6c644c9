use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archipel_core::crypto::SendHalf;
use archipel_core::identity::verify;
use archipel_core::message::{self, TextMessage};
use archipel_core::wire::{self, read_body, ChunkRef, Flags, PacketType};
use archipel_core::{unix_millis, FileManifest, Identity, NodeId};
use archipel_services::{Event, SecurityAlert, TrustStore};
use archipeld::connection::handshake;
use archipeld::connection::Established;
use archipeld::framing::{read_frame, write_frame};
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use zerocopy::AsBytes;

use crate::*;

// ── Rogue peer ────────────────────────────────────────────────────────────────

/// A peer that completes the handshake honestly and then misbehaves.
struct Rogue {
    addr: SocketAddr,
    id: NodeId,
    requests: Arc<AtomicUsize>,
}

#[derive(Clone)]
enum Misbehaviour {
    /// Announce `manifest`, then answer every CHUNK_REQUEST with garbage.
    CorruptChunks(Arc<FileManifest>),
    /// Send one MESSAGE whose signature has been tampered with.
    ForgedSignature,
}

async fn spawn_rogue(behaviour: Misbehaviour) -> Rogue {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let identity = Arc::new(Identity::generate());
    let id = identity.public_id();
    let requests = Arc::new(AtomicUsize::new(0));
    {
        let requests = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_rogue(
                    stream,
                    identity.clone(),
                    behaviour.clone(),
                    requests.clone(),
                ));
            }
        });
    }
    Rogue { addr, id, requests }
}

async fn serve_rogue(
    mut stream: TcpStream,
    identity: Arc<Identity>,
    behaviour: Misbehaviour,
    requests: Arc<AtomicUsize>,
) {
    let trust = TrustStore::default();
    let Ok(Established { mut send, mut recv, .. }) =
        handshake::respond(&mut stream, &identity, &trust, Duration::from_secs(5)).await
    else {
        return;
    };

    match &behaviour {
        Misbehaviour::CorruptChunks(manifest) => {
            let json = manifest.to_json().unwrap();
            let frame = sealed(&identity, &mut send, PacketType::FileManifest, &json);
            write_frame(&mut stream, &frame).await.unwrap();
        }
        Misbehaviour::ForgedSignature => {
            let text = TextMessage {
                text: "trust me".into(),
                sent_at: unix_millis(),
            };
            let mut frame = sealed(
                &identity,
                &mut send,
                PacketType::Message,
                &message::to_json(&text).unwrap(),
            );
            let last = frame.len() - 1;
            frame[last] ^= 0xFF;
            write_frame(&mut stream, &frame).await.unwrap();
        }
    }

    while let Ok(Some(frame)) = read_frame(&mut stream).await {
        let Ok(packet) = wire::decode(&frame, verify) else {
            continue;
        };
        if !packet.flags.is_encrypted() {
            continue;
        }
        let Ok(plain) = recv.open(
            packet.packet_type.code(),
            &packet.sender_id,
            &packet.nonce,
            &packet.payload,
        ) else {
            continue;
        };
        let reply = match packet.packet_type {
            PacketType::Ping => Some((PacketType::Pong, plain)),
            PacketType::ChunkRequest => {
                requests.fetch_add(1, Ordering::SeqCst);
                let Ok(request) = read_body::<ChunkRef>(&plain) else {
                    continue;
                };
                let mut body = request.as_bytes().to_vec();
                body.extend(std::iter::repeat(0xEE).take(4096));
                Some((PacketType::ChunkData, body))
            }
            _ => None,
        };
        if let Some((packet_type, body)) = reply {
            let frame = sealed(&identity, &mut send, packet_type, &body);
            if write_frame(&mut stream, &frame).await.is_err() {
                return;
            }
        }
    }
}

fn sealed(identity: &Identity, send: &mut SendHalf, packet_type: PacketType, plaintext: &[u8]) -> Vec<u8> {
    let id = identity.public_id();
    let (nonce, ciphertext) = send.seal(packet_type.code(), &id, plaintext).unwrap();
    wire::encode(packet_type, Flags::ENCRYPTED, &id, &nonce, &ciphertext, |bytes| {
        identity.sign(bytes)
    })
    .unwrap()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// One honest and one lying provider: every bad chunk is caught by its hash
/// and fetched again from the honest node.
#[tokio::test]
async fn corrupt_chunks_are_refetched_elsewhere() {
    let a = spawn_node().await;
    let d = spawn_node().await;

    let data = pattern(2 * 1024 * 1024, 0x44);
    let manifest = a.node.share(Bytes::from(data.clone()), None).await.unwrap();
    let hash = manifest.content_hash;
    let rogue = spawn_rogue(Misbehaviour::CorruptChunks(manifest)).await;

    connect(&d, &a).await;
    assert_eq!(d.node.connect(rogue.addr).await.unwrap(), rogue.id);
    wait_until("both providers known", || {
        d.node.catalogue().providers(&hash).len() == 2
    })
    .await;

    let path = within("fetch", d.node.fetch(hash).wait()).await.unwrap();
    assert!(std::fs::read(path).unwrap() == data, "fetched bytes differ");
    assert!(rogue.requests.load(Ordering::SeqCst) >= 1, "rogue was never asked");
}

#[tokio::test]
async fn forged_signature_raises_an_alert() {
    let mut d = spawn_node().await;
    let rogue = spawn_rogue(Misbehaviour::ForgedSignature).await;

    d.node.connect(rogue.addr).await.unwrap();
    let rogue_id = rogue.id;
    wait_for_event(&mut d.events, "bad signature alert", |e| {
        matches!(
            e,
            Event::SecurityAlert { peer, alert: SecurityAlert::BadSignature } if *peer == rogue_id
        )
    })
    .await;

    // The forged message was not delivered.
    while let Ok(event) = d.events.try_recv() {
        assert!(!matches!(event, Event::MessageReceived { .. }));
    }
}

/// A recorded HANDSHAKE_INIT sent again on a fresh connection must not
/// disturb the live session it came from.
#[tokio::test]
async fn replayed_handshake_leaves_the_session_alone() {
    let a = spawn_node().await;
    let mut b = spawn_node().await;
    let (a_id, b_id) = (a.node.id(), b.node.id());

    // Relay A → B, keeping a copy of A's first frame.
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap();
    let b_addr = b.node.local_addr();
    let (captured_tx, captured_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut inbound, _) = relay.accept().await.unwrap();
        let mut outbound = TcpStream::connect(b_addr).await.unwrap();
        let init = read_frame(&mut inbound).await.unwrap().unwrap();
        write_frame(&mut outbound, &init).await.unwrap();
        let _ = captured_tx.send(init);
        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
    });

    assert_eq!(a.node.connect(relay_addr).await.unwrap(), b_id);
    wait_until("b holds the session", || b.node.sessions().contains(&a_id)).await;
    let before = b.node.sessions().get(&a_id).unwrap().session_id;
    let init = captured_rx.await.unwrap();

    let mut attacker = TcpStream::connect(b_addr).await.unwrap();
    write_frame(&mut attacker, &init).await.unwrap();
    // B either stays silent or hangs up; it must never answer with a session.
    let answer = tokio::time::timeout(Duration::from_millis(500), read_frame(&mut attacker)).await;
    assert!(
        !matches!(answer, Ok(Ok(Some(_)))),
        "replayed INIT was answered"
    );
    drop(attacker);

    let after = b.node.sessions().get(&a_id).unwrap();
    assert_eq!(after.session_id, before);
    assert!(!after.is_closed());

    a.node.send_message(&b_id, "still here").await.unwrap();
    wait_for_event(&mut b.events, "message after replay", |e| {
        matches!(e, Event::MessageReceived { peer, .. } if *peer == a_id)
    })
    .await;
}
