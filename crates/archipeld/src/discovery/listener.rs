//! Multicast listener and peer expiry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use archipel_core::crypto::NonceCache;
use archipel_core::wire::{read_body, HelloBody, Packet, PacketType, RevocationBody};
use archipel_core::short_id;
use archipel_services::peer::Sighting;
use archipel_services::{Event, PeerSource, SecurityAlert, TrustError};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use super::MAX_DATAGRAM;
use crate::connection::ConnectionManager;
use crate::context::NodeContext;

/// (sender, nonce) pairs remembered to drop replayed datagrams.
const REPLAY_CACHE: usize = 8192;

/// Receive HELLO and REVOKE datagrams until shutdown.
pub async fn listener_loop(
    ctx: NodeContext,
    connections: ConnectionManager,
    socket: Arc<UdpSocket>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut replay = NonceCache::new(REPLAY_CACHE);
    let local = ctx.id();

    tracing::info!(port = ctx.config.network.discovery_port, "discovery listener starting");

    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("discovery listener shutting down");
                return;
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "recv_from failed");
                    continue;
                }
            },
        };

        let packet = match ctx.decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(%src, error = %e, "dropping datagram");
                continue;
            }
        };
        if packet.sender_id == local {
            tracing::trace!("ignoring own datagram");
            continue;
        }
        if packet.flags.is_encrypted() {
            tracing::debug!(%src, "dropping encrypted datagram");
            continue;
        }
        if !replay.insert(&packet.sender_id, &packet.nonce) {
            tracing::trace!(%src, "dropping replayed datagram");
            continue;
        }

        match packet.packet_type {
            PacketType::Hello => on_hello(&ctx, &packet, src),
            PacketType::Revoke => match read_body::<RevocationBody>(&packet.payload) {
                Ok(body) => connections.apply_revocation(&body).await,
                Err(e) => tracing::debug!(%src, error = %e, "malformed REVOKE"),
            },
            other => tracing::trace!(kind = ?other, "ignoring datagram"),
        }
    }
}

fn on_hello(ctx: &NodeContext, packet: &Packet, src: SocketAddr) {
    let body = match read_body::<HelloBody>(&packet.payload) {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(%src, error = %e, "malformed HELLO");
            return;
        }
    };
    let peer = packet.sender_id;

    if let Err(e) = ctx.trust.observe(&peer, &peer) {
        if matches!(e, TrustError::KeyMismatch { .. }) {
            ctx.events.security(peer, SecurityAlert::KeyMismatch);
        }
        return;
    }
    if !ctx.trust.is_acceptable(&peer) {
        tracing::trace!(peer = short_id(&peer), "ignoring HELLO from revoked peer");
        return;
    }

    let addr = SocketAddr::new(src.ip(), body.tcp_port.get());
    match ctx.peers.record_sighting(peer, addr, PeerSource::Hello) {
        Sighting::New => {
            tracing::info!(peer = short_id(&peer), %addr, "peer discovered");
            ctx.events.emit(Event::PeerDiscovered { peer });
        }
        Sighting::Moved => tracing::debug!(peer = short_id(&peer), %addr, "peer moved"),
        Sighting::Refreshed => tracing::trace!(peer = short_id(&peer), "hello"),
    }
}

/// Evict peers not heard from for `missed_hellos_before_eviction` intervals.
pub async fn expiry_loop(ctx: NodeContext, mut shutdown: broadcast::Receiver<()>) {
    let silence = ctx.config.network.peer_expiry();
    let mut interval = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {}
        }
        for peer in ctx.peers.expire(silence) {
            tracing::debug!(peer = short_id(&peer), "peer expired");
            ctx.events.emit(Event::PeerExpired { peer });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use archipel_core::config::ArchipelConfig;
    use archipel_core::Identity;
    use archipel_services::{event_channel, ChunkStore, ManifestCatalogue, PeerTable, TrustStore};
    use zerocopy::AsBytes;

    use crate::discovery::broadcast::hello_body;

    fn context(dir: &std::path::Path) -> (NodeContext, tokio::sync::mpsc::Receiver<Event>) {
        let (events, rx) = event_channel(16);
        let ctx = NodeContext {
            identity: Arc::new(Identity::generate()),
            config: Arc::new(ArchipelConfig::default()),
            trust: TrustStore::default(),
            peers: PeerTable::new(),
            catalogue: ManifestCatalogue::new(),
            store: ChunkStore::new(dir.join("chunks")).unwrap(),
            events,
        };
        (ctx, rx)
    }

    fn hello_from(sender: &Identity, port: u16) -> Packet {
        let frame = archipel_core::wire::encode(
            PacketType::Hello,
            archipel_core::wire::Flags::NONE,
            &sender.public_id(),
            &[7; 12],
            hello_body(port).as_bytes(),
            |b| sender.sign(b),
        )
        .unwrap();
        archipel_core::wire::decode(&frame, archipel_core::identity::verify).unwrap()
    }

    #[test]
    fn hello_records_the_tcp_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = context(dir.path());
        let peer = Identity::generate();
        let src: SocketAddr = "192.168.1.20:6000".parse().unwrap();

        on_hello(&ctx, &hello_from(&peer, 7777), src);

        let record = ctx.peers.get(&peer.public_id()).unwrap();
        assert_eq!(record.addr, "192.168.1.20:7777".parse().unwrap());
        assert!(ctx.trust.get(&peer.public_id()).is_some());
        assert!(matches!(rx.try_recv(), Ok(Event::PeerDiscovered { .. })));

        // A repeat is a refresh, not a new discovery.
        on_hello(&ctx, &hello_from(&peer, 7777), src);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn hello_from_revoked_peer_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _rx) = context(dir.path());
        let peer = Identity::generate();
        let cert = peer.revoke_self(archipel_core::unix_millis());
        ctx.trust.revoke(&cert).unwrap();

        on_hello(&ctx, &hello_from(&peer, 7777), "10.0.0.2:6000".parse().unwrap());
        assert!(ctx.peers.get(&peer.public_id()).is_none());
    }
}
