//! Connection manager — TCP sessions between peers.
//!
//! Inbound connections are accepted, outbound ones dialled on request or
//! when discovery turns up a peer. Each runs the handshake, then becomes a
//! session: one reader task (decode, decrypt, dispatch) and one writer task
//! (seal, sign, write, keep-alive). Transfer traffic is handed to the
//! transfer engine; everything else is handled here.

pub mod handshake;
pub mod session;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use archipel_core::crypto::{NonceCache, RecvHalf, SendHalf};
use archipel_core::message::{self, PeerList, PeerListEntry, TextMessage, MAX_PEER_LIST};
use archipel_core::wire::{
    self, read_body, DecodeError, Flags, PacketType, PingBody, RevocationBody,
};
use archipel_core::{short_id, NodeId, ProtocolError};
use archipel_services::peer::Sighting;
use archipel_services::{ConnectionState, Event, PeerSource, SecurityAlert, TrustError};
use bytes::Bytes;
use dashmap::DashSet;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use zerocopy::byteorder::{BigEndian, U64};
use zerocopy::AsBytes;

use crate::context::NodeContext;
use crate::framing::{read_frame, write_frame};
use crate::transfer::TransferInbound;

pub use handshake::{Established, HandshakeError};
pub use session::{Outbound, Registered, SessionHandle, SessionTable};

/// Packets queued per session before senders wait.
const OUTBOUND_QUEUE: usize = 64;

/// Plaintext (sender, nonce) pairs remembered per session.
const REPLAY_CACHE: usize = 4096;

/// HANDSHAKE_INIT (sender, nonce) pairs remembered node-wide.
const HANDSHAKE_REPLAY_CACHE: usize = 8192;

/// How often the dialler looks for peers to connect to.
const DIAL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct ConnectionManager {
    ctx: NodeContext,
    sessions: SessionTable,
    transfers: mpsc::Sender<TransferInbound>,
    dialing: Arc<DashSet<NodeId>>,
    handshakes: Arc<Mutex<NonceCache>>,
}

impl ConnectionManager {
    pub fn new(
        ctx: NodeContext,
        sessions: SessionTable,
        transfers: mpsc::Sender<TransferInbound>,
    ) -> Self {
        Self {
            ctx,
            sessions,
            transfers,
            dialing: Arc::new(DashSet::new()),
            handshakes: Arc::new(Mutex::new(NonceCache::new(HANDSHAKE_REPLAY_CACHE))),
        }
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    pub async fn accept_loop(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "transfer listener starting");
        }
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("transfer listener shutting down");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let mgr = self.clone();
                        tokio::spawn(async move { mgr.handle_inbound(stream, addr).await });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        }
    }

    async fn handle_inbound(&self, mut stream: TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let limit = self.ctx.config.network.handshake_timeout();
        let init = match handshake::read_init(&mut stream, &self.ctx.identity, limit).await {
            Ok(init) => init,
            Err(e) => {
                tracing::debug!(%addr, error = %e, "inbound handshake abandoned");
                return;
            }
        };
        let peer = init.peer;
        if !self.handshakes.lock().await.insert(&peer, &init.nonce) {
            tracing::warn!(peer = short_id(&peer), %addr, "dropping replayed HANDSHAKE_INIT");
            return;
        }
        if self.ctx.peers.get(&peer).is_none() {
            self.ctx.peers.record_sighting(peer, addr, PeerSource::Inbound);
            self.ctx.events.emit(Event::PeerDiscovered { peer });
        } else {
            self.ctx.peers.touch(&peer);
        }
        self.ctx.set_state(&peer, ConnectionState::Handshaking);

        match handshake::accept(&mut stream, &self.ctx.identity, &self.ctx.trust, init).await {
            Ok(established) => {
                self.establish(stream, addr, established, peer).await;
            }
            Err(e) => self.handshake_failed(&peer, &e),
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Dial `addr` and handshake. With `expected`, the responder must be that
    /// identity. Returns the peer's identity once a session is up.
    pub async fn connect(&self, addr: SocketAddr, expected: Option<NodeId>) -> Result<NodeId> {
        if let Some(peer) = expected {
            if self.sessions.contains(&peer) {
                return Ok(peer);
            }
            if !self.ctx.trust.is_acceptable(&peer) {
                return Err(ProtocolError::PeerRevoked {
                    peer: short_id(&peer),
                }
                .into());
            }
        }

        let limit = self.ctx.config.network.handshake_timeout();
        let mut stream = tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connect to {addr}")))?
            .with_context(|| format!("failed to connect to {addr}"))?;
        let _ = stream.set_nodelay(true);

        if let Some(peer) = expected {
            self.ctx.set_state(&peer, ConnectionState::Handshaking);
        }
        let result = handshake::initiate(
            &mut stream,
            &self.ctx.identity,
            &self.ctx.trust,
            expected,
            limit,
        )
        .await;

        match result {
            Ok(established) => {
                let peer = established.peer;
                if expected.is_none() {
                    if self.ctx.peers.record_sighting(peer, addr, PeerSource::Manual) == Sighting::New {
                        self.ctx.events.emit(Event::PeerDiscovered { peer });
                    }
                    self.ctx.set_state(&peer, ConnectionState::Handshaking);
                }
                let local = self.ctx.id();
                self.establish(stream, addr, established, local).await;
                Ok(peer)
            }
            Err(e) => {
                if let Some(peer) = expected.or_else(|| failed_peer(&e)) {
                    self.handshake_failed(&peer, &e);
                }
                Err(anyhow::Error::new(e).context(format!("handshake with {addr} failed")))
            }
        }
    }

    /// Connect to discovered peers that have no session yet.
    ///
    /// Only the lower identity of a pair dials, so two nodes that discover
    /// each other at once do not race.
    pub async fn dial_loop(self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(DIAL_INTERVAL);
        let max_attempts = self.ctx.config.network.max_handshake_attempts;
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {}
            }
            let local = self.ctx.id();
            let now = Instant::now();
            for record in self.ctx.peers.list() {
                let peer = record.identity;
                let eligible = record.state.is_dialable()
                    && record.source != PeerSource::Inbound
                    && !record.in_cooldown(now)
                    && record.failed_attempts < max_attempts
                    && local < peer
                    && !self.sessions.contains(&peer)
                    && self.ctx.trust.is_acceptable(&peer);
                if !eligible || !self.dialing.insert(peer) {
                    continue;
                }
                let mgr = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = mgr.connect(record.addr, Some(peer)).await {
                        tracing::debug!(peer = short_id(&peer), error = %e, "dial failed");
                    }
                    mgr.dialing.remove(&peer);
                });
            }
        }
    }

    fn handshake_failed(&self, peer: &NodeId, e: &HandshakeError) {
        if matches!(e, HandshakeError::Unconfirmed) {
            // Anyone can resend a recorded INIT; it says nothing about the peer.
            tracing::debug!(peer = short_id(peer), "inbound handshake never confirmed");
            if self.ctx.peers.state(peer) == Some(ConnectionState::Handshaking) {
                self.ctx.set_state(peer, ConnectionState::Closed);
            }
            return;
        }
        tracing::warn!(peer = short_id(peer), error = %e, "handshake failed");
        if e.is_key_mismatch() {
            self.ctx.events.security(*peer, SecurityAlert::KeyMismatch);
        }
        if matches!(e, HandshakeError::Trust(TrustError::Revoked(_))) {
            self.ctx.set_state(peer, ConnectionState::Revoked);
            return;
        }
        self.ctx.set_state(peer, ConnectionState::Rejected);
        self.ctx
            .peers
            .record_failure(peer, self.ctx.config.network.handshake_cooldown());
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    async fn establish(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        established: Established,
        initiator: NodeId,
    ) {
        let Established {
            peer,
            session_id,
            send,
            recv,
        } = established;
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let handle = SessionHandle::new(peer, session_id, initiator, addr, tx);

        if let Registered::Duplicate = self.sessions.register(handle.clone()) {
            tracing::debug!(peer = short_id(&peer), "dropping duplicate connection");
            self.ctx.set_state(&peer, ConnectionState::Established);
            return;
        }

        let (read_half, write_half) = stream.into_split();
        let keepalive = Arc::new(Keepalive::new());
        tokio::spawn(writer_task(
            self.ctx.clone(),
            write_half,
            send,
            rx,
            handle.clone(),
            keepalive.clone(),
        ));
        tokio::spawn(
            self.clone()
                .reader_task(read_half, recv, handle.clone(), keepalive),
        );

        // A session that closed while this one was handshaking left the
        // record Closed.
        if self.ctx.peers.state(&peer) == Some(ConnectionState::Closed) {
            self.ctx.set_state(&peer, ConnectionState::Handshaking);
        }
        self.ctx.set_state(&peer, ConnectionState::Established);
        tracing::info!(
            peer = short_id(&peer),
            %addr,
            session_id = short_id(&session_id),
            "session established"
        );

        self.send_peer_list(&handle);
        if self
            .transfers
            .send(TransferInbound::PeerEstablished(peer))
            .await
            .is_err()
        {
            tracing::debug!("transfer engine gone");
        }
    }

    async fn reader_task(
        self,
        mut reader: OwnedReadHalf,
        mut recv: RecvHalf,
        handle: SessionHandle,
        keepalive: Arc<Keepalive>,
    ) {
        let mut closed = handle.closed();
        let mut replay = NonceCache::new(REPLAY_CACHE);
        loop {
            if *closed.borrow_and_update() {
                break;
            }
            let frame = tokio::select! {
                _ = closed.changed() => break,
                read = read_frame(&mut reader) => match read {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        tracing::debug!(peer = short_id(&handle.peer), "peer closed connection");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(peer = short_id(&handle.peer), error = %e, "read failed");
                        break;
                    }
                },
            };
            self.handle_frame(&handle, &mut recv, &mut replay, &keepalive, &frame)
                .await;
        }
        handle.close();
        self.session_closed(&handle).await;
    }

    async fn handle_frame(
        &self,
        handle: &SessionHandle,
        recv: &mut RecvHalf,
        replay: &mut NonceCache,
        keepalive: &Keepalive,
        frame: &[u8],
    ) {
        let packet = match self.ctx.decode(frame) {
            Ok(packet) => packet,
            Err(DecodeError::BadSignature) => {
                self.ctx.events.security(handle.peer, SecurityAlert::BadSignature);
                return;
            }
            Err(e) => {
                tracing::debug!(peer = short_id(&handle.peer), error = %e, "dropping packet");
                return;
            }
        };
        if packet.sender_id != handle.peer {
            tracing::debug!(
                peer = short_id(&handle.peer),
                sender = short_id(&packet.sender_id),
                "dropping packet from another identity"
            );
            return;
        }

        let payload = if packet.flags.is_encrypted() {
            match recv.open(
                packet.packet_type.code(),
                &packet.sender_id,
                &packet.nonce,
                &packet.payload,
            ) {
                Ok(plaintext) => Bytes::from(plaintext),
                Err(e) => {
                    tracing::debug!(peer = short_id(&handle.peer), error = %e, "dropping packet");
                    return;
                }
            }
        } else {
            if packet.packet_type.requires_session() {
                tracing::debug!(kind = ?packet.packet_type, "dropping unencrypted session packet");
                return;
            }
            if !replay.insert(&packet.sender_id, &packet.nonce) {
                tracing::trace!("dropping replayed packet");
                return;
            }
            packet.payload.clone()
        };

        self.ctx.peers.touch(&handle.peer);
        self.dispatch(handle, packet.packet_type, payload, keepalive)
            .await;
    }

    async fn dispatch(
        &self,
        handle: &SessionHandle,
        packet_type: PacketType,
        payload: Bytes,
        keepalive: &Keepalive,
    ) {
        let peer = handle.peer;
        match packet_type {
            PacketType::Ping => {
                if !handle.try_send(PacketType::Pong, payload) {
                    tracing::trace!("outbound queue full; PONG skipped");
                }
            }
            PacketType::Pong => {
                if let Ok(body) = read_body::<PingBody>(&payload) {
                    if let Some(rtt) = keepalive.answered(body.token.get()) {
                        self.ctx.peers.record_rtt(&peer, rtt);
                    }
                }
            }
            PacketType::Revoke => match read_body::<RevocationBody>(&payload) {
                Ok(body) => self.apply_revocation(&body).await,
                Err(e) => tracing::debug!(error = %e, "malformed REVOKE"),
            },
            PacketType::Message => {
                let parsed = message::from_json::<TextMessage>(&payload)
                    .and_then(|m| m.validate().map(|()| m));
                match parsed {
                    Ok(msg) => {
                        tracing::debug!(peer = short_id(&peer), len = msg.text.len(), "message received");
                        self.ctx.events.emit(Event::MessageReceived {
                            peer,
                            text: msg.text,
                            sent_at: msg.sent_at,
                        });
                    }
                    Err(e) => tracing::debug!(error = %e, "malformed MESSAGE"),
                }
            }
            PacketType::PeerList => self.handle_peer_list(&peer, &payload),
            PacketType::FileManifest
            | PacketType::ChunkRequest
            | PacketType::ChunkData
            | PacketType::ChunkAck
            | PacketType::Error => {
                let inbound = TransferInbound::Packet {
                    from: peer,
                    packet_type,
                    payload,
                };
                if self.transfers.send(inbound).await.is_err() {
                    tracing::debug!("transfer engine gone");
                }
            }
            other => tracing::trace!(kind = ?other, "ignoring packet on established session"),
        }
    }

    async fn session_closed(&self, handle: &SessionHandle) {
        if !self.sessions.remove(&handle.peer, &handle.session_id) {
            return;
        }
        tracing::info!(peer = short_id(&handle.peer), "session closed");
        self.ctx.set_state(&handle.peer, ConnectionState::Closed);
        self.ctx.catalogue.forget_peer(&handle.peer);
        if self
            .transfers
            .send(TransferInbound::PeerClosed(handle.peer))
            .await
            .is_err()
        {
            tracing::debug!(peer = short_id(&handle.peer), "transfer engine gone");
        }
    }

    // ── Revocation ────────────────────────────────────────────────────────────

    /// Apply a REVOKE received on any channel. A newly revoked peer loses
    /// its session at once and is refused from then on.
    pub async fn apply_revocation(&self, body: &RevocationBody) {
        let target = body.identity;
        if target == self.ctx.id() {
            tracing::warn!("ignoring revocation of our own identity");
            return;
        }
        match self.ctx.trust.revoke(body) {
            Ok(true) => {
                self.sessions.close_peer(&target);
                self.ctx.set_state(&target, ConnectionState::Revoked);
                self.ctx.catalogue.forget_peer(&target);
                self.ctx.events.security(target, SecurityAlert::PeerRevoked);
                if self
                    .transfers
                    .send(TransferInbound::PeerClosed(target))
                    .await
                    .is_err()
                {
                    tracing::debug!(peer = short_id(&target), "transfer engine gone");
                }
            }
            Ok(false) => tracing::trace!(peer = short_id(&target), "already revoked"),
            Err(e) => tracing::debug!(peer = short_id(&target), error = %e, "revocation refused"),
        }
    }

    // ── Peer lists ────────────────────────────────────────────────────────────

    /// Tell a new peer about the peers we reach directly.
    fn send_peer_list(&self, handle: &SessionHandle) {
        let peers: Vec<PeerListEntry> = self
            .ctx
            .peers
            .list()
            .into_iter()
            .filter(|r| {
                r.identity != handle.peer
                    && matches!(r.source, PeerSource::Hello | PeerSource::Manual)
                    && r.state != ConnectionState::Revoked
            })
            .take(MAX_PEER_LIST)
            .map(|r| PeerListEntry {
                id: r.identity,
                addr: r.addr,
            })
            .collect();
        if peers.is_empty() {
            return;
        }
        match message::to_json(&PeerList { peers }) {
            Ok(payload) => {
                handle.try_send(PacketType::PeerList, Bytes::from(payload));
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode PEER_LIST"),
        }
    }

    fn handle_peer_list(&self, from: &NodeId, payload: &[u8]) {
        let list = match message::from_json::<PeerList>(payload).and_then(|l| l.validate().map(|()| l)) {
            Ok(list) => list,
            Err(e) => {
                tracing::debug!(error = %e, "malformed PEER_LIST");
                return;
            }
        };
        let local = self.ctx.id();
        for entry in list.peers {
            if entry.id == local || entry.id == *from || self.ctx.peers.get(&entry.id).is_some() {
                continue;
            }
            if let Err(e) = self.ctx.trust.observe(&entry.id, &entry.id) {
                if matches!(e, TrustError::KeyMismatch { .. }) {
                    self.ctx.events.security(entry.id, SecurityAlert::KeyMismatch);
                }
                continue;
            }
            if !self.ctx.trust.is_acceptable(&entry.id) {
                continue;
            }
            self.ctx
                .peers
                .record_sighting(entry.id, entry.addr, PeerSource::PeerList);
            tracing::debug!(
                peer = short_id(&entry.id),
                via = short_id(from),
                addr = %entry.addr,
                "learned peer from PEER_LIST"
            );
            self.ctx.events.emit(Event::PeerDiscovered { peer: entry.id });
        }
    }
}

/// The peer a failed handshake was about, when the error names it.
fn failed_peer(e: &HandshakeError) -> Option<NodeId> {
    match e {
        HandshakeError::Trust(TrustError::KeyMismatch { identity, .. }) => Some(*identity),
        HandshakeError::Trust(TrustError::Revoked(id)) => Some(*id),
        _ => None,
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

async fn writer_task(
    ctx: NodeContext,
    mut writer: OwnedWriteHalf,
    mut send: SendHalf,
    mut rx: mpsc::Receiver<Outbound>,
    handle: SessionHandle,
    keepalive: Arc<Keepalive>,
) {
    let mut closed: watch::Receiver<bool> = handle.closed();
    let period = ctx.config.network.keepalive_interval();
    let missed_limit = ctx.config.network.missed_pongs_before_close;
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        if *closed.borrow_and_update() {
            break;
        }
        let out = tokio::select! {
            _ = closed.changed() => break,
            next = rx.recv() => match next {
                Some(out) => out,
                None => break,
            },
            _ = ping.tick() => {
                if keepalive.missed() >= missed_limit {
                    tracing::info!(peer = short_id(&handle.peer), "keep-alive timed out");
                    break;
                }
                let body = PingBody { token: U64::<BigEndian>::new(keepalive.ping_token()) };
                Outbound {
                    packet_type: PacketType::Ping,
                    payload: Bytes::copy_from_slice(body.as_bytes()),
                }
            }
        };

        let frame = match seal(&ctx, &mut send, &out) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(peer = short_id(&handle.peer), error = %e, "cannot seal packet");
                break;
            }
        };
        if let Err(e) = write_frame(&mut writer, &frame).await {
            tracing::debug!(peer = short_id(&handle.peer), error = %e, "write failed");
            break;
        }
    }
    handle.close();
    let _ = writer.shutdown().await;
}

/// Encrypt under the session key, then frame and sign.
fn seal(ctx: &NodeContext, send: &mut SendHalf, out: &Outbound) -> Result<Vec<u8>> {
    let local = ctx.id();
    let (nonce, ciphertext) = send.seal(out.packet_type.code(), &local, &out.payload)?;
    let frame = wire::encode(
        out.packet_type,
        Flags::ENCRYPTED,
        &local,
        &nonce,
        &ciphertext,
        |bytes| ctx.identity.sign(bytes),
    )?;
    Ok(frame)
}

// ── Keep-alive ────────────────────────────────────────────────────────────────

/// Unanswered PINGs remembered per session; older ones are forgotten.
const MAX_PENDING_PINGS: usize = 64;

/// PING bookkeeping shared by a session's reader and writer.
struct Keepalive {
    epoch: Instant,
    /// Tokens of unanswered PINGs, oldest first.
    pending: std::sync::Mutex<VecDeque<u64>>,
}

impl Keepalive {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            pending: std::sync::Mutex::new(VecDeque::new()),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, VecDeque<u64>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Token for a new PING: microseconds since the session started, kept
    /// strictly increasing.
    fn ping_token(&self) -> u64 {
        let mut pending = self.pending();
        let now = self.epoch.elapsed().as_micros() as u64;
        let token = pending.back().map_or(now, |last| now.max(last + 1));
        if pending.len() == MAX_PENDING_PINGS {
            pending.pop_front();
        }
        pending.push_back(token);
        token
    }

    fn missed(&self) -> u32 {
        self.pending().len() as u32
    }

    /// A PONG echoed `token`. Only a token from an unanswered PING counts:
    /// it clears that PING and every older one and yields the round trip.
    fn answered(&self, token: u64) -> Option<Duration> {
        let mut pending = self.pending();
        let position = pending.iter().position(|t| *t == token)?;
        pending.drain(..=position);
        let now = self.epoch.elapsed().as_micros() as u64;
        now.checked_sub(token).map(Duration::from_micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_counts_unanswered_pings() {
        let k = Keepalive::new();
        k.ping_token();
        k.ping_token();
        assert_eq!(k.missed(), 2);
        let token = k.ping_token();
        assert!(k.answered(token).is_some());
        assert_eq!(k.missed(), 0);
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let k = Keepalive::new();
        let token = k.ping_token();
        k.ping_token();
        assert_eq!(k.answered(u64::MAX), None);
        assert_eq!(k.answered(token + 1_000_000), None);
        assert_eq!(k.missed(), 2);

        assert!(k.answered(token).is_some());
        assert_eq!(k.missed(), 1);
        // The same PONG twice only counts once.
        assert_eq!(k.answered(token), None);
        assert_eq!(k.missed(), 1);
    }

    #[test]
    fn tokens_strictly_increase() {
        let k = Keepalive::new();
        let first = k.ping_token();
        let second = k.ping_token();
        assert!(second > first);
    }
}
