//! A running Archipel node: every task wired to one set of shared tables.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use archipel_core::config::ArchipelConfig;
use archipel_core::message::{self, TextMessage};
use archipel_core::wire::{PacketType, RevocationBody};
use archipel_core::{short_id, unix_millis, FileManifest, Identity, NodeId};
use archipel_services::events::EVENT_CHANNEL_CAPACITY;
use archipel_services::{
    event_channel, ChunkStore, Event, ManifestCatalogue, PeerRecord, PeerTable, Persistence,
    TrustError, TrustPolicy, TrustState, TrustStore,
};
use bytes::Bytes;
use serde::Serialize;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, mpsc, oneshot};
use zerocopy::AsBytes;

use crate::connection::{ConnectionManager, SessionTable};
use crate::context::NodeContext;
use crate::discovery;
use crate::transfer::{TransferEngine, TransferHandle};

/// Transfer packets queued between the connection manager and the engine.
const TRANSFER_QUEUE: usize = 1024;

/// Commands queued for `serve_commands`.
pub const COMMAND_QUEUE: usize = 32;

#[derive(Clone)]
pub struct Node {
    ctx: NodeContext,
    sessions: SessionTable,
    connections: ConnectionManager,
    transfers: TransferEngine,
    local_addr: SocketAddr,
    discovery: Option<Arc<UdpSocket>>,
    shutdown: broadcast::Sender<()>,
}

impl Node {
    /// Load the tables, bind the transfer port and spawn every task.
    /// Discovery runs only when `network.discovery_enabled` is set.
    pub async fn start(
        config: ArchipelConfig,
        identity: Identity,
        persistence: Arc<dyn Persistence>,
    ) -> Result<(Self, mpsc::Receiver<Event>)> {
        let policy = TrustPolicy {
            allow_introducer_revocation: config.trust.allow_introducer_revocation,
        };
        let trust = TrustStore::with_persistence(policy, persistence.clone())
            .context("failed to load trust store")?;
        trust.apply_config(&config.trust.trusted_peers);
        let catalogue = ManifestCatalogue::with_persistence(persistence)
            .context("failed to load manifest catalogue")?;
        let store = ChunkStore::new(config.storage.data_dir.join("chunks"))?;
        let (events, event_rx) = event_channel(EVENT_CHANNEL_CAPACITY);

        let ctx = NodeContext {
            identity: Arc::new(identity),
            config: Arc::new(config),
            trust,
            peers: PeerTable::new(),
            catalogue,
            store,
            events,
        };

        let sessions = SessionTable::new();
        let (transfer_tx, transfer_rx) = mpsc::channel(TRANSFER_QUEUE);
        let connections = ConnectionManager::new(ctx.clone(), sessions.clone(), transfer_tx);
        let transfers = TransferEngine::new(ctx.clone(), sessions.clone());

        let net = &ctx.config.network;
        let listener = TcpListener::bind((net.bind_addr, net.tcp_port))
            .await
            .with_context(|| format!("failed to bind transfer port {}:{}", net.bind_addr, net.tcp_port))?;
        let local_addr = listener.local_addr()?;

        let (shutdown, _) = broadcast::channel::<()>(1);

        tokio::spawn(connections.clone().accept_loop(listener, shutdown.subscribe()));
        tokio::spawn(connections.clone().dial_loop(shutdown.subscribe()));
        tokio::spawn(transfers.clone().run(transfer_rx, shutdown.subscribe()));
        tokio::spawn(discovery::expiry_loop(ctx.clone(), shutdown.subscribe()));

        let discovery = if net.discovery_enabled {
            let socket = Arc::new(
                discovery::multicast_socket(net).context("failed to open discovery socket")?,
            );
            tokio::spawn(discovery::hello_loop(
                ctx.clone(),
                socket.clone(),
                local_addr.port(),
                shutdown.subscribe(),
            ));
            tokio::spawn(discovery::listener_loop(
                ctx.clone(),
                connections.clone(),
                socket.clone(),
                shutdown.subscribe(),
            ));
            Some(socket)
        } else {
            tracing::info!("multicast discovery disabled");
            None
        };

        tracing::info!(
            node = short_id(&ctx.id()),
            fingerprint = ctx.identity.fingerprint(),
            %local_addr,
            "node started"
        );

        let node = Self {
            ctx,
            sessions,
            connections,
            transfers,
            local_addr,
            discovery,
            shutdown,
        };
        Ok((node, event_rx))
    }

    pub fn id(&self) -> NodeId {
        self.ctx.id()
    }

    /// Where the transfer listener is bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ArchipelConfig {
        &self.ctx.config
    }

    pub fn trust(&self) -> &TrustStore {
        &self.ctx.trust
    }

    pub fn peers(&self) -> &PeerTable {
        &self.ctx.peers
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn catalogue(&self) -> &ManifestCatalogue {
        &self.ctx.catalogue
    }

    // ── Operations ───────────────────────────────────────────────────────────

    /// Dial a peer by address. Returns its identity once the session is up.
    pub async fn connect(&self, addr: SocketAddr) -> Result<NodeId> {
        self.connections.connect(addr, None).await
    }

    pub async fn share(&self, data: Bytes, name: Option<String>) -> Result<Arc<FileManifest>> {
        self.transfers.share(data, name).await
    }

    pub async fn share_file(&self, path: &Path) -> Result<Arc<FileManifest>> {
        self.transfers.share_file(path).await
    }

    pub fn fetch(&self, content_hash: [u8; 32]) -> TransferHandle {
        self.transfers.fetch(content_hash)
    }

    pub async fn cancel(&self, content_hash: &[u8; 32]) -> bool {
        self.transfers.cancel(content_hash).await
    }

    pub async fn send_message(&self, peer: &NodeId, text: impl Into<String>) -> Result<()> {
        let msg = TextMessage {
            text: text.into(),
            sent_at: unix_millis(),
        };
        msg.validate()?;
        let payload = message::to_json(&msg)?;
        if !self
            .sessions
            .send(peer, PacketType::Message, Bytes::from(payload))
            .await
        {
            bail!("no session with peer {}", short_id(peer));
        }
        Ok(())
    }

    pub fn list_peers(&self) -> Vec<PeerRecord> {
        let mut peers = self.ctx.peers.list();
        peers.sort_by(|a, b| a.identity.cmp(&b.identity));
        peers
    }

    pub fn promote(&self, peer: &NodeId) -> Result<TrustState, TrustError> {
        self.ctx.trust.promote(peer)
    }

    /// Revoke this node's own identity: tell every connected peer, and the
    /// LAN when discovery is on. Peers tear their sessions down on receipt.
    pub async fn revoke_self(&self) -> Result<RevocationBody> {
        let cert = self.ctx.identity.revoke_self(unix_millis());
        let reached = self
            .sessions
            .broadcast(PacketType::Revoke, Bytes::copy_from_slice(cert.as_bytes()))
            .await;
        if let Some(socket) = &self.discovery {
            discovery::send_revocation(&self.ctx, socket, &cert)
                .await
                .context("failed to multicast revocation")?;
        }
        tracing::warn!(reached, "own identity revoked");
        Ok(cert)
    }

    pub fn status(&self) -> NodeStatus {
        let (unverified, trusted, revoked) = self.ctx.trust.counts();
        let mut sessions: Vec<SessionStatus> = self
            .sessions
            .handles()
            .into_iter()
            .map(|h| SessionStatus {
                peer: hex::encode(h.peer),
                remote_addr: h.remote_addr.to_string(),
                established_secs: h.established_at.elapsed().as_secs(),
                rtt_ms: self.ctx.peers.rtt(&h.peer).map(|d| d.as_millis() as u64),
            })
            .collect();
        sessions.sort_by(|a, b| a.peer.cmp(&b.peer));
        NodeStatus {
            node_id: self.ctx.identity.node_id_hex(),
            listen_addr: self.local_addr.to_string(),
            sessions,
            peers_known: self.ctx.peers.len(),
            trust: TrustCounts {
                unverified,
                trusted,
                revoked,
            },
            manifests: self.ctx.catalogue.len(),
            active_transfers: self.transfers.active().len(),
            chunks_stored: self.ctx.store.count(),
            bytes_stored: self.ctx.store.size(),
        }
    }

    /// Stop every task and close every session.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.sessions.close_all();
        tracing::info!(node = short_id(&self.ctx.id()), "node stopped");
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// Answer commands until the channel closes or the node shuts down.
    pub async fn serve_commands(self, mut commands: mpsc::Receiver<Command>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let command = tokio::select! {
                _ = shutdown.recv() => return,
                next = commands.recv() => match next {
                    Some(command) => command,
                    None => return,
                },
            };
            self.execute(command).await;
        }
    }

    async fn execute(&self, command: Command) {
        match command {
            Command::ListPeers { reply } => {
                let _ = reply.send(self.list_peers());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::SendMessage { peer, text, reply } => {
                let _ = reply.send(self.send_message(&peer, text).await);
            }
            Command::ShareFile { path, reply } => {
                let _ = reply.send(self.share_file(&path).await);
            }
            Command::Fetch {
                content_hash,
                reply,
            } => {
                let _ = reply.send(self.fetch(content_hash));
            }
            Command::Promote { peer, reply } => {
                let _ = reply.send(self.promote(&peer));
            }
            Command::RevokeSelf { reply } => {
                let _ = reply.send(self.revoke_self().await);
            }
            Command::Cancel {
                content_hash,
                reply,
            } => {
                let _ = reply.send(self.cancel(&content_hash).await);
            }
        }
    }
}

/// Requests from a front end, each answered on its own oneshot.
pub enum Command {
    ListPeers {
        reply: oneshot::Sender<Vec<PeerRecord>>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    SendMessage {
        peer: NodeId,
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ShareFile {
        path: PathBuf,
        reply: oneshot::Sender<Result<Arc<FileManifest>>>,
    },
    Fetch {
        content_hash: [u8; 32],
        reply: oneshot::Sender<TransferHandle>,
    },
    Promote {
        peer: NodeId,
        reply: oneshot::Sender<Result<TrustState, TrustError>>,
    },
    RevokeSelf {
        reply: oneshot::Sender<Result<RevocationBody>>,
    },
    Cancel {
        content_hash: [u8; 32],
        reply: oneshot::Sender<bool>,
    },
}

pub fn command_channel() -> (mpsc::Sender<Command>, mpsc::Receiver<Command>) {
    mpsc::channel(COMMAND_QUEUE)
}

// ── Status ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub listen_addr: String,
    pub sessions: Vec<SessionStatus>,
    pub peers_known: usize,
    pub trust: TrustCounts,
    pub manifests: usize,
    pub active_transfers: usize,
    pub chunks_stored: usize,
    pub bytes_stored: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub peer: String,
    pub remote_addr: String,
    pub established_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TrustCounts {
    pub unverified: usize,
    pub trusted: usize,
    pub revoked: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use archipel_services::MemoryPersistence;

    fn config(dir: &Path) -> ArchipelConfig {
        let mut config = ArchipelConfig::default();
        config.network.bind_addr = "127.0.0.1".parse().unwrap();
        config.network.tcp_port = 0;
        config.network.discovery_enabled = false;
        config.storage.data_dir = dir.join("data");
        config.transfer.download_dir = dir.join("downloads");
        config
    }

    async fn start(dir: &Path) -> Node {
        let (node, _events) = Node::start(
            config(dir),
            Identity::generate(),
            Arc::new(MemoryPersistence::default()),
        )
        .await
        .unwrap();
        node
    }

    #[tokio::test]
    async fn commands_are_answered() {
        let dir = tempfile::tempdir().unwrap();
        let node = start(dir.path()).await;
        let (tx, rx) = command_channel();
        tokio::spawn(node.clone().serve_commands(rx));

        let (reply, answer) = oneshot::channel();
        tx.send(Command::ListPeers { reply }).await.unwrap();
        assert!(answer.await.unwrap().is_empty());

        let (reply, answer) = oneshot::channel();
        tx.send(Command::Promote {
            peer: [9; 32],
            reply,
        })
        .await
        .unwrap();
        assert!(matches!(answer.await.unwrap(), Err(TrustError::Unknown(_))));

        let (reply, answer) = oneshot::channel();
        tx.send(Command::SendMessage {
            peer: [9; 32],
            text: "hi".into(),
            reply,
        })
        .await
        .unwrap();
        assert!(answer.await.unwrap().is_err(), "no session");

        let (reply, answer) = oneshot::channel();
        tx.send(Command::Status { reply }).await.unwrap();
        let status = answer.await.unwrap();
        assert_eq!(status.node_id, hex::encode(node.id()));
        assert!(status.sessions.is_empty());
        node.shutdown();
    }

    #[tokio::test]
    async fn sharing_twice_gives_one_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let node = start(dir.path()).await;
        let data = Bytes::from(vec![42u8; 600_000]);

        let first = node.share(data.clone(), Some("a.bin".into())).await.unwrap();
        let second = node.share(data, None).await.unwrap();
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.chunk_count(), 3);
        assert_eq!(node.catalogue().len(), 1);
        assert!(node.catalogue().is_complete(&first.content_hash));
        node.shutdown();
    }

    #[tokio::test]
    async fn fetch_of_a_local_file_completes_from_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let node = start(dir.path()).await;
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let manifest = node.share(Bytes::from(data.clone()), None).await.unwrap();

        let path = node.fetch(manifest.content_hash).wait().await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), data);
        node.shutdown();
    }
}
