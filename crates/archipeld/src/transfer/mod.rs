//! Transfer engine — serves chunks to peers and drives downloads.
//!
//! The connection manager forwards every transfer packet here. The router
//! answers CHUNK_REQUEST from the local store, records FILE_MANIFEST and
//! CHUNK_ACK announcements in the catalogue, and routes CHUNK_DATA and
//! not-found errors to the download they belong to. Each download runs in
//! its own task (see `fetch`).

mod fetch;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use archipel_core::message::{self, ErrorBody, ErrorCode};
use archipel_core::wire::{read_body, ChunkRef, PacketType};
use archipel_core::{short_id, FileManifest, NodeId};
use archipel_services::transfer::Progress;
use archipel_services::{Event, TransferError};
use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use zerocopy::{AsBytes, FromBytes};

use crate::connection::SessionTable;
use crate::context::NodeContext;

/// Bytes of `ChunkRef` in front of the data in a CHUNK_DATA payload.
pub const CHUNK_REF_LEN: usize = std::mem::size_of::<ChunkRef>();

/// Events queued per download.
const FETCH_QUEUE: usize = 256;

/// What the connection manager hands the engine.
#[derive(Debug)]
pub enum TransferInbound {
    Packet {
        from: NodeId,
        packet_type: PacketType,
        payload: Bytes,
    },
    PeerEstablished(NodeId),
    PeerClosed(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// No peer has announced the manifest yet.
    AwaitingManifest,
    Running(Progress),
    /// Verified and written to disk.
    Completed(PathBuf),
    Failed(TransferError),
}

/// Watches one download.
#[derive(Clone)]
pub struct TransferHandle {
    pub content_hash: [u8; 32],
    status: watch::Receiver<TransferStatus>,
}

impl TransferHandle {
    pub fn status(&self) -> TransferStatus {
        self.status.borrow().clone()
    }

    /// Wait for the download to finish. Returns where the file was written.
    pub async fn wait(mut self) -> Result<PathBuf, TransferError> {
        loop {
            match self.status.borrow_and_update().clone() {
                TransferStatus::Completed(path) => return Ok(path),
                TransferStatus::Failed(e) => return Err(e),
                TransferStatus::AwaitingManifest | TransferStatus::Running(_) => {}
            }
            if self.status.changed().await.is_err() {
                return match self.status.borrow().clone() {
                    TransferStatus::Completed(path) => Ok(path),
                    TransferStatus::Failed(e) => Err(e),
                    _ => Err(TransferError::Cancelled),
                };
            }
        }
    }
}

/// Router → download task.
#[derive(Debug)]
enum FetchEvent {
    Announced {
        peer: NodeId,
        manifest: Arc<FileManifest>,
    },
    Holder {
        peer: NodeId,
        index: u32,
    },
    Data {
        from: NodeId,
        index: u32,
        data: Bytes,
    },
    NotFound {
        from: NodeId,
        index: u32,
    },
    PeerGone(NodeId),
    Cancel,
}

struct ActiveFetch {
    events: mpsc::Sender<FetchEvent>,
    status: watch::Receiver<TransferStatus>,
}

#[derive(Clone)]
pub struct TransferEngine {
    ctx: NodeContext,
    sessions: SessionTable,
    active: Arc<DashMap<[u8; 32], ActiveFetch>>,
}

impl TransferEngine {
    pub fn new(ctx: NodeContext, sessions: SessionTable) -> Self {
        Self {
            ctx,
            sessions,
            active: Arc::new(DashMap::new()),
        }
    }

    // ── Local operations ─────────────────────────────────────────────────────

    /// Chunk, store and announce `data`. Sharing the same bytes twice gives
    /// the same manifest.
    pub async fn share(&self, data: Bytes, name: Option<String>) -> Result<Arc<FileManifest>> {
        let chunk_size = self.ctx.config.transfer.chunk_size;
        let store = self.ctx.store.clone();
        let manifest = tokio::task::spawn_blocking(move || -> Result<FileManifest> {
            let manifest = FileManifest::from_bytes(&data, chunk_size)?;
            store.put_file(&manifest, &data)?;
            Ok(manifest)
        })
        .await
        .context("chunking task panicked")??;

        let manifest = self.ctx.catalogue.insert_local(manifest, name);
        tracing::info!(
            content = short_id(&manifest.content_hash),
            size = manifest.total_size,
            chunks = manifest.chunk_count(),
            "sharing file"
        );
        self.announce(&manifest).await;
        Ok(manifest)
    }

    pub async fn share_file(&self, path: &Path) -> Result<Arc<FileManifest>> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        self.share(Bytes::from(data), name).await
    }

    /// Start (or join) the download of `content_hash`.
    pub fn fetch(&self, content_hash: [u8; 32]) -> TransferHandle {
        let (events_rx, status_tx, handle) = match self.active.entry(content_hash) {
            Entry::Occupied(existing) => {
                return TransferHandle {
                    content_hash,
                    status: existing.get().status.clone(),
                };
            }
            Entry::Vacant(slot) => {
                let (events_tx, events_rx) = mpsc::channel(FETCH_QUEUE);
                let (status_tx, status_rx) = watch::channel(TransferStatus::AwaitingManifest);
                slot.insert(ActiveFetch {
                    events: events_tx,
                    status: status_rx.clone(),
                });
                let handle = TransferHandle {
                    content_hash,
                    status: status_rx,
                };
                (events_rx, status_tx, handle)
            }
        };
        tracing::info!(content = short_id(&content_hash), "fetch started");
        tokio::spawn(fetch::run(self.clone(), content_hash, events_rx, status_tx));
        handle
    }

    pub async fn cancel(&self, content_hash: &[u8; 32]) -> bool {
        self.forward(content_hash, FetchEvent::Cancel).await
    }

    pub fn active(&self) -> Vec<[u8; 32]> {
        self.active.iter().map(|e| *e.key()).collect()
    }

    /// Send our manifest to every connected peer.
    async fn announce(&self, manifest: &FileManifest) {
        match manifest.to_json() {
            Ok(json) => {
                let reached = self
                    .sessions
                    .broadcast(PacketType::FileManifest, Bytes::from(json))
                    .await;
                tracing::debug!(content = short_id(&manifest.content_hash), reached, "manifest announced");
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode manifest"),
        }
    }

    // ── Router ───────────────────────────────────────────────────────────────

    pub async fn run(self, mut inbound: mpsc::Receiver<TransferInbound>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("transfer engine shutting down");
                    for hash in self.active() {
                        self.forward(&hash, FetchEvent::Cancel).await;
                    }
                    return;
                }
                next = inbound.recv() => match next {
                    Some(msg) => self.handle(msg).await,
                    None => return,
                }
            }
        }
    }

    async fn handle(&self, msg: TransferInbound) {
        match msg {
            TransferInbound::Packet {
                from,
                packet_type,
                payload,
            } => match packet_type {
                PacketType::FileManifest => self.on_manifest(from, &payload).await,
                PacketType::ChunkRequest => self.serve_chunk(from, &payload),
                PacketType::ChunkData => self.on_chunk_data(from, payload).await,
                PacketType::ChunkAck => self.on_chunk_ack(from, &payload).await,
                PacketType::Error => self.on_error(from, &payload).await,
                other => tracing::trace!(kind = ?other, "not a transfer packet"),
            },
            TransferInbound::PeerEstablished(peer) => {
                for manifest in self.ctx.catalogue.complete_manifests() {
                    let Ok(json) = manifest.to_json() else { continue };
                    self.sessions
                        .send(&peer, PacketType::FileManifest, Bytes::from(json))
                        .await;
                }
            }
            TransferInbound::PeerClosed(peer) => {
                for hash in self.active() {
                    self.forward(&hash, FetchEvent::PeerGone(peer)).await;
                }
            }
        }
    }

    async fn on_manifest(&self, from: NodeId, payload: &[u8]) {
        let manifest = match FileManifest::from_json(payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(peer = short_id(&from), error = %e, "malformed FILE_MANIFEST");
                return;
            }
        };
        let hash = manifest.content_hash;
        if self.ctx.catalogue.record_announcement(manifest, from) {
            self.ctx.events.emit(Event::ManifestAnnounced {
                peer: from,
                content_hash: hash,
            });
        }
        if let Some(manifest) = self.ctx.catalogue.get(&hash) {
            self.forward(&hash, FetchEvent::Announced { peer: from, manifest })
                .await;
        }
    }

    /// Answer a CHUNK_REQUEST with CHUNK_DATA, or ERROR not_found.
    fn serve_chunk(&self, from: NodeId, payload: &[u8]) {
        let request = match read_body::<ChunkRef>(payload) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(peer = short_id(&from), error = %e, "malformed CHUNK_REQUEST");
                return;
            }
        };
        let content_hash = request.content_hash;
        let index = request.chunk_index();
        let chunk_hash = self
            .ctx
            .catalogue
            .get(&content_hash)
            .and_then(|m| m.chunk_hashes.get(index as usize).copied());

        let engine = self.clone();
        tokio::spawn(async move {
            let data = match chunk_hash {
                Some(hash) => engine.read_chunk(hash).await,
                None => None,
            };
            match data {
                Some(data) => {
                    let mut out = BytesMut::with_capacity(CHUNK_REF_LEN + data.len());
                    out.extend_from_slice(request.as_bytes());
                    out.extend_from_slice(&data);
                    engine
                        .sessions
                        .send(&from, PacketType::ChunkData, out.freeze())
                        .await;
                    tracing::trace!(content = short_id(&content_hash), chunk = index, "served chunk");
                }
                None => {
                    tracing::debug!(
                        peer = short_id(&from),
                        content = short_id(&content_hash),
                        chunk = index,
                        "chunk not found"
                    );
                    let body = ErrorBody::chunk_not_found(content_hash, index);
                    if let Ok(json) = message::to_json(&body) {
                        engine
                            .sessions
                            .send(&from, PacketType::Error, Bytes::from(json))
                            .await;
                    }
                }
            }
        });
    }

    async fn read_chunk(&self, hash: [u8; 32]) -> Option<Bytes> {
        let store = self.ctx.store.clone();
        match tokio::task::spawn_blocking(move || store.get_verified(&hash)).await {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "chunk read failed");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "chunk read task failed");
                None
            }
        }
    }

    async fn on_chunk_data(&self, from: NodeId, payload: Bytes) {
        if payload.len() < CHUNK_REF_LEN {
            tracing::debug!(peer = short_id(&from), len = payload.len(), "short CHUNK_DATA");
            return;
        }
        let Some(chunk) = ChunkRef::read_from(&payload[..CHUNK_REF_LEN]) else {
            return;
        };
        let hash = chunk.content_hash;
        let event = FetchEvent::Data {
            from,
            index: chunk.chunk_index(),
            data: payload.slice(CHUNK_REF_LEN..),
        };
        if !self.forward(&hash, event).await {
            tracing::trace!(peer = short_id(&from), "CHUNK_DATA for no active transfer");
        }
    }

    async fn on_chunk_ack(&self, from: NodeId, payload: &[u8]) {
        let Ok(chunk) = read_body::<ChunkRef>(payload) else {
            tracing::debug!(peer = short_id(&from), "malformed CHUNK_ACK");
            return;
        };
        let hash = chunk.content_hash;
        let index = chunk.chunk_index();
        self.ctx.catalogue.record_chunk_holder(&hash, from, index);
        self.forward(&hash, FetchEvent::Holder { peer: from, index })
            .await;
    }

    async fn on_error(&self, from: NodeId, payload: &[u8]) {
        let body = match message::from_json::<ErrorBody>(payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(peer = short_id(&from), error = %e, "malformed ERROR");
                return;
            }
        };
        match (body.code, body.content_hash, body.index) {
            (ErrorCode::NotFound, Some(hash), Some(index)) => {
                self.ctx.catalogue.forget_provider(&hash, &from);
                self.forward(&hash, FetchEvent::NotFound { from, index })
                    .await;
            }
            _ => tracing::warn!(
                peer = short_id(&from),
                code = ?body.code,
                message = %body.message,
                "peer reported an error"
            ),
        }
    }

    /// Hand an event to the download for `hash`. False if there is none.
    async fn forward(&self, hash: &[u8; 32], event: FetchEvent) -> bool {
        // Clone the sender out: never hold a shard lock across an await.
        let Some(tx) = self.active.get(hash).map(|a| a.events.clone()) else {
            return false;
        };
        tx.send(event).await.is_ok()
    }
}
