//! One download: wait for the manifest, resume from the store, then keep
//! up to K chunk requests in flight across every provider until the file
//! verifies.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use archipel_core::config::TransferConfig;
use archipel_core::wire::{ChunkRef, PacketType};
use archipel_core::{short_id, FileManifest};
use archipel_services::{ChunkOutcome, Event, Holding, SchedulerConfig, TransferError, TransferState};
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use zerocopy::AsBytes;

use super::{FetchEvent, TransferEngine, TransferStatus};

/// How often deadlines are checked when nothing arrives.
const TICK: Duration = Duration::from_millis(200);

pub(super) fn scheduler_config(cfg: &TransferConfig) -> SchedulerConfig {
    SchedulerConfig {
        max_in_flight: cfg.max_in_flight.max(1),
        request_timeout: cfg.request_timeout(),
        max_attempts: cfg.max_chunk_attempts.max(1),
        peer_backoff: cfg.peer_backoff(),
    }
}

pub(super) async fn run(
    engine: TransferEngine,
    content_hash: [u8; 32],
    mut events: mpsc::Receiver<FetchEvent>,
    status: watch::Sender<TransferStatus>,
) {
    let outcome = drive(&engine, content_hash, &mut events, &status).await;
    engine.active.remove(&content_hash);

    let ctx = &engine.ctx;
    match outcome {
        Ok(path) => {
            tracing::info!(content = short_id(&content_hash), path = %path.display(), "transfer complete");
            ctx.events.emit(Event::TransferCompleted { content_hash });
            status.send_replace(TransferStatus::Completed(path));
        }
        Err(e) => {
            tracing::warn!(content = short_id(&content_hash), error = %e, "transfer failed");
            ctx.events.emit(Event::TransferFailed {
                content_hash,
                reason: e.to_string(),
            });
            status.send_replace(TransferStatus::Failed(e));
        }
    }
}

async fn drive(
    engine: &TransferEngine,
    content_hash: [u8; 32],
    events: &mut mpsc::Receiver<FetchEvent>,
    status: &watch::Sender<TransferStatus>,
) -> Result<PathBuf, TransferError> {
    let ctx = &engine.ctx;
    let config = scheduler_config(&ctx.config.transfer);
    let patience = config.request_timeout * config.max_attempts;

    let manifest = match ctx.catalogue.get(&content_hash) {
        Some(manifest) => manifest,
        None => await_manifest(events, patience).await?,
    };
    let mut state = TransferState::new(manifest.clone(), config);

    let resumed = resume(engine, &mut state).await?;
    if resumed > 0 {
        tracing::info!(
            content = short_id(&content_hash),
            resumed,
            total = manifest.chunk_count(),
            "resuming from local store"
        );
    }
    for (peer, holding) in ctx.catalogue.providers(&content_hash) {
        if engine.sessions.contains(&peer) {
            state.add_provider(peer, holding);
        }
    }

    let mut tick = tokio::time::interval(TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reported = None;

    loop {
        let now = Instant::now();
        for expired in state.expire(now) {
            tracing::debug!(
                content = short_id(&content_hash),
                chunk = expired.index,
                peer = short_id(&expired.peer),
                "chunk request timed out"
            );
        }
        if state.is_complete() {
            break;
        }

        for assignment in state.schedule(now, |peer| ctx.peers.rtt(peer))? {
            let request = ChunkRef::new(content_hash, assignment.index);
            let sent = engine
                .sessions
                .send(
                    &assignment.peer,
                    PacketType::ChunkRequest,
                    Bytes::copy_from_slice(request.as_bytes()),
                )
                .await;
            if !sent {
                state.remove_provider(&assignment.peer);
            }
        }

        let progress = state.progress();
        if reported != Some(progress.verified) {
            reported = Some(progress.verified);
            status.send_replace(TransferStatus::Running(progress));
            ctx.events.emit(Event::TransferProgress {
                content_hash,
                progress,
            });
        }

        if state.is_stalled(now, patience) {
            return Err(TransferError::Stalled);
        }

        tokio::select! {
            next = events.recv() => match next {
                Some(event) => apply(engine, &mut state, event).await?,
                None => return Err(TransferError::Cancelled),
            },
            _ = tick.tick() => {}
        }
    }

    finish(engine, &state).await
}

/// Wait for some peer to announce the manifest.
async fn await_manifest(
    events: &mut mpsc::Receiver<FetchEvent>,
    patience: Duration,
) -> Result<Arc<FileManifest>, TransferError> {
    let deadline = tokio::time::sleep(patience);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return Err(TransferError::ManifestUnavailable),
            next = events.recv() => match next {
                Some(FetchEvent::Announced { manifest, .. }) => return Ok(manifest),
                Some(FetchEvent::Cancel) | None => return Err(TransferError::Cancelled),
                Some(_) => {}
            },
        }
    }
}

/// Mark every intact chunk already in the store. Returns how many.
async fn resume(engine: &TransferEngine, state: &mut TransferState) -> Result<usize, TransferError> {
    let store = engine.ctx.store.clone();
    let manifest = state.manifest().clone();
    let present = tokio::task::spawn_blocking(move || store.present_chunks(&manifest))
        .await
        .map_err(|e| TransferError::Storage(e.to_string()))?;

    Ok(present
        .into_iter()
        .filter(|index| state.mark_present(*index))
        .count())
}

async fn apply(
    engine: &TransferEngine,
    state: &mut TransferState,
    event: FetchEvent,
) -> Result<(), TransferError> {
    let content_hash = state.content_hash();
    match event {
        FetchEvent::Announced { peer, .. } => state.add_provider(peer, Holding::All),
        FetchEvent::Holder { peer, index } => {
            state.add_provider(peer, Holding::Chunks(HashSet::from([index])));
        }
        FetchEvent::Data { from, index, data } => {
            match state.on_chunk_data(index, &from, &data, Instant::now()) {
                ChunkOutcome::Verified => {
                    store_chunk(engine, state.manifest(), index, data).await?;
                    let ack = ChunkRef::new(content_hash, index);
                    engine
                        .sessions
                        .broadcast(PacketType::ChunkAck, Bytes::copy_from_slice(ack.as_bytes()))
                        .await;
                }
                ChunkOutcome::VerificationFailed => tracing::warn!(
                    content = short_id(&content_hash),
                    chunk = index,
                    peer = short_id(&from),
                    "chunk failed verification"
                ),
                ChunkOutcome::Duplicate | ChunkOutcome::Unsolicited => {
                    tracing::trace!(chunk = index, peer = short_id(&from), "ignoring chunk")
                }
            }
        }
        FetchEvent::NotFound { from, index } => {
            tracing::debug!(chunk = index, peer = short_id(&from), "provider lacks chunk; dropping it");
            state.remove_provider(&from);
        }
        FetchEvent::PeerGone(peer) => {
            let released = state.remove_provider(&peer);
            if !released.is_empty() {
                tracing::debug!(peer = short_id(&peer), released = released.len(), "provider gone");
            }
        }
        FetchEvent::Cancel => {
            state.cancel();
            return Err(TransferError::Cancelled);
        }
    }
    Ok(())
}

async fn store_chunk(
    engine: &TransferEngine,
    manifest: &FileManifest,
    index: u32,
    data: Bytes,
) -> Result<(), TransferError> {
    let Some(hash) = manifest.chunk_hashes.get(index as usize).copied() else {
        return Ok(());
    };
    let store = engine.ctx.store.clone();
    tokio::task::spawn_blocking(move || store.put(&hash, &data))
        .await
        .map_err(|e| TransferError::Storage(e.to_string()))?
        .map_err(|e| TransferError::Storage(format!("{e:#}")))
}

/// Stream the file out of the chunk store, checking the whole-file hash on
/// the way, then start serving it.
async fn finish(engine: &TransferEngine, state: &TransferState) -> Result<PathBuf, TransferError> {
    let ctx = &engine.ctx;
    state.ensure_complete()?;

    let dir = ctx.config.transfer.download_dir.clone();
    let path = dir.join(hex::encode(state.content_hash()));
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| TransferError::Storage(format!("{}: {e}", dir.display())))?;

    let store = ctx.store.clone();
    let manifest = state.manifest().clone();
    let dest = path.clone();
    let matched = tokio::task::spawn_blocking(move || store.assemble(&manifest, &dest))
        .await
        .map_err(|e| TransferError::Storage(e.to_string()))?
        .map_err(|e| TransferError::Storage(format!("{e:#}")))?;
    if !matched {
        return Err(TransferError::WholeFileMismatch);
    }

    let manifest = ctx
        .catalogue
        .insert_local(FileManifest::clone(state.manifest()), None);
    engine.announce(&manifest).await;
    Ok(path)
}
