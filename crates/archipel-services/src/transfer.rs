//! Transfer state and the multi-peer chunk scheduler.
//!
//! One `TransferState` per file being fetched. It is a plain value with no
//! I/O: the daemon's per-transfer task owns it, feeds it events (chunk data,
//! deadlines, providers coming and going) and sends whatever `schedule`
//! hands back.
//!
//! Scheduling, per call:
//!   1. Keep at most K requests in flight.
//!   2. Pick missing chunks rarest first (fewest eligible providers), then by index.
//!   3. For each, pick the eligible provider with the fewest requests in
//!      flight, then the lowest RTT, then the lowest id.
//!   4. A provider that sent bad data for a chunk, or let its request
//!      expire, is not eligible for that chunk until its backoff ends.
//!
//! Partial data is never VERIFIED: a chunk only becomes VERIFIED when it
//! hashes to its manifest entry, and the file is only handed out when every
//! chunk is VERIFIED and the whole-file hash matches. The state keeps no
//! chunk bytes: verified chunks go straight to the chunk store and the file
//! is reassembled from there.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use archipel_core::{FileManifest, NodeId};
use thiserror::Error;

use crate::catalogue::Holding;

/// Stand-in RTT for providers never pinged; ranks them behind measured fast peers.
const UNKNOWN_RTT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Missing,
    Requested,
    Received,
    Verified,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// K.
    pub max_in_flight: usize,
    pub request_timeout: Duration,
    /// Failures tolerated per chunk before the transfer fails.
    pub max_attempts: u32,
    pub peer_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            request_timeout: Duration::from_secs(10),
            max_attempts: 5,
            peer_backoff: Duration::from_secs(30),
        }
    }
}

/// One request to send: CHUNK_REQUEST(content_hash, index) to `peer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub index: u32,
    pub peer: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Verified,
    /// Hash mismatch. Chunk is MISSING again and `peer` is backed off for it.
    VerificationFailed,
    /// Chunk already VERIFIED.
    Duplicate,
    /// Not requested from this peer, or index out of range. Dropped.
    Unsolicited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub verified: u32,
    pub total: u32,
    pub in_flight: usize,
    pub bytes_verified: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("chunk {index} failed {attempts} times")]
    ChunkExhausted { index: u32, attempts: u32 },

    #[error("{missing} chunks not yet verified")]
    Incomplete { missing: u32 },

    #[error("reassembled file does not match the manifest content hash")]
    WholeFileMismatch,

    #[error("no provider answered within the deadline")]
    Stalled,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("no peer announced the manifest")]
    ManifestUnavailable,

    #[error("storage: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    peer: NodeId,
    deadline: Instant,
}

pub struct TransferState {
    manifest: Arc<FileManifest>,
    config: SchedulerConfig,
    status: Vec<ChunkStatus>,
    attempts: Vec<u32>,
    in_flight: HashMap<u32, InFlight>,
    /// (chunk, peer) → not before.
    penalties: HashMap<(u32, NodeId), Instant>,
    providers: BTreeMap<NodeId, Holding>,
    verified: u32,
    bytes_verified: u64,
    last_progress: Instant,
}

impl TransferState {
    /// A transfer with every chunk MISSING.
    pub fn new(manifest: Arc<FileManifest>, config: SchedulerConfig) -> Self {
        let n = manifest.chunk_count() as usize;
        Self {
            manifest,
            config,
            status: vec![ChunkStatus::Missing; n],
            attempts: vec![0; n],
            in_flight: HashMap::new(),
            penalties: HashMap::new(),
            providers: BTreeMap::new(),
            verified: 0,
            bytes_verified: 0,
            last_progress: Instant::now(),
        }
    }

    pub fn manifest(&self) -> &Arc<FileManifest> {
        &self.manifest
    }

    pub fn content_hash(&self) -> [u8; 32] {
        self.manifest.content_hash
    }

    // ── Providers ─────────────────────────────────────────────────────────────

    /// Register or widen a provider. `Holding::All` always wins.
    pub fn add_provider(&mut self, peer: NodeId, holding: Holding) {
        let Some(existing) = self.providers.get_mut(&peer) else {
            self.providers.insert(peer, holding);
            return;
        };
        match (existing, holding) {
            (existing, Holding::All) => *existing = Holding::All,
            (Holding::Chunks(set), Holding::Chunks(more)) => set.extend(more),
            (Holding::All, Holding::Chunks(_)) => {}
        }
    }

    /// Drop a provider (disconnected, revoked, or answered not-found).
    /// Its in-flight requests go back to MISSING without counting as failures.
    /// Returns the released chunk indices.
    pub fn remove_provider(&mut self, peer: &NodeId) -> Vec<u32> {
        self.providers.remove(peer);
        let released: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.peer == *peer)
            .map(|(i, _)| *i)
            .collect();
        for index in &released {
            self.in_flight.remove(index);
            self.status[*index as usize] = ChunkStatus::Missing;
        }
        released
    }

    pub fn providers(&self) -> Vec<NodeId> {
        self.providers.keys().copied().collect()
    }

    pub fn has_provider(&self, peer: &NodeId) -> bool {
        self.providers.contains_key(peer)
    }

    // ── Scheduling ────────────────────────────────────────────────────────────

    /// Hand out new requests, up to K in flight.
    ///
    /// `rtt` looks up a provider's smoothed round-trip time. Fails once any
    /// chunk has used up its attempts.
    pub fn schedule<F>(&mut self, now: Instant, rtt: F) -> Result<Vec<Assignment>, TransferError>
    where
        F: Fn(&NodeId) -> Option<Duration>,
    {
        if let Some((index, &attempts)) = self
            .attempts
            .iter()
            .enumerate()
            .find(|(i, &a)| a >= self.config.max_attempts && self.status[*i] != ChunkStatus::Verified)
        {
            return Err(TransferError::ChunkExhausted {
                index: index as u32,
                attempts,
            });
        }

        self.penalties.retain(|_, until| *until > now);

        let mut free = self.config.max_in_flight.saturating_sub(self.in_flight.len());
        if free == 0 || self.providers.is_empty() {
            return Ok(Vec::new());
        }

        let mut load: HashMap<NodeId, usize> = HashMap::new();
        for f in self.in_flight.values() {
            *load.entry(f.peer).or_default() += 1;
        }

        // Rarest first.
        let mut wanted: Vec<(usize, u32)> = self
            .status
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == ChunkStatus::Missing)
            .map(|(i, _)| {
                let index = i as u32;
                (self.eligible(index).count(), index)
            })
            .filter(|(avail, _)| *avail > 0)
            .collect();
        wanted.sort_unstable();

        let mut out = Vec::new();
        for (_, index) in wanted {
            if free == 0 {
                break;
            }
            let Some(peer) = self
                .eligible(index)
                .min_by_key(|p| {
                    (
                        load.get(*p).copied().unwrap_or(0),
                        rtt(p).unwrap_or(UNKNOWN_RTT),
                        **p,
                    )
                })
                .copied()
            else {
                continue;
            };

            self.status[index as usize] = ChunkStatus::Requested;
            self.in_flight.insert(
                index,
                InFlight {
                    peer,
                    deadline: now + self.config.request_timeout,
                },
            );
            *load.entry(peer).or_default() += 1;
            free -= 1;
            out.push(Assignment { index, peer });
        }
        if !out.is_empty() {
            self.last_progress = now;
        }
        Ok(out)
    }

    /// Providers that hold `index` and are not backed off for it.
    fn eligible(&self, index: u32) -> impl Iterator<Item = &NodeId> + '_ {
        self.providers
            .iter()
            .filter(move |(peer, holding)| {
                holding.has(index) && !self.penalties.contains_key(&(index, **peer))
            })
            .map(|(peer, _)| peer)
    }

    // ── Events ────────────────────────────────────────────────────────────────

    /// Process CHUNK_DATA for `index` from `from`. On `Verified` the caller
    /// owns the bytes and must put them in the store.
    pub fn on_chunk_data(&mut self, index: u32, from: &NodeId, data: &[u8], now: Instant) -> ChunkOutcome {
        let Some(status) = self.status.get(index as usize).copied() else {
            return ChunkOutcome::Unsolicited;
        };
        if status == ChunkStatus::Verified {
            return ChunkOutcome::Duplicate;
        }
        match self.in_flight.get(&index) {
            Some(f) if f.peer == *from => {}
            _ => return ChunkOutcome::Unsolicited,
        }
        self.in_flight.remove(&index);
        self.status[index as usize] = ChunkStatus::Received;

        if self.manifest.verify_chunk(index, data) {
            self.accept(index, now);
            ChunkOutcome::Verified
        } else {
            self.fail(index, *from, now);
            ChunkOutcome::VerificationFailed
        }
    }

    /// Expire overdue requests. Each counts as a failure for its chunk and
    /// backs the slow provider off. Returns what expired.
    pub fn expire(&mut self, now: Instant) -> Vec<Assignment> {
        let overdue: Vec<Assignment> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(i, f)| Assignment {
                index: *i,
                peer: f.peer,
            })
            .collect();
        for a in &overdue {
            self.in_flight.remove(&a.index);
            self.fail(a.index, a.peer, now);
        }
        overdue
    }

    /// Mark a chunk the store already holds intact (resume after restart or
    /// reconnect). False if `index` is outside the manifest.
    pub fn mark_present(&mut self, index: u32) -> bool {
        match self.status.get(index as usize) {
            Some(ChunkStatus::Verified) => return true,
            Some(_) => {}
            None => return false,
        }
        self.in_flight.remove(&index);
        self.accept(index, Instant::now());
        true
    }

    /// Release every in-flight slot. Returns what was released.
    pub fn cancel(&mut self) -> Vec<Assignment> {
        let released: Vec<Assignment> = self
            .in_flight
            .drain()
            .map(|(index, f)| Assignment { index, peer: f.peer })
            .collect();
        for a in &released {
            self.status[a.index as usize] = ChunkStatus::Missing;
        }
        released
    }

    fn accept(&mut self, index: u32, now: Instant) {
        self.bytes_verified += self.manifest.chunk_len(index).unwrap_or(0) as u64;
        self.status[index as usize] = ChunkStatus::Verified;
        self.verified += 1;
        self.last_progress = now;
    }

    fn fail(&mut self, index: u32, peer: NodeId, now: Instant) {
        self.status[index as usize] = ChunkStatus::Missing;
        self.attempts[index as usize] += 1;
        self.penalties
            .insert((index, peer), now + self.config.peer_backoff);
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn status(&self, index: u32) -> Option<ChunkStatus> {
        self.status.get(index as usize).copied()
    }

    pub fn attempts(&self, index: u32) -> u32 {
        self.attempts.get(index as usize).copied().unwrap_or(0)
    }

    pub fn in_flight_to(&self, index: u32) -> Option<NodeId> {
        self.in_flight.get(&index).map(|f| f.peer)
    }

    pub fn is_complete(&self) -> bool {
        self.verified as usize == self.status.len()
    }

    /// Nothing verified or requested for `limit` while chunks are still missing.
    pub fn is_stalled(&self, now: Instant, limit: Duration) -> bool {
        !self.is_complete()
            && self.in_flight.is_empty()
            && now.duration_since(self.last_progress) >= limit
    }

    pub fn progress(&self) -> Progress {
        Progress {
            verified: self.verified,
            total: self.status.len() as u32,
            in_flight: self.in_flight.len(),
            bytes_verified: self.bytes_verified,
            total_bytes: self.manifest.total_size,
        }
    }

    /// Ok once every chunk is VERIFIED; the file can then be assembled.
    pub fn ensure_complete(&self) -> Result<(), TransferError> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(TransferError::Incomplete {
                missing: self.status.len() as u32 - self.verified,
            })
        }
    }
}
