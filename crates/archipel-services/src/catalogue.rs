//! Manifest catalogue — every manifest this node has shared or heard about,
//! and which peers are known to hold its chunks.
//!
//! Keyed on content hash. Provider knowledge is runtime-only; the manifests
//! themselves (and whether we hold the full file) are persisted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use archipel_core::{short_id, FileManifest, NodeId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::persist::{Persistence, SaveOrder};

/// What a provider is known to hold of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Holding {
    /// Announced the manifest: serves every chunk.
    All,
    /// Acknowledged individual chunks.
    Chunks(HashSet<u32>),
}

impl Holding {
    pub fn has(&self, index: u32) -> bool {
        match self {
            Holding::All => true,
            Holding::Chunks(set) => set.contains(&index),
        }
    }
}

/// Persisted form of a catalogue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredManifest {
    pub manifest: FileManifest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Every chunk is in the local chunk store.
    pub complete: bool,
}

#[derive(Debug, Clone)]
pub struct CatalogueEntry {
    pub manifest: Arc<FileManifest>,
    pub name: Option<String>,
    pub complete: bool,
    pub providers: HashMap<NodeId, Holding>,
}

/// Shared, per-record-locked manifest table.
#[derive(Clone, Default)]
pub struct ManifestCatalogue {
    entries: Arc<DashMap<[u8; 32], CatalogueEntry>>,
    persistence: Option<Arc<dyn Persistence>>,
    save_order: Arc<SaveOrder>,
}

impl ManifestCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persistence(
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self, crate::persist::PersistError> {
        let entries = DashMap::new();
        for stored in persistence.load_manifests()? {
            if let Err(e) = stored.manifest.validate() {
                tracing::warn!(error = %e, "skipping invalid persisted manifest");
                continue;
            }
            entries.insert(
                stored.manifest.content_hash,
                CatalogueEntry {
                    manifest: Arc::new(stored.manifest),
                    name: stored.name,
                    complete: stored.complete,
                    providers: HashMap::new(),
                },
            );
        }
        Ok(Self {
            entries: Arc::new(entries),
            persistence: Some(persistence),
            save_order: Arc::default(),
        })
    }

    /// Record a manifest for a file this node holds in full.
    pub fn insert_local(&self, manifest: FileManifest, name: Option<String>) -> Arc<FileManifest> {
        let hash = manifest.content_hash;
        let shared = {
            let mut entry = self.entries.entry(hash).or_insert_with(|| CatalogueEntry {
                manifest: Arc::new(manifest),
                name: None,
                complete: false,
                providers: HashMap::new(),
            });
            entry.complete = true;
            if name.is_some() {
                entry.name = name;
            }
            entry.manifest.clone()
        };
        self.save();
        shared
    }

    /// Record a FILE_MANIFEST announcement from `peer`, who then holds every chunk.
    /// Returns true when the manifest was not known before.
    pub fn record_announcement(&self, manifest: FileManifest, peer: NodeId) -> bool {
        let hash = manifest.content_hash;
        let is_new = {
            let mut is_new = false;
            let mut entry = self.entries.entry(hash).or_insert_with(|| {
                is_new = true;
                CatalogueEntry {
                    manifest: Arc::new(manifest),
                    name: None,
                    complete: false,
                    providers: HashMap::new(),
                }
            });
            entry.providers.insert(peer, Holding::All);
            is_new
        };
        if is_new {
            tracing::debug!(
                content = short_id(&hash),
                peer = short_id(&peer),
                "learned manifest"
            );
            self.save();
        }
        is_new
    }

    /// Record that `peer` acknowledged holding chunk `index`.
    pub fn record_chunk_holder(&self, hash: &[u8; 32], peer: NodeId, index: u32) {
        if let Some(mut entry) = self.entries.get_mut(hash) {
            match entry
                .providers
                .entry(peer)
                .or_insert_with(|| Holding::Chunks(HashSet::new()))
            {
                Holding::All => {}
                Holding::Chunks(set) => {
                    set.insert(index);
                }
            }
        }
    }

    /// Forget everything `peer` was known to hold (disconnect, revoke, not-found reply).
    pub fn forget_provider(&self, hash: &[u8; 32], peer: &NodeId) {
        if let Some(mut entry) = self.entries.get_mut(hash) {
            entry.providers.remove(peer);
        }
    }

    pub fn forget_peer(&self, peer: &NodeId) {
        for mut entry in self.entries.iter_mut() {
            entry.providers.remove(peer);
        }
    }

    pub fn mark_complete(&self, hash: &[u8; 32]) {
        let changed = match self.entries.get_mut(hash) {
            Some(mut entry) if !entry.complete => {
                entry.complete = true;
                true
            }
            _ => false,
        };
        if changed {
            self.save();
        }
    }

    pub fn get(&self, hash: &[u8; 32]) -> Option<Arc<FileManifest>> {
        self.entries.get(hash).map(|e| e.manifest.clone())
    }

    pub fn entry(&self, hash: &[u8; 32]) -> Option<CatalogueEntry> {
        self.entries.get(hash).map(|e| e.value().clone())
    }

    pub fn providers(&self, hash: &[u8; 32]) -> HashMap<NodeId, Holding> {
        self.entries
            .get(hash)
            .map(|e| e.providers.clone())
            .unwrap_or_default()
    }

    pub fn is_complete(&self, hash: &[u8; 32]) -> bool {
        self.entries.get(hash).map(|e| e.complete).unwrap_or(false)
    }

    /// Manifests held in full, to announce to newly connected peers.
    pub fn complete_manifests(&self) -> Vec<Arc<FileManifest>> {
        self.entries
            .iter()
            .filter(|e| e.complete)
            .map(|e| e.manifest.clone())
            .collect()
    }

    pub fn list(&self) -> Vec<CatalogueEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn save(&self) {
        let Some(persistence) = self.persistence.clone() else {
            return;
        };
        self.save_order.save(
            "manifests",
            || {
                let mut snapshot: Vec<StoredManifest> = self
                    .entries
                    .iter()
                    .map(|e| StoredManifest {
                        manifest: (*e.manifest).clone(),
                        name: e.name.clone(),
                        complete: e.complete,
                    })
                    .collect();
                snapshot.sort_by(|a, b| a.manifest.content_hash.cmp(&b.manifest.content_hash));
                snapshot
            },
            move |snapshot| persistence.save_manifests(snapshot),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryPersistence;

    fn manifest(fill: u8) -> FileManifest {
        FileManifest::from_bytes(&[fill; 5000], 1024).unwrap()
    }

    #[test]
    fn announcement_registers_full_provider() {
        let cat = ManifestCatalogue::new();
        let m = manifest(1);
        assert!(cat.record_announcement(m.clone(), [7; 32]));
        assert!(!cat.record_announcement(m.clone(), [8; 32]));

        let providers = cat.providers(&m.content_hash);
        assert_eq!(providers.len(), 2);
        assert!(providers[&[7; 32]].has(4));
        assert!(!cat.is_complete(&m.content_hash));
    }

    #[test]
    fn chunk_ack_records_partial_holder() {
        let cat = ManifestCatalogue::new();
        let m = manifest(2);
        cat.insert_local(m.clone(), None);
        cat.record_chunk_holder(&m.content_hash, [3; 32], 1);
        cat.record_chunk_holder(&m.content_hash, [3; 32], 2);

        let holding = &cat.providers(&m.content_hash)[&[3; 32]];
        assert!(holding.has(1) && holding.has(2));
        assert!(!holding.has(0));
    }

    #[test]
    fn chunk_ack_never_downgrades_full_provider() {
        let cat = ManifestCatalogue::new();
        let m = manifest(3);
        cat.record_announcement(m.clone(), [5; 32]);
        cat.record_chunk_holder(&m.content_hash, [5; 32], 0);
        assert_eq!(cat.providers(&m.content_hash)[&[5; 32]], Holding::All);
    }

    #[test]
    fn forget_peer_drops_it_everywhere() {
        let cat = ManifestCatalogue::new();
        let a = manifest(4);
        let b = manifest(5);
        cat.record_announcement(a.clone(), [9; 32]);
        cat.record_announcement(b.clone(), [9; 32]);
        cat.forget_peer(&[9; 32]);
        assert!(cat.providers(&a.content_hash).is_empty());
        assert!(cat.providers(&b.content_hash).is_empty());
    }

    #[test]
    fn local_manifests_survive_reload() {
        let persistence = Arc::new(MemoryPersistence::default());
        let m = manifest(6);
        {
            let cat = ManifestCatalogue::with_persistence(persistence.clone()).unwrap();
            cat.insert_local(m.clone(), Some("six.bin".into()));
            cat.record_announcement(manifest(7), [1; 32]);
        }
        let cat = ManifestCatalogue::with_persistence(persistence).unwrap();
        assert_eq!(cat.len(), 2);
        assert!(cat.is_complete(&m.content_hash));
        assert_eq!(cat.entry(&m.content_hash).unwrap().name.as_deref(), Some("six.bin"));
        assert_eq!(cat.complete_manifests().len(), 1);
        // Providers are runtime knowledge only.
        assert!(cat.providers(&manifest(7).content_hash).is_empty());
    }

    #[test]
    fn concurrent_inserts_all_reach_disk() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(crate::persist::JsonPersistence::new(dir.path()).unwrap());
        let cat = ManifestCatalogue::with_persistence(persistence.clone()).unwrap();
        std::thread::scope(|scope| {
            for fill in 40..48u8 {
                let cat = cat.clone();
                scope.spawn(move || {
                    cat.insert_local(manifest(fill), None);
                });
            }
        });
        let reloaded = ManifestCatalogue::with_persistence(persistence).unwrap();
        assert_eq!(reloaded.len(), 8);
    }
}
