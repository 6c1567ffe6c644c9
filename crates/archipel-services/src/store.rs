//! Content-addressed chunk store.
//!
//! Chunks are stored by BLAKE3 hash in a two-level directory structure:
//!   {data_dir}/chunks/{hash[0..2]}/{full_hash}
//!
//! This is the same layout Git uses for objects. Files are immutable —
//! if the hash exists, the content is correct. No TTLs, no invalidation.
//! A chunk held here can be served to any peer that asks for it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use archipel_core::crypto::Hasher;
use archipel_core::FileManifest;
use bytes::Bytes;
use memmap2::Mmap;

/// Per-process counter so concurrent writers never share a temp file.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

fn tmp_path(path: &Path) -> PathBuf {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_extension(format!("tmp{}.{seq}", std::process::id()))
}

#[derive(Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create chunk store root: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn has(&self, hash: &[u8; 32]) -> bool {
        self.chunk_path(hash).exists()
    }

    /// Retrieve a chunk. Returns None if not present.
    pub fn get(&self, hash: &[u8; 32]) -> Result<Option<Bytes>> {
        let path = self.chunk_path(hash);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to open chunk: {}", path.display()))
            }
        };
        let len = file
            .metadata()
            .with_context(|| format!("failed to stat chunk: {}", path.display()))?
            .len();
        if len == 0 {
            return Ok(Some(Bytes::new()));
        }

        // Safety: chunk files are never modified after the rename in `put`,
        // and the map is dropped before this function returns.
        let mmap = unsafe {
            Mmap::map(&file).with_context(|| format!("failed to mmap chunk: {}", path.display()))?
        };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    /// Retrieve a chunk only if it still hashes to its name.
    pub fn get_verified(&self, hash: &[u8; 32]) -> Result<Option<Bytes>> {
        match self.get(hash)? {
            Some(data) if blake3::hash(&data).as_bytes() == hash => Ok(Some(data)),
            Some(_) => {
                tracing::warn!(hash = hex::encode(hash), "stored chunk is corrupt; discarding");
                let _ = fs::remove_file(self.chunk_path(hash));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Store a chunk under its hash.
    ///
    /// Writes are atomic: temp file, then rename. Storing an existing chunk
    /// is a no-op. Data that does not hash to `hash` is refused.
    pub fn put(&self, hash: &[u8; 32], data: &[u8]) -> Result<()> {
        if blake3::hash(data).as_bytes() != hash {
            bail!("chunk data does not match hash {}", hex::encode(hash));
        }
        let path = self.chunk_path(hash);
        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store dir: {}", parent.display()))?;
        }

        let tmp = tmp_path(&path);
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create temp file: {}", tmp.display()))?;
            file.write_all(data).context("failed to write chunk data")?;
            file.sync_all().context("failed to sync chunk to disk")?;
        }

        fs::rename(&tmp, &path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                tmp.display(),
                path.display()
            )
        })?;

        tracing::trace!(hash = hex::encode(hash), "chunk stored");
        Ok(())
    }

    /// Store every chunk of a file described by `manifest`.
    pub fn put_file(&self, manifest: &FileManifest, data: &[u8]) -> Result<()> {
        if !manifest.verify_file(data) {
            bail!("file bytes do not match manifest");
        }
        for (index, hash) in manifest.chunk_hashes.iter().enumerate() {
            let range = manifest
                .chunk_range(index as u32)
                .context("chunk index outside manifest")?;
            self.put(hash, &data[range.start as usize..range.end as usize])?;
        }
        Ok(())
    }

    /// Indices of the manifest's chunks already present and intact.
    pub fn present_chunks(&self, manifest: &FileManifest) -> Vec<u32> {
        manifest
            .chunk_hashes
            .iter()
            .enumerate()
            .filter(|(i, hash)| match self.get_verified(hash) {
                Ok(Some(data)) => manifest.verify_chunk(*i as u32, &data),
                _ => false,
            })
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Stream the file described by `manifest` out of the store into `dest`.
    ///
    /// Chunks are copied one at a time and hashed as they go; `dest` only
    /// appears, via rename, once the whole-file hash matches. Returns
    /// `Ok(false)` if a chunk is missing or the result does not match.
    pub fn assemble(&self, manifest: &FileManifest, dest: &Path) -> Result<bool> {
        let tmp = tmp_path(dest);
        match self.write_chunks(manifest, &tmp) {
            Ok(true) => {}
            other => {
                let _ = fs::remove_file(&tmp);
                return other;
            }
        }
        fs::rename(&tmp, dest)
            .with_context(|| format!("failed to rename {} to {}", tmp.display(), dest.display()))?;
        Ok(true)
    }

    fn write_chunks(&self, manifest: &FileManifest, tmp: &Path) -> Result<bool> {
        let mut file = fs::File::create(tmp)
            .with_context(|| format!("failed to create temp file: {}", tmp.display()))?;
        let mut hasher = Hasher::new();
        let mut total = 0u64;
        for hash in &manifest.chunk_hashes {
            let Some(chunk) = self.get_verified(hash)? else {
                return Ok(false);
            };
            hasher.update(&chunk);
            total += chunk.len() as u64;
            file.write_all(&chunk)
                .with_context(|| format!("failed to write {}", tmp.display()))?;
        }
        if total != manifest.total_size || hasher.finalize() != manifest.content_hash {
            return Ok(false);
        }
        file.sync_all().context("failed to sync assembled file")?;
        Ok(true)
    }

    fn chunk_path(&self, hash: &[u8; 32]) -> PathBuf {
        let hex = hex::encode(hash);
        // Two-level: chunks/ab/abc123...
        self.root.join(&hex[0..2]).join(&hex)
    }

    /// Count total chunks in the store.
    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    total += subdir.count();
                }
            }
        }
        total
    }

    /// Total store size in bytes.
    pub fn size(&self) -> u64 {
        let mut total = 0u64;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    for chunk in subdir.flatten() {
                        if let Ok(meta) = chunk.metadata() {
                            total += meta.len();
                        }
                    }
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archipel_core::crypto::hash;

    fn temp_store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path().join("chunks")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_and_get_roundtrip() {
        let (_dir, store) = temp_store();
        let data = b"hello world";
        let h = hash(data);

        assert!(!store.has(&h));
        store.put(&h, data).unwrap();
        assert!(store.has(&h));
        assert_eq!(&store.get(&h).unwrap().unwrap()[..], data);
    }

    #[test]
    fn wrong_hash_is_refused() {
        let (_dir, store) = temp_store();
        assert!(store.put(&hash(b"a"), b"b").is_err());
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = temp_store();
        let data = b"idempotent";
        store.put(&hash(data), data).unwrap();
        store.put(&hash(data), data).unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.size(), data.len() as u64);
    }

    #[test]
    fn file_round_trip_and_resume_scan() {
        let (dir, store) = temp_store();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7) as u8).collect();
        let manifest = FileManifest::from_bytes(&data, 4096).unwrap();

        let out = dir.path().join("out.bin");

        assert!(store.present_chunks(&manifest).is_empty());
        assert!(!store.assemble(&manifest, &out).unwrap());
        assert!(!out.exists());

        store.put_file(&manifest, &data).unwrap();
        assert_eq!(store.present_chunks(&manifest), vec![0, 1, 2]);
        assert!(store.assemble(&manifest, &out).unwrap());
        assert_eq!(fs::read(&out).unwrap(), data);
    }

    #[test]
    fn assemble_refuses_a_wrong_content_hash() {
        let (dir, store) = temp_store();
        let data = vec![3u8; 5000];
        let mut manifest = FileManifest::from_bytes(&data, 4096).unwrap();
        store.put_file(&manifest, &data).unwrap();

        manifest.content_hash = hash(b"something else");
        let out = dir.path().join("out.bin");
        assert!(!store.assemble(&manifest, &out).unwrap());
        assert!(!out.exists());
    }

    #[test]
    fn concurrent_puts_of_one_chunk_all_succeed() {
        let (_dir, store) = temp_store();
        let data = vec![0x42u8; 64 * 1024];
        let h = hash(&data);
        std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| store.put(&h, &data)))
                .collect();
            for worker in workers {
                worker.join().unwrap().unwrap();
            }
        });
        assert_eq!(store.count(), 1);
        assert_eq!(&store.get_verified(&h).unwrap().unwrap()[..], &data[..]);
    }

    #[test]
    fn corrupt_chunk_is_not_reported_present() {
        let (_dir, store) = temp_store();
        let data = vec![5u8; 8192];
        let manifest = FileManifest::from_bytes(&data, 4096).unwrap();
        store.put_file(&manifest, &data).unwrap();

        // Both chunks share a hash; corrupt it on disk.
        let path = store.chunk_path(&manifest.chunk_hashes[0]);
        fs::write(&path, b"garbage").unwrap();
        assert!(store.present_chunks(&manifest).is_empty());
        assert!(!store.has(&manifest.chunk_hashes[0]));
    }
}
