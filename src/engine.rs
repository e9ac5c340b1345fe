//! Engine Facade: the public API surface. Owns the block device, bitmap,
//! and namespace store behind one reader-writer lock, and is the only layer
//! that knows how to orchestrate the three of them together.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use log::{debug, error, warn};

use crate::bitmap::Bitmap;
use crate::block::BlockDevice;
use crate::error::{Result, YfsError};
use crate::index::{IndexChain, MAX_IDS_PER_INDEX};
use crate::namespace::{FileEntry, FileMetadata, NamespaceStore};
use crate::path;

/// Default block size used when creating a new volume without an explicit
/// override.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Volume tunables gathered into one builder, mirroring `std::fs::OpenOptions`.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub block_size: u32,
    pub checksum_enabled: bool,
    pub max_ids_per_index: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            checksum_enabled: true,
            max_ids_per_index: MAX_IDS_PER_INDEX,
        }
    }
}

/// The kind of a namespace entry, returned by `ls`/`stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One entry as returned by `ls`.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: i64,
    pub mod_time: i64,
    pub create_time: i64,
    pub block_count: u32,
}

/// Full stat result for a path.
#[derive(Debug, Clone)]
pub struct Stat {
    pub kind: EntryKind,
    pub size: i64,
    pub mod_time: i64,
    pub create_time: i64,
    pub permissions: u32,
    pub index_block_count: u32,
    pub data_block_count: u32,
}

/// Snapshot of the counters returned by `get_stats`.
#[derive(Debug, Clone)]
pub struct Stats {
    pub version: u32,
    pub block_size: u32,
    pub total_blocks: u64,
    pub allocated_blocks: u64,
    pub used_blocks: u64,
    pub free_blocks: u64,
    pub checksum_enabled: bool,
    pub bitmap_search_pos: u64,
    pub blocks_file_size: u64,
}

struct Paths {
    root: PathBuf,
    bitmap: PathBuf,
    blocks: PathBuf,
}

struct State {
    namespace: NamespaceStore,
    bitmap: Bitmap,
    device: BlockDevice,
    paths: Paths,
    options: EngineOptions,
    namespace_dirty: bool,
}

impl State {
    fn sync(&mut self) -> Result<()> {
        if self.namespace_dirty {
            self.namespace.save(&self.paths.root, self.bitmap.total_blocks())?;
            self.namespace_dirty = false;
            debug!("root.yfs flushed");
        }
        if self.bitmap.is_dirty() {
            self.bitmap.save(&self.paths.bitmap)?;
            debug!("bitmap.yfs flushed");
        }
        self.device.sync()?;
        Ok(())
    }
}

/// The storage engine. Cheap to clone a handle to via `&Engine`; all state
/// lives behind the internal reader-writer lock, so the facade itself needs
/// no `Clone`/`Arc` wrapping to be shared across threads — callers wrap it
/// in `Arc<Engine>` themselves if they need to hand out multiple owners.
pub struct Engine {
    state: RwLock<State>,
}

impl Engine {
    /// Open or create a volume whose three sidecar files live directly
    /// under `dir`, named `root.yfs`, `bitmap.yfs`, and `blocks.glob`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Self::open_paths(
            dir.join("root.yfs"),
            dir.join("bitmap.yfs"),
            dir.join("blocks.glob"),
            EngineOptions::default(),
        )
    }

    /// Open or create a volume from three explicit file paths.
    pub fn open_paths(
        root: impl AsRef<Path>,
        bitmap: impl AsRef<Path>,
        blocks: impl AsRef<Path>,
        options: EngineOptions,
    ) -> Result<Self> {
        let paths = Paths {
            root: root.as_ref().to_path_buf(),
            bitmap: bitmap.as_ref().to_path_buf(),
            blocks: blocks.as_ref().to_path_buf(),
        };

        let exists = paths.root.exists() && paths.bitmap.exists() && paths.blocks.exists();

        let (namespace, bitmap_store, device) = if exists {
            let namespace = NamespaceStore::load(&paths.root)?;
            let bitmap_store = Bitmap::load(&paths.bitmap)?;
            let device = BlockDevice::open(&paths.blocks)?;
            (namespace, bitmap_store, device)
        } else {
            let namespace = NamespaceStore::new(options.block_size, options.checksum_enabled);
            // Seed with one growth unit's worth of capacity (matching the
            // bitmap allocator's own append-1024-bytes/8192-blocks growth
            // step) so the very first multi-block write doesn't need a
            // contiguous run out of a zero-capacity bitmap.
            let bitmap_store = Bitmap::new(8192);
            let device = BlockDevice::create(&paths.blocks, options.block_size)?;
            (namespace, bitmap_store, device)
        };

        let mut state = State {
            namespace,
            bitmap: bitmap_store,
            device,
            paths,
            options,
            namespace_dirty: !exists,
        };
        if !exists {
            state.sync()?;
        }

        Ok(Self {
            state: RwLock::new(state),
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().expect("engine lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().expect("engine lock poisoned")
    }

    pub fn get_block_size(&self) -> u32 {
        self.read().device.block_size()
    }

    /// Write `bytes` as the contents of `path`, creating parent directories
    /// as needed and overwriting any existing file there.
    pub fn write_file(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let mut st = self.write();

        let (parent_components, name) =
            path::split(path).ok_or_else(|| YfsError::IsADirectory(path.to_string()))?;
        if !path::is_valid_name(name) {
            return Err(YfsError::not_found(path));
        }
        if st.namespace.get_dir(path).is_ok() {
            return Err(YfsError::IsADirectory(path.to_string()));
        }

        let old_head = match st.namespace.get_file(path) {
            Ok((_, entry)) => entry.first_index_block_id,
            Err(YfsError::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };

        let max_ids = st.options.max_ids_per_index;
        let new_head = IndexChain::store(&st.device, &mut st.bitmap, bytes, old_head, max_ids)?;

        let per_block = st.device.data_per_block();
        let data_block_count = bytes.len().div_ceil(per_block.max(1)) as u32;
        let index_block_count = (data_block_count as usize).div_ceil(max_ids.max(1)) as u32;

        let entry = FileEntry {
            metadata: FileMetadata::new(name, 0o644),
            first_index_block_id: new_head,
            size: bytes.len() as i64,
            index_block_count: if new_head == 0 { 0 } else { index_block_count },
            data_block_count: if new_head == 0 { 0 } else { data_block_count },
        };

        let _ = parent_components;
        st.namespace.put_file(path, entry)?;
        st.namespace_dirty = true;
        st.sync()
    }

    /// Return the exact bytes stored at `path`.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let st = self.read();
        let (_, entry) = st.namespace.get_file(path)?;
        if entry.metadata.crc32 != 0
            && st.namespace.checksum_enabled
            && !entry.metadata.verify_crc()
        {
            error!("metadata checksum mismatch for {path}");
            return Err(YfsError::checksum_mismatch(path.to_string()));
        }
        if entry.first_index_block_id == 0 {
            return Ok(Vec::new());
        }
        IndexChain::load(
            &st.device,
            entry.first_index_block_id,
            entry.size as u64,
            st.namespace.checksum_enabled,
        )
    }

    pub fn delete_file(&self, path: &str) -> Result<()> {
        let mut st = self.write();
        let entry = st.namespace.take_file(path)?;
        if entry.first_index_block_id != 0 {
            IndexChain::release(&st.device, &mut st.bitmap, entry.first_index_block_id)?;
        }
        st.namespace_dirty = true;
        st.sync()
    }

    /// Copy `src` to `dst`: read the full source into memory, then write it
    /// under `dst` as an independent file with its own block chain.
    pub fn copy_file(&self, src: &str, dst: &str) -> Result<()> {
        let bytes = self.read_file(src)?;
        self.write_file(dst, &bytes)
    }

    /// Move `src` to `dst`: copy then delete. Non-atomic across a crash
    /// between the two steps, as documented in the design.
    pub fn move_file(&self, src: &str, dst: &str) -> Result<()> {
        self.copy_file(src, dst)?;
        self.delete_file(src)
    }

    pub fn create_directory(&self, path: &str) -> Result<()> {
        let mut st = self.write();
        st.namespace.mkdir(path)?;
        st.namespace_dirty = true;
        st.sync()
    }

    pub fn delete_directory(&self, path: &str) -> Result<()> {
        let mut st = self.write();
        st.namespace.rmdir(path)?;
        st.namespace_dirty = true;
        st.sync()
    }

    /// List the entries of the directory at `path`, sorted by name.
    pub fn ls(&self, path: &str) -> Result<Vec<ListEntry>> {
        let st = self.read();
        let dir = st.namespace.get_dir(path)?;
        let mut out = Vec::with_capacity(dir.files.len() + dir.dirs.len());
        for (name, f) in &dir.files {
            out.push(ListEntry {
                name: name.clone(),
                kind: EntryKind::File,
                size: f.size,
                mod_time: f.metadata.mod_time,
                create_time: f.metadata.create_time,
                block_count: f.data_block_count + f.index_block_count,
            });
        }
        for (name, d) in &dir.dirs {
            out.push(ListEntry {
                name: name.clone(),
                kind: EntryKind::Directory,
                size: 0,
                mod_time: d.metadata.mod_time,
                create_time: d.metadata.create_time,
                block_count: 0,
            });
        }
        Ok(out)
    }

    /// List the root directory's entries.
    pub fn ls_all(&self) -> Result<Vec<ListEntry>> {
        self.ls("/")
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        let st = self.read();
        if path::is_root(path) {
            let dir = &st.namespace.root;
            return Ok(Stat {
                kind: EntryKind::Directory,
                size: 0,
                mod_time: dir.metadata.mod_time,
                create_time: dir.metadata.create_time,
                permissions: dir.metadata.permissions,
                index_block_count: 0,
                data_block_count: 0,
            });
        }
        if let Ok(dir) = st.namespace.get_dir(path) {
            return Ok(Stat {
                kind: EntryKind::Directory,
                size: 0,
                mod_time: dir.metadata.mod_time,
                create_time: dir.metadata.create_time,
                permissions: dir.metadata.permissions,
                index_block_count: 0,
                data_block_count: 0,
            });
        }
        let (_, entry) = st.namespace.get_file(path)?;
        if st.namespace.checksum_enabled && entry.metadata.crc32 != 0 && !entry.metadata.verify_crc()
        {
            error!("metadata checksum mismatch for {path}");
            return Err(YfsError::checksum_mismatch(path.to_string()));
        }
        Ok(Stat {
            kind: EntryKind::File,
            size: entry.size,
            mod_time: entry.metadata.mod_time,
            create_time: entry.metadata.create_time,
            permissions: entry.metadata.permissions,
            index_block_count: entry.index_block_count,
            data_block_count: entry.data_block_count,
        })
    }

    /// Flush the namespace and bitmap to disk if either is dirty; a no-op
    /// otherwise.
    pub fn sync(&self) -> Result<()> {
        self.write().sync()
    }

    /// Reset the allocator's rotating scan hint back to the start of the
    /// bitmap.
    pub fn defragment(&self) -> Result<()> {
        let mut st = self.write();
        st.bitmap.reset_search_pos();
        debug!("defragment: bitmap search position reset to 0");
        st.sync()
    }

    pub fn get_stats(&self) -> Result<Stats> {
        let st = self.read();
        let blocks_file_size = st.device.file_len()?;
        // Blocks physically present in blocks.glob, as opposed to the
        // bitmap's (possibly larger, since it grows ahead of use) capacity.
        let allocated_blocks = blocks_file_size.saturating_sub(4) / st.device.block_size() as u64;
        Ok(Stats {
            version: st.namespace.version,
            block_size: st.device.block_size(),
            total_blocks: st.bitmap.total_blocks(),
            allocated_blocks,
            used_blocks: st.bitmap.used_blocks(),
            free_blocks: st.bitmap.total_blocks() - st.bitmap.used_blocks(),
            checksum_enabled: st.namespace.checksum_enabled,
            bitmap_search_pos: st.bitmap.search_pos(),
            blocks_file_size,
        })
    }

    /// Walk every file's index chain, checking for cycles, out-of-range
    /// block references, and metadata checksum mismatches. Does not repair
    /// anything it finds, matching the design's best-effort consistency
    /// model. On success, also cross-checks every chain's footprint against
    /// the bitmap and logs (but does not fail on) any mismatch — neither
    /// direction of that mismatch is treated as fatal.
    pub fn verify_integrity(&self) -> Result<()> {
        let st = self.read();
        let checksum_enabled = st.namespace.checksum_enabled;
        let mut referenced = HashSet::new();
        Self::verify_dir(&st, &st.namespace.root, "/", checksum_enabled, &mut referenced)?;
        Self::check_for_leaks(&st, &referenced);
        Ok(())
    }

    fn verify_dir(
        st: &State,
        dir: &crate::namespace::DirectoryEntry,
        path: &str,
        checksum_enabled: bool,
        referenced: &mut HashSet<u32>,
    ) -> Result<()> {
        if checksum_enabled && dir.metadata.crc32 != 0 && !dir.metadata.verify_crc() {
            error!("directory metadata checksum mismatch at {path}");
            return Err(YfsError::checksum_mismatch(path.to_string()));
        }
        for (name, f) in &dir.files {
            if checksum_enabled && f.metadata.crc32 != 0 && !f.metadata.verify_crc() {
                error!("file metadata checksum mismatch at {path}{name}");
                return Err(YfsError::checksum_mismatch(format!("{path}{name}")));
            }
            if f.first_index_block_id != 0 {
                IndexChain::walk_for_integrity(
                    &st.device,
                    &st.bitmap,
                    f.first_index_block_id,
                    checksum_enabled,
                    referenced,
                )?;
            }
        }
        for (name, d) in &dir.dirs {
            let child_path = if path.ends_with('/') {
                format!("{path}{name}/")
            } else {
                format!("{path}/{name}/")
            };
            Self::verify_dir(st, d, &child_path, checksum_enabled, referenced)?;
        }
        Ok(())
    }

    /// Cross-check the set of blocks reachable from the namespace's chains
    /// against the bitmap's used set. The design tolerates leaked blocks
    /// (marked used but unreferenced) as an accepted consequence of a crash
    /// between mutating state and persisting it, and neither direction of
    /// mismatch is treated as a hard failure here — only logged.
    fn check_for_leaks(st: &State, referenced: &HashSet<u32>) {
        let used: HashSet<u32> = st.bitmap.used_block_ids().into_iter().collect();
        let leaked = used.difference(referenced).count();
        if leaked > 0 {
            warn!("verify_integrity: {leaked} block(s) marked used in the bitmap but not referenced by any chain");
        }
        let unmarked = referenced.difference(&used).count();
        if unmarked > 0 {
            warn!("verify_integrity: {unmarked} block(s) referenced by a chain but not marked used in the bitmap");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_small_file() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        engine.write_file("/a.txt", b"hello").unwrap();
        assert_eq!(engine.read_file("/a.txt").unwrap(), b"hello");
        let entries = engine.ls("/").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].size, 5);
    }

    #[test]
    fn multi_index_chain_large_file() {
        let dir = tempdir().unwrap();
        let options = EngineOptions {
            block_size: 128,
            checksum_enabled: true,
            max_ids_per_index: 1000,
        };
        let engine = Engine::open_paths(
            dir.path().join("root.yfs"),
            dir.path().join("bitmap.yfs"),
            dir.path().join("blocks.glob"),
            options,
        )
        .unwrap();
        let payload = vec![0x5Au8; 200_000];
        engine.write_file("/big.bin", &payload).unwrap();
        let stat = engine.stat("/big.bin").unwrap();
        // Usable payload per block is block_size - 4 (the length prefix),
        // per the framing rule in the design notes, not the raw block size.
        let per_block = 128 - 4;
        let expected_data_blocks = payload.len().div_ceil(per_block) as u32;
        assert_eq!(stat.data_block_count, expected_data_blocks);
        assert_eq!(stat.index_block_count, expected_data_blocks.div_ceil(1000));
        assert_eq!(engine.read_file("/big.bin").unwrap(), payload);
    }

    #[test]
    fn overwrite_shrinks_allocation() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        let n0 = engine.get_stats().unwrap().used_blocks;
        engine.write_file("/x", &vec![b'A'; 10_000]).unwrap();
        let n1 = engine.get_stats().unwrap().used_blocks;
        engine.write_file("/x", b"short").unwrap();
        let n2 = engine.get_stats().unwrap().used_blocks;
        assert!(n2 < n1);
        assert_eq!(n2, n0 + 2);
    }

    #[test]
    fn move_preserves_bytes_and_removes_source() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        engine.write_file("/a", b"payload").unwrap();
        engine.move_file("/a", "/d/b").unwrap();
        assert_eq!(engine.read_file("/d/b").unwrap(), b"payload");
        assert!(matches!(engine.read_file("/a"), Err(YfsError::NotFound(_))));
        let entries = engine.ls("/d").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
    }

    #[test]
    fn copy_produces_independent_chain() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        engine.write_file("/a", b"X").unwrap();
        engine.copy_file("/a", "/b").unwrap();
        engine.write_file("/a", b"Y").unwrap();
        assert_eq!(engine.read_file("/a").unwrap(), b"Y");
        assert_eq!(engine.read_file("/b").unwrap(), b"X");
    }

    #[test]
    fn reopen_after_sync_preserves_state() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(dir.path()).unwrap();
            engine.write_file("/a.txt", b"hello").unwrap();
            engine.sync().unwrap();
        }
        let engine = Engine::open(dir.path()).unwrap();
        assert_eq!(engine.read_file("/a.txt").unwrap(), b"hello");
    }

    #[test]
    fn delete_non_empty_directory_fails() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        engine.write_file("/a/b.txt", b"x").unwrap();
        assert!(matches!(
            engine.delete_directory("/a"),
            Err(YfsError::NotEmpty(_))
        ));
    }

    #[test]
    fn delete_root_fails() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        assert!(engine.delete_directory("/").is_err());
    }

    #[test]
    fn verify_integrity_passes_on_healthy_volume() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        engine.write_file("/a.txt", b"hello").unwrap();
        engine.write_file("/b.txt", &vec![3u8; 5000]).unwrap();
        engine.verify_integrity().unwrap();
    }

    #[test]
    fn delete_frees_blocks() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        engine.write_file("/a.txt", &vec![1u8; 10_000]).unwrap();
        let used_before = engine.get_stats().unwrap().used_blocks;
        engine.delete_file("/a.txt").unwrap();
        let used_after = engine.get_stats().unwrap().used_blocks;
        assert!(used_after < used_before);
    }

    #[test]
    fn verify_integrity_rejects_a_cycle() {
        use crate::index::IndexBlock;

        let dir = tempdir().unwrap();
        let options = EngineOptions {
            block_size: 64,
            checksum_enabled: true,
            max_ids_per_index: 1,
        };
        let engine = Engine::open_paths(
            dir.path().join("root.yfs"),
            dir.path().join("bitmap.yfs"),
            dir.path().join("blocks.glob"),
            options,
        )
        .unwrap();
        // With max_ids_per_index == 1, a two-data-block file yields a
        // two-element index chain.
        engine.write_file("/a", &vec![1u8; 120]).unwrap();
        let head = engine.stat("/a").unwrap();
        assert_eq!(head.index_block_count, 2);

        let st = engine.write();
        let first_head = st.namespace.get_file("/a").unwrap().1.first_index_block_id;
        let raw = st.device.read_block(first_head).unwrap();
        let first = IndexBlock::decode(&raw).unwrap();
        let second_id = first.next;
        let raw2 = st.device.read_block(second_id).unwrap();
        let mut second = IndexBlock::decode(&raw2).unwrap();
        second.next = first_head;
        second.recompute_crc();
        st.device.write_block(second_id, &second.encode()).unwrap();
        drop(st);

        assert!(matches!(
            engine.verify_integrity(),
            Err(YfsError::CorruptChain(_))
        ));
    }

    #[test]
    fn disabled_checksums_tolerate_a_corrupted_index_block() {
        use crate::index::IndexBlock;

        let dir = tempdir().unwrap();
        let options = EngineOptions {
            checksum_enabled: false,
            ..EngineOptions::default()
        };
        let engine = Engine::open_paths(
            dir.path().join("root.yfs"),
            dir.path().join("bitmap.yfs"),
            dir.path().join("blocks.glob"),
            options,
        )
        .unwrap();
        engine.write_file("/a.txt", b"hello").unwrap();

        let st = engine.write();
        let head = st.namespace.get_file("/a.txt").unwrap().1.first_index_block_id;
        let raw = st.device.read_block(head).unwrap();
        let mut block = IndexBlock::decode(&raw).unwrap();
        block.crc32 ^= 0xFFFF_FFFF;
        st.device.write_block(head, &block.encode()).unwrap();
        drop(st);

        assert_eq!(engine.read_file("/a.txt").unwrap(), b"hello");
        engine.verify_integrity().unwrap();
    }

    #[test]
    fn verify_integrity_tolerates_a_leaked_block() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        engine.write_file("/a.txt", b"hello").unwrap();

        // Allocate a block directly through the bitmap, bypassing the index
        // chain machinery entirely -- marked used but referenced by no
        // chain, i.e. a leak rather than a corruption.
        let mut st = engine.write();
        st.bitmap.allocate(1).unwrap();
        drop(st);

        // verify_integrity logs the leak but still succeeds.
        engine.verify_integrity().unwrap();
    }
}
