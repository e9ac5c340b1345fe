//! Namespace Store: the in-memory directory tree, persisted whole to
//! `root.yfs` on every successful mutation.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crc::crc32;
use crate::error::{Result, YfsError};
use crate::path;
use crate::serialize::{Reader, Writer};

const FORMAT_VERSION: u32 = 1;

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Metadata shared by files and directories.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub name: String,
    pub mod_time: i64,
    pub create_time: i64,
    pub permissions: u32,
    pub crc32: u32,
}

impl FileMetadata {
    pub fn new(name: impl Into<String>, permissions: u32) -> Self {
        let t = now();
        let mut m = Self {
            name: name.into(),
            mod_time: t,
            create_time: t,
            permissions,
            crc32: 0,
        };
        m.recompute_crc();
        m
    }

    /// CRC-32/IEEE over `name || mod_time || create_time || permissions`,
    /// each integer rendered in decimal — a cheap, endian-independent check,
    /// not a cryptographic one.
    pub fn recompute_crc(&mut self) {
        let joined = format!(
            "{}{}{}{}",
            self.name, self.mod_time, self.create_time, self.permissions
        );
        self.crc32 = crc32(joined.as_bytes());
    }

    pub fn verify_crc(&self) -> bool {
        let joined = format!(
            "{}{}{}{}",
            self.name, self.mod_time, self.create_time, self.permissions
        );
        self.crc32 == crc32(joined.as_bytes())
    }

    fn encode(&self, w: &mut Writer) {
        w.write_str(&self.name);
        w.write_i64(self.mod_time);
        w.write_i64(self.create_time);
        w.write_u32(self.permissions);
        w.write_u32(self.crc32);
    }

    fn decode(r: &mut Reader) -> Result<Self> {
        Ok(Self {
            name: r.read_str()?,
            mod_time: r.read_i64()?,
            create_time: r.read_i64()?,
            permissions: r.read_u32()?,
            crc32: r.read_u32()?,
        })
    }
}

/// A regular file: metadata plus a pointer to its index chain.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub metadata: FileMetadata,
    pub first_index_block_id: u32,
    pub size: i64,
    pub index_block_count: u32,
    pub data_block_count: u32,
}

impl FileEntry {
    fn encode(&self, w: &mut Writer) {
        self.metadata.encode(w);
        w.write_u32(self.first_index_block_id);
        w.write_i64(self.size);
        w.write_u32(self.index_block_count);
        w.write_u32(self.data_block_count);
    }

    fn decode(r: &mut Reader) -> Result<Self> {
        Ok(Self {
            metadata: FileMetadata::decode(r)?,
            first_index_block_id: r.read_u32()?,
            size: r.read_i64()?,
            index_block_count: r.read_u32()?,
            data_block_count: r.read_u32()?,
        })
    }
}

/// A directory: metadata plus named file and subdirectory maps.
///
/// `BTreeMap` gives deterministic, sorted-by-name iteration — the design
/// only requires "insertion order is not observable", and sorted order is
/// the cheapest way to make the on-disk bytes reproducible for identical
/// input, which the root.yfs wire format calls for.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub metadata: FileMetadata,
    pub files: BTreeMap<String, FileEntry>,
    pub dirs: BTreeMap<String, DirectoryEntry>,
}

impl DirectoryEntry {
    fn new_root() -> Self {
        Self {
            metadata: FileMetadata::new("/", 0o755),
            files: BTreeMap::new(),
            dirs: BTreeMap::new(),
        }
    }

    fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: FileMetadata::new(name, 0o755),
            files: BTreeMap::new(),
            dirs: BTreeMap::new(),
        }
    }

    fn encode(&self, w: &mut Writer) {
        self.metadata.encode(w);
        w.write_varint(self.files.len() as u64);
        for (name, f) in &self.files {
            w.write_str(name);
            f.encode(w);
        }
        w.write_varint(self.dirs.len() as u64);
        for (name, d) in &self.dirs {
            w.write_str(name);
            d.encode(w);
        }
    }

    fn decode(r: &mut Reader) -> Result<Self> {
        let metadata = FileMetadata::decode(r)?;
        let n_files = r.read_varint()?;
        let mut files = BTreeMap::new();
        for _ in 0..n_files {
            let name = r.read_str()?;
            files.insert(name, FileEntry::decode(r)?);
        }
        let n_dirs = r.read_varint()?;
        let mut dirs = BTreeMap::new();
        for _ in 0..n_dirs {
            let name = r.read_str()?;
            dirs.insert(name, DirectoryEntry::decode(r)?);
        }
        Ok(Self {
            metadata,
            files,
            dirs,
        })
    }

    /// Recompute this directory's own CRC and every descendant's, in place.
    fn recompute_crcs(&mut self) {
        self.metadata.recompute_crc();
        for f in self.files.values_mut() {
            f.metadata.recompute_crc();
        }
        for d in self.dirs.values_mut() {
            d.recompute_crcs();
        }
    }
}

/// The in-memory directory tree plus the header fields persisted alongside
/// it in `root.yfs`.
pub struct NamespaceStore {
    pub version: u32,
    pub block_size: u32,
    pub root: DirectoryEntry,
    pub checksum_enabled: bool,
}

impl NamespaceStore {
    pub fn new(block_size: u32, checksum_enabled: bool) -> Self {
        Self {
            version: FORMAT_VERSION,
            block_size,
            root: DirectoryEntry::new_root(),
            checksum_enabled,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read(path)?;
        let mut r = Reader::new(&raw);
        let version = r.read_u32()?;
        let block_size = r.read_u32()?;
        let root = DirectoryEntry::decode(&mut r)?;
        let _total_blocks = r.read_u64()?;
        let checksum_enabled = r.read_u32()? != 0;
        Ok(Self {
            version,
            block_size,
            root,
            checksum_enabled,
        })
    }

    /// Serialize the whole tree and replace `root.yfs` wholesale.
    ///
    /// `total_blocks` is threaded in from the bitmap at save time rather
    /// than cached here, since the bitmap is the source of truth for
    /// capacity.
    pub fn save(&mut self, path: impl AsRef<Path>, total_blocks: u64) -> Result<()> {
        self.root.recompute_crcs();
        let mut w = Writer::new();
        w.write_u32(self.version);
        w.write_u32(self.block_size);
        self.root.encode(&mut w);
        w.write_u64(total_blocks);
        w.write_u32(self.checksum_enabled as u32);
        fs::write(path, w.into_bytes())?;
        Ok(())
    }

    /// Walk to the directory named by `path`, creating every missing
    /// intermediate directory (including `path` itself) along the way.
    /// Fails `NotADirectory` if any component along the way already exists
    /// as a file. This is the "materialize missing parents" step `write_file`
    /// and `mkdir` both rely on.
    pub fn create_directory_chain(&mut self, path: &str) -> Result<&mut DirectoryEntry> {
        let components = path::components(path);
        self.resolve_dir_mut_creating(&components, path)
    }

    /// Create `path` as a new, empty directory. Errors `AlreadyExists` if a
    /// directory or file already sits at that path; missing parent
    /// directories are created implicitly, mirroring `write_file`.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let (parent_components, name) = path::split(path)
            .ok_or_else(|| YfsError::AlreadyExists("/".to_string()))?;
        if !path::is_valid_name(name) {
            return Err(YfsError::NotFound(path.to_string()));
        }
        let parent = self.create_directory_chain(&path::join(&parent_components))?;
        if parent.dirs.contains_key(name) || parent.files.contains_key(name) {
            return Err(YfsError::AlreadyExists(path.to_string()));
        }
        parent.dirs.insert(name.to_string(), DirectoryEntry::new(name));
        parent.metadata.mod_time = now();
        Ok(())
    }

    /// Remove an empty, non-root directory.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        if path::is_root(path) {
            return Err(YfsError::IsADirectory("/ is root".to_string()));
        }
        let (parent_components, name) = path::split(path).expect("non-root path has a final component");
        let parent = self.resolve_dir_mut(&parent_components, path)?;
        match parent.dirs.get(name) {
            None => {
                if parent.files.contains_key(name) {
                    Err(YfsError::NotADirectory(path.to_string()))
                } else {
                    Err(YfsError::not_found(path))
                }
            }
            Some(d) if !d.files.is_empty() || !d.dirs.is_empty() => {
                Err(YfsError::NotEmpty(path.to_string()))
            }
            Some(_) => {
                parent.dirs.remove(name);
                parent.metadata.mod_time = now();
                Ok(())
            }
        }
    }

    /// Look up the directory at `path` for reading (`ls`, `stat`).
    pub fn get_dir(&self, path: &str) -> Result<&DirectoryEntry> {
        let components = path::components(path);
        let mut dir = &self.root;
        for name in components {
            dir = dir
                .dirs
                .get(name)
                .ok_or_else(|| YfsError::not_found(path))?;
        }
        Ok(dir)
    }

    /// Look up a file entry and its containing directory.
    pub fn get_file(&self, path: &str) -> Result<(&DirectoryEntry, &FileEntry)> {
        let (parent_components, name) =
            path::split(path).ok_or_else(|| YfsError::IsADirectory(path.to_string()))?;
        let parent = self.get_dir(&path::join(&parent_components))?;
        let entry = parent
            .files
            .get(name)
            .ok_or_else(|| YfsError::not_found(path))?;
        Ok((parent, entry))
    }

    /// Insert or replace the file entry at `path`, creating missing
    /// parents. Errors `IsADirectory` if `path` already names a directory.
    pub fn put_file(&mut self, path: &str, entry: FileEntry) -> Result<()> {
        let (parent_components, name) =
            path::split(path).ok_or_else(|| YfsError::IsADirectory(path.to_string()))?;
        if !path::is_valid_name(name) {
            return Err(YfsError::not_found(path));
        }
        let parent = self.create_directory_chain(&path::join(&parent_components))?;
        if parent.dirs.contains_key(name) {
            return Err(YfsError::IsADirectory(path.to_string()));
        }
        parent.files.insert(name.to_string(), entry);
        parent.metadata.mod_time = now();
        Ok(())
    }

    /// Remove and return the file entry at `path`.
    pub fn take_file(&mut self, path: &str) -> Result<FileEntry> {
        let (parent_components, name) =
            path::split(path).ok_or_else(|| YfsError::IsADirectory(path.to_string()))?;
        let parent = self.resolve_dir_mut(&parent_components, path)?;
        if parent.dirs.contains_key(name) {
            return Err(YfsError::IsADirectory(path.to_string()));
        }
        let entry = parent
            .files
            .remove(name)
            .ok_or_else(|| YfsError::not_found(path))?;
        parent.metadata.mod_time = now();
        Ok(entry)
    }

    fn resolve_dir_mut(&mut self, components: &[&str], context: &str) -> Result<&mut DirectoryEntry> {
        let mut dir = &mut self.root;
        for name in components {
            dir = dir
                .dirs
                .get_mut(*name)
                .ok_or_else(|| YfsError::not_found(context))?;
        }
        Ok(dir)
    }

    fn resolve_dir_mut_creating(
        &mut self,
        components: &[&str],
        context: &str,
    ) -> Result<&mut DirectoryEntry> {
        let mut dir = &mut self.root;
        for name in components {
            if dir.files.contains_key(*name) {
                return Err(YfsError::NotADirectory(context.to_string()));
            }
            dir = dir
                .dirs
                .entry(name.to_string())
                .or_insert_with(|| DirectoryEntry::new(*name));
        }
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_entry(name: &str) -> FileEntry {
        FileEntry {
            metadata: FileMetadata::new(name, 0o644),
            first_index_block_id: 0,
            size: 0,
            index_block_count: 0,
            data_block_count: 0,
        }
    }

    #[test]
    fn put_file_creates_missing_parents() {
        let mut ns = NamespaceStore::new(128, true);
        ns.put_file("/a/b/c.txt", file_entry("c.txt")).unwrap();
        let dir = ns.get_dir("/a/b").unwrap();
        assert!(dir.files.contains_key("c.txt"));
    }

    #[test]
    fn create_directory_chain_materializes_every_missing_parent() {
        let mut ns = NamespaceStore::new(128, true);
        ns.create_directory_chain("/a/b/c").unwrap();
        assert!(ns.get_dir("/a/b/c").is_ok());
        assert!(ns.get_dir("/a/b").is_ok());
        assert!(ns.get_dir("/a").is_ok());
    }

    #[test]
    fn create_directory_chain_rejects_a_file_in_the_way() {
        let mut ns = NamespaceStore::new(128, true);
        ns.put_file("/a", file_entry("a")).unwrap();
        let err = ns.create_directory_chain("/a/b").unwrap_err();
        assert!(matches!(err, YfsError::NotADirectory(_)));
    }

    #[test]
    fn put_file_rejects_existing_directory_target() {
        let mut ns = NamespaceStore::new(128, true);
        ns.mkdir("/a").unwrap();
        let err = ns.put_file("/a", file_entry("a")).unwrap_err();
        assert!(matches!(err, YfsError::IsADirectory(_)));
    }

    #[test]
    fn mkdir_then_duplicate_errors() {
        let mut ns = NamespaceStore::new(128, true);
        ns.mkdir("/a").unwrap();
        let err = ns.mkdir("/a").unwrap_err();
        assert!(matches!(err, YfsError::AlreadyExists(_)));
    }

    #[test]
    fn rmdir_rejects_non_empty_and_root() {
        let mut ns = NamespaceStore::new(128, true);
        ns.put_file("/a/b.txt", file_entry("b.txt")).unwrap();
        assert!(matches!(ns.rmdir("/a"), Err(YfsError::NotEmpty(_))));
        assert!(matches!(ns.rmdir("/"), Err(YfsError::IsADirectory(_))));
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut ns = NamespaceStore::new(256, true);
        ns.put_file("/x.txt", file_entry("x.txt")).unwrap();
        ns.mkdir("/dir").unwrap();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        ns.save(tmp.path(), 100).unwrap();

        let reloaded = NamespaceStore::load(tmp.path()).unwrap();
        assert_eq!(reloaded.block_size, 256);
        assert!(reloaded.get_file("/x.txt").is_ok());
        assert!(reloaded.get_dir("/dir").is_ok());
    }

    #[test]
    fn metadata_crc_verifies_after_round_trip() {
        let mut ns = NamespaceStore::new(256, true);
        ns.put_file("/x.txt", file_entry("x.txt")).unwrap();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        ns.save(tmp.path(), 10).unwrap();
        let reloaded = NamespaceStore::load(tmp.path()).unwrap();
        let (_, entry) = reloaded.get_file("/x.txt").unwrap();
        assert!(entry.metadata.verify_crc());
    }
}
