//! Block Device: byte-accurate read/write of fixed-size blocks against a
//! single host file (`blocks.glob`).
//!
//! Layout:
//! ```text
//! [0..4)   header: block_size, little-endian u32
//! [4..)    block 1, block 2, ... each exactly block_size bytes
//! ```
//! Block `k` (1-based) begins at offset `4 + (k - 1) * block_size`. The
//! first four bytes of every block's payload area hold the payload length
//! `L` as a little-endian u32; bytes `[4..4+L)` of the block are the
//! payload, the rest is undefined padding.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Result, YfsError};

const HEADER_LEN: u64 = 4;
const LENGTH_PREFIX: usize = 4;

/// Bytes of actual payload a block of size `block_size` can hold, after
/// reserving the 4-byte length prefix.
pub fn data_per_block(block_size: u32) -> usize {
    block_size as usize - LENGTH_PREFIX
}

/// Owns the host file backing `blocks.glob`.
///
/// The handle is wrapped in a `Mutex` rather than re-opened per call:
/// concurrent readers holding the engine's shared read lock still share one
/// file descriptor with one seek position, so the actual `seek`+`read`/
/// `write` pair around each block access needs its own short-lived
/// exclusion independent of the engine's reader-writer lock.
pub struct BlockDevice {
    file: Mutex<File>,
    block_size: u32,
}

impl BlockDevice {
    /// Open an existing `blocks.glob`, reading and caching its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut header = [0u8; HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let block_size = u32::from_le_bytes(header);
        Ok(Self {
            file: Mutex::new(file),
            block_size,
        })
    }

    /// Create a new `blocks.glob` with the given block size, truncating any
    /// existing file at `path`.
    pub fn create(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&block_size.to_le_bytes())?;
        file.flush()?;
        Ok(Self {
            file: Mutex::new(file),
            block_size,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn data_per_block(&self) -> usize {
        data_per_block(self.block_size)
    }

    fn offset_of(&self, id: u32) -> Result<u64> {
        if id == 0 {
            return Err(YfsError::InvalidBlockId(id));
        }
        Ok(HEADER_LEN + (id as u64 - 1) * self.block_size as u64)
    }

    /// Read the payload stored in block `id`: the length-prefixed bytes,
    /// with the prefix and trailing padding stripped.
    pub fn read_block(&self, id: u32) -> Result<Vec<u8>> {
        let offset = self.offset_of(id)?;
        let mut file = self.file.lock().expect("blocks.glob file mutex poisoned");
        let len = file.metadata()?.len();
        if offset + self.block_size as u64 > len {
            return Err(YfsError::InvalidBlockId(id));
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut raw = vec![0u8; self.block_size as usize];
        file.read_exact(&mut raw)?;
        let payload_len = u32::from_le_bytes(raw[..LENGTH_PREFIX].try_into().unwrap()) as usize;
        let max = self.data_per_block();
        if payload_len > max {
            return Err(YfsError::CorruptChain(format!(
                "block {id} declares payload length {payload_len} exceeding capacity {max}"
            )));
        }
        Ok(raw[LENGTH_PREFIX..LENGTH_PREFIX + payload_len].to_vec())
    }

    /// Write `payload` into block `id`, zero-padding the rest of the block.
    /// Extends the host file if `id` is past the current end.
    pub fn write_block(&self, id: u32, payload: &[u8]) -> Result<()> {
        let max = self.data_per_block();
        if payload.len() > max {
            return Err(YfsError::OversizedPayload {
                len: payload.len(),
                max,
            });
        }
        let offset = self.offset_of(id)?;
        let mut raw = vec![0u8; self.block_size as usize];
        raw[..LENGTH_PREFIX].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        raw[LENGTH_PREFIX..LENGTH_PREFIX + payload.len()].copy_from_slice(payload);

        let mut file = self.file.lock().expect("blocks.glob file mutex poisoned");
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&raw)?;
        Ok(())
    }

    /// Size of the underlying host file, for `get_stats`.
    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.lock().expect("blocks.glob file mutex poisoned").metadata()?.len())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().expect("blocks.glob file mutex poisoned").flush()?;
        Ok(())
    }
}
