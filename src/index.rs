//! Index Chain Manager: maps a file's byte payload onto a chain of index
//! blocks, each naming the data blocks that make up part of the file.
//!
//! An index block is itself stored as the framed payload of one ordinary
//! block in `blocks.glob`. Its own record format (block IDs, extents, next
//! pointer, CRC) is encoded with the varint writer/reader in
//! [`crate::serialize`].

use std::collections::HashSet;

use log::error;

use crate::bitmap::Bitmap;
use crate::block::BlockDevice;
use crate::crc::crc32;
use crate::error::{Result, YfsError};
use crate::serialize::{Reader, Writer};

/// Default cap on how many data-block IDs a single index block may name
/// before the chain continues into another index block.
pub const MAX_IDS_PER_INDEX: usize = 1000;

/// A contiguous run of `count` data blocks starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: u32,
    pub count: u32,
}

/// One link in a file's index chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlock {
    pub block_ids: Vec<u32>,
    pub extents: Vec<Extent>,
    pub next: u32,
    pub data_size: u32,
    pub crc32: u32,
}

impl IndexBlock {
    fn crc_source(block_ids: &[u32], extents: &[Extent], next: u32) -> String {
        let ids = block_ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let ext = extents
            .iter()
            .map(|e| format!("{}:{}", e.start, e.count))
            .collect::<Vec<_>>()
            .join(",");
        format!("{ids}|{ext}|{next}")
    }

    fn new(block_ids: Vec<u32>, extents: Vec<Extent>, next: u32, data_size: u32) -> Self {
        let crc32 = crc32(Self::crc_source(&block_ids, &extents, next).as_bytes());
        Self {
            block_ids,
            extents,
            next,
            data_size,
            crc32,
        }
    }

    pub fn verify_crc(&self) -> bool {
        self.crc32 == crc32(Self::crc_source(&self.block_ids, &self.extents, self.next).as_bytes())
    }

    /// Recompute `crc32` in place after manually editing `next`/`block_ids`/
    /// `extents` — used by integrity tests that corrupt a chain in place.
    pub fn recompute_crc(&mut self) {
        self.crc32 = crc32(Self::crc_source(&self.block_ids, &self.extents, self.next).as_bytes());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_varint(self.block_ids.len() as u64);
        for id in &self.block_ids {
            w.write_u32(*id);
        }
        w.write_varint(self.extents.len() as u64);
        for e in &self.extents {
            w.write_u32(e.start);
            w.write_u32(e.count);
        }
        w.write_u32(self.next);
        w.write_u32(self.data_size);
        w.write_u32(self.crc32);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let n_ids = r.read_varint()?;
        let mut block_ids = Vec::with_capacity(n_ids as usize);
        for _ in 0..n_ids {
            block_ids.push(r.read_u32()?);
        }
        let n_ext = r.read_varint()?;
        let mut extents = Vec::with_capacity(n_ext as usize);
        for _ in 0..n_ext {
            let start = r.read_u32()?;
            let count = r.read_u32()?;
            extents.push(Extent { start, count });
        }
        let next = r.read_u32()?;
        let data_size = r.read_u32()?;
        let crc32 = r.read_u32()?;
        Ok(Self {
            block_ids,
            extents,
            next,
            data_size,
            crc32,
        })
    }

    /// All data block IDs named by this record, `block_ids` first, then
    /// each extent expanded to its constituent IDs — matching the read
    /// tie-break in the design (`block_ids` before extents).
    pub fn data_block_ids(&self) -> Vec<u32> {
        let mut out = self.block_ids.clone();
        for e in &self.extents {
            out.extend(e.start..e.start + e.count);
        }
        out
    }
}

/// Stateless namespace of index-chain operations; every method takes the
/// block device and bitmap it needs explicitly rather than owning them,
/// since both are already shared and locked by the engine facade.
pub struct IndexChain;

impl IndexChain {
    /// Replace the chain at `old_head` (if any) with a new chain holding
    /// `payload`, returning the new head (0 if `payload` is empty).
    ///
    /// On any failure after blocks have been reserved, every block
    /// allocated during this call is released before the error is
    /// returned — the old chain is left untouched in that case.
    pub fn store(
        device: &BlockDevice,
        bitmap: &mut Bitmap,
        payload: &[u8],
        old_head: u32,
        max_ids_per_index: usize,
    ) -> Result<u32> {
        if payload.is_empty() {
            if old_head != 0 {
                Self::release(device, bitmap, old_head)?;
            }
            return Ok(0);
        }

        let per_block = device.data_per_block();
        let n_data = payload.len().div_ceil(per_block);

        let mut allocated: Vec<u32> = Vec::new();
        let result = Self::write_chain(device, bitmap, payload, per_block, n_data, max_ids_per_index, &mut allocated);

        let new_head = match result {
            Ok(head) => head,
            Err(e) => {
                bitmap.free(&allocated);
                return Err(e);
            }
        };

        if old_head != 0 {
            Self::release(device, bitmap, old_head)?;
        }
        Ok(new_head)
    }

    fn write_chain(
        device: &BlockDevice,
        bitmap: &mut Bitmap,
        payload: &[u8],
        per_block: usize,
        n_data: usize,
        max_ids_per_index: usize,
        allocated: &mut Vec<u32>,
    ) -> Result<u32> {
        let data_ids = bitmap.allocate(n_data as u32)?;
        allocated.extend(&data_ids);

        for (i, &id) in data_ids.iter().enumerate() {
            let start = i * per_block;
            let end = (start + per_block).min(payload.len());
            device.write_block(id, &payload[start..end])?;
        }

        let chunks: Vec<&[u32]> = data_ids.chunks(max_ids_per_index).collect();
        let index_ids = bitmap.allocate(chunks.len() as u32)?;
        allocated.extend(&index_ids);

        for (i, (&index_id, chunk)) in index_ids.iter().zip(chunks.iter()).enumerate() {
            let next = if i + 1 < index_ids.len() {
                index_ids[i + 1]
            } else {
                0
            };
            let data_size = chunk
                .iter()
                .enumerate()
                .map(|(j, _)| {
                    let global = i * max_ids_per_index + j;
                    let start = global * per_block;
                    (payload.len() - start).min(per_block)
                })
                .sum::<usize>() as u32;
            let block = IndexBlock::new(chunk.to_vec(), Vec::new(), next, data_size);
            device.write_block(index_id, &block.encode())?;
        }

        Ok(index_ids[0])
    }

    /// Read `size` bytes from the chain starting at `head`.
    ///
    /// Each index block's CRC is checked only when `checksum_enabled` is
    /// set and the block's own `crc32` field is non-zero, matching the
    /// metadata-CRC rule: writers always populate CRCs, but a volume opened
    /// with checksums disabled skips verifying them.
    pub fn load(device: &BlockDevice, head: u32, size: u64, checksum_enabled: bool) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size as usize);
        let mut current = head;
        let mut visited = HashSet::new();
        while current != 0 && (out.len() as u64) < size {
            if !visited.insert(current) {
                error!("cycle detected at index block {current} while reading chain from {head}");
                return Err(YfsError::CorruptChain(format!(
                    "cycle detected at index block {current}"
                )));
            }
            let raw = device.read_block(current)?;
            let block = IndexBlock::decode(&raw)?;
            if checksum_enabled && block.crc32 != 0 && !block.verify_crc() {
                error!("checksum mismatch on index block {current}");
                return Err(YfsError::checksum_mismatch(format!(
                    "index block {current}"
                )));
            }
            for data_id in block.data_block_ids() {
                if (out.len() as u64) >= size {
                    break;
                }
                let data = device.read_block(data_id)?;
                out.extend_from_slice(&data);
            }
            current = block.next;
        }
        out.truncate(size as usize);
        Ok(out)
    }

    /// Free every data and index block reachable from `head`.
    pub fn release(device: &BlockDevice, bitmap: &mut Bitmap, head: u32) -> Result<()> {
        let mut current = head;
        let mut visited = HashSet::new();
        while current != 0 {
            if !visited.insert(current) {
                error!("cycle detected at index block {current} while releasing chain from {head}");
                return Err(YfsError::CorruptChain(format!(
                    "cycle detected at index block {current}"
                )));
            }
            let raw = device.read_block(current)?;
            let block = IndexBlock::decode(&raw)?;
            bitmap.free(&block.block_ids);
            for e in &block.extents {
                let ids: Vec<u32> = (e.start..e.start + e.count).collect();
                bitmap.free(&ids);
            }
            let next = block.next;
            bitmap.free(&[current]);
            current = next;
        }
        Ok(())
    }

    /// Walk the chain from `head`, detecting cycles and out-of-range
    /// references without materializing the file's contents. Used by
    /// `verify_integrity`, which also passes `referenced` so the caller can
    /// cross-check every chain's footprint against the bitmap afterward.
    ///
    /// As with [`Self::load`], each index block's CRC is only checked when
    /// `checksum_enabled` is set and the block's own `crc32` is non-zero.
    pub fn walk_for_integrity(
        device: &BlockDevice,
        bitmap: &Bitmap,
        head: u32,
        checksum_enabled: bool,
        referenced: &mut HashSet<u32>,
    ) -> Result<(u32, u32)> {
        let mut data_blocks = 0u32;
        let mut index_blocks = 0u32;
        let mut current = head;
        let mut visited = HashSet::new();
        while current != 0 {
            if !visited.insert(current) {
                error!("cycle detected at index block {current} while verifying chain from {head}");
                return Err(YfsError::CorruptChain(format!(
                    "cycle detected at index block {current}"
                )));
            }
            index_blocks += 1;
            referenced.insert(current);
            let raw = device.read_block(current)?;
            let block = IndexBlock::decode(&raw)?;
            if checksum_enabled && block.crc32 != 0 && !block.verify_crc() {
                error!("checksum mismatch on index block {current}");
                return Err(YfsError::checksum_mismatch(format!(
                    "index block {current}"
                )));
            }
            for id in block.data_block_ids() {
                if id == 0 || id as u64 > bitmap.total_blocks() {
                    error!("index block {current} references out-of-range block {id}");
                    return Err(YfsError::InvalidBlockId(id));
                }
                data_blocks += 1;
                referenced.insert(id);
            }
            current = block.next;
        }
        Ok((index_blocks, data_blocks))
    }
}
