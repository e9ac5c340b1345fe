//! A self-contained, single-host filesystem stored in three sidecar files
//! on the host filesystem: `root.yfs` (namespace), `bitmap.yfs` (free-block
//! bitmap), and `blocks.glob` (fixed-size block store).
//!
//! The [`Engine`] is the public entry point: it owns the three on-disk
//! artifacts and exposes POSIX-like file operations over the namespace they
//! describe. Everything else in this crate — the block device, the bitmap
//! allocator, the index-chain manager, and the namespace store — is an
//! internal collaborator the engine orchestrates under a single
//! reader-writer lock.

pub mod bitmap;
pub mod block;
pub mod crc;
pub mod engine;
pub mod error;
pub mod index;
pub mod namespace;
pub mod path;
mod serialize;

pub use engine::{Engine, EngineOptions, EntryKind, ListEntry, Stat, Stats};
pub use error::{Result, YfsError};
