//! Storage core for a versioning filesystem: a delta-indexed buffer
//! cache with a buffer-fork protocol, a generic B+ tree engine, an
//! extent mapping layer, a block-bitmap allocator, an inode table, and
//! the [`mount::Mount`] that wires them into one cooperative
//! frontend/backend delta model.
//!
//! This crate has no notion of threads, files-on-disk beyond a single
//! [`device::Device`], or a network — it is the engine a filesystem
//! frontend (FUSE, a kernel module, a CLI) would drive.

pub mod alloc;
pub mod btree;
pub mod buffer;
pub mod delta;
pub mod device;
pub mod error;
pub mod extent;
pub mod inode;
pub mod leaf;
pub mod mount;
pub mod superblock;

#[cfg(test)]
pub(crate) mod testkit;

pub use device::{BlockT, Device, FileDevice};
pub use error::{Error, Result};
pub use mount::{Mount, MountConfig};
