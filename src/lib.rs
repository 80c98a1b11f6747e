//! Core of the SimpleFS disk-image format.
//!
//! A SimpleFS volume is a single host file (or block device) cut into
//! 4096-byte blocks: a superblock, an inode table covering a tenth of the
//! disk, and a data region. The [`disk`] module moves whole blocks, [`block`]
//! decodes and encodes the on-disk structures, and [`fs`] implements the
//! inode-level operations on top of them. The free-block bitmap ([`bitmap`])
//! exists only in memory; it is rebuilt from the inode table on every mount.

pub mod bitmap;
pub mod block;
pub mod disk;
pub mod fs;

pub use disk::Disk;
pub use fs::{FileSystem, FsError, MountError};
