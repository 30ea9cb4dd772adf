//! # RedSea
//!
//! Driver for the RedSea filesystem, the contiguous-allocation on-disk
//! format used as the distribution medium of a hobby operating system.
//!
//! The crate mounts a RedSea volume from any byte-addressable block device,
//! services directory traversal, reads and writes regular files, creates and
//! removes entries, and reports volume statistics. Files occupy a single
//! contiguous run of 512-byte sectors; growing a file past a busy neighbour
//! relocates the whole run.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use redsea_fs::fs::MountOptionsBuilder;
//! use redsea_fs::vfs::{AccessMode, RedSeaFs};
//!
//! let device = std::fs::File::options()
//!     .read(true)
//!     .write(true)
//!     .open("/dev/disk/redsea")
//!     .unwrap();
//!
//! let options = MountOptionsBuilder::default().build().unwrap();
//! let fs = RedSeaFs::mount(device, options).unwrap();
//!
//! let ino = fs.lookup(fs.root_ino(), "Boot.BIN").unwrap();
//! let cookie = fs.open(ino, AccessMode::ReadOnly, false).unwrap();
//!
//! let mut buffer = [0u8; 512];
//! let read = fs.read(&cookie, 0, &mut buffer).unwrap();
//! println!("read {read} bytes");
//! ```

/// Sector allocation bitmap and its first-fit allocator
pub mod bitmap;
/// Boot record (superblock) parsing
pub mod boot;
/// Directory abstractions
pub mod dir;
/// Positioned block I/O
pub mod disk;
pub mod error;
/// Volume engine and file views
pub mod fs;
/// Host VFS adapter
pub mod vfs;

#[cfg(test)]
pub(crate) mod testutil;

/// Unit of volume addressing. All on-disk structures are sector aligned.
pub const SECTOR_SIZE: u64 = 512;

/// Number of sectors needed to hold `bytes` bytes of payload.
pub(crate) fn sectors_for(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE)
}
