//! Reflink-aware POSIX tar archiving and extraction.
//!
//! Regular-file payloads are shared between the archive and the
//! source/destination files through the `FICLONERANGE` ioctl on
//! copy-on-write filesystems (btrfs, XFS with reflink, bcachefs). Tar
//! headers are grown with PAX padding records so that payloads land on
//! filesystem page boundaries, which the ioctl requires. Where extent
//! sharing is impossible the data path falls back to in-kernel
//! `copy_file_range`, never buffering file contents in user space.

pub mod chroot;
pub mod create;
pub mod extract;
pub mod header;
pub mod progress;
pub mod reflink;
pub mod tools;

/// Tar stream granularity; headers and bodies are padded to this.
pub const BLOCK_SIZE: u64 = 512;

/// Extent-sharing alignment unit of the supported filesystems.
pub const PAGE_SIZE: u64 = 4096;
