//! The two kernel-side data transports: extent sharing via the
//! `FICLONERANGE` ioctl, and `copy_file_range` as the fallback.

use std::os::unix::io::RawFd;

use anyhow::{bail, Error};
use nix::errno::Errno;
use nix::fcntl;

/// Argument block of the `FICLONERANGE` ioctl, see `ioctl_ficlonerange(2)`.
#[repr(C)]
#[derive(Debug, Default)]
struct FileCloneRange {
    src_fd: i64,
    src_offset: u64,
    src_length: u64,
    dest_offset: u64,
}

nix::ioctl_write_ptr!(ficlonerange, 0x94, 13, FileCloneRange);

/// Share `len` bytes of `src_fd` at `src_offset` into `dst_fd` at
/// `dest_offset` without copying.
///
/// A `len` of 0 means "up to the end of the source file". Offsets and `len`
/// must be multiples of the filesystem block size, except that a
/// to-the-end range may cover the terminal partial block; callers split
/// off any other sub-block spill themselves.
pub fn try_clone(
    src_fd: RawFd,
    src_offset: u64,
    len: u64,
    dst_fd: RawFd,
    dest_offset: u64,
) -> nix::Result<()> {
    let range = FileCloneRange {
        src_fd: i64::from(src_fd),
        src_offset,
        src_length: len,
        dest_offset,
    };
    unsafe { ficlonerange(dst_fd, &range) }.map(drop)
}

/// Whether a failed clone attempt means "reflink is impossible here" (cross
/// device, filesystem without the feature, misalignment) rather than a real
/// I/O failure. Callers fall back to [`copy_range`] for these.
pub fn clone_impossible(errno: Errno) -> bool {
    matches!(
        errno,
        Errno::EXDEV
            | Errno::EOPNOTSUPP
            | Errno::ENOTTY
            | Errno::ENOSYS
            | Errno::EINVAL
            | Errno::EBADF
    )
}

/// In-kernel byte copy with the same post-condition as [`try_clone`]: `len`
/// bytes of `src_fd` at `src_off` become observable at `dst_off` of
/// `dst_fd`. Neither descriptor's file offset is disturbed.
pub fn copy_range(
    src_fd: RawFd,
    src_off: i64,
    len: u64,
    dst_fd: RawFd,
    dst_off: i64,
) -> Result<(), Error> {
    let mut src_off = src_off;
    let mut dst_off = dst_off;
    let mut remaining = len;
    while remaining > 0 {
        let copied = fcntl::copy_file_range(
            src_fd,
            Some(&mut src_off),
            dst_fd,
            Some(&mut dst_off),
            remaining as usize,
        )?;
        if copied == 0 {
            break;
        }
        remaining -= copied as u64;
    }
    if remaining > 0 {
        bail!("short transfer: {} bytes, expected: {}", len - remaining, len);
    }
    Ok(())
}
