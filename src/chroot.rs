//! Directory handles resolved strictly under an extraction root.
//!
//! Resolution uses `openat2(2)` with `RESOLVE_IN_ROOT`, so symlinks and
//! `..` components cannot escape the root and absolute names are
//! re-interpreted as root-relative. This needs Linux 5.6.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use anyhow::Error;
use nix::errno::Errno;
use nix::sys::stat::{self, Mode};

use crate::tools::op_err;

fn openat2_dir(dirfd: RawFd, path: &Path) -> nix::Result<RawFd> {
    let mut how: libc::open_how = unsafe { std::mem::zeroed() };
    how.flags = (libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC) as u64;
    how.mode = 0;
    how.resolve = libc::RESOLVE_IN_ROOT as u64 | libc::RESOLVE_NO_MAGICLINKS as u64;
    let path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)?;
    let res = unsafe {
        libc::syscall(
            libc::SYS_openat2,
            dirfd,
            path.as_ptr(),
            &how as *const libc::open_how,
            std::mem::size_of::<libc::open_how>(),
        )
    };
    Errno::result(res).map(|fd| fd as RawFd)
}

/// Open a directory handle for `path` interpreted strictly under
/// `root_fd`, creating missing intermediate directories with mode 0777.
pub fn open_dir_under(root_fd: RawFd, path: &Path) -> Result<OwnedFd, Error> {
    let path = if path.as_os_str().is_empty() {
        Path::new(".")
    } else {
        path
    };
    match openat2_dir(root_fd, path) {
        Ok(fd) => Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
        Err(Errno::ENOENT) => {
            let name = match path.file_name() {
                Some(name) => name,
                // "." or a ".."-tail cannot be created, only resolved.
                None => return Err(op_err("openat2()", path)(Errno::ENOENT)),
            };
            let parent = open_dir_under(root_fd, path.parent().unwrap_or(Path::new(".")))?;
            stat::mkdirat(parent.as_raw_fd(), name, Mode::from_bits_truncate(0o777))
                .map_err(op_err("mkdirat()", path))?;
            open_dir_under(root_fd, path)
        }
        Err(err) => Err(op_err("openat2()", path)(err)),
    }
}
