//! Helpers shared by the archive and extract paths.

use std::fmt;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Error};
use nix::sys::stat::FileStat;
use nix::unistd::{self, Whence};

use crate::BLOCK_SIZE;

/// Identity of a filesystem object within a live system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    dev: u64,
    ino: u64,
}

impl From<&FileStat> for NodeId {
    fn from(stat: &FileStat) -> Self {
        Self {
            dev: stat.st_dev,
            ino: stat.st_ino,
        }
    }
}

/// A syscall failure annotated with the operation and the path it hit.
#[derive(Debug)]
pub struct ErrorDuringOp {
    op: &'static str,
    path: PathBuf,
    source: Error,
}

impl ErrorDuringOp {
    pub fn new(op: &'static str, path: impl Into<PathBuf>, source: Error) -> Self {
        Self {
            op,
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for ErrorDuringOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "during {} of '{}': {:#}",
            self.op,
            self.path.display(),
            self.source
        )
    }
}

impl std::error::Error for ErrorDuringOp {}

/// `map_err` adapter: wrap a syscall error as [`ErrorDuringOp`].
pub(crate) fn op_err<'a, E>(op: &'static str, path: &'a Path) -> impl FnOnce(E) -> Error + 'a
where
    E: Into<Error>,
{
    move |err| ErrorDuringOp::new(op, path, err.into()).into()
}

/// Current offset of `file`. A seek failure here means the descriptor is
/// not the regular file the caller set up, which is a bug, not a runtime
/// condition.
pub fn tell(file: &File) -> u64 {
    match unistd::lseek(file.as_raw_fd(), 0, Whence::SeekCur) {
        Ok(pos) => pos as u64,
        Err(err) => panic!("unexpected error while seeking: {err}"),
    }
}

/// Extend `file` to the next record boundary by truncation (leaving a hole
/// rather than writing zeroes), then position at the end for the next
/// record. The seek happens even when no padding is needed, since a
/// preceding `copy_file_range` does not advance the file offset.
pub fn pad_to_block(file: &File, len: u64) -> Result<(), Error> {
    let over = len % BLOCK_SIZE;
    if over > 0 {
        unistd::ftruncate(file.as_raw_fd(), (len + BLOCK_SIZE - over) as i64)
            .context("failed to pad archive to record boundary")?;
    }
    unistd::lseek(file.as_raw_fd(), 0, Whence::SeekEnd)
        .context("failed to seek to end of archive")?;
    Ok(())
}

/// Append the end-of-archive marker: two all-zero 512-byte blocks.
pub fn finalize_archive(file: &File) -> Result<(), Error> {
    let len = unistd::lseek(file.as_raw_fd(), 0, Whence::SeekEnd)
        .context("failed to seek to end of archive")?;
    unistd::ftruncate(file.as_raw_fd(), len + 2 * BLOCK_SIZE as i64)
        .context("failed to write archive trailer")?;
    Ok(())
}

/// One-word name for a record type byte, for progress output.
pub fn humanize_record_type(type_byte: u8) -> String {
    match type_byte {
        0 | b'0' => "file",
        b'1' => "hardlink",
        b'2' => "symlink",
        b'3' => "chardev",
        b'4' => "blockdev",
        b'5' => "directory",
        b'6' => "fifo",
        other => return (other as char).to_string(),
    }
    .to_string()
}

/// Lexically normalize a path: drop `.` components, fold `..` into the
/// preceding component where one exists. Purely textual, like the shortest
/// equivalent path; no filesystem access.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::CurDir => {}
            Component::RootDir => out.push("/"),
            Component::ParentDir => {
                if depth > 0 {
                    out.pop();
                    depth -= 1;
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(name) => {
                out.push(name);
                depth += 1;
            }
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}
