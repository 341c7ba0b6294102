//! Archive creation: recursive walk, header emission, and the
//! clone-into-archive data path with its copy fallback.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::{self, Mode};
use nix::unistd::{self, Whence};
use tar::EntryType;

use crate::header::EntryHeader;
use crate::progress::Progress;
use crate::reflink;
use crate::tools::{
    clean_path, finalize_archive, humanize_record_type, op_err, pad_to_block, tell, NodeId,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct CreateOptions {
    /// Archive symlink destinations instead of the symlinks themselves.
    pub follow_symlinks: bool,
    /// Do not descend into directories.
    pub no_recursion: bool,
}

/// Create the tar file at `archive` (truncating any existing file) from
/// `inputs`. On the first fatal error the partial archive is left behind
/// without a trailer; removing it is the caller's business.
pub fn create_archive(
    archive: &Path,
    inputs: &[PathBuf],
    options: &CreateOptions,
    progress: &Progress,
) -> Result<(), Error> {
    let out = File::create(archive).map_err(op_err("create()", archive))?;
    let mut archiver = Archiver {
        out,
        options,
        progress,
        visited: HashSet::new(),
        hardlinks: HashMap::new(),
    };
    for input in inputs {
        archiver.add_path(input)?;
    }
    finalize_archive(&archiver.out)
}

struct Archiver<'a> {
    out: File,
    options: &'a CreateOptions,
    progress: &'a Progress,
    /// Directories already descended into; guards against loops through
    /// bind mounts.
    visited: HashSet<NodeId>,
    /// First archive name seen for each multi-link inode; later
    /// encounters become hardlink records pointing here.
    hardlinks: HashMap<NodeId, PathBuf>,
}

impl Archiver<'_> {
    fn add_path(&mut self, inpath: &Path) -> Result<(), Error> {
        let stat = if self.options.follow_symlinks {
            stat::stat(inpath)
        } else {
            stat::lstat(inpath)
        }
        .map_err(op_err("stat()", inpath))?;
        let node = NodeId::from(&stat);

        let link_target = if stat.st_mode & libc::S_IFMT == libc::S_IFLNK {
            Some(fs::read_link(inpath).map_err(op_err("readlink()", inpath))?)
        } else {
            None
        };

        let is_dir = stat.st_mode & libc::S_IFMT == libc::S_IFDIR;
        let cleaned = clean_path(inpath);
        let name = if is_dir {
            let mut name = cleaned.clone().into_os_string();
            name.push("/");
            PathBuf::from(name)
        } else {
            cleaned.clone()
        };
        let mut header = EntryHeader::from_stat(name, &stat, link_target)
            .with_context(|| format!("cannot archive '{}'", inpath.display()))?;

        if header.kind == EntryType::Regular && stat.st_nlink > 1 {
            // This inode is shared; only its first path carries the body.
            if let Some(first) = self.hardlinks.get(&node) {
                header.kind = EntryType::Link;
                header.link_target = Some(first.clone());
                header.size = 0;
            } else {
                self.hardlinks.insert(node, header.name.clone());
            }
        }

        let was_cloned = self.write_entry(&header, &cleaned)?;
        let tag = if was_cloned {
            "file (cloned)".to_string()
        } else {
            humanize_record_type(header.kind.as_byte())
        };
        self.progress
            .verbose(format!("{:<14}\t{}", tag, header.name.display()));

        if is_dir && !self.options.no_recursion {
            if self.visited.contains(&node) {
                self.progress.warning(format!(
                    "Skipping directory (already visited): {}",
                    inpath.display()
                ));
            } else {
                self.visited.insert(node);
                let mut children: Vec<OsString> = fs::read_dir(&cleaned)
                    .map_err(op_err("readdir()", inpath))?
                    .map(|entry| entry.map(|entry| entry.file_name()))
                    .collect::<Result<_, _>>()
                    .map_err(op_err("readdir()", inpath))?;
                children.sort_unstable();
                for child in children {
                    self.add_path(&cleaned.join(child))?;
                }
            }
        }
        Ok(())
    }

    /// Write one record: header, and for non-empty regular files the body
    /// via extent sharing where possible.
    fn write_entry(&mut self, header: &EntryHeader, src_path: &Path) -> Result<bool, Error> {
        let header_pos = tell(&self.out);
        let plain = header.render()?;
        if header.kind != EntryType::Regular || header.size == 0 {
            self.out
                .write_all(&plain)
                .context("failed to write tar header")?;
            return Ok(false);
        }

        let src = open_source(src_path)?;
        let (growth, padded) = header.render_page_aligned(header_pos)?;
        if growth > header.size {
            // The alignment padding would outweigh the body itself.
            self.out
                .write_all(&plain)
                .context("failed to write tar header")?;
            self.copy_body(&src, header.size, src_path)?;
            return Ok(false);
        }

        self.out
            .write_all(&padded)
            .context("failed to write tar header")?;
        match self.clone_body(&src, header.size, src_path)? {
            CloneOutcome::Cloned => Ok(true),
            CloneOutcome::Impossible(errno) => {
                log::debug!(
                    "extent sharing unavailable for '{}' ({errno}), copying",
                    src_path.display()
                );
                if growth > 0 {
                    // The padding bought nothing; put the plain header back.
                    unistd::lseek(self.out.as_raw_fd(), header_pos as i64, Whence::SeekSet)
                        .map_err(op_err("seek()", src_path))?;
                    unistd::ftruncate(self.out.as_raw_fd(), header_pos as i64)
                        .map_err(op_err("ftruncate()", src_path))?;
                    self.out
                        .write_all(&plain)
                        .context("failed to write tar header")?;
                }
                self.copy_body(&src, header.size, src_path)?;
                Ok(false)
            }
        }
    }

    fn clone_body(
        &mut self,
        src: &OwnedFd,
        size: u64,
        path: &Path,
    ) -> Result<CloneOutcome, Error> {
        let pos = tell(&self.out);
        match reflink::try_clone(src.as_raw_fd(), 0, 0, self.out.as_raw_fd(), pos) {
            Ok(()) => {}
            Err(errno) if reflink::clone_impossible(errno) => {
                return Ok(CloneOutcome::Impossible(errno))
            }
            Err(errno) => return Err(op_err("ioctl(FICLONERANGE)", path)(errno)),
        }
        let end = unistd::lseek(self.out.as_raw_fd(), 0, Whence::SeekEnd)
            .map_err(op_err("seek()", path))? as u64;
        let written = end - pos;
        if written != size {
            bail!(
                "while reading '{}': {} bytes, expected: {}",
                path.display(),
                written,
                size
            );
        }
        pad_to_block(&self.out, end)?;
        Ok(CloneOutcome::Cloned)
    }

    fn copy_body(&mut self, src: &OwnedFd, size: u64, path: &Path) -> Result<(), Error> {
        let pos = tell(&self.out);
        reflink::copy_range(src.as_raw_fd(), 0, size, self.out.as_raw_fd(), pos as i64)
            .map_err(op_err("copy_file_range()", path))?;
        pad_to_block(&self.out, pos + size)
    }
}

enum CloneOutcome {
    Cloned,
    Impossible(Errno),
}

/// Open an archive source read-only, suppressing atime updates where
/// permitted. Only the owner may request `O_NOATIME`; anyone else gets
/// `EPERM` and a plain read-only retry.
fn open_source(path: &Path) -> Result<OwnedFd, Error> {
    let mut noatime = OFlag::O_NOATIME;
    loop {
        return match nix::fcntl::open(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC | noatime, Mode::empty())
        {
            Ok(fd) => Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
            Err(Errno::EPERM) if !noatime.is_empty() => {
                noatime = OFlag::empty();
                continue;
            }
            Err(errno) => Err(op_err("open()", path)(errno)),
        };
    }
}
