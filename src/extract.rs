//! Extraction of tar streams onto the filesystem.
//!
//! Each record runs the same pipeline: resolve the parent directory
//! strictly under the extraction root, verify nothing occupies the name,
//! create the type-specific filesystem object, transfer the payload
//! (shared extents where the archiver aligned the body), apply metadata,
//! and repair the parent directory's timestamps, which the creation
//! syscall just bumped.

use std::collections::HashMap;
use std::ffi::{CString, OsString};
use std::fmt;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Error};
use nix::errno::Errno;
use nix::fcntl::{AtFlags, OFlag};
use nix::sys::stat::{self, FchmodatFlags, Mode, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{self, FchownatFlags, Gid, LinkatFlags, Uid};

use crate::chroot;
use crate::header::UnixTime;
use crate::progress::Progress;
use crate::reflink;
use crate::tools::{clean_path, humanize_record_type, op_err};
use crate::PAGE_SIZE;

#[derive(Clone, Copy, Debug, Default)]
pub struct ExtractOptions {
    /// Restore uid/gid as recorded in the archive.
    pub same_owner: bool,
    /// Abort on the first error instead of warning and continuing.
    pub freakout: bool,
}

/// A record whose type byte is outside the supported set. Recoverable
/// per-entry unless freakout mode is on.
#[derive(Debug)]
pub struct UnhandledRecord {
    type_byte: u8,
    path: PathBuf,
}

impl fmt::Display for UnhandledRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "unhandled record type '{}' for '{}'",
            self.type_byte as char,
            self.path.display()
        )
    }
}

impl std::error::Error for UnhandledRecord {}

/// Extraction never overwrites; an occupied name is a per-entry error.
#[derive(Debug)]
pub struct TargetAlreadyExists {
    path: PathBuf,
}

impl fmt::Display for TargetAlreadyExists {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "target already exists: '{}'", self.path.display())
    }
}

impl std::error::Error for TargetAlreadyExists {}

/// Extract `archive` into `extract_dir`. Returns whether every record
/// extracted cleanly; recoverable per-entry failures are reported to
/// `progress` as warnings and flip the result to `false` unless
/// `freakout` turns them fatal.
pub fn extract_archive(
    extract_dir: &Path,
    archive: &File,
    options: &ExtractOptions,
    progress: &Progress,
) -> Result<bool, Error> {
    let root = nix::fcntl::open(
        extract_dir,
        OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(op_err("open()", extract_dir))?;
    let root = unsafe { OwnedFd::from_raw_fd(root) };

    let mut dir_times: HashMap<PathBuf, (TimeSpec, TimeSpec)> = HashMap::new();
    let mut all_clean = true;

    let mut reader = tar::Archive::new(archive);
    for entry in reader.entries().context("cannot read tar archive")? {
        let mut entry = entry.context("error reading tar record")?;
        let meta = RecordMeta::from_entry(&mut entry)?;

        let rel = clean_path(meta.name.strip_prefix("/").unwrap_or(&meta.name));
        let full_path = clean_path(&extract_dir.join(&rel));

        match extract_one(
            root.as_raw_fd(),
            &rel,
            &full_path,
            &meta,
            archive,
            &mut dir_times,
            options,
        ) {
            Ok(was_cloned) => {
                let tag = if was_cloned {
                    "file (cloned)".to_string()
                } else {
                    humanize_record_type(meta.type_byte)
                };
                progress.verbose(format!("{:<15}\t{}", tag, meta.name.display()));
            }
            Err(err) if !options.freakout && is_per_entry_error(&err) => {
                progress.warning(format!("Skipping: {err:#}"));
                all_clean = false;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(all_clean)
}

fn is_per_entry_error(err: &Error) -> bool {
    err.downcast_ref::<UnhandledRecord>().is_some()
        || err.downcast_ref::<TargetAlreadyExists>().is_some()
}

/// Everything the extractor needs from one record, decoded up front so the
/// tar reader borrow ends before any filesystem work starts.
struct RecordMeta {
    type_byte: u8,
    name: PathBuf,
    link_target: Option<PathBuf>,
    size: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    atime: UnixTime,
    mtime: UnixTime,
    dev_major: u32,
    dev_minor: u32,
    /// Byte offset of the body within the archive file.
    data_offset: u64,
}

impl RecordMeta {
    fn from_entry(entry: &mut tar::Entry<'_, &File>) -> Result<Self, Error> {
        let mut name = entry.path().context("invalid entry name")?.into_owned();
        let mut link_target = entry
            .link_name()
            .context("invalid link target")?
            .map(|target| target.into_owned());
        let mut size = entry.size();
        let data_offset = entry.raw_file_position();

        let header = entry.header();
        let type_byte = header.entry_type().as_byte();
        let mode = header.mode().context("invalid mode field")?;
        let mut uid = header.uid().context("invalid uid field")? as u32;
        let mut gid = header.gid().context("invalid gid field")? as u32;
        let mut mtime = UnixTime::new(header.mtime().context("invalid mtime field")? as i64, 0);
        let dev_major = header.device_major().ok().flatten().unwrap_or(0);
        let dev_minor = header.device_minor().ok().flatten().unwrap_or(0);

        let mut atime = None;
        if let Some(extensions) = entry.pax_extensions().context("invalid PAX records")? {
            for extension in extensions {
                let extension = extension.context("invalid PAX record")?;
                let value = extension.value();
                match extension.key() {
                    Ok("atime") => atime = value.ok().and_then(UnixTime::from_pax),
                    Ok("mtime") => {
                        if let Some(time) = value.ok().and_then(UnixTime::from_pax) {
                            mtime = time;
                        }
                    }
                    Ok("path") => {
                        if let Ok(value) = value {
                            name = PathBuf::from(value);
                        }
                    }
                    Ok("linkpath") => {
                        if let Ok(value) = value {
                            link_target = Some(PathBuf::from(value));
                        }
                    }
                    Ok("size") => {
                        if let Some(value) = value.ok().and_then(|v| v.parse().ok()) {
                            size = value;
                        }
                    }
                    Ok("uid") => {
                        if let Some(value) = value.ok().and_then(|v| v.parse().ok()) {
                            uid = value;
                        }
                    }
                    Ok("gid") => {
                        if let Some(value) = value.ok().and_then(|v| v.parse().ok()) {
                            gid = value;
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            type_byte,
            name,
            link_target,
            size,
            mode,
            uid,
            gid,
            atime: atime.unwrap_or(mtime),
            mtime,
            dev_major,
            dev_minor,
            data_offset,
        })
    }
}

fn parent_or_dot(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn extract_one(
    root_fd: RawFd,
    rel: &Path,
    full_path: &Path,
    meta: &RecordMeta,
    archive: &File,
    dir_times: &mut HashMap<PathBuf, (TimeSpec, TimeSpec)>,
    options: &ExtractOptions,
) -> Result<bool, Error> {
    let dir_fd = chroot::open_dir_under(root_fd, &parent_or_dot(rel))?;
    let base: OsString = rel
        .file_name()
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| OsString::from("."));

    match stat::fstatat(
        dir_fd.as_raw_fd(),
        base.as_os_str(),
        AtFlags::AT_SYMLINK_NOFOLLOW,
    ) {
        Ok(_) => {
            return Err(TargetAlreadyExists {
                path: full_path.to_path_buf(),
            }
            .into())
        }
        Err(Errno::ENOENT) => {}
        Err(errno) => return Err(op_err("stat()", full_path)(errno)),
    }

    let mode = Mode::from_bits_truncate(meta.mode as libc::mode_t);
    let mut was_cloned = false;
    let mut out_file: Option<File> = None;

    match meta.type_byte {
        0 | b'0' => {
            let fd = nix::fcntl::openat(
                dir_fd.as_raw_fd(),
                base.as_os_str(),
                OFlag::O_EXCL | OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_CLOEXEC,
                mode,
            )
            .map_err(op_err("openat()", full_path))?;
            let out = unsafe { File::from_raw_fd(fd) };
            was_cloned = write_payload(archive, meta, &out, full_path)?;
            out_file = Some(out);
        }
        b'5' => {
            stat::mkdirat(dir_fd.as_raw_fd(), base.as_os_str(), mode)
                .map_err(op_err("mkdirat()", full_path))?;
        }
        b'2' => {
            let target = meta
                .link_target
                .as_ref()
                .ok_or_else(|| anyhow!("symlink record without a target"))?;
            unistd::symlinkat(target.as_path(), Some(dir_fd.as_raw_fd()), base.as_os_str())
                .map_err(op_err("symlinkat()", full_path))?;
        }
        b'1' => {
            let target = meta
                .link_target
                .as_ref()
                .ok_or_else(|| anyhow!("hardlink record without a target"))?;
            let target_rel = clean_path(target.strip_prefix("/").unwrap_or(target));
            let target_base = target_rel
                .file_name()
                .map(ToOwned::to_owned)
                .ok_or_else(|| anyhow!("invalid hardlink target '{}'", target.display()))?;
            let link_dir = chroot::open_dir_under(root_fd, &parent_or_dot(&target_rel))?;
            unistd::linkat(
                Some(link_dir.as_raw_fd()),
                target_base.as_os_str(),
                Some(dir_fd.as_raw_fd()),
                base.as_os_str(),
                LinkatFlags::NoSymlinkFollow,
            )
            .map_err(op_err("linkat()", full_path))?;
        }
        b'6' => {
            // No nix wrapper for this one; call through libc.
            let name = CString::new(base.as_bytes()).context("file name contains NUL")?;
            let res = unsafe {
                libc::mkfifoat(dir_fd.as_raw_fd(), name.as_ptr(), meta.mode as libc::mode_t)
            };
            Errno::result(res).map_err(op_err("mkfifoat()", full_path))?;
        }
        b'3' | b'4' => {
            let kind = if meta.type_byte == b'3' {
                libc::S_IFCHR
            } else {
                libc::S_IFBLK
            };
            let name = CString::new(base.as_bytes()).context("file name contains NUL")?;
            let dev = stat::makedev(meta.dev_major.into(), meta.dev_minor.into());
            let res = unsafe {
                libc::mknodat(
                    dir_fd.as_raw_fd(),
                    name.as_ptr(),
                    kind | meta.mode as libc::mode_t,
                    dev,
                )
            };
            Errno::result(res).map_err(op_err("mknodat()", full_path))?;
        }
        other => {
            return Err(UnhandledRecord {
                type_byte: other,
                path: full_path.to_path_buf(),
            }
            .into())
        }
    }

    let times = (
        TimeSpec::new(meta.atime.secs, meta.atime.nanos as i64),
        TimeSpec::new(meta.mtime.secs, meta.mtime.nanos as i64),
    );

    if meta.type_byte == b'2' {
        // No descriptor-based metadata for symlinks; use the *at calls
        // that do not dereference.
        if options.same_owner {
            unistd::fchownat(
                Some(dir_fd.as_raw_fd()),
                base.as_os_str(),
                Some(Uid::from_raw(meta.uid)),
                Some(Gid::from_raw(meta.gid)),
                FchownatFlags::NoFollowSymlink,
            )
            .map_err(op_err("chown()", full_path))?;
        }
        stat::utimensat(
            Some(dir_fd.as_raw_fd()),
            base.as_os_str(),
            &times.0,
            &times.1,
            UtimensatFlags::NoFollowSymlink,
        )
        .map_err(op_err("utimensat()", full_path))?;
    } else {
        let reopened;
        let meta_fd = match &out_file {
            Some(file) => file.as_raw_fd(),
            None => {
                let fd = nix::fcntl::openat(
                    dir_fd.as_raw_fd(),
                    base.as_os_str(),
                    OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
                    Mode::empty(),
                )
                .map_err(op_err("reopening", full_path))?;
                reopened = unsafe { OwnedFd::from_raw_fd(fd) };
                reopened.as_raw_fd()
            }
        };
        apply_metadata(meta_fd, meta, &times, options.same_owner, full_path)?;
    }

    if meta.type_byte == b'5' {
        // Children created in here later will bump these; keep them for
        // restoration.
        dir_times.insert(full_path.to_path_buf(), times);
    }
    if let Some(parent_times) = full_path.parent().and_then(|parent| dir_times.get(parent)) {
        // Creating this entry touched the parent's mtime; put it back. The
        // parent handle is O_PATH, so the timestamps go through /proc.
        let proc_path = PathBuf::from(format!("/proc/self/fd/{}", dir_fd.as_raw_fd()));
        stat::utimensat(
            None,
            &proc_path,
            &parent_times.0,
            &parent_times.1,
            UtimensatFlags::FollowSymlink,
        )
        .map_err(op_err("utimensat()", full_path))?;
    }

    Ok(was_cloned)
}

/// Transfer a regular file's body out of the archive. Bodies the archiver
/// page-aligned are cloned (whole pages) with the terminal partial page
/// copied after; everything else goes through `copy_file_range`.
fn write_payload(
    archive: &File,
    meta: &RecordMeta,
    out: &File,
    path: &Path,
) -> Result<bool, Error> {
    let mut was_cloned = false;
    let tar_pos = meta.data_offset;
    let aligned = meta.size / PAGE_SIZE * PAGE_SIZE;
    let spill = meta.size - aligned;

    if tar_pos % PAGE_SIZE == 0 && aligned > 0 {
        match reflink::try_clone(archive.as_raw_fd(), tar_pos, aligned, out.as_raw_fd(), 0) {
            Ok(()) => {
                if spill > 0 {
                    reflink::copy_range(
                        archive.as_raw_fd(),
                        (tar_pos + aligned) as i64,
                        spill,
                        out.as_raw_fd(),
                        aligned as i64,
                    )
                    .map_err(op_err("copy_file_range()", path))?;
                }
                was_cloned = true;
            }
            Err(errno) if reflink::clone_impossible(errno) => {
                log::debug!(
                    "extent sharing unavailable for '{}' ({errno}), copying",
                    path.display()
                );
                reflink::copy_range(archive.as_raw_fd(), tar_pos as i64, meta.size, out.as_raw_fd(), 0)
                    .map_err(op_err("copy_file_range()", path))?;
            }
            Err(errno) => return Err(op_err("ioctl(FICLONERANGE)", path)(errno)),
        }
    } else if meta.size > 0 {
        reflink::copy_range(archive.as_raw_fd(), tar_pos as i64, meta.size, out.as_raw_fd(), 0)
            .map_err(op_err("copy_file_range()", path))?;
    }

    unistd::fsync(out.as_raw_fd()).map_err(op_err("fsync()", path))?;
    Ok(was_cloned)
}

/// Apply mode, ownership and times through `/proc/self/fd`, so the same
/// path serves `O_PATH` descriptors (directories, devices, fifos) and
/// regular write descriptors alike.
fn apply_metadata(
    fd: RawFd,
    meta: &RecordMeta,
    times: &(TimeSpec, TimeSpec),
    same_owner: bool,
    path: &Path,
) -> Result<(), Error> {
    let proc_path = PathBuf::from(format!("/proc/self/fd/{fd}"));
    if same_owner {
        // Ownership first; if it drops our access, mode and times below
        // would be the casualties, not the chown.
        unistd::chown(
            &proc_path,
            Some(Uid::from_raw(meta.uid)),
            Some(Gid::from_raw(meta.gid)),
        )
        .map_err(op_err("chown()", path))?;
    }
    stat::fchmodat(
        None,
        &proc_path,
        Mode::from_bits_truncate(meta.mode as libc::mode_t),
        FchmodatFlags::FollowSymlink,
    )
    .map_err(op_err("chmod()", path))?;
    stat::utimensat(
        None,
        &proc_path,
        &times.0,
        &times.1,
        UtimensatFlags::FollowSymlink,
    )
    .map_err(op_err("utimensat()", path))?;
    Ok(())
}
