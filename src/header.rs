//! In-memory tar record metadata, PAX rendering, and the page-alignment
//! header padder.
//!
//! A rendered header is the PAX extended-header entry (when any records are
//! carried) followed by the ustar block, and is always a whole number of
//! 512-byte blocks. Page alignment of the following payload is achieved by
//! growing a synthetic PAX `comment` record until the header ends on a
//! 4096-byte boundary; `comment` is reserved as informational by POSIX, so
//! conforming readers skip it without side effects.

use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use anyhow::{bail, Context, Error};
use nix::sys::stat::{self, FileStat};
use tar::EntryType;

use crate::{BLOCK_SIZE, PAGE_SIZE};

/// PAX key used for alignment filler.
const PAD_KEY: &str = "comment";
const PAD_FILLER: u8 = b'X';

/// Largest value fitting the 8-byte octal uid/gid ustar fields.
const USTAR_MAX_ID: u64 = 0o7777777;
/// Largest value fitting the 12-byte octal size/mtime ustar fields.
const USTAR_MAX_NUM: u64 = 0o77777777777;

/// Nanosecond-precision timestamp, encoded in PAX records as a decimal
/// number of seconds with an optional 9-digit fraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnixTime {
    pub secs: i64,
    pub nanos: u32,
}

impl UnixTime {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    pub fn to_pax(self) -> String {
        let total = self.secs as i128 * 1_000_000_000 + self.nanos as i128;
        let sign = if total < 0 { "-" } else { "" };
        let abs = total.unsigned_abs();
        let (secs, frac) = (abs / 1_000_000_000, abs % 1_000_000_000);
        if frac == 0 {
            format!("{sign}{secs}")
        } else {
            format!("{sign}{secs}.{frac:09}")
        }
    }

    pub fn from_pax(text: &str) -> Option<Self> {
        let (sign, text) = match text.strip_prefix('-') {
            Some(rest) => (-1i128, rest),
            None => (1i128, text),
        };
        let (secs, frac) = match text.split_once('.') {
            Some((secs, frac)) => (secs, frac),
            None => (text, ""),
        };
        let secs: i128 = secs.parse().ok()?;
        // Fractional digits beyond nanoseconds are discarded.
        let mut nanos: i128 = 0;
        for (i, digit) in frac.bytes().take(9).enumerate() {
            if !digit.is_ascii_digit() {
                return None;
            }
            nanos += i128::from(digit - b'0') * 10i128.pow(8 - i as u32);
        }
        let total = sign * (secs * 1_000_000_000 + nanos);
        Some(Self {
            secs: total.div_euclid(1_000_000_000) as i64,
            nanos: total.rem_euclid(1_000_000_000) as u32,
        })
    }
}

/// Logical record metadata, the in-memory form of one tar entry header.
#[derive(Clone, Debug)]
pub struct EntryHeader {
    /// Name as stored in the archive; directories carry a trailing slash.
    pub name: PathBuf,
    /// Symlink destination or hardlink target.
    pub link_target: Option<PathBuf>,
    /// Body length; positive only for regular files.
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: UnixTime,
    pub mtime: UnixTime,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub kind: EntryType,
}

impl EntryHeader {
    /// Build a header from a `stat` result. `name` is the archive name
    /// (trailing slash already applied for directories), `link_target` the
    /// destination read from a symlink.
    pub fn from_stat(
        name: PathBuf,
        stat: &FileStat,
        link_target: Option<PathBuf>,
    ) -> Result<Self, Error> {
        let kind = match stat.st_mode & libc::S_IFMT {
            libc::S_IFREG => EntryType::Regular,
            libc::S_IFDIR => EntryType::Directory,
            libc::S_IFLNK => EntryType::Symlink,
            libc::S_IFIFO => EntryType::Fifo,
            libc::S_IFBLK => EntryType::Block,
            libc::S_IFCHR => EntryType::Char,
            libc::S_IFSOCK => bail!("sockets cannot be represented in a tar archive"),
            other => bail!("unknown file type 0o{:o}", other),
        };
        Ok(Self {
            name,
            link_target,
            size: if kind == EntryType::Regular {
                stat.st_size as u64
            } else {
                0
            },
            mode: stat.st_mode & 0o7777,
            uid: stat.st_uid,
            gid: stat.st_gid,
            atime: UnixTime::new(stat.st_atime, stat.st_atime_nsec as u32),
            mtime: UnixTime::new(stat.st_mtime, stat.st_mtime_nsec as u32),
            dev_major: stat::major(stat.st_rdev) as u32,
            dev_minor: stat::minor(stat.st_rdev) as u32,
            kind,
        })
    }

    /// Render the plain header: ustar block, preceded by the PAX extended
    /// entry carrying the timestamp records (and any overflow records).
    pub fn render(&self) -> Result<Vec<u8>, Error> {
        let (block, records) = self.ustar_block()?;
        Ok(self.assemble(block, records))
    }

    /// Render a header such that `header_offset + buffer.len()` is a
    /// multiple of the filesystem page size, by attaching a PAX `comment`
    /// record of computed length. Returns the growth in bytes over the
    /// plain rendering, which is 0 when the plain form is already aligned.
    ///
    /// The record length field encodes the length of the record including
    /// the field itself, so the filler size is solved by fixed-point
    /// iteration. Landing one byte short of the block boundary is fine:
    /// the block-level zero padding completes it, and cannot disturb page
    /// alignment because the page size is a multiple of the block size.
    pub fn render_page_aligned(&self, header_offset: u64) -> Result<(u64, Vec<u8>), Error> {
        let plain = self.render()?;
        if (header_offset + plain.len() as u64) % PAGE_SIZE == 0 {
            return Ok((0, plain));
        }

        let (block, mut records) = self.ustar_block()?;
        let base_len: usize = records
            .iter()
            .map(|(key, value)| pax_record_len(key.len(), value.len()))
            .sum();

        // Rendered headers are whole blocks, so alignment is a matter of
        // picking the right number of PAX data blocks. At most 8 candidates
        // separate one page boundary from the next.
        let min_pax = base_len + pax_record_len(PAD_KEY.len(), 1);
        let min_blocks = (min_pax as u64).div_ceil(BLOCK_SIZE);
        let blocks = (min_blocks..min_blocks + PAGE_SIZE / BLOCK_SIZE)
            .find(|k| (header_offset + 2 * BLOCK_SIZE + BLOCK_SIZE * k) % PAGE_SIZE == 0)
            .unwrap_or_else(|| {
                panic!(
                    "header padding miscalculation: no reachable page boundary from offset {}",
                    header_offset
                )
            });

        // Largest filler that still fits the chosen block count. Growing
        // the filler by one byte can grow the record by two when the
        // length field gains a digit, hence the stepwise search.
        let budget = (BLOCK_SIZE * blocks) as usize - base_len;
        let mut filler = 1;
        while pax_record_len(PAD_KEY.len(), filler + 1) <= budget {
            filler += 1;
        }

        records.push((PAD_KEY, vec![PAD_FILLER; filler]));
        let padded = self.assemble(block, records);

        let want = (2 * BLOCK_SIZE + BLOCK_SIZE * blocks) as usize;
        if padded.len() != want {
            panic!(
                "header padding miscalculation: wanted {}, got {}",
                want,
                padded.len()
            );
        }
        Ok(((padded.len() - plain.len()) as u64, padded))
    }

    /// Build the ustar block plus the PAX records it needs: timestamps
    /// always (for nanosecond precision), and overflow records for values
    /// the fixed octal fields cannot hold.
    fn ustar_block(&self) -> Result<(tar::Header, Vec<(&'static str, Vec<u8>)>), Error> {
        let mut header = tar::Header::new_ustar();
        let mut records: Vec<(&'static str, Vec<u8>)> = vec![
            ("atime", self.atime.to_pax().into_bytes()),
            ("mtime", self.mtime.to_pax().into_bytes()),
        ];

        if header.set_path(&self.name).is_err() {
            records.push(("path", self.name.as_os_str().as_bytes().to_vec()));
            set_name_prefix(&mut header.as_old_mut().name, self.name.as_os_str().as_bytes());
        }
        if let Some(target) = &self.link_target {
            if header.set_link_name(target).is_err() {
                records.push(("linkpath", target.as_os_str().as_bytes().to_vec()));
                set_name_prefix(
                    &mut header.as_old_mut().linkname,
                    target.as_os_str().as_bytes(),
                );
            }
        }

        header.set_mode(self.mode);
        if u64::from(self.uid) > USTAR_MAX_ID {
            records.push(("uid", self.uid.to_string().into_bytes()));
            header.set_uid(0);
        } else {
            header.set_uid(u64::from(self.uid));
        }
        if u64::from(self.gid) > USTAR_MAX_ID {
            records.push(("gid", self.gid.to_string().into_bytes()));
            header.set_gid(0);
        } else {
            header.set_gid(u64::from(self.gid));
        }
        if self.size > USTAR_MAX_NUM {
            records.push(("size", self.size.to_string().into_bytes()));
            header.set_size(0);
        } else {
            header.set_size(self.size);
        }
        header.set_mtime(self.mtime.secs.clamp(0, USTAR_MAX_NUM as i64) as u64);
        header.set_entry_type(self.kind);
        if matches!(self.kind, EntryType::Block | EntryType::Char) {
            header
                .set_device_major(self.dev_major)
                .context("cannot store device major number")?;
            header
                .set_device_minor(self.dev_minor)
                .context("cannot store device minor number")?;
        }
        header.set_cksum();

        Ok((header, records))
    }

    /// Serialize: extended-header entry (when records exist) with its data
    /// zero-padded to the block boundary, then the ustar block.
    fn assemble(&self, block: tar::Header, mut records: Vec<(&'static str, Vec<u8>)>) -> Vec<u8> {
        if records.is_empty() {
            return block.as_bytes().to_vec();
        }
        records.sort_by_key(|(key, _)| *key);

        let mut data = Vec::new();
        for (key, value) in &records {
            data.extend_from_slice(&pax_record(key, value));
        }

        let mut extended = tar::Header::new_ustar();
        let mut xname = Vec::with_capacity(113);
        xname.extend_from_slice(b"PaxHeaders.0/");
        xname.extend_from_slice(self.name.as_os_str().as_bytes());
        set_name_prefix(&mut extended.as_old_mut().name, &xname);
        extended.set_mode(0o644);
        extended.set_uid(0);
        extended.set_gid(0);
        extended.set_size(data.len() as u64);
        extended.set_mtime(self.mtime.secs.clamp(0, USTAR_MAX_NUM as i64) as u64);
        extended.set_entry_type(EntryType::XHeader);
        extended.set_cksum();

        let padded_data = data.len().next_multiple_of(BLOCK_SIZE as usize);
        let mut out = Vec::with_capacity(2 * BLOCK_SIZE as usize + padded_data);
        out.extend_from_slice(extended.as_bytes());
        out.extend_from_slice(&data);
        out.resize(BLOCK_SIZE as usize + padded_data, 0);
        out.extend_from_slice(block.as_bytes());
        out
    }
}

/// Write the leading bytes of `bytes` into a fixed-size header field.
/// Used where the full value travels in a PAX record and the field only
/// carries a best-effort prefix for pre-PAX readers.
fn set_name_prefix(field: &mut [u8], bytes: &[u8]) {
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
}

/// Length of a PAX record `"<len> <key>=<value>\n"`, where `<len>` is the
/// decimal length of the whole record including its own digits.
fn pax_record_len(key_len: usize, value_len: usize) -> usize {
    let base = key_len + value_len + 3; // separator space, '=', newline
    let mut total = base + 1;
    loop {
        let next = base + decimal_width(total);
        if next == total {
            return total;
        }
        total = next;
    }
}

fn pax_record(key: &str, value: &[u8]) -> Vec<u8> {
    let total = pax_record_len(key.len(), value.len());
    let mut record = format!("{total} {key}=").into_bytes();
    record.extend_from_slice(value);
    record.push(b'\n');
    debug_assert_eq!(record.len(), total);
    record
}

fn decimal_width(mut n: usize) -> usize {
    let mut width = 1;
    while n >= 10 {
        n /= 10;
        width += 1;
    }
    width
}
