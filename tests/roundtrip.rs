//! End-to-end archive → extract fidelity tests, plus the failure paths an
//! extractor must survive: occupied targets, unknown record types, and
//! archives that try to climb out of the extraction root.
//!
//! Nothing here assumes a reflink-capable filesystem: on filesystems
//! without the feature both data paths legitimately fall back to
//! `copy_file_range`, and the alignment assertions probe first.

use std::fs::{self, File};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use nix::sys::stat::{self, Mode, UtimensatFlags};
use nix::sys::time::TimeSpec;

use reftar::create::{create_archive, CreateOptions};
use reftar::extract::{extract_archive, ExtractOptions};
use reftar::header::{EntryHeader, UnixTime};
use reftar::progress::{MessageKind, Progress, ProgressMessage};
use reftar::reflink;

fn capture_progress() -> (Progress, mpsc::Receiver<ProgressMessage>) {
    let (sender, receiver) = mpsc::channel();
    (Progress::new(sender), receiver)
}

fn warnings(receiver: mpsc::Receiver<ProgressMessage>) -> Vec<String> {
    receiver
        .iter()
        .filter(|message| message.kind == MessageKind::Warning)
        .map(|message| message.text)
        .collect()
}

fn set_times(path: &Path, atime: (i64, i64), mtime: (i64, i64), follow: bool) {
    let flag = if follow {
        UtimensatFlags::FollowSymlink
    } else {
        UtimensatFlags::NoFollowSymlink
    };
    stat::utimensat(
        None,
        path,
        &TimeSpec::new(atime.0, atime.1),
        &TimeSpec::new(mtime.0, mtime.1),
        flag,
    )
    .unwrap();
}

/// Where an absolute source path lands below the extraction root.
fn extracted(dest: &Path, source: &Path) -> PathBuf {
    dest.join(source.strip_prefix("/").unwrap())
}

/// Whether FICLONERANGE works on the filesystem holding `dir`.
fn reflink_available(dir: &Path) -> bool {
    let src_path = dir.join("probe_src");
    let dst_path = dir.join("probe_dst");
    fs::write(&src_path, vec![7u8; 8192]).unwrap();
    let src = File::open(&src_path).unwrap();
    let dst = File::create(&dst_path).unwrap();
    reflink::try_clone(src.as_raw_fd(), 0, 0, dst.as_raw_fd(), 0).is_ok()
}

const HELLO_ATIME: (i64, i64) = (1_600_000_000, 111_111_111);
const HELLO_MTIME: (i64, i64) = (1_577_836_800, 123_456_789);
const SUB_MTIME: (i64, i64) = (1_500_000_000, 999_999_999);
const LINK_MTIME: (i64, i64) = (1_400_000_000, 5);

fn build_tree(src: &Path) -> Vec<u8> {
    let hello: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();

    fs::create_dir(src).unwrap();
    fs::write(src.join("hello.txt"), &hello).unwrap();
    fs::set_permissions(src.join("hello.txt"), fs::Permissions::from_mode(0o644)).unwrap();
    set_times(&src.join("hello.txt"), HELLO_ATIME, HELLO_MTIME, true);

    fs::write(src.join("tiny.txt"), b"!").unwrap();
    fs::write(src.join("empty.txt"), b"").unwrap();

    fs::create_dir(src.join("sub")).unwrap();
    fs::write(src.join("sub/inner.txt"), b"inner contents\n").unwrap();

    std::os::unix::fs::symlink("hello.txt", src.join("link.txt")).unwrap();
    set_times(&src.join("link.txt"), LINK_MTIME, LINK_MTIME, false);

    fs::write(src.join("a"), b"XYZ").unwrap();
    fs::hard_link(src.join("a"), src.join("b")).unwrap();
    fs::hard_link(src.join("a"), src.join("c")).unwrap();

    nix::unistd::mkfifo(&src.join("pipe"), Mode::from_bits_truncate(0o600)).unwrap();

    fs::set_permissions(src.join("sub"), fs::Permissions::from_mode(0o751)).unwrap();
    set_times(&src.join("sub"), SUB_MTIME, SUB_MTIME, true);

    hello
}

#[test]
fn roundtrip_preserves_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let hello = build_tree(&src);

    let tar_path = tmp.path().join("out.tar");
    create_archive(
        &tar_path,
        &[src.clone()],
        &CreateOptions::default(),
        &Progress::disabled(),
    )
    .unwrap();

    let dest = tmp.path().join("dest");
    fs::create_dir(&dest).unwrap();
    let all_clean = extract_archive(
        &dest,
        &File::open(&tar_path).unwrap(),
        &ExtractOptions::default(),
        &Progress::disabled(),
    )
    .unwrap();
    assert!(all_clean);

    let out = extracted(&dest, &src);

    // Metadata first: reading contents would disturb the restored atime.
    let hello_meta = fs::metadata(out.join("hello.txt")).unwrap();
    assert_eq!(hello_meta.permissions().mode() & 0o7777, 0o644);
    assert_eq!(
        (hello_meta.atime(), hello_meta.atime_nsec()),
        HELLO_ATIME,
        "atime at nanosecond precision"
    );
    assert_eq!((hello_meta.mtime(), hello_meta.mtime_nsec()), HELLO_MTIME);

    assert_eq!(fs::read(out.join("hello.txt")).unwrap(), hello);
    assert_eq!(fs::read(out.join("tiny.txt")).unwrap(), b"!");
    assert_eq!(fs::read(out.join("empty.txt")).unwrap(), b"");
    assert_eq!(
        fs::read(out.join("sub/inner.txt")).unwrap(),
        b"inner contents\n"
    );

    // The directory's mtime survives the creation of its children.
    let sub_meta = fs::metadata(out.join("sub")).unwrap();
    assert_eq!(sub_meta.permissions().mode() & 0o7777, 0o751);
    assert_eq!((sub_meta.mtime(), sub_meta.mtime_nsec()), SUB_MTIME);

    let link_meta = fs::symlink_metadata(out.join("link.txt")).unwrap();
    assert!(link_meta.file_type().is_symlink());
    assert_eq!(
        fs::read_link(out.join("link.txt")).unwrap(),
        Path::new("hello.txt")
    );
    assert_eq!((link_meta.mtime(), link_meta.mtime_nsec()), LINK_MTIME);

    // Hardlink structure: one inode, three names.
    let ino_a = fs::metadata(out.join("a")).unwrap().ino();
    assert_eq!(fs::metadata(out.join("b")).unwrap().ino(), ino_a);
    assert_eq!(fs::metadata(out.join("c")).unwrap().ino(), ino_a);
    assert_eq!(fs::read(out.join("c")).unwrap(), b"XYZ");

    assert!(fs::metadata(out.join("pipe"))
        .unwrap()
        .file_type()
        .is_fifo());
}

#[test]
fn hardlinks_are_canonicalized_in_the_archive() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    build_tree(&src);

    let tar_path = tmp.path().join("links.tar");
    create_archive(
        &tar_path,
        &[src.join("a"), src.join("b"), src.join("c")],
        &CreateOptions::default(),
        &Progress::disabled(),
    )
    .unwrap();

    let file = File::open(&tar_path).unwrap();
    let mut reader = tar::Archive::new(&file);
    let mut regular = 0;
    let mut links = 0;
    let mut first_name = None;
    for entry in reader.entries().unwrap() {
        let entry = entry.unwrap();
        match entry.header().entry_type() {
            tar::EntryType::Regular => {
                regular += 1;
                first_name = Some(entry.path().unwrap().into_owned());
            }
            tar::EntryType::Link => {
                links += 1;
                let target = entry.link_name().unwrap().unwrap().into_owned();
                assert_eq!(Some(target), first_name.clone());
                assert_eq!(entry.size(), 0);
            }
            other => panic!("unexpected entry type {other:?}"),
        }
    }
    assert_eq!((regular, links), (1, 2));
}

#[test]
fn tiny_files_get_plain_headers() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("one");
    fs::write(&src, b"x").unwrap();

    let tar_path = tmp.path().join("tiny.tar");
    create_archive(
        &tar_path,
        &[src],
        &CreateOptions::default(),
        &Progress::disabled(),
    )
    .unwrap();

    let file = File::open(&tar_path).unwrap();
    let mut reader = tar::Archive::new(&file);
    let mut entry = reader.entries().unwrap().next().unwrap().unwrap();
    assert_eq!(entry.size(), 1);
    // Padding the header would cost more than the 1-byte body; the
    // archiver must not have attached an alignment record.
    if let Some(extensions) = entry.pax_extensions().unwrap() {
        for extension in extensions {
            assert_ne!(extension.unwrap().key().unwrap(), "comment");
        }
    }
}

#[test]
fn cloned_bodies_start_on_page_boundaries() {
    let tmp = tempfile::tempdir().unwrap();
    if !reflink_available(tmp.path()) {
        eprintln!("skipping: filesystem has no reflink support");
        return;
    }

    let src = tmp.path().join("src");
    let hello = build_tree(&src);

    let tar_path = tmp.path().join("aligned.tar");
    let (progress, receiver) = capture_progress();
    create_archive(
        &tar_path,
        &[src.join("hello.txt")],
        &CreateOptions::default(),
        &progress,
    )
    .unwrap();
    drop(progress);
    let verbose: Vec<String> = receiver.iter().map(|m| m.text).collect();
    assert!(
        verbose.iter().any(|line| line.contains("file (cloned)")),
        "archiver should have cloned: {verbose:?}"
    );

    let file = File::open(&tar_path).unwrap();
    let mut reader = tar::Archive::new(&file);
    let entry = reader.entries().unwrap().next().unwrap().unwrap();
    assert_eq!(entry.raw_file_position() % 4096, 0);

    let dest = tmp.path().join("dest");
    fs::create_dir(&dest).unwrap();
    assert!(extract_archive(
        &dest,
        &File::open(&tar_path).unwrap(),
        &ExtractOptions::default(),
        &Progress::disabled(),
    )
    .unwrap());
    assert_eq!(
        fs::read(extracted(&dest, &src.join("hello.txt"))).unwrap(),
        hello
    );
}

#[test]
fn archive_ends_with_zero_trailer() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("f");
    fs::write(&src, b"some payload").unwrap();

    let tar_path = tmp.path().join("trailer.tar");
    create_archive(
        &tar_path,
        &[src],
        &CreateOptions::default(),
        &Progress::disabled(),
    )
    .unwrap();

    let bytes = fs::read(&tar_path).unwrap();
    assert_eq!(bytes.len() % 512, 0);
    assert!(bytes.len() >= 1024);
    assert!(bytes[bytes.len() - 1024..].iter().all(|&b| b == 0));
}

fn sample_raw_header(name: &str, kind: tar::EntryType, size: u64) -> EntryHeader {
    EntryHeader {
        name: PathBuf::from(name),
        link_target: None,
        size,
        mode: 0o644,
        uid: 0,
        gid: 0,
        atime: UnixTime::new(1_000_000, 0),
        mtime: UnixTime::new(1_000_000, 0),
        dev_major: 0,
        dev_minor: 0,
        kind,
    }
}

fn write_raw_archive(path: &Path, entries: &[(EntryHeader, &[u8])]) {
    let mut out = Vec::new();
    for (header, body) in entries {
        out.extend(header.render().unwrap());
        out.extend_from_slice(body);
        out.resize(out.len().next_multiple_of(512), 0);
    }
    out.extend_from_slice(&[0u8; 1024]);
    fs::write(path, out).unwrap();
}

#[test]
fn malicious_names_cannot_escape_the_extraction_root() {
    let tmp = tempfile::tempdir().unwrap();
    let inner = tmp.path().join("inner");
    fs::create_dir(&inner).unwrap();

    let tar_path = tmp.path().join("evil.tar");
    write_raw_archive(
        &tar_path,
        &[
            (
                sample_raw_header("../evil.txt", tar::EntryType::Regular, 6),
                b"gotcha".as_slice(),
            ),
            (
                sample_raw_header("/abs/evil2.txt", tar::EntryType::Regular, 7),
                b"gotcha2".as_slice(),
            ),
        ],
    );

    let all_clean = extract_archive(
        &inner,
        &File::open(&tar_path).unwrap(),
        &ExtractOptions::default(),
        &Progress::disabled(),
    )
    .unwrap();
    assert!(all_clean);

    // ".." clamps at the root; absolute names become root-relative.
    assert_eq!(fs::read(inner.join("evil.txt")).unwrap(), b"gotcha");
    assert!(!tmp.path().join("evil.txt").exists());
    assert_eq!(fs::read(inner.join("abs/evil2.txt")).unwrap(), b"gotcha2");
    assert!(!Path::new("/abs").exists());
}

#[test]
fn occupied_targets_are_skipped_with_a_warning() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("f");
    fs::write(&src, b"payload").unwrap();

    let tar_path = tmp.path().join("twice.tar");
    create_archive(
        &tar_path,
        &[src],
        &CreateOptions::default(),
        &Progress::disabled(),
    )
    .unwrap();

    let dest = tmp.path().join("dest");
    fs::create_dir(&dest).unwrap();
    assert!(extract_archive(
        &dest,
        &File::open(&tar_path).unwrap(),
        &ExtractOptions::default(),
        &Progress::disabled(),
    )
    .unwrap());

    // Second pass: every target exists already.
    let (progress, receiver) = capture_progress();
    let all_clean = extract_archive(
        &dest,
        &File::open(&tar_path).unwrap(),
        &ExtractOptions::default(),
        &progress,
    )
    .unwrap();
    drop(progress);
    assert!(!all_clean);
    let warned = warnings(receiver);
    assert!(
        warned.iter().any(|w| w.contains("target already exists")),
        "{warned:?}"
    );

    // Freakout mode turns the same condition fatal.
    let err = extract_archive(
        &dest,
        &File::open(&tar_path).unwrap(),
        &ExtractOptions {
            freakout: true,
            ..Default::default()
        },
        &Progress::disabled(),
    )
    .unwrap_err();
    assert!(err
        .downcast_ref::<reftar::extract::TargetAlreadyExists>()
        .is_some());
}

#[test]
fn unknown_record_types_are_skipped_with_a_warning() {
    let tmp = tempfile::tempdir().unwrap();
    let tar_path = tmp.path().join("odd.tar");
    write_raw_archive(
        &tar_path,
        &[
            (
                sample_raw_header("sparse.bin", tar::EntryType::GNUSparse, 0),
                b"".as_slice(),
            ),
            (
                sample_raw_header("normal.txt", tar::EntryType::Regular, 2),
                b"ok".as_slice(),
            ),
        ],
    );

    let dest = tmp.path().join("dest");
    fs::create_dir(&dest).unwrap();
    let (progress, receiver) = capture_progress();
    let all_clean = extract_archive(
        &dest,
        &File::open(&tar_path).unwrap(),
        &ExtractOptions::default(),
        &progress,
    )
    .unwrap();
    drop(progress);

    assert!(!all_clean);
    let warned = warnings(receiver);
    assert!(
        warned.iter().any(|w| w.contains("unhandled record type 'S'")),
        "{warned:?}"
    );
    // The loop carried on past the oddity.
    assert_eq!(fs::read(dest.join("normal.txt")).unwrap(), b"ok");
}

#[test]
fn directory_loops_are_visited_once() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir(&src).unwrap();
    fs::write(src.join("file.txt"), b"data").unwrap();
    // With --follow-symlinks a self-referential symlink walks back into
    // the same directory inode.
    std::os::unix::fs::symlink(".", src.join("loop")).unwrap();

    let tar_path = tmp.path().join("loop.tar");
    let (progress, receiver) = capture_progress();
    create_archive(
        &tar_path,
        &[src],
        &CreateOptions {
            follow_symlinks: true,
            ..Default::default()
        },
        &progress,
    )
    .unwrap();
    drop(progress);

    let warned = warnings(receiver);
    assert!(
        warned
            .iter()
            .any(|w| w.contains("Skipping directory (already visited)")),
        "{warned:?}"
    );
}
