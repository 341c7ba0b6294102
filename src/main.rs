use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::sync::mpsc;
use std::thread;

use anyhow::Error;
use clap::Parser;

use reftar::create::{create_archive, CreateOptions};
use reftar::extract::{extract_archive, ExtractOptions};
use reftar::progress::{MessageKind, Progress, ProgressMessage};
use reftar::tools::clean_path;

const BANNER: &str = concat!(
    "reftar ",
    env!("CARGO_PKG_VERSION"),
    " — a tar for Linux 4.5+ (archiving) / 5.6+ (extraction) that uses\n",
    "the FICLONERANGE ioctl to share data between the archive and the\n",
    "source/destination files on copy-on-write filesystems.\n",
);

/// Archive and extract POSIX tar files without copying file contents,
/// sharing extents with the archive on reflink-capable filesystems.
#[derive(Parser, Debug)]
#[command(name = "reftar", disable_version_flag = true)]
struct Args {
    /// Verbosely list files processed.
    #[arg(short = 'v')]
    verbose: bool,

    /// Archive the symlink destination rather than the symlink itself.
    #[arg(long)]
    follow_symlinks: bool,

    /// Turn off recursing into directories.
    #[arg(long)]
    no_recursion: bool,

    /// As in GNU tar: upon extraction, set file ownership as recorded in
    /// the archive.
    #[arg(long)]
    same_owner: bool,

    /// Exit immediately on any extraction error, instead of printing a
    /// warning and continuing. Either way the exit code will be nonzero.
    #[arg(long)]
    freakout: bool,

    /// Print version banner and exit.
    #[arg(long)]
    version: bool,

    /// Print software license and exit.
    #[arg(long)]
    license: bool,

    /// Print contributors and exit.
    #[arg(long)]
    contributors: bool,

    /// Tar file to extract from.
    #[arg(short = 'x', value_name = "ARCHIVE")]
    extract: Option<PathBuf>,

    /// Tar file to create. Will be overwritten if it already exists.
    #[arg(short = 'c', value_name = "ARCHIVE")]
    create: Option<PathBuf>,

    /// Extract archive contents to DIR rather than to the current working
    /// directory.
    #[arg(short = 'C', value_name = "DIR")]
    directory: Option<PathBuf>,

    /// Files and directories to archive.
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,
}

fn fatal(err: &Error) -> ! {
    eprintln!("Fatal: {err:#}");
    process::exit(1);
}

fn fail_usage(text: &str) -> ! {
    eprintln!("{text}\nRun 'reftar --help' for a command synopsis.");
    process::exit(1);
}

/// `-C DIR` made absolute against the working directory, lexically cleaned.
fn fully_qualify(dir: Option<PathBuf>) -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match dir {
        None => cwd,
        Some(dir) => {
            let dir = clean_path(&dir);
            if dir.is_absolute() {
                dir
            } else {
                clean_path(&cwd.join(dir))
            }
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if args.version {
        print!("{BANNER}");
        return;
    }
    if args.license {
        print!("{}", include_str!("../LICENSE.txt"));
        return;
    }
    if args.contributors {
        print!("{}", include_str!("../CONTRIBUTORS.md"));
        return;
    }

    match (&args.create, &args.extract) {
        (None, None) => fail_usage(
            "Fatal: Neither an archive to extract from, nor an archive to create have been specified.",
        ),
        (Some(_), Some(_)) => fail_usage(
            "Fatal: Both an archive to extract from, and an archive to create have been specified.",
        ),
        (Some(_), None) => {
            if args.directory.is_some() {
                fail_usage("Fatal: -C is only valid in combination with -x (extract).");
            }
            if args.same_owner {
                fail_usage("Fatal: --same-owner is only valid in combination with -x (extract).");
            }
            if args.freakout {
                fail_usage("Fatal: --freakout is only valid in combination with -x (extract).");
            }
        }
        (None, Some(_)) => {}
    }

    // Single consumer for the progress side channel; joined before the
    // final status is reported so ordering holds.
    let (sender, receiver) = mpsc::channel::<ProgressMessage>();
    let verbose = args.verbose;
    let printer = thread::spawn(move || {
        for message in receiver {
            match message.kind {
                MessageKind::Verbose => {
                    if verbose {
                        println!("{}", message.text);
                    }
                }
                MessageKind::Warning => eprintln!("Warning: {}", message.text),
            }
        }
    });
    let progress = Progress::new(sender);

    if let Some(archive) = &args.create {
        let options = CreateOptions {
            follow_symlinks: args.follow_symlinks,
            no_recursion: args.no_recursion,
        };
        let result = create_archive(archive, &args.paths, &options, &progress);
        drop(progress);
        printer.join().expect("progress printer panicked");
        if let Err(err) = result {
            fatal(&err);
        }
    } else if let Some(archive) = &args.extract {
        let archive = match File::open(archive) {
            Ok(file) => file,
            Err(err) => fatal(&err.into()),
        };
        let options = ExtractOptions {
            same_owner: args.same_owner,
            freakout: args.freakout,
        };
        let extract_dir = fully_qualify(args.directory.clone());
        let result = extract_archive(&extract_dir, &archive, &options, &progress);
        drop(progress);
        printer.join().expect("progress printer panicked");
        match result {
            Err(err) => fatal(&err),
            Ok(false) => {
                eprintln!("Warning: One or more errors were encountered, and ignored.");
                process::exit(1);
            }
            Ok(true) => {}
        }
    }
}
