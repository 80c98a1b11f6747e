//! `sfssh` is the interactive shell driving a SimpleFS disk image.

use std::env;
use std::env::ArgsOs;
use std::fmt;
use std::fs::File;
use std::io;
use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::process::exit;

use sfs::disk::Disk;
use sfs::fs::{FileSystem, FsError, MountError};

/// Transfer unit for `copyin`/`copyout`: four stdio-sized buffers.
const COPY_CHUNK: usize = 4 * 8192;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// The path to the disk image.
    image: Option<PathBuf>,
    /// The number of blocks in the image.
    blocks: Option<String>,
    /// If true, more positional arguments were given than expected.
    extra: bool,
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    for arg in args {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            _ => {
                if res.image.is_none() {
                    res.image = Some(PathBuf::from(arg));
                } else if res.blocks.is_none() {
                    res.blocks = Some(arg.to_string_lossy().into_owned());
                } else {
                    res.extra = true;
                }
            }
        }
    }
    res
}

/// Prints command usage.
fn print_usage() {
    eprintln!("sfssh: bad usage");
    eprintln!("Try 'sfssh --help' for more information.");
}

/// Prints command line help.
fn print_help() {
    println!();
    println!("Usage:");
    println!(" sfssh <diskfile> <nblocks>");
    println!();
    println!("Opens the disk image at <diskfile>, sized to <nblocks> blocks,");
    println!("and starts an interactive session on it.");
    println!();
    println!("Options:");
    println!(" -h, --help\tPrints help.");
}

/// Prints help for the shell's internal commands.
fn print_cmd_help() {
    println!();
    println!("Commands:");
    println!(" format");
    println!(" mount");
    println!(" debug");
    println!(" create");
    println!(" remove <inode>");
    println!(" stat <inode>");
    println!(" cat <inode>");
    println!(" copyin <file> <inode>");
    println!(" copyout <inode> <file>");
    println!(" help");
    println!(" quit");
    println!(" exit");
    println!();
}

/// Writes an error to stderr, then exits.
fn error<M: fmt::Display>(msg: M) -> ! {
    eprintln!("sfssh: error: {msg}");
    exit(1);
}

/// Shows `text` and reads one line from stdin. `None` on end of input.
fn prompt(text: &str) -> Option<String> {
    print!("{text}");
    let _ = io::stdout().flush();
    io::stdin().lock().lines().next()?.ok()
}

/// The shell's view of the image: raw until a mount succeeds.
enum Session {
    Raw(Disk),
    Mounted(FileSystem),
}

enum Flow {
    Continue,
    Quit,
}

fn main() {
    env_logger::init();
    let mut args = env::args_os();
    // Skip the binary name.
    let _ = args.next();
    let args = parse_args(args);
    if args.help {
        print_help();
        exit(0);
    }
    let (Some(image), Some(blocks), false) = (args.image, args.blocks, args.extra) else {
        print_usage();
        exit(1);
    };
    let nblocks: u32 = blocks
        .parse()
        .unwrap_or_else(|_| error(format_args!("invalid block count `{blocks}`")));
    let disk = Disk::open(&image, nblocks)
        .unwrap_or_else(|e| error(format_args!("{}: {e}", image.display())));

    let mut session = Session::Raw(disk);
    while let Some(line) = prompt("sfs> ") {
        let words: Vec<&str> = line.split_whitespace().collect();
        let (next, flow) = handle_cmd(&words, session);
        session = next;
        if let Flow::Quit = flow {
            break;
        }
    }

    let disk = match session {
        Session::Raw(disk) => disk,
        Session::Mounted(fs) => fs.unmount(),
    };
    println!("{} disk block reads", disk.reads());
    println!("{} disk block writes", disk.writes());
}

fn handle_cmd(words: &[&str], mut session: Session) -> (Session, Flow) {
    match words {
        [] => {}

        ["help"] => print_cmd_help(),

        ["quit"] | ["exit"] => return (session, Flow::Quit),

        ["format"] => match &mut session {
            Session::Raw(disk) => match FileSystem::format(disk) {
                Ok(()) => println!("disk formatted."),
                Err(e) => eprintln!("format failed: {e}"),
            },
            Session::Mounted(_) => eprintln!("format failed: disk is mounted"),
        },

        ["mount"] => {
            session = match session {
                Session::Raw(disk) => match FileSystem::mount(disk) {
                    Ok(fs) => {
                        println!("disk mounted.");
                        Session::Mounted(fs)
                    }
                    Err(MountError { disk, source }) => {
                        eprintln!("mount failed: {source}");
                        Session::Raw(disk)
                    }
                },
                mounted => {
                    eprintln!("mount failed: disk is already mounted");
                    mounted
                }
            };
        }

        ["debug"] => {
            let mut out = io::stdout().lock();
            let result = match &mut session {
                Session::Raw(disk) => FileSystem::debug(disk, &mut out),
                Session::Mounted(fs) => fs.dump(&mut out),
            };
            if let Err(e) = result {
                eprintln!("debug failed: {e}");
            }
        }

        ["create"] => with_mounted(&mut session, |fs| match fs.create() {
            Ok(inumber) => println!("created inode {inumber}."),
            Err(e) => eprintln!("create failed: {e}"),
        }),

        ["remove", word] => {
            if let Some(inumber) = parse_inumber(word) {
                with_mounted(&mut session, |fs| match fs.remove(inumber) {
                    Ok(()) => println!("removed inode {inumber}."),
                    Err(e) => eprintln!("remove failed: {e}"),
                });
            }
        }
        ["remove", ..] => eprintln!("usage: remove <inode>"),

        ["stat", word] => {
            if let Some(inumber) = parse_inumber(word) {
                with_mounted(&mut session, |fs| match fs.stat(inumber) {
                    Ok(size) => println!("inode {inumber} has size {size} bytes."),
                    Err(e) => eprintln!("stat failed: {e}"),
                });
            }
        }
        ["stat", ..] => eprintln!("usage: stat <inode>"),

        ["cat", word] => {
            if let Some(inumber) = parse_inumber(word) {
                with_mounted(&mut session, |fs| {
                    let mut out = io::stdout().lock();
                    if let Err(e) = copyout(fs, inumber, &mut out) {
                        eprintln!("cat failed: {e}");
                    }
                });
            }
        }
        ["cat", ..] => eprintln!("usage: cat <inode>"),

        ["copyin", path, word] => {
            if let Some(inumber) = parse_inumber(word) {
                with_mounted(&mut session, |fs| {
                    match copyin(fs, Path::new(path), inumber) {
                        Ok((copied, false)) => println!("{copied} bytes copied."),
                        Ok((copied, true)) => println!("{copied} bytes copied (disk is full)."),
                        Err(e) => eprintln!("copyin failed: {e}"),
                    }
                });
            }
        }
        ["copyin", ..] => eprintln!("usage: copyin <file> <inode>"),

        ["copyout", word, path] => {
            if let Some(inumber) = parse_inumber(word) {
                with_mounted(&mut session, |fs| {
                    let result = File::create(path)
                        .map_err(FsError::from)
                        .and_then(|mut f| copyout(fs, inumber, &mut f));
                    match result {
                        Ok(copied) => println!("{copied} bytes copied."),
                        Err(e) => eprintln!("copyout failed: {e}"),
                    }
                });
            }
        }
        ["copyout", ..] => eprintln!("usage: copyout <inode> <file>"),

        _ => {
            eprintln!("unknown command: {}", words.join(" "));
            print_cmd_help();
        }
    }
    (session, Flow::Continue)
}

/// Runs `f` on the mounted file system, or reports that there is none.
fn with_mounted(session: &mut Session, f: impl FnOnce(&mut FileSystem)) {
    match session {
        Session::Mounted(fs) => f(fs),
        Session::Raw(_) => eprintln!("disk is not mounted"),
    }
}

fn parse_inumber(word: &str) -> Option<u32> {
    match word.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            eprintln!("invalid inode number `{word}`");
            None
        }
    }
}

/// Streams the file in `inumber` into `out`, chunk by chunk, until a read
/// returns nothing. Returns the number of bytes copied.
fn copyout<W: Write>(fs: &mut FileSystem, inumber: u32, out: &mut W) -> Result<u64, FsError> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut offset: u32 = 0;
    loop {
        let n = fs.read(inumber, &mut buf, offset)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        offset += n as u32;
    }
    Ok(offset as u64)
}

/// Streams the host file at `path` into `inumber` at increasing offsets.
///
/// Returns the number of bytes copied and whether the transfer stopped early
/// because the volume filled up.
fn copyin(fs: &mut FileSystem, path: &Path, inumber: u32) -> Result<(u64, bool), FsError> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut offset: u32 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let written = fs.write(inumber, &buf[..n], offset)?;
        offset += written as u32;
        if written < n {
            return Ok((offset as u64, true));
        }
    }
    Ok((offset as u64, false))
}
