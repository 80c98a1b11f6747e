//! Block-addressed access to a disk image.

use std::ffi::c_long;
use std::fs::{File, OpenOptions};
use std::io;
use std::io::{Error, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use libc::ioctl;

use crate::block::BLOCK_SIZE;

/// ioctl macro: Command.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

/// ioctl macro: Read command.
macro_rules! ior {
    ($a:expr, $b:expr, $c:ty) => {
        ioc!(2, $a, $b, std::mem::size_of::<$c>() as c_long)
    };
}

/// ioctl command: Get size of a block device in bytes.
const BLKGETSIZE64: c_long = ior!(0x12, 114, u64);

/// A disk image addressed in whole blocks.
///
/// The backing store is either a regular file, size-provisioned on open, or a
/// block device large enough to hold the requested number of blocks. Every
/// transfer moves exactly one block; the disk keeps per-instance read and
/// write counters. Dropping the value closes the image.
#[derive(Debug)]
pub struct Disk {
    file: File,
    blocks: u32,
    reads: u64,
    writes: u64,
}

impl Disk {
    /// Opens the image at `path` and provisions it to hold `blocks` blocks.
    ///
    /// Regular files are created if absent and resized to exactly
    /// `blocks * BLOCK_SIZE` bytes; block devices must already be at least
    /// that large.
    pub fn open(path: &Path, blocks: u32) -> io::Result<Self> {
        if blocks == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "zero-block disk"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = blocks as u64 * BLOCK_SIZE as u64;
        let file_type = file.metadata()?.file_type();
        if file_type.is_block_device() || file_type.is_char_device() {
            if device_size(&file)? < len {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("device cannot hold {blocks} blocks"),
                ));
            }
        } else {
            file.set_len(len)?;
        }
        Ok(Self {
            file,
            blocks,
            reads: 0,
            writes: 0,
        })
    }

    /// Returns the number of blocks on the disk.
    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    /// Returns the number of blocks read since open.
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// Returns the number of blocks written since open.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    fn seek_to(&mut self, block: u32) -> io::Result<()> {
        if block >= self.blocks {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("block {block} out of range (disk has {})", self.blocks),
            ));
        }
        self.file
            .seek(SeekFrom::Start(block as u64 * BLOCK_SIZE as u64))?;
        Ok(())
    }

    /// Reads one whole block into `buf`.
    pub fn read(&mut self, block: u32, buf: &mut [u8; BLOCK_SIZE]) -> io::Result<()> {
        self.seek_to(block)?;
        self.file.read_exact(buf)?;
        self.reads += 1;
        Ok(())
    }

    /// Writes one whole block from `buf`.
    pub fn write(&mut self, block: u32, buf: &[u8; BLOCK_SIZE]) -> io::Result<()> {
        self.seek_to(block)?;
        self.file.write_all(buf)?;
        self.writes += 1;
        Ok(())
    }
}

/// Returns the size in bytes of the block device backing `dev`.
fn device_size(dev: &File) -> io::Result<u64> {
    let mut size: u64 = 0;
    let ret = unsafe { ioctl(dev.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    Ok(size)
}
