//! The file-system engine: mount-time verification, the free-block bitmap
//! reconstruction, inode allocation and removal, and the read/write paths.

use std::io;
use std::io::Write;

use log::{debug, trace};
use thiserror::Error;

use crate::bitmap::FreeMap;
use crate::block::{
    Block, Inode, SuperBlock, BLOCK_SIZE, INODES_PER_BLOCK, MAGIC, POINTERS_PER_BLOCK,
    POINTERS_PER_INODE,
};
use crate::disk::Disk;

/// Errors surfaced by file-system operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// The underlying disk transfer failed.
    #[error("disk error: {0}")]
    Io(#[from] io::Error),
    /// Block 0 does not describe a volume this disk could hold.
    #[error("bad superblock: {0}")]
    BadSuperblock(&'static str),
    /// The inode number is out of range or the slot holds no file.
    #[error("invalid inode {0}")]
    BadInode(u32),
    /// Every inode slot is taken.
    #[error("inode table is full")]
    OutOfInodes,
    /// The inode table references blocks outside the data region.
    #[error("corrupted image: {0}")]
    Corrupted(&'static str),
}

/// Error returned by a failed [`FileSystem::mount`].
///
/// Hands the disk back so the caller is left exactly where it started.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct MountError {
    /// The disk that could not be mounted.
    pub disk: Disk,
    /// Why the mount failed.
    #[source]
    pub source: FsError,
}

/// A mounted SimpleFS volume.
///
/// Owns the disk, the cached superblock and the free-block bitmap, so the
/// type system enforces the mount discipline: inode operations exist only on
/// a mounted volume, and a disk cannot be formatted or mounted twice while
/// this value holds it. Dropping the value unmounts.
#[derive(Debug)]
pub struct FileSystem {
    disk: Disk,
    meta: SuperBlock,
    free: FreeMap,
}

impl FileSystem {
    /// Writes a fresh, empty file system over every block of `disk`.
    ///
    /// Does not mount. The previous contents of the image are lost; if a
    /// write fails midway the image is left half-formatted.
    pub fn format(disk: &mut Disk) -> Result<(), FsError> {
        let meta = SuperBlock::for_blocks(disk.blocks());
        debug!(
            "formatting {} blocks: {} inode blocks, {} inodes",
            meta.blocks, meta.inode_blocks, meta.inodes
        );
        let mut block = Block::zeroed();
        block.set_superblock(&meta);
        disk.write(0, block.data())?;
        let zero = Block::zeroed();
        for b in 1..meta.blocks {
            disk.write(b, zero.data())?;
        }
        Ok(())
    }

    /// Verifies the image on `disk` and builds the in-memory metadata.
    ///
    /// On failure the disk comes back untouched inside [`MountError`].
    pub fn mount(mut disk: Disk) -> Result<Self, MountError> {
        match Self::read_metadata(&mut disk) {
            Ok((meta, free)) => Ok(Self { disk, meta, free }),
            Err(source) => Err(MountError { disk, source }),
        }
    }

    /// Releases the in-memory metadata and returns the disk.
    pub fn unmount(self) -> Disk {
        self.disk
    }

    /// Checks the superblock against the disk and rebuilds the free-block
    /// bitmap from the inode table.
    fn read_metadata(disk: &mut Disk) -> Result<(SuperBlock, FreeMap), FsError> {
        let mut block = Block::zeroed();
        disk.read(0, block.data_mut())?;
        let meta = block.superblock();
        if meta.magic != MAGIC {
            return Err(FsError::BadSuperblock("wrong magic number"));
        }
        if meta.blocks != disk.blocks() {
            return Err(FsError::BadSuperblock("block count does not match the disk"));
        }
        let expected = SuperBlock::for_blocks(disk.blocks());
        if meta.inode_blocks != expected.inode_blocks || meta.inodes != expected.inodes {
            return Err(FsError::BadSuperblock("inode table has the wrong geometry"));
        }

        // Every block starts out free; the metadata blocks and every block
        // referenced by a valid inode are then taken back. The inode table is
        // the only authority, so whatever a crash left in the data region is
        // reclaimed here.
        let mut free = FreeMap::new(meta.blocks);
        for b in 0..meta.data_start() {
            free.reserve(b);
        }
        let in_data_region = |b: u32| b >= meta.data_start() && b < meta.blocks;
        for table_block in 1..=meta.inode_blocks {
            disk.read(table_block, block.data_mut())?;
            for slot in 0..INODES_PER_BLOCK {
                let inode = block.inode(slot);
                if !inode.is_valid() {
                    continue;
                }
                for &d in &inode.direct {
                    if d == 0 {
                        continue;
                    }
                    if !in_data_region(d) {
                        return Err(FsError::Corrupted("direct pointer outside the data region"));
                    }
                    free.reserve(d);
                }
                if inode.indirect != 0 {
                    if !in_data_region(inode.indirect) {
                        return Err(FsError::Corrupted(
                            "indirect pointer outside the data region",
                        ));
                    }
                    free.reserve(inode.indirect);
                    let mut ptrs = Block::zeroed();
                    disk.read(inode.indirect, ptrs.data_mut())?;
                    for i in 0..POINTERS_PER_BLOCK {
                        let p = ptrs.pointer(i);
                        if p == 0 {
                            continue;
                        }
                        if !in_data_region(p) {
                            return Err(FsError::Corrupted(
                                "indirect entry outside the data region",
                            ));
                        }
                        free.reserve(p);
                    }
                }
            }
        }
        debug!(
            "mounted {} blocks, {} free",
            meta.blocks,
            free.free_blocks()
        );
        Ok((meta, free))
    }

    /// Returns the cached superblock.
    pub fn superblock(&self) -> &SuperBlock {
        &self.meta
    }

    /// Returns the free-block bitmap.
    pub fn free_map(&self) -> &FreeMap {
        &self.free
    }

    /// Returns the underlying disk.
    pub fn disk(&self) -> &Disk {
        &self.disk
    }

    /// Maps an inode number to its table block and slot within that block.
    fn inode_location(&self, inumber: u32) -> Result<(u32, usize), FsError> {
        if inumber >= self.meta.inodes {
            return Err(FsError::BadInode(inumber));
        }
        let table_block = 1 + inumber / INODES_PER_BLOCK as u32;
        let slot = inumber as usize % INODES_PER_BLOCK;
        Ok((table_block, slot))
    }

    /// Loads inode `inumber`, requiring a live file.
    fn load_inode(&mut self, inumber: u32) -> Result<Inode, FsError> {
        let (table_block, slot) = self.inode_location(inumber)?;
        let mut block = Block::zeroed();
        self.disk.read(table_block, block.data_mut())?;
        let inode = block.inode(slot);
        if !inode.is_valid() {
            return Err(FsError::BadInode(inumber));
        }
        Ok(inode)
    }

    /// Writes inode `inumber` back to its slot in the inode table.
    fn save_inode(&mut self, inumber: u32, inode: &Inode) -> Result<(), FsError> {
        let (table_block, slot) = self.inode_location(inumber)?;
        let mut block = Block::zeroed();
        self.disk.read(table_block, block.data_mut())?;
        block.set_inode(slot, inode);
        self.disk.write(table_block, block.data())?;
        Ok(())
    }

    /// Claims the first free inode slot and returns its number.
    ///
    /// The enclosing table block is written back before the number is handed
    /// out, so the claim survives an orderly unmount.
    pub fn create(&mut self) -> Result<u32, FsError> {
        let mut block = Block::zeroed();
        for table_block in 1..=self.meta.inode_blocks {
            self.disk.read(table_block, block.data_mut())?;
            for slot in 0..INODES_PER_BLOCK {
                if block.inode(slot).is_valid() {
                    continue;
                }
                block.set_inode(
                    slot,
                    &Inode {
                        valid: 1,
                        ..Inode::default()
                    },
                );
                self.disk.write(table_block, block.data())?;
                let inumber = (table_block - 1) * INODES_PER_BLOCK as u32 + slot as u32;
                trace!("created inode {inumber}");
                return Ok(inumber);
            }
        }
        Err(FsError::OutOfInodes)
    }

    /// Destroys inode `inumber` and frees every block it references.
    ///
    /// The freed blocks keep their contents on disk; a later allocation must
    /// not assume they come back zeroed.
    pub fn remove(&mut self, inumber: u32) -> Result<(), FsError> {
        let mut inode = self.load_inode(inumber)?;
        for d in &mut inode.direct {
            if *d != 0 {
                self.free.release(*d);
                *d = 0;
            }
        }
        if inode.indirect != 0 {
            let mut ptrs = Block::zeroed();
            self.disk.read(inode.indirect, ptrs.data_mut())?;
            for i in 0..POINTERS_PER_BLOCK {
                let p = ptrs.pointer(i);
                if p != 0 {
                    self.free.release(p);
                }
            }
            self.free.release(inode.indirect);
            inode.indirect = 0;
        }
        inode.valid = 0;
        inode.size = 0;
        self.save_inode(inumber, &inode)?;
        trace!("removed inode {inumber}");
        Ok(())
    }

    /// Returns the size in bytes of the file held by inode `inumber`.
    pub fn stat(&mut self, inumber: u32) -> Result<u32, FsError> {
        Ok(self.load_inode(inumber)?.size)
    }

    /// Returns the data block holding file block `q` of `inode`, or 0 when
    /// nothing is allocated there.
    fn block_at(&mut self, inode: &Inode, q: usize) -> Result<u32, FsError> {
        if q < POINTERS_PER_INODE {
            return Ok(inode.direct[q]);
        }
        let i = q - POINTERS_PER_INODE;
        if i >= POINTERS_PER_BLOCK || inode.indirect == 0 {
            return Ok(0);
        }
        let mut ptrs = Block::zeroed();
        self.disk.read(inode.indirect, ptrs.data_mut())?;
        Ok(ptrs.pointer(i))
    }

    /// Returns the data block backing file block `q`, allocating it (and the
    /// indirect block, when `q` spills past the direct pointers) on demand.
    ///
    /// `None` means the volume has no free block left, or `q` is past the
    /// last block an inode can address.
    fn map_or_allocate(&mut self, inode: &mut Inode, q: usize) -> Result<Option<u32>, FsError> {
        if q < POINTERS_PER_INODE {
            if inode.direct[q] == 0 {
                match self.free.allocate() {
                    Some(b) => {
                        trace!("allocated block {b} for direct slot {q}");
                        inode.direct[q] = b;
                    }
                    None => return Ok(None),
                }
            }
            return Ok(Some(inode.direct[q]));
        }
        let i = q - POINTERS_PER_INODE;
        if i >= POINTERS_PER_BLOCK {
            return Ok(None);
        }
        if inode.indirect == 0 {
            let Some(b) = self.free.allocate() else {
                return Ok(None);
            };
            // A fresh pointer block must read back as all "no block here".
            self.disk.write(b, Block::zeroed().data())?;
            trace!("allocated indirect block {b}");
            inode.indirect = b;
        }
        let mut ptrs = Block::zeroed();
        self.disk.read(inode.indirect, ptrs.data_mut())?;
        let mut p = ptrs.pointer(i);
        if p == 0 {
            match self.free.allocate() {
                Some(b) => {
                    trace!("allocated block {b} for indirect entry {i}");
                    ptrs.set_pointer(i, b);
                    self.disk.write(inode.indirect, ptrs.data())?;
                    p = b;
                }
                None => return Ok(None),
            }
        }
        Ok(Some(p))
    }

    /// Reads from the file in inode `inumber` starting at byte `offset`,
    /// filling as much of `data` as the file provides.
    ///
    /// Returns the number of bytes copied: 0 at or past end of file, and
    /// never more than the file holds past `offset`.
    pub fn read(&mut self, inumber: u32, data: &mut [u8], offset: u32) -> Result<usize, FsError> {
        let inode = self.load_inode(inumber)?;
        if offset >= inode.size {
            return Ok(0);
        }
        let mut remaining = data.len().min((inode.size - offset) as usize);
        let mut pos = offset as usize;
        let mut copied = 0;
        let mut block = Block::zeroed();
        while remaining > 0 {
            let q = pos / BLOCK_SIZE;
            let r = pos % BLOCK_SIZE;
            let target = self.block_at(&inode, q)?;
            if target == 0 {
                // An unallocated block inside the file; nothing more to copy.
                break;
            }
            self.disk.read(target, block.data_mut())?;
            let chunk = remaining.min(BLOCK_SIZE - r);
            data[copied..copied + chunk].copy_from_slice(&block.data()[r..r + chunk]);
            copied += chunk;
            pos += chunk;
            remaining -= chunk;
        }
        Ok(copied)
    }

    /// Writes `data` into the file in inode `inumber` at byte `offset`,
    /// allocating blocks on demand.
    ///
    /// Overwrites in place and grows `size` only when the end of the write
    /// passes it. Returns the number of bytes stored, which falls short of
    /// `data.len()` only when the volume runs out of free blocks.
    pub fn write(&mut self, inumber: u32, data: &[u8], offset: u32) -> Result<usize, FsError> {
        let mut inode = self.load_inode(inumber)?;
        let mut pos = offset as usize;
        let mut written = 0;
        let mut block = Block::zeroed();
        while written < data.len() {
            let q = pos / BLOCK_SIZE;
            let r = pos % BLOCK_SIZE;
            let Some(target) = self.map_or_allocate(&mut inode, q)? else {
                break;
            };
            let chunk = (data.len() - written).min(BLOCK_SIZE - r);
            // Read-modify-write keeps the bytes outside [r, r + chunk).
            self.disk.read(target, block.data_mut())?;
            block.data_mut()[r..r + chunk].copy_from_slice(&data[written..written + chunk]);
            self.disk.write(target, block.data())?;
            written += chunk;
            pos += chunk;
        }
        let end = offset as u64 + written as u64;
        if end > inode.size as u64 {
            inode.size = end as u32;
        }
        self.save_inode(inumber, &inode)?;
        Ok(written)
    }

    /// Writes the diagnostic report for the volume on `disk`.
    ///
    /// Works on any disk, mounted or not, and changes nothing. The report
    /// format is stable; shell tests compare it verbatim.
    pub fn debug<W: Write>(disk: &mut Disk, out: &mut W) -> Result<(), FsError> {
        let mut block = Block::zeroed();
        disk.read(0, block.data_mut())?;
        let meta = block.superblock();
        writeln!(out, "SuperBlock:")?;
        if meta.magic == MAGIC {
            writeln!(out, "    magic number is valid")?;
        } else {
            writeln!(out, "    magic number is not valid")?;
        }
        writeln!(out, "    {} blocks", meta.blocks)?;
        writeln!(out, "    {} inode blocks", meta.inode_blocks)?;
        writeln!(out, "    {} inodes", meta.inodes)?;

        // Walk only as many table blocks as both the superblock and the disk
        // can hold, so a garbage image cannot push reads out of range.
        let table_blocks = meta.inode_blocks.min(disk.blocks().saturating_sub(1));
        for table_block in 1..=table_blocks {
            disk.read(table_block, block.data_mut())?;
            for slot in 0..INODES_PER_BLOCK {
                let inode = block.inode(slot);
                if !inode.is_valid() {
                    continue;
                }
                let inumber = (table_block - 1) * INODES_PER_BLOCK as u32 + slot as u32;
                writeln!(out, "Inode {inumber}:")?;
                writeln!(out, "    size: {} bytes", inode.size)?;
                write!(out, "    direct blocks:")?;
                for &d in inode.direct.iter().filter(|&&d| d != 0) {
                    write!(out, " {d}")?;
                }
                writeln!(out)?;
                if inode.indirect != 0 {
                    writeln!(out, "    indirect block: {}", inode.indirect)?;
                    write!(out, "    indirect data blocks:")?;
                    if inode.indirect < disk.blocks() {
                        let mut ptrs = Block::zeroed();
                        disk.read(inode.indirect, ptrs.data_mut())?;
                        for i in 0..POINTERS_PER_BLOCK {
                            let p = ptrs.pointer(i);
                            if p != 0 {
                                write!(out, " {p}")?;
                            }
                        }
                    }
                    writeln!(out)?;
                }
            }
        }
        Ok(())
    }

    /// Writes the diagnostic report for this mounted volume.
    pub fn dump<W: Write>(&mut self, out: &mut W) -> Result<(), FsError> {
        Self::debug(&mut self.disk, out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    fn image_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sfs-fs-{name}-{}", std::process::id()))
    }

    fn fresh_fs(name: &str, blocks: u32) -> FileSystem {
        let path = image_path(name);
        let mut disk = Disk::open(&path, blocks).unwrap();
        FileSystem::format(&mut disk).unwrap();
        std::fs::remove_file(&path).unwrap();
        FileSystem::mount(disk).unwrap()
    }

    #[test]
    fn create_numbers_slots_in_order() {
        let mut fs = fresh_fs("create-order", 5);
        assert_eq!(fs.create().unwrap(), 0);
        assert_eq!(fs.create().unwrap(), 1);
        assert_eq!(fs.create().unwrap(), 2);
        // Freeing a low slot makes it the next grant again.
        fs.remove(1).unwrap();
        assert_eq!(fs.create().unwrap(), 1);
    }

    #[test]
    fn create_exhausts_the_table() {
        let mut fs = fresh_fs("create-full", 5);
        for expected in 0..128 {
            assert_eq!(fs.create().unwrap(), expected);
        }
        assert!(matches!(fs.create(), Err(FsError::OutOfInodes)));
    }

    #[test]
    fn remove_rejects_dead_and_out_of_range_inodes() {
        let mut fs = fresh_fs("remove-bad", 5);
        assert!(matches!(fs.remove(0), Err(FsError::BadInode(0))));
        assert!(matches!(fs.remove(4096), Err(FsError::BadInode(4096))));
        let ino = fs.create().unwrap();
        fs.remove(ino).unwrap();
        assert!(matches!(fs.remove(ino), Err(FsError::BadInode(0))));
    }

    #[test]
    fn stat_reports_size_of_live_inodes_only() {
        let mut fs = fresh_fs("stat", 5);
        let ino = fs.create().unwrap();
        assert_eq!(fs.stat(ino).unwrap(), 0);
        fs.write(ino, &[7u8; 965], 0).unwrap();
        assert_eq!(fs.stat(ino).unwrap(), 965);
        assert!(fs.stat(ino + 1).is_err());
    }

    #[test]
    fn overwrite_keeps_the_larger_size() {
        let mut fs = fresh_fs("overwrite", 5);
        let ino = fs.create().unwrap();
        assert_eq!(fs.write(ino, b"hello world", 0).unwrap(), 11);
        assert_eq!(fs.write(ino, b"HELLO", 0).unwrap(), 5);
        assert_eq!(fs.stat(ino).unwrap(), 11);
        let mut back = [0u8; 16];
        assert_eq!(fs.read(ino, &mut back, 0).unwrap(), 11);
        assert_eq!(&back[..11], b"HELLO world");
    }

    #[test]
    fn read_past_end_returns_zero() {
        let mut fs = fresh_fs("read-eof", 5);
        let ino = fs.create().unwrap();
        fs.write(ino, b"abc", 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(fs.read(ino, &mut buf, 3).unwrap(), 0);
        assert_eq!(fs.read(ino, &mut buf, 100).unwrap(), 0);
        // A short request near the end is clamped to the file size.
        assert_eq!(fs.read(ino, &mut buf, 1).unwrap(), 2);
        assert_eq!(&buf[..2], b"bc");
    }

    #[test]
    fn mount_rejects_the_wrong_magic() {
        let path = image_path("bad-magic");
        let disk = Disk::open(&path, 5).unwrap();
        // Never formatted: block 0 is all zeroes.
        let err = FileSystem::mount(disk).unwrap_err();
        assert!(matches!(err.source, FsError::BadSuperblock(_)));
        // The disk comes back usable.
        let mut disk = err.disk;
        FileSystem::format(&mut disk).unwrap();
        assert!(FileSystem::mount(disk).is_ok());
        std::fs::remove_file(&path).unwrap();
    }
}
