//! On-disk file system ("kfs")
//!
//! A fixed three-region layout over 4096-byte blocks, all integers
//! little-endian:
//!
//! | Region | Blocks | Contents |
//! |---|---|---|
//! | Boot block | 0 | counts + up to 63 directory entries |
//! | Inode table | 1 .. 1+Ninodes | 4-byte length + 1023 block indices each |
//! | Data blocks | rest | raw 4096-byte chunks |
//!
//! Files have a fixed size: writes overwrite in place and truncate at
//! end-of-file, reads return 0 there.
//!
//! Locking follows the kernel's critical-section discipline. The
//! open-file table and boot block live behind a lock that is only taken
//! inside interrupt-disabled sections and never held across anything
//! that blocks. Device transfers go through a *transfer token*
//! ([`KfsIo`]): a transaction takes the token (parking on a condition
//! when another transaction holds it), performs its seek/transfer pairs
//! with no lock held, and puts the token back. The token also owns the
//! block-sized inode scratch buffer, so nothing block-sized ever lands
//! on a one-page kernel stack.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;

use spin::Mutex;

#[cfg(target_arch = "riscv64")]
use crate::sync::condition::Condition;

use crate::error::{FsError, KernelError, KernelResult};
use crate::io::{self, Control, IoStream};
use crate::sync::critical;
use crate::sync::once_lock::OnceLock;

/// Filesystem block size.
pub const FS_BLKSZ: usize = 4096;

/// Length of a directory-entry name; not null-terminated when exactly 32.
pub const FS_NAMELEN: usize = 32;

/// Open-file slots.
pub const FS_MAXOPEN: usize = 32;

/// Directory entries in the boot block.
pub const FS_MAXDENTRY: usize = 63;

/// Data-block indices per inode.
pub const INODE_DATA_BLOCKS: usize = 1023;

/// Largest representable file.
pub const FS_MAXFILE: usize = INODE_DATA_BLOCKS * FS_BLKSZ;

/// Byte offset of the directory entries inside block 0 (after the three
/// counts and 52 reserved bytes). Entries are 64 bytes apart: 32-byte
/// name, 4-byte inode index, 28 reserved.
const DENTRY_BASE: usize = 64;
const DENTRY_SIZE: usize = 64;

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

/// The three counts at the head of block 0.
#[derive(Debug, Clone, Copy)]
pub struct BootBlock {
    pub num_dentry: u32,
    pub num_inodes: u32,
    pub num_data: u32,
}

impl BootBlock {
    pub fn parse(block: &[u8]) -> Self {
        Self {
            num_dentry: read_u32(block, 0),
            num_inodes: read_u32(block, 4),
            num_data: read_u32(block, 8),
        }
    }
}

/// Compare a sought name against a stored 32-byte, zero-padded name.
/// At most 32 bytes participate.
pub fn dentry_name_matches(stored: &[u8], sought: &[u8]) -> bool {
    if sought.len() > FS_NAMELEN || stored.len() < FS_NAMELEN {
        return false;
    }
    if stored[..sought.len()] != *sought {
        return false;
    }
    sought.len() == FS_NAMELEN || stored[sought.len()] == 0
}

#[derive(Clone, Copy, Default)]
struct FileSlot {
    in_use: bool,
    inode: u32,
    size: u64,
    pos: u64,
}

/// Metadata guarded by short interrupt-disabled sections: the mounted
/// counts, the raw boot block (directory scans read it in place), and
/// the open-file table.
struct KfsState {
    boot: BootBlock,
    boot_block: Box<[u8]>,
    files: [FileSlot; FS_MAXOPEN],
}

impl KfsState {
    /// Scan the directory for `name`, returning its inode index.
    fn dentry_lookup(&self, name: &[u8]) -> Option<u32> {
        let count = (self.boot.num_dentry as usize).min(FS_MAXDENTRY);
        for i in 0..count {
            let base = DENTRY_BASE + i * DENTRY_SIZE;
            if dentry_name_matches(&self.boot_block[base..base + FS_NAMELEN], name) {
                return Some(read_u32(&self.boot_block, base + FS_NAMELEN));
            }
        }
        None
    }
}

/// The transfer token: exclusive use of the backing device plus the
/// inode scratch block. Held by value for the duration of a transaction,
/// so no lock spans the blocking device I/O.
struct KfsIo {
    device: Arc<dyn IoStream>,
    boot: BootBlock,
    inode_buf: Box<[u8]>,
}

impl KfsIo {
    /// Byte offset of an inode record on the device.
    fn inode_offset(&self, inode: u32) -> u64 {
        (FS_BLKSZ + inode as usize * FS_BLKSZ) as u64
    }

    /// Byte offset of a data block on the device.
    fn data_block_offset(&self, data_block: u32) -> u64 {
        (FS_BLKSZ + self.boot.num_inodes as usize * FS_BLKSZ + data_block as usize * FS_BLKSZ)
            as u64
    }

    /// Pull an inode record into the scratch block; returns the file
    /// byte length stored in it.
    fn load_inode(&mut self, inode: u32) -> KernelResult<u32> {
        io::seek(&*self.device, self.inode_offset(inode))?;
        io::read_exact(&*self.device, &mut self.inode_buf)?;
        Ok(read_u32(&self.inode_buf, 0))
    }

    /// Data-block index `index` of the loaded inode record.
    fn loaded_data_block(&self, index: usize) -> u32 {
        read_u32(&self.inode_buf, 4 + index * 4)
    }
}

/// The mounted filesystem.
pub struct Kfs {
    state: Mutex<KfsState>,
    /// `None` while a transaction holds the transfer token.
    io: Mutex<Option<KfsIo>>,
    /// Broadcast when the token returns.
    #[cfg(target_arch = "riscv64")]
    io_released: Condition,
}

static KFS: OnceLock<Arc<Kfs>> = OnceLock::new();

impl Kfs {
    /// Short metadata critical section: interrupts disabled, never
    /// blocks.
    fn with_state<R>(&self, f: impl FnOnce(&mut KfsState) -> R) -> R {
        critical(|| f(&mut self.state.lock()))
    }

    /// Take the transfer token, parking until the current holder puts
    /// it back.
    fn acquire_io(&self) -> KfsIo {
        critical(|| loop {
            if let Some(io) = self.io.lock().take() {
                return io;
            }
            #[cfg(target_arch = "riscv64")]
            self.io_released.wait();
            #[cfg(not(target_arch = "riscv64"))]
            unreachable!("transfer token missing on a single-threaded host");
        })
    }

    /// Return the transfer token and wake parked transactions.
    fn release_io(&self, io: KfsIo) {
        critical(|| {
            *self.io.lock() = Some(io);
        });
        #[cfg(target_arch = "riscv64")]
        self.io_released.broadcast();
    }
}

/// Mount the filesystem from a rewindable stream (the block device).
///
/// Reads the boot block and rejects the mount when the counts are
/// unusable or a filesystem is already mounted.
pub fn mount(device: Arc<dyn IoStream>) -> KernelResult<()> {
    if KFS.get().is_some() {
        return Err(KernelError::FsError(FsError::AlreadyMounted));
    }

    io::seek(&*device, 0)?;
    let mut boot_block = vec![0u8; FS_BLKSZ].into_boxed_slice();
    io::read_exact(&*device, &mut boot_block)?;
    let boot = BootBlock::parse(&boot_block);

    if boot.num_inodes == 0 || boot.num_data == 0 {
        return Err(KernelError::FsError(FsError::BadBootBlock));
    }

    crate::println!(
        "[KFS] mounted: {} dentries, {} inodes, {} data blocks",
        boot.num_dentry,
        boot.num_inodes,
        boot.num_data
    );

    let kfs = Arc::new(Kfs {
        state: Mutex::new(KfsState {
            boot,
            boot_block,
            files: [FileSlot::default(); FS_MAXOPEN],
        }),
        io: Mutex::new(Some(KfsIo {
            device,
            boot,
            inode_buf: vec![0u8; FS_BLKSZ].into_boxed_slice(),
        })),
        #[cfg(target_arch = "riscv64")]
        io_released: Condition::new("kfs io released"),
    });
    KFS.set(kfs)
        .map_err(|_| KernelError::FsError(FsError::AlreadyMounted))
}

/// The mounted filesystem, if any.
pub fn mounted() -> Option<&'static Arc<Kfs>> {
    KFS.get()
}

/// Open a file by name on the mounted filesystem.
pub fn open(name: &[u8]) -> KernelResult<Arc<dyn IoStream>> {
    let kfs = KFS
        .get()
        .ok_or(KernelError::NotInitialized { subsystem: "kfs" })?;
    kfs.open_file(kfs, name)
}

impl Kfs {
    fn open_file(&self, self_arc: &Arc<Kfs>, name: &[u8]) -> KernelResult<Arc<dyn IoStream>> {
        // Reserve a slot and resolve the name in one critical section;
        // the slot keeps concurrent opens off it while the inode loads.
        let (slot, inode_index) = self.with_state(|state| {
            let slot = state
                .files
                .iter()
                .position(|f| !f.in_use)
                .ok_or(KernelError::FsError(FsError::TooManyOpenFiles))?;
            let inode = state
                .dentry_lookup(name)
                .ok_or(KernelError::FsError(FsError::NotFound))?;
            state.files[slot] = FileSlot {
                in_use: true,
                inode,
                size: 0,
                pos: 0,
            };
            Ok::<_, KernelError>((slot, inode))
        })?;

        let mut io = self.acquire_io();
        let loaded = io.load_inode(inode_index);
        self.release_io(io);

        match loaded {
            Ok(byte_len) => {
                self.with_state(|state| state.files[slot].size = byte_len as u64);
                Ok(Arc::new(FileStream {
                    fs: Arc::clone(self_arc),
                    slot,
                }))
            }
            Err(e) => {
                self.with_state(|state| state.files[slot] = FileSlot::default());
                Err(e)
            }
        }
    }
}

/// A stream over one open file. The slot is released on close; clones of
/// the `Arc` made by `fork` share the slot and its cursor.
pub struct FileStream {
    fs: Arc<Kfs>,
    slot: usize,
}

impl FileStream {
    /// Run `op` for each block span of `[pos, pos + len)`, stopping at
    /// end-of-file. `op` receives the device, the device byte offset and
    /// the span within the caller's buffer.
    ///
    /// The slot is snapshotted under the state lock, the transfer runs
    /// under the token with no lock held, and the cursor is published
    /// afterwards if the slot still names this file.
    fn transfer_spans(
        &self,
        len: usize,
        mut op: impl FnMut(&dyn IoStream, u64, usize, usize) -> KernelResult<()>,
    ) -> KernelResult<usize> {
        let (inode, size, start_pos) = self.fs.with_state(|state| {
            let file = state.files[self.slot];
            if !file.in_use {
                return Err(KernelError::StreamClosed);
            }
            Ok((file.inode, file.size, file.pos))
        })?;
        if start_pos >= size {
            return Ok(0);
        }
        // Clamp to the fixed file size; the file never grows.
        let len = len.min((size - start_pos) as usize);

        let mut io = self.fs.acquire_io();
        let outcome: KernelResult<(usize, u64)> = (|| {
            io.load_inode(inode)?;

            let mut done = 0usize;
            let mut pos = start_pos;
            while done < len {
                let block_index = (pos / FS_BLKSZ as u64) as usize;
                if block_index >= INODE_DATA_BLOCKS {
                    break;
                }
                let offset = (pos % FS_BLKSZ as u64) as usize;
                let chunk = (FS_BLKSZ - offset).min(len - done);
                let device_offset =
                    io.data_block_offset(io.loaded_data_block(block_index)) + offset as u64;

                op(&*io.device, device_offset, done, chunk)?;

                done += chunk;
                pos += chunk as u64;
            }
            Ok((done, pos))
        })();
        self.fs.release_io(io);
        let (done, pos) = outcome?;

        self.fs.with_state(|state| {
            let file = &mut state.files[self.slot];
            // The slot may have been closed and reopened for another
            // file while the transfer was in flight.
            if file.in_use && file.inode == inode {
                file.pos = pos;
            }
        });
        Ok(done)
    }
}

impl IoStream for FileStream {
    fn close(&self) {
        self.fs
            .with_state(|state| state.files[self.slot] = FileSlot::default());
    }

    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        self.transfer_spans(buf.len(), |dev, offset, done, chunk| {
            io::seek(dev, offset)?;
            io::read_exact(dev, &mut buf[done..done + chunk])
        })
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        self.transfer_spans(buf.len(), |dev, offset, done, chunk| {
            io::seek(dev, offset)?;
            let written = dev.write(&buf[done..done + chunk])?;
            if written != chunk {
                return Err(KernelError::FsError(FsError::IoError));
            }
            Ok(())
        })
    }

    fn control(&self, op: Control) -> KernelResult<u64> {
        self.fs.with_state(|state| {
            let file = &mut state.files[self.slot];
            if !file.in_use {
                return Err(KernelError::StreamClosed);
            }
            match op {
                Control::GetLen => Ok(file.size),
                Control::GetPos => Ok(file.pos),
                Control::SetPos(pos) => {
                    if pos > file.size {
                        return Err(KernelError::InvalidArgument {
                            name: "pos",
                            value: "beyond end of file",
                        });
                    }
                    file.pos = pos;
                    Ok(0)
                }
                Control::GetBlkSz => Ok(FS_BLKSZ as u64),
            }
        })
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::error::KernelResult;
    use crate::io::memory::MemoryIo;

    /// Build a disk image: boot block, `inodes` inode blocks, then data
    /// blocks. Each file entry is (name, inode, size, data blocks).
    fn build_disk(
        num_inodes: u32,
        num_data: u32,
        files: &[(&[u8], u32, u32, &[u32])],
        data: &[(u32, Vec<u8>)],
    ) -> Vec<u8> {
        let total_blocks = 1 + num_inodes as usize + num_data as usize;
        let mut disk = vec![0u8; total_blocks * FS_BLKSZ];

        disk[0..4].copy_from_slice(&(files.len() as u32).to_le_bytes());
        disk[4..8].copy_from_slice(&num_inodes.to_le_bytes());
        disk[8..12].copy_from_slice(&num_data.to_le_bytes());

        for (i, (name, inode, size, blocks)) in files.iter().enumerate() {
            let base = DENTRY_BASE + i * DENTRY_SIZE;
            disk[base..base + name.len()].copy_from_slice(name);
            disk[base + FS_NAMELEN..base + FS_NAMELEN + 4].copy_from_slice(&inode.to_le_bytes());

            let ibase = (1 + *inode as usize) * FS_BLKSZ;
            disk[ibase..ibase + 4].copy_from_slice(&size.to_le_bytes());
            for (j, b) in blocks.iter().enumerate() {
                let o = ibase + 4 + j * 4;
                disk[o..o + 4].copy_from_slice(&b.to_le_bytes());
            }
        }

        for (block, bytes) in data {
            let base = (1 + num_inodes as usize + *block as usize) * FS_BLKSZ;
            disk[base..base + bytes.len()].copy_from_slice(bytes);
        }
        disk
    }

    fn fresh_fs(disk: Vec<u8>) -> Arc<Kfs> {
        let device: Arc<dyn IoStream> = Arc::new(MemoryIo::new(disk.into_boxed_slice()));
        let mut boot_block = vec![0u8; FS_BLKSZ].into_boxed_slice();
        io::seek(&*device, 0).unwrap();
        io::read_exact(&*device, &mut boot_block).unwrap();
        let boot = BootBlock::parse(&boot_block);
        Arc::new(Kfs {
            state: Mutex::new(KfsState {
                boot,
                boot_block,
                files: [FileSlot::default(); FS_MAXOPEN],
            }),
            io: Mutex::new(Some(KfsIo {
                device,
                boot,
                inode_buf: vec![0u8; FS_BLKSZ].into_boxed_slice(),
            })),
            #[cfg(target_arch = "riscv64")]
            io_released: Condition::new("kfs io released"),
        })
    }

    #[test_case]
    fn boot_block_counts_and_name_compare() -> KernelResult<()> {
        let disk = build_disk(2, 2, &[(b"hello.txt", 0, 11, &[0])], &[]);
        let boot = BootBlock::parse(&disk[..FS_BLKSZ]);
        assert_eq!(boot.num_dentry, 1);
        assert_eq!(boot.num_inodes, 2);
        assert_eq!(boot.num_data, 2);

        let fs = fresh_fs(disk);
        fs.with_state(|state| {
            assert_eq!(state.dentry_lookup(b"hello.txt"), Some(0));
            // Prefixes and extensions of a stored name do not match.
            assert_eq!(state.dentry_lookup(b"hello"), None);
            assert_eq!(state.dentry_lookup(b"hello.txt.bak"), None);
        });
        Ok(())
    }

    #[test_case]
    fn full_width_names_need_no_terminator() -> KernelResult<()> {
        let name: &[u8; FS_NAMELEN] = b"abcdefghijklmnopqrstuvwxyz012345";
        let disk = build_disk(1, 1, &[(name, 0, 1, &[0])], &[]);
        let fs = fresh_fs(disk);
        fs.with_state(|state| {
            assert_eq!(state.dentry_lookup(name), Some(0));
            assert_eq!(state.dentry_lookup(&name[..31]), None);
        });
        Ok(())
    }

    #[test_case]
    fn read_whole_file_then_eof() -> KernelResult<()> {
        let disk = build_disk(
            2,
            2,
            &[(b"hello.txt", 0, 11, &[1])],
            &[(1, b"hello world".to_vec())],
        );
        let fs = fresh_fs(disk);
        let file = fs.open_file(&fs, b"hello.txt")?;

        assert_eq!(file.control(Control::GetLen)?, 11);
        let mut buf = [0u8; 32];
        assert_eq!(file.read(&mut buf)?, 11);
        assert_eq!(&buf[..11], b"hello world");
        // Subsequent read is at end-of-file.
        assert_eq!(file.read(&mut buf)?, 0);
        Ok(())
    }

    #[test_case]
    fn write_then_read_back_round_trips() -> KernelResult<()> {
        let disk = build_disk(
            2,
            2,
            &[(b"hello.txt", 0, 11, &[1])],
            &[(1, b"hello world".to_vec())],
        );
        let fs = fresh_fs(disk);
        let file = fs.open_file(&fs, b"hello.txt")?;

        assert_eq!(file.write(b"NEW CONTENT")?, 11);
        file.control(Control::SetPos(0))?;
        let mut buf = [0u8; 11];
        assert_eq!(file.read(&mut buf)?, 11);
        assert_eq!(&buf, b"NEW CONTENT");
        Ok(())
    }

    #[test_case]
    fn writes_do_not_grow_the_file() -> KernelResult<()> {
        let disk = build_disk(2, 2, &[(b"f", 0, 4, &[0])], &[(0, b"abcd".to_vec())]);
        let fs = fresh_fs(disk);
        let file = fs.open_file(&fs, b"f")?;

        // Only 4 bytes fit; the rest truncates.
        assert_eq!(file.write(b"123456")?, 4);
        assert_eq!(file.control(Control::GetPos)?, 4);
        assert_eq!(file.write(b"x")?, 0);
        Ok(())
    }

    #[test_case]
    fn reads_span_multiple_data_blocks() -> KernelResult<()> {
        // File of 2 blocks mapped out of order: file block 0 -> data 1,
        // file block 1 -> data 0.
        let mut first = vec![0u8; FS_BLKSZ];
        let mut second = vec![0u8; FS_BLKSZ];
        first.fill(b'A');
        second.fill(b'B');
        let disk = build_disk(
            1,
            2,
            &[(b"big", 0, (2 * FS_BLKSZ) as u32, &[1, 0])],
            &[(1, first), (0, second)],
        );
        let fs = fresh_fs(disk);
        let file = fs.open_file(&fs, b"big")?;

        let mut buf = vec![0u8; 2 * FS_BLKSZ];
        assert_eq!(file.read(&mut buf)?, 2 * FS_BLKSZ);
        assert!(buf[..FS_BLKSZ].iter().all(|&b| b == b'A'));
        assert!(buf[FS_BLKSZ..].iter().all(|&b| b == b'B'));
        Ok(())
    }

    #[test_case]
    fn set_pos_bounds_and_slot_reuse() -> KernelResult<()> {
        let disk = build_disk(2, 2, &[(b"f", 0, 4, &[0])], &[]);
        let fs = fresh_fs(disk);
        let file = fs.open_file(&fs, b"f")?;
        assert!(file.control(Control::SetPos(5)).is_err());
        assert!(file.control(Control::SetPos(4)).is_ok());

        file.close();
        // Closed stream rejects further operations.
        assert!(file.read(&mut [0u8; 1]).is_err());
        // The slot is free again.
        let again = fs.open_file(&fs, b"f")?;
        assert_eq!(again.control(Control::GetPos)?, 0);
        Ok(())
    }

    #[test_case]
    fn transfer_token_returns_after_use() -> KernelResult<()> {
        let disk = build_disk(2, 2, &[(b"f", 0, 4, &[0])], &[(0, b"abcd".to_vec())]);
        let fs = fresh_fs(disk);
        let file = fs.open_file(&fs, b"f")?;
        let mut buf = [0u8; 4];
        file.read(&mut buf)?;
        // The token is back in its slot once the transfer completes.
        assert!(critical(|| fs.io.lock().is_some()));
        Ok(())
    }
}
