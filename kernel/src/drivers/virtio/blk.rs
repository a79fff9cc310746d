//! Virtio block device driver
//!
//! Implements a block device driver for virtio-mmio block devices as
//! described in the virtio specification, section 5.2.
//!
//! # Request format
//!
//! Each request is a three-descriptor chain behind an indirect head:
//!
//! 1. **Header** (device-readable): [`VioBlkReqHeader`] with request type
//!    and sector
//! 2. **Data** (device-writable for read, device-readable for write): one
//!    device block
//! 3. **Status** (device-writable): single byte result (0 = OK,
//!    1 = IOERR, 2 = UNSUPP)
//!
//! The driver issues one transaction at a time and parks the calling
//! thread on a condition variable until the ISR observes the used ring
//! advance. A single cached block absorbs sub-block reads and makes
//! read-modify-write possible for sub-block writes, so the device only
//! ever sees full-block transfers.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;

use spin::Mutex;

use super::mmio::{self, VirtioMmioTransport, VIRTIO_ID_BLOCK};
use super::queue::SingleVirtq;
use crate::error::{KernelError, KernelResult};
use crate::io::{Control, IoStream};
use crate::sync::condition::Condition;
use crate::sync::intr;
use crate::sync::once_lock::OnceLock;

/// Virtio-blk feature bits (virtio spec 5.2.3; bit numbers, not masks).
pub mod features {
    /// Device is read-only.
    pub const VIRTIO_BLK_F_RO: u64 = 5;
    /// Block size of disk is in `blk_size`.
    pub const VIRTIO_BLK_F_BLK_SIZE: u64 = 6;
    /// The device accepts indirect descriptor tables.
    pub const VIRTIO_F_INDIRECT_DESC: u64 = 28;
    /// Modern (v1.0+) device.
    pub const VIRTIO_F_VERSION_1: u64 = 32;
}

/// Request types (virtio spec 5.2.6).
mod req_type {
    pub const VIRTIO_BLK_T_IN: u32 = 0;
    pub const VIRTIO_BLK_T_OUT: u32 = 1;
}

/// Status byte values written by the device.
mod blk_status {
    pub const VIRTIO_BLK_S_OK: u8 = 0;
    pub const VIRTIO_BLK_S_IOERR: u8 = 1;
    pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;
}

/// A 512-byte sector, the unit of the `sector` header field.
const SECTOR_SIZE: u64 = 512;

/// Request header, first descriptor in each chain.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VioBlkReqHeader {
    /// VIRTIO_BLK_T_IN (read) or VIRTIO_BLK_T_OUT (write)
    type_: u32,
    /// Must be zero
    reserved: u32,
    /// Starting sector (512-byte units)
    sector: u64,
}

/// DMA area for one request: header and status byte, heap-allocated so
/// the identity-mapped addresses can be handed to the device.
#[repr(C)]
struct VioBlkRequest {
    header: VioBlkReqHeader,
    status: u8,
}

struct VioBlkInner {
    vq: Box<SingleVirtq>,
    req: Box<VioBlkRequest>,
    /// One cached device block
    blkbuf: Box<[u8]>,
    /// Block number currently held in `blkbuf`
    bufblkno: Option<u64>,
    /// Stream byte position
    pos: u64,
    /// Device size in bytes
    size: u64,
    /// Optimal transfer size
    blksz: u32,
    /// Used-ring index consumed so far
    last_used_idx: u16,
    opened: bool,
    readonly: bool,
}

/// Virtio block device with a single outstanding transaction.
pub struct VioBlkDevice {
    transport: VirtioMmioTransport,
    irq: u32,
    /// Signalled from the ISR when the used ring advances.
    used_updated: Condition,
    inner: Mutex<VioBlkInner>,
}

/// The block device, if one was found during the boot probe.
static VIOBLK: OnceLock<VioBlkDevice> = OnceLock::new();

impl VioBlkDevice {
    /// Initialize a probed device: negotiate features, install the
    /// single-transaction queue, read the capacity.
    fn attach(transport: VirtioMmioTransport, irq: u32) -> KernelResult<VioBlkDevice> {
        transport.begin_init();

        let device_features = transport.read_device_features();
        // Indirect descriptors carry the three-descriptor chain; without
        // them the one-entry ring cannot hold a request.
        let needed = (1 << features::VIRTIO_F_VERSION_1) | (1 << features::VIRTIO_F_INDIRECT_DESC);
        if device_features & needed != needed {
            transport.set_failed();
            return Err(KernelError::OperationNotSupported {
                operation: "virtio-blk feature negotiation",
            });
        }
        let wanted = (1 << features::VIRTIO_BLK_F_BLK_SIZE) | (1 << features::VIRTIO_BLK_F_RO);
        let accepted = needed | (device_features & wanted);
        transport.write_driver_features(accepted);
        transport.set_features_ok()?;

        let readonly = accepted & (1 << features::VIRTIO_BLK_F_RO) != 0;

        // Device config: capacity in sectors at 0x00, blk_size at 0x14.
        let capacity_sectors = transport.read_config_u64(0x00);
        let blksz = if accepted & (1 << features::VIRTIO_BLK_F_BLK_SIZE) != 0 {
            transport.read_config_u32(0x14)
        } else {
            SECTOR_SIZE as u32
        };

        let vq = Box::new(SingleVirtq::new());
        let desc_pa = &vq.desc as *const _ as u64;
        let avail_pa = &vq.avail as *const _ as u64;
        let used_pa = &vq.used as *const _ as u64;
        transport.setup_queue(0, 1, desc_pa, avail_pa, used_pa)?;

        transport.set_driver_ok();

        crate::println!(
            "[VIOBLK] {} sectors ({} KB), block size {}, {}",
            capacity_sectors,
            capacity_sectors * SECTOR_SIZE / 1024,
            blksz,
            if readonly { "read-only" } else { "read-write" }
        );

        Ok(VioBlkDevice {
            transport,
            irq,
            used_updated: Condition::new("vioblk used_updated"),
            inner: Mutex::new(VioBlkInner {
                vq,
                req: Box::new(VioBlkRequest {
                    header: VioBlkReqHeader {
                        type_: 0,
                        reserved: 0,
                        sector: 0,
                    },
                    status: 0,
                }),
                blkbuf: vec![0u8; blksz as usize].into_boxed_slice(),
                bufblkno: None,
                pos: 0,
                size: capacity_sectors * SECTOR_SIZE,
                blksz,
                last_used_idx: 0,
                opened: false,
                readonly,
            }),
        })
    }

    /// Submit one block transaction and park until the ISR signals
    /// completion. `blkno` is in `blksz` units.
    fn block_io(&self, inner: &mut VioBlkInner, type_: u32, blkno: u64) -> KernelResult<()> {
        let blksz = inner.blksz;
        inner.req.header = VioBlkReqHeader {
            type_,
            reserved: 0,
            sector: blkno * (blksz as u64 / SECTOR_SIZE),
        };
        inner.req.status = 0xFF;

        let header = &inner.req.header as *const _ as u64;
        let status = &inner.req.status as *const _ as u64;
        let data = inner.blkbuf.as_ptr() as u64;
        inner.vq.prepare(
            header,
            core::mem::size_of::<VioBlkReqHeader>() as u32,
            data,
            blksz,
            status,
            type_ == req_type::VIRTIO_BLK_T_IN,
        );
        inner.vq.publish();
        self.transport.notify_queue(0);

        // Park until the used index advances past what we've consumed.
        let expected = inner.last_used_idx.wrapping_add(1);
        let saved = intr::disable();
        while inner.vq.used_idx() != expected {
            self.used_updated.wait();
        }
        intr::restore(saved);
        inner.last_used_idx = expected;

        match inner.req.status {
            blk_status::VIRTIO_BLK_S_OK => Ok(()),
            blk_status::VIRTIO_BLK_S_IOERR => Err(KernelError::DeviceError {
                device: "vioblk",
                code: blk_status::VIRTIO_BLK_S_IOERR as u32,
            }),
            blk_status::VIRTIO_BLK_S_UNSUPP => Err(KernelError::OperationNotSupported {
                operation: "virtio-blk request type",
            }),
            other => Err(KernelError::DeviceError {
                device: "vioblk",
                code: other as u32,
            }),
        }
    }

    /// Make `blkbuf` hold `blkno`, reloading from the device if needed.
    fn fill_cache(&self, inner: &mut VioBlkInner, blkno: u64) -> KernelResult<()> {
        if inner.bufblkno != Some(blkno) {
            self.block_io(inner, req_type::VIRTIO_BLK_T_IN, blkno)?;
            inner.bufblkno = Some(blkno);
        }
        Ok(())
    }

    /// Interrupt service routine: acknowledge what the device raised and
    /// wake the waiting thread.
    pub fn handle_interrupt(&self) {
        let status = self.transport.interrupt_status();
        // The status read must settle before the acknowledgement write.
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        self.transport.interrupt_ack(status);
        self.used_updated.broadcast();
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }
}

impl IoStream for VioBlkDevice {
    fn close(&self) {
        self.inner.lock().opened = false;
    }

    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        let blksz = inner.blksz as u64;
        let mut copied = 0usize;

        while copied < buf.len() {
            if inner.pos >= inner.size {
                break;
            }
            let blkno = inner.pos / blksz;
            let offset = (inner.pos % blksz) as usize;
            self.fill_cache(&mut inner, blkno)?;

            let available = (blksz as usize - offset)
                .min(buf.len() - copied)
                .min((inner.size - inner.pos) as usize);
            buf[copied..copied + available]
                .copy_from_slice(&inner.blkbuf[offset..offset + available]);
            copied += available;
            inner.pos += available as u64;
        }
        Ok(copied)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        if inner.readonly {
            return Err(KernelError::ReadOnlyDevice { device: "vioblk" });
        }
        let blksz = inner.blksz as u64;
        let mut written = 0usize;

        while written < buf.len() {
            // The device never grows; writes past the end truncate.
            if inner.pos >= inner.size {
                break;
            }
            let blkno = inner.pos / blksz;
            let offset = (inner.pos % blksz) as usize;
            let chunk = (blksz as usize - offset)
                .min(buf.len() - written)
                .min((inner.size - inner.pos) as usize);

            // Sub-block store: read-modify-write through the cache so the
            // device always receives a full block.
            if chunk < blksz as usize {
                self.fill_cache(&mut inner, blkno)?;
            }
            inner.blkbuf[offset..offset + chunk].copy_from_slice(&buf[written..written + chunk]);
            inner.bufblkno = Some(blkno);
            self.block_io(&mut inner, req_type::VIRTIO_BLK_T_OUT, blkno)?;

            written += chunk;
            inner.pos += chunk as u64;
        }
        Ok(written)
    }

    fn control(&self, op: Control) -> KernelResult<u64> {
        let mut inner = self.inner.lock();
        match op {
            Control::GetLen => Ok(inner.size),
            Control::GetPos => Ok(inner.pos),
            Control::SetPos(pos) => {
                if pos > inner.size {
                    return Err(KernelError::InvalidArgument {
                        name: "pos",
                        value: "beyond end of device",
                    });
                }
                inner.pos = pos;
                Ok(0)
            }
            Control::GetBlkSz => Ok(inner.blksz as u64),
        }
    }
}

/// Stream handle for an opened block device. Closing (or dropping the
/// last descriptor) releases the device for the next open.
pub struct VioBlkStream {
    dev: &'static VioBlkDevice,
}

impl IoStream for VioBlkStream {
    fn close(&self) {
        self.dev.close();
    }

    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        self.dev.read(buf)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        self.dev.write(buf)
    }

    fn control(&self, op: Control) -> KernelResult<u64> {
        self.dev.control(op)
    }
}

impl Drop for VioBlkStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Probe the virtio-mmio slots for a block device and attach the first
/// one found. Called once from boot.
pub fn init() {
    for slot in 0..mmio::VIRTIO_MMIO_SLOTS {
        let base = mmio::VIRTIO_MMIO_BASE + slot * mmio::VIRTIO_MMIO_STRIDE;
        let transport = VirtioMmioTransport::new(base);
        if transport.probe(VIRTIO_ID_BLOCK).is_err() {
            continue;
        }
        let irq = mmio::VIRTIO_IRQ_BASE + slot as u32;
        match VioBlkDevice::attach(transport, irq) {
            Ok(dev) => {
                crate::arch::riscv64::plic::enable_source(irq);
                if VIOBLK.set(dev).is_ok() {
                    crate::println!("[VIOBLK] device at {:#x}, irq {}", base, irq);
                }
                return;
            }
            Err(e) => {
                crate::println!("[VIOBLK] attach failed at {:#x}: {}", base, e);
            }
        }
    }
    crate::println!("[VIOBLK] no block device found");
}

/// The attached device, if any.
pub fn device() -> Option<&'static VioBlkDevice> {
    VIOBLK.get()
}

/// Open the block device as a stream. Only one open at a time; a second
/// open while the first is live reports the device busy.
pub fn open(instance: usize) -> KernelResult<Arc<dyn IoStream>> {
    if instance != 0 {
        return Err(KernelError::NotInitialized { subsystem: "vioblk instance" });
    }
    let dev = VIOBLK
        .get()
        .ok_or(KernelError::NotInitialized { subsystem: "vioblk" })?;
    let mut inner = dev.inner.lock();
    if inner.opened {
        return Err(KernelError::DeviceBusy { device: "blk" });
    }
    inner.opened = true;
    drop(inner);
    Ok(Arc::new(VioBlkStream { dev }))
}

/// External-interrupt hook: route a claimed PLIC source to the device.
pub fn handle_irq(irq: u32) -> bool {
    if let Some(dev) = VIOBLK.get() {
        if dev.irq == irq {
            dev.handle_interrupt();
            return true;
        }
    }
    false
}
