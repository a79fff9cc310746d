//! Single-transaction split virtqueue
//!
//! The block driver issues one request at a time, so its virtqueue is
//! sized for exactly one outstanding transaction: a one-entry descriptor
//! ring whose only descriptor is an *indirect* head pointing at a
//! three-entry table (request header → data → status byte), plus
//! one-entry available and used rings.
//!
//! Publication order follows the virtio contract: the descriptor chain is
//! fully written before the available index moves (release fence), and
//! the used index is read with an acquire fence before the status byte.

use core::sync::atomic::{self, Ordering};

/// Descriptor flag: buffer continues via the `next` field
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
/// Descriptor flag: buffer is device-writable (device writes, driver reads)
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
/// Descriptor flag: buffer contains a table of descriptors (indirect)
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Virtqueue descriptor table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    /// Physical address of the guest buffer
    pub addr: u64,
    /// Length of the guest buffer in bytes
    pub len: u32,
    /// Descriptor flags (NEXT, WRITE, INDIRECT)
    pub flags: u16,
    /// Index of the next descriptor in the chain (valid with NEXT)
    pub next: u16,
}

/// Available ring sized for one in-flight chain.
#[repr(C)]
pub struct VirtqAvail {
    pub flags: u16,
    pub idx: u16,
    pub ring: [u16; 1],
    pub used_event: u16,
}

/// Element in the used ring, written by the device on completion.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqUsedElem {
    /// Index of the head of the completed chain
    pub id: u32,
    /// Bytes the device wrote into the chain
    pub len: u32,
}

/// Used ring sized for one in-flight chain.
#[repr(C)]
pub struct VirtqUsed {
    pub flags: u16,
    pub idx: u16,
    pub ring: [VirtqUsedElem; 1],
    pub avail_event: u16,
}

/// The four descriptors of a block transaction: the ring descriptor
/// (indirect head) plus the three-entry indirect table.
///
/// The whole queue lives in one heap allocation; the kernel heap is
/// identity-mapped, so field addresses double as DMA addresses.
#[repr(C, align(4096))]
pub struct SingleVirtq {
    /// Descriptor ring: exactly one entry, the indirect head.
    pub desc: [VirtqDesc; 1],
    /// Indirect table: header, data, status.
    pub indirect: [VirtqDesc; 3],
    pub avail: VirtqAvail,
    pub used: VirtqUsed,
}

impl SingleVirtq {
    pub const fn new() -> Self {
        Self {
            desc: [VirtqDesc {
                addr: 0,
                len: 0,
                flags: 0,
                next: 0,
            }; 1],
            indirect: [VirtqDesc {
                addr: 0,
                len: 0,
                flags: 0,
                next: 0,
            }; 3],
            avail: VirtqAvail {
                flags: 0,
                idx: 0,
                ring: [0; 1],
                used_event: 0,
            },
            used: VirtqUsed {
                flags: 0,
                idx: 0,
                ring: [VirtqUsedElem { id: 0, len: 0 }; 1],
                avail_event: 0,
            },
        }
    }

    /// Chain the indirect table for one request and aim the ring
    /// descriptor at it.
    ///
    /// `header`/`header_len` and `status` are the DMA addresses of the
    /// request header and status byte; `data`/`data_len` describe the
    /// block buffer. `device_writes_data` is true for reads (IN
    /// requests).
    pub fn prepare(
        &mut self,
        header: u64,
        header_len: u32,
        data: u64,
        data_len: u32,
        status: u64,
        device_writes_data: bool,
    ) {
        self.indirect[0] = VirtqDesc {
            addr: header,
            len: header_len,
            flags: VIRTQ_DESC_F_NEXT,
            next: 1,
        };
        let data_flags = if device_writes_data {
            VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE
        } else {
            VIRTQ_DESC_F_NEXT
        };
        self.indirect[1] = VirtqDesc {
            addr: data,
            len: data_len,
            flags: data_flags,
            next: 2,
        };
        self.indirect[2] = VirtqDesc {
            addr: status,
            len: 1,
            flags: VIRTQ_DESC_F_WRITE,
            next: 0,
        };
        self.desc[0] = VirtqDesc {
            addr: core::ptr::addr_of!(self.indirect) as u64,
            len: (core::mem::size_of::<VirtqDesc>() * 3) as u32,
            flags: VIRTQ_DESC_F_INDIRECT,
            next: 0,
        };
    }

    /// Publish the prepared chain: release-fence, then advance the
    /// available index. The caller notifies the device afterwards.
    pub fn publish(&mut self) {
        self.avail.ring[0] = 0;
        // The chain must be globally visible before the index moves.
        atomic::fence(Ordering::Release);
        let idx = self.avail.idx.wrapping_add(1);
        // SAFETY: Volatile store so the index update reaches memory the
        // device observes, not a cached copy.
        unsafe {
            core::ptr::write_volatile(core::ptr::addr_of_mut!(self.avail.idx), idx);
        }
    }

    /// Current used index, acquire-fenced so the device's writes to the
    /// status byte and data buffer are visible after the read.
    pub fn used_idx(&self) -> u16 {
        // SAFETY: Volatile load of a field the device updates via DMA.
        let idx = unsafe { core::ptr::read_volatile(core::ptr::addr_of!(self.used.idx)) };
        atomic::fence(Ordering::Acquire);
        idx
    }
}

impl Default for SingleVirtq {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelResult;

    #[test_case]
    fn chain_layout() -> KernelResult<()> {
        let mut vq = SingleVirtq::new();
        vq.prepare(0x1000, 16, 0x2000, 4096, 0x3000, true);

        // Header is device-readable and chains to the data descriptor.
        assert_eq!(vq.indirect[0].addr, 0x1000);
        assert_eq!(vq.indirect[0].len, 16);
        assert_eq!(vq.indirect[0].flags, VIRTQ_DESC_F_NEXT);
        assert_eq!(vq.indirect[0].next, 1);

        // Read request: the device writes the data buffer.
        assert_eq!(vq.indirect[1].flags, VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE);
        assert_eq!(vq.indirect[1].len, 4096);

        // Status byte is always device-written and ends the chain.
        assert_eq!(vq.indirect[2].flags, VIRTQ_DESC_F_WRITE);
        assert_eq!(vq.indirect[2].len, 1);

        // The ring descriptor points at the three-entry indirect table.
        assert_eq!(vq.desc[0].flags, VIRTQ_DESC_F_INDIRECT);
        assert_eq!(vq.desc[0].len, 48);
        Ok(())
    }

    #[test_case]
    fn writes_keep_data_device_readable() -> KernelResult<()> {
        let mut vq = SingleVirtq::new();
        vq.prepare(0x1000, 16, 0x2000, 512, 0x3000, false);
        assert_eq!(vq.indirect[1].flags, VIRTQ_DESC_F_NEXT);
        Ok(())
    }

    #[test_case]
    fn publish_advances_available_index() -> KernelResult<()> {
        let mut vq = SingleVirtq::new();
        assert_eq!(vq.avail.idx, 0);
        vq.prepare(0, 16, 0, 0, 0, false);
        vq.publish();
        assert_eq!(vq.avail.idx, 1);
        assert_eq!(vq.avail.ring[0], 0);
        Ok(())
    }
}
