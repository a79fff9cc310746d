//! Memory management
//!
//! Three pieces, leaves first: the physical page allocator
//! ([`frame_allocator`]), the Sv39 page-table structures
//! ([`page_table`]), and the virtual-memory manager ([`vmm`]) that owns
//! address spaces and every mapping operation.
//!
//! # Physical memory map
//!
//! ```text
//! 0x0000_0000 .. RAM_START      MMIO (RW gigapages, global)
//! RAM_START   .. _kimg_end      kernel image (RX / R / RW per section)
//! _kimg_end   .. heap end       kernel heap + 4 KiB page pool, global
//! RAM_START+2M .. RAM_END       free page pool (RW megapages, global)
//! ```
//!
//! User images occupy `[USER_START_VMA, USER_END_VMA)`; the user stack is
//! the single page below [`USER_STACK_VMA`].

pub mod page_table;

#[cfg(target_arch = "riscv64")]
pub mod frame_allocator;
#[cfg(target_arch = "riscv64")]
pub mod vmm;

/// Size of one page / physical frame.
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE)
pub const PAGE_ORDER: usize = 12;

/// Size of a level-1 megapage mapping.
pub const MEGA_SIZE: usize = 2 * 1024 * 1024;

/// Size of a level-2 gigapage mapping.
pub const GIGA_SIZE: usize = 1024 * 1024 * 1024;

/// Start of physical RAM on the QEMU virt machine.
pub const RAM_START: usize = 0x8000_0000;

/// Total RAM given to the machine.
pub const RAM_SIZE: usize = 8 * 1024 * 1024;

/// One past the last RAM byte.
pub const RAM_END: usize = RAM_START + RAM_SIZE;

/// Lowest virtual address a user image may occupy.
pub const USER_START_VMA: usize = 0x8010_0000;

/// One past the highest virtual address a user image may occupy.
pub const USER_END_VMA: usize = 0x8100_0000;

/// Top of the user stack; the stack is the single page below this.
pub const USER_STACK_VMA: usize = USER_END_VMA;

/// Minimum bytes handed to the heap allocator at boot.
pub const HEAP_INIT_MIN: usize = 256 * 1024;

/// Align `value` down to a multiple of `align` (power of two).
pub const fn round_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Align `value` up to a multiple of `align` (power of two).
pub const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// True if `value` is a multiple of `align`.
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value % align == 0
}

/// True if `vma` is canonical for Sv39: bits 63:38 all zero or all one.
pub const fn wellformed_vma(vma: usize) -> bool {
    let bits = (vma as i64) >> 38;
    bits == 0 || bits == -1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelResult;

    #[test_case]
    fn vma_wellformedness() -> KernelResult<()> {
        assert!(wellformed_vma(0));
        assert!(wellformed_vma(RAM_START));
        assert!(wellformed_vma(USER_END_VMA - 1));
        assert!(wellformed_vma(0xFFFF_FFFF_F000_0000));
        assert!(!wellformed_vma(0x0000_0040_0000_0000));
        assert!(!wellformed_vma(0x8000_0000_0000_0000));
        Ok(())
    }

    #[test_case]
    fn rounding() -> KernelResult<()> {
        assert_eq!(round_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_down(PAGE_SIZE + 1, PAGE_SIZE), PAGE_SIZE);
        assert!(is_aligned(USER_START_VMA, MEGA_SIZE / 2));
        Ok(())
    }
}
