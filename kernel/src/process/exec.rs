//! Program execution
//!
//! `exec` replaces the calling process's user image with the executable
//! read from a stream: the old user pages are unmapped and freed, the
//! ELF is loaded into the current address space, the user stack page is
//! mapped, and the thread enters user mode on a fresh kernel stack. On
//! success it does not return.

extern crate alloc;

use alloc::sync::Arc;

use crate::arch::riscv64::context;
use crate::error::{KernelError, KernelResult};
use crate::io::IoStream;
use crate::mm::page_table::PteFlags;
use crate::mm::vmm;
use crate::mm::{frame_allocator, PAGE_SIZE, USER_END_VMA, USER_STACK_VMA, USER_START_VMA};
use crate::sched;
use crate::sync::intr;

/// Replace the current user image with the executable in `image`.
///
/// Returns only on failure. Note that the old image is already gone by
/// the time the ELF is parsed, so a rejected image leaves the process
/// without a loadable user half; the caller is expected to exit.
pub fn exec(image: Arc<dyn IoStream>) -> KernelResult<()> {
    vmm::unmap_and_free_user();

    let entry = crate::elf::load(&*image).map_err(KernelError::ElfError)?;
    if !(USER_START_VMA..USER_END_VMA).contains(&entry) {
        return Err(KernelError::InvalidAddress { addr: entry });
    }

    // The single user stack page, directly below the stack top.
    vmm::alloc_and_map_page(
        USER_STACK_VMA - PAGE_SIZE,
        PteFlags::R | PteFlags::W | PteFlags::U,
    )?;

    // The image stream is done; release our reference before leaving the
    // kernel for good.
    drop(image);

    // Fresh kernel stack with a stack anchor naming this thread; the
    // stack we are running on is recycled below.
    let tid = sched::current_tid();
    let (new_base, anchor_addr) = fresh_kernel_stack(tid)?;

    crate::println!(
        "[PROC] exec: entry {:#x}, user stack below {:#x}",
        entry,
        USER_STACK_VMA
    );

    intr::disable();
    let old_base = sched::replace_current_stack(new_base);
    if old_base != 0 {
        // Safe to release while still executing on it: interrupts are
        // off and nothing allocates between here and sret.
        frame_allocator::free_page(old_base);
    }

    // SAFETY: entry was range-checked into the mapped user image, the
    // stack page is mapped RWU, anchor_addr tops a stack owned by this
    // thread, and interrupts are disabled.
    unsafe { context::jump_to_user(entry, USER_STACK_VMA, anchor_addr) }
}

/// Allocate and anchor a fresh kernel stack for `tid`.
fn fresh_kernel_stack(tid: usize) -> KernelResult<(usize, usize)> {
    let base = frame_allocator::alloc_page_zeroed()
        .ok_or(KernelError::OutOfMemory { requested: PAGE_SIZE })?;
    let anchor_addr = base + PAGE_SIZE - core::mem::size_of::<sched::StackAnchor>();
    // SAFETY: Fresh frame, exclusively owned.
    unsafe {
        (anchor_addr as *mut sched::StackAnchor).write(sched::StackAnchor::new(tid));
    }
    Ok((base, anchor_addr))
}
