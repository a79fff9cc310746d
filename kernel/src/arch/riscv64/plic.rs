//! Platform-Level Interrupt Controller
//!
//! SiFive PLIC as wired on the QEMU virt machine (base 0x0C00_0000).
//! cinder runs one hart, so only hart 0's S-mode context (context 1) is
//! programmed: sources are enabled there with priority 1 and threshold 0,
//! and external interrupts are claimed and completed through its
//! claim/complete register.

use core::ptr;

/// PLIC base address on the QEMU virt machine.
const PLIC_BASE: usize = 0x0C00_0000;

/// Per-source priority registers (4 bytes each, source 0 reserved).
const PLIC_PRIORITY_OFFSET: usize = 0x00_0000;

/// Enable bit arrays: 0x80 bytes per context.
const PLIC_ENABLE_OFFSET: usize = 0x00_2000;
const PLIC_ENABLE_STRIDE: usize = 0x80;

/// Threshold/claim region: 0x1000 bytes per context, claim at +4.
const PLIC_THRESHOLD_OFFSET: usize = 0x20_0000;
const PLIC_CLAIM_OFFSET: usize = 0x20_0004;
const PLIC_CONTEXT_STRIDE: usize = 0x1000;

/// Hart 0 S-mode context (M-mode contexts are even, S-mode odd).
const CONTEXT: usize = 1;

fn write_reg(offset: usize, value: u32) {
    // SAFETY: The PLIC register block is identity-mapped RW; offsets are
    // built from the SiFive layout constants above.
    unsafe { ptr::write_volatile((PLIC_BASE + offset) as *mut u32, value) }
}

fn read_reg(offset: usize) -> u32 {
    // SAFETY: As in `write_reg`.
    unsafe { ptr::read_volatile((PLIC_BASE + offset) as *const u32) }
}

/// Accept every enabled source on hart 0's S-mode context.
pub fn init() {
    write_reg(
        PLIC_THRESHOLD_OFFSET + CONTEXT * PLIC_CONTEXT_STRIDE,
        0,
    );
}

/// Route `source` to hart 0 S-mode with priority 1.
pub fn enable_source(source: u32) {
    write_reg(PLIC_PRIORITY_OFFSET + source as usize * 4, 1);
    let enable_offset =
        PLIC_ENABLE_OFFSET + CONTEXT * PLIC_ENABLE_STRIDE + (source as usize / 32) * 4;
    let bits = read_reg(enable_offset) | (1 << (source % 32));
    write_reg(enable_offset, bits);
}

/// Claim the highest-priority pending source, or None.
fn claim() -> Option<u32> {
    let source = read_reg(PLIC_CLAIM_OFFSET + CONTEXT * PLIC_CONTEXT_STRIDE);
    if source == 0 {
        None
    } else {
        Some(source)
    }
}

/// Signal completion of a claimed source.
fn complete(source: u32) {
    write_reg(PLIC_CLAIM_OFFSET + CONTEXT * PLIC_CONTEXT_STRIDE, source);
}

/// Drain and dispatch pending external interrupts. Called from the trap
/// handler on a supervisor external interrupt.
pub fn handle_external_interrupt() {
    while let Some(source) = claim() {
        let handled = crate::drivers::virtio::blk::handle_irq(source);
        if !handled {
            crate::println!("[PLIC] spurious interrupt source {}", source);
        }
        complete(source);
    }
}
