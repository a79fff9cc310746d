//! Boot entry
//!
//! QEMU (`-bios none`) enters `_start` at 0x8000_0000 in M-mode. The shim
//! opens the PMP to S/U mode, delegates every trap to S-mode, enables the
//! Sstc supervisor timer and the time counter, then drops to S-mode and
//! calls `kmain` on the boot thread's single-page stack.
//!
//! The stack leaves sixteen bytes at the top for the boot thread's stack
//! anchor, which the scheduler fills in during its init.

use core::arch::global_asm;

global_asm!(
    r#"
    .section .bss.bootstack, "aw", @nobits
    .align 12
    .global boot_stack
boot_stack:
    .space 4096
    .global boot_stack_top
boot_stack_top:

    .section .text.boot, "ax"
    .global _start
_start:
    // Park everything but hart 0.
    csrr    t0, mhartid
    bnez    t0, 4f

    // PMP entry 0: NAPOT over the whole address space, RWX, so S/U
    // accesses are never blocked by the (implemented but unconfigured)
    // PMP.
    li      t0, 0x3fffffffffffff
    csrw    pmpaddr0, t0
    li      t0, 0x1f
    csrw    pmpcfg0, t0

    // Delegate all exceptions and interrupts to S-mode.
    li      t0, 0xffff
    csrw    medeleg, t0
    csrw    mideleg, t0

    // Sstc: let S-mode program stimecmp directly (menvcfg.STCE), and
    // expose cycle/time/instret to S-mode.
    li      t0, 1
    slli    t0, t0, 63
    csrs    0x30a, t0
    li      t0, 7
    csrw    mcounteren, t0
    csrw    scounteren, t0

    // M-mode interrupts stay off; S-mode manages sie itself.
    csrw    mie, zero

    // Return into S-mode at 1: with paging off.
    csrw    satp, zero
    li      t0, 0x1800
    csrc    mstatus, t0
    li      t0, 0x0800
    csrs    mstatus, t0
    la      t0, 1f
    csrw    mepc, t0
    mret

1:
    // Clear .bss.
    la      t0, _bss_start
    la      t1, _bss_end
2:
    bgeu    t0, t1, 3f
    sd      zero, 0(t0)
    addi    t0, t0, 8
    j       2b
3:
    // Boot stack, leaving room for the stack anchor at the top.
    la      sp, boot_stack_top
    addi    sp, sp, -16
    csrw    sscratch, zero
    call    kmain

4:
    wfi
    j       4b
"#
);
