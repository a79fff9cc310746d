//! Threads and the scheduler
//!
//! Threads live in a fixed arena (`NTHR` slots) and are referenced by
//! integer ids everywhere; the ready list is an intrusive FIFO threaded
//! through the slots. Each thread owns one page of kernel stack whose top
//! sixteen bytes hold the *stack anchor* (the thread's own id), so the
//! running thread is derived from the stack pointer alone.
//!
//! Single hart: every entry point below runs inside an
//! interrupt-disabled critical section; there is no other mutual
//! exclusion to take. The context switch itself only touches
//! callee-saved state (see `arch::riscv64::context`).

use spin::Mutex;

use crate::arch::riscv64::context::{context_switch, ThreadContext};
use crate::arch::riscv64::trap::{self, TrapFrame, REG_A0, TRAP_FRAME_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::mm::vmm::{self, Mtag};
use crate::mm::{frame_allocator, PAGE_SIZE};
use crate::sync::condition::Condition;
use crate::sync::intr;

/// Thread identifier: an index into the thread arena.
pub type Tid = usize;

/// Maximum number of threads.
pub const NTHR: usize = 32;

/// The boot thread's id.
pub const MAIN_TID: Tid = 0;

/// Record at the top of every kernel stack naming its owner.
#[repr(C)]
pub struct StackAnchor {
    pub tid: usize,
    reserved: usize,
}

impl StackAnchor {
    pub fn new(tid: Tid) -> Self {
        Self { tid, reserved: 0 }
    }
}

const ANCHOR_SIZE: usize = core::mem::size_of::<StackAnchor>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Waiting,
    Exited,
}

pub struct Thread {
    pub name: &'static str,
    pub state: ThreadState,
    pub parent: Tid,
    /// Owning process slot.
    pub proc_id: usize,
    /// Address space the scheduler installs when running this thread.
    pub mtag: Mtag,
    context: ThreadContext,
    /// Pool frame backing the kernel stack; 0 for the static boot stack.
    stack_base: usize,
    next_ready: Option<Tid>,
}

struct ThreadTable {
    slots: [Option<Thread>; NTHR],
    ready_head: Option<Tid>,
    ready_tail: Option<Tid>,
}

impl ThreadTable {
    fn slot_mut(&mut self, tid: Tid) -> &mut Thread {
        self.slots[tid].as_mut().expect("dead thread id")
    }

    fn ready_push(&mut self, tid: Tid) {
        self.slot_mut(tid).next_ready = None;
        match self.ready_tail {
            Some(tail) => self.slot_mut(tail).next_ready = Some(tid),
            None => self.ready_head = Some(tid),
        }
        self.ready_tail = Some(tid);
    }

    fn ready_pop(&mut self) -> Option<Tid> {
        let head = self.ready_head?;
        let next = self.slot_mut(head).next_ready.take();
        self.ready_head = next;
        if next.is_none() {
            self.ready_tail = None;
        }
        Some(head)
    }
}

static THREADS: Mutex<ThreadTable> = Mutex::new(ThreadTable {
    slots: [const { None }; NTHR],
    ready_head: None,
    ready_tail: None,
});

/// Woken whenever any thread exits; joiners re-check their target.
static EXIT_COND: Condition = Condition::new("thread exited");

extern "C" {
    static boot_stack: u8;
}

/// Install the boot thread: anchor the boot stack and enter it in the
/// arena as thread 0 of process 0.
pub fn init() {
    // SAFETY: Only the symbol's address is used.
    let stack_base = unsafe { core::ptr::addr_of!(boot_stack) as usize };
    let anchor = (stack_base + PAGE_SIZE - ANCHOR_SIZE) as *mut StackAnchor;
    // SAFETY: The linker reserves one aligned page for the boot stack;
    // the top sixteen bytes were kept free by the boot shim.
    unsafe {
        (*anchor).tid = MAIN_TID;
        (*anchor).reserved = 0;
    }

    let mut table = THREADS.lock();
    table.slots[MAIN_TID] = Some(Thread {
        name: "main",
        state: ThreadState::Running,
        parent: MAIN_TID,
        proc_id: 0,
        mtag: vmm::main_mtag(),
        context: ThreadContext::zeroed(),
        stack_base: 0,
        next_ready: None,
    });
}

/// Id of the running thread, recovered from the stack anchor.
pub fn current_tid() -> Tid {
    let sp: usize;
    // SAFETY: Reading sp has no side effects.
    unsafe {
        core::arch::asm!("mv {}, sp", out(reg) sp);
    }
    let anchor = (sp & !(PAGE_SIZE - 1)) + PAGE_SIZE - ANCHOR_SIZE;
    // SAFETY: Every kernel stack is one aligned page with a live anchor
    // at its top, so masking sp locates it.
    unsafe { (*(anchor as *const StackAnchor)).tid }
}

/// Name of a live thread.
pub fn thread_name(tid: Tid) -> &'static str {
    intr::with_disabled(|| {
        THREADS.lock().slots[tid]
            .as_ref()
            .map(|t| t.name)
            .unwrap_or("?")
    })
}

/// Process slot owning the running thread.
pub fn current_proc_id() -> usize {
    intr::with_disabled(|| THREADS.lock().slot_mut(current_tid()).proc_id)
}

/// Point the running thread at a new address space (exec, exit).
pub fn set_current_mtag(mtag: Mtag) {
    intr::with_disabled(|| THREADS.lock().slot_mut(current_tid()).mtag = mtag);
}

/// Swap the running thread's kernel stack record for a fresh frame,
/// returning the old pool frame (0 when the old stack was static).
pub fn replace_current_stack(new_base: usize) -> usize {
    intr::with_disabled(|| {
        let mut table = THREADS.lock();
        let thread = table.slot_mut(current_tid());
        core::mem::replace(&mut thread.stack_base, new_base)
    })
}

/// Allocate a one-page kernel stack with its anchor installed.
/// Returns (stack_base, anchor_address).
fn alloc_kernel_stack(tid: Tid) -> KernelResult<(usize, usize)> {
    let base = frame_allocator::alloc_page_zeroed()
        .ok_or(KernelError::OutOfMemory { requested: PAGE_SIZE })?;
    let anchor_addr = base + PAGE_SIZE - ANCHOR_SIZE;
    // SAFETY: The frame was just allocated; the anchor lives at its top.
    unsafe {
        let anchor = anchor_addr as *mut StackAnchor;
        (*anchor).tid = tid;
        (*anchor).reserved = 0;
    }
    Ok((base, anchor_addr))
}

fn free_slot(table: &mut ThreadTable) -> KernelResult<Tid> {
    // Slot 0 is the boot thread; never recycled.
    (1..NTHR)
        .find(|&tid| table.slots[tid].is_none())
        .ok_or(KernelError::ResourceExhausted { resource: "thread slots" })
}

/// Spawn a kernel thread running `entry(arg)` in the caller's process
/// and address space. The thread is inserted at the ready-list tail.
pub fn spawn(name: &'static str, entry: extern "C" fn(usize), arg: usize) -> KernelResult<Tid> {
    intr::with_disabled(|| {
        let mut table = THREADS.lock();
        let tid = free_slot(&mut table)?;
        let (stack_base, anchor_addr) = alloc_kernel_stack(tid)?;

        let parent = current_tid();
        let (proc_id, mtag) = {
            let cur = table.slot_mut(parent);
            (cur.proc_id, cur.mtag)
        };
        table.slots[tid] = Some(Thread {
            name,
            state: ThreadState::Ready,
            parent,
            proc_id,
            mtag,
            context: ThreadContext::prime(entry, arg, anchor_addr),
            stack_base,
            next_ready: None,
        });
        table.ready_push(tid);
        Ok(tid)
    })
}

/// Create a thread that resumes user execution from a saved trap frame,
/// with the fork child's return value of 0. Used by `fork`.
pub fn fork_to_user(
    proc_id: usize,
    mtag: Mtag,
    parent_frame: &TrapFrame,
) -> KernelResult<Tid> {
    intr::with_disabled(|| {
        let mut table = THREADS.lock();
        let tid = free_slot(&mut table)?;
        let (stack_base, anchor_addr) = alloc_kernel_stack(tid)?;

        // The child's first trap frame sits where a user trap would have
        // put it: directly below the anchor.
        let frame_addr = anchor_addr - TRAP_FRAME_SIZE;
        // SAFETY: The fresh stack page is exclusively owned; frame_addr
        // is in bounds and 16-byte aligned.
        unsafe {
            let frame = frame_addr as *mut TrapFrame;
            frame.write(parent_frame.clone());
            (*frame).regs[REG_A0] = 0;
            (*frame).sepc = parent_frame.sepc.wrapping_add(4);
        }

        let parent = current_tid();
        let name = table.slot_mut(parent).name;
        table.slots[tid] = Some(Thread {
            name,
            state: ThreadState::Ready,
            parent,
            proc_id,
            mtag,
            context: ThreadContext::prime(fork_child_entry, frame_addr, frame_addr),
            stack_base,
            next_ready: None,
        });
        table.ready_push(tid);
        Ok(tid)
    })
}

/// First schedule of a forked child: restore the prepared trap frame.
extern "C" fn fork_child_entry(frame_addr: usize) {
    // SAFETY: fork_to_user placed a complete trap frame at this address
    // on this thread's own stack; trap_return never comes back.
    unsafe {
        trap::trap_return(frame_addr as *mut TrapFrame);
    }
}

/// Pick the next ready thread and switch to it.
///
/// Must be called with interrupts disabled and with the current thread's
/// state already set to what it should be while off the CPU (Ready and
/// queued, Waiting, or Exited). When nothing is ready and the current
/// thread cannot continue, idles with `wfi` until an interrupt readies
/// someone.
fn schedule() {
    debug_assert!(!intr::enabled());
    let cur = current_tid();
    loop {
        let mut table = THREADS.lock();
        if let Some(next) = table.ready_pop() {
            if next == cur {
                table.slot_mut(cur).state = ThreadState::Running;
                return;
            }
            let next_thread = table.slot_mut(next);
            next_thread.state = ThreadState::Running;
            let next_mtag = next_thread.mtag;
            let next_ctx = &next_thread.context as *const ThreadContext;
            let cur_ctx = &mut table.slot_mut(cur).context as *mut ThreadContext;
            drop(table);

            if vmm::active_mtag() != next_mtag {
                vmm::install(next_mtag);
            }
            // SAFETY: Both contexts live in the static arena; slots are
            // only reaped after their thread has switched away for good.
            // Interrupts are disabled across the switch.
            unsafe {
                context_switch(cur_ctx, next_ctx);
            }
            return;
        }

        if table.slot_mut(cur).state == ThreadState::Running {
            // Nothing else to run; keep going.
            return;
        }
        drop(table);

        // Everyone is parked. Sleep until an interrupt readies a thread.
        intr::enable();
        crate::arch::riscv64::wait_for_interrupt();
        intr::disable();
    }
}

/// Give up the CPU, staying ready.
pub fn yield_now() {
    intr::with_disabled(|| {
        let cur = current_tid();
        let mut table = THREADS.lock();
        table.slot_mut(cur).state = ThreadState::Ready;
        table.ready_push(cur);
        drop(table);
        schedule();
    });
}

/// Timer-driven round-robin: reschedule the running thread behind any
/// waiters. Called from the trap path with interrupts disabled.
pub fn preempt() {
    let cur = current_tid();
    let mut table = THREADS.lock();
    // Only a Running thread can be preempted; the idle loop inside
    // `schedule` takes timer interrupts too.
    if table.ready_head.is_none() || table.slot_mut(cur).state != ThreadState::Running {
        return;
    }
    table.slot_mut(cur).state = ThreadState::Ready;
    table.ready_push(cur);
    drop(table);
    schedule();
}

/// Park the current thread (it is already queued on a condition).
/// Returns once unparked. Interrupts must be disabled.
pub fn block_current() {
    debug_assert!(!intr::enabled());
    let cur = current_tid();
    THREADS.lock().slot_mut(cur).state = ThreadState::Waiting;
    schedule();
}

/// Make a parked thread runnable. Interrupts must be disabled (safe from
/// interrupt handlers).
pub fn unpark(tid: Tid) {
    let mut table = THREADS.lock();
    if let Some(thread) = table.slots[tid].as_mut() {
        if thread.state == ThreadState::Waiting {
            thread.state = ThreadState::Ready;
            table.ready_push(tid);
        }
    }
}

/// Terminate the calling thread. Its slot and stack are reclaimed by a
/// joiner.
pub fn exit_current() -> ! {
    intr::disable();
    let cur = current_tid();
    THREADS.lock().slot_mut(cur).state = ThreadState::Exited;
    EXIT_COND.broadcast();
    schedule();
    unreachable!("exited thread was rescheduled");
}

/// C-callable exit used by the thread startup shim.
#[no_mangle]
extern "C" fn thread_exit_trampoline() -> ! {
    exit_current()
}

fn reap(table: &mut ThreadTable, tid: Tid) {
    if let Some(thread) = table.slots[tid].take() {
        if thread.stack_base != 0 {
            frame_allocator::free_page(thread.stack_base);
        }
    }
}

/// Block until thread `tid` exits, then reclaim it.
pub fn join(tid: Tid) -> KernelResult<Tid> {
    if tid >= NTHR || tid == current_tid() {
        return Err(KernelError::ThreadNotFound { tid });
    }
    intr::with_disabled(|| loop {
        let mut table = THREADS.lock();
        let state = table.slots[tid].as_ref().map(|t| t.state);
        match state {
            None => return Err(KernelError::ThreadNotFound { tid }),
            Some(ThreadState::Exited) => {
                reap(&mut table, tid);
                return Ok(tid);
            }
            Some(_) => {
                drop(table);
                EXIT_COND.wait();
            }
        }
    })
}

/// Block until any child of the calling thread exits; reclaims and
/// returns the first one found.
pub fn join_any() -> KernelResult<Tid> {
    let cur = current_tid();
    intr::with_disabled(|| loop {
        let mut table = THREADS.lock();
        let mut have_child = false;
        let mut exited = None;
        for tid in 0..NTHR {
            if tid == cur {
                continue;
            }
            if let Some(t) = table.slots[tid].as_ref() {
                if t.parent == cur {
                    have_child = true;
                    if t.state == ThreadState::Exited {
                        exited = Some(tid);
                        break;
                    }
                }
            }
        }
        if let Some(tid) = exited {
            reap(&mut table, tid);
            return Ok(tid);
        }
        if !have_child {
            return Err(KernelError::ThreadNotFound { tid: 0 });
        }
        drop(table);
        EXIT_COND.wait();
    })
}
