//! Processes
//!
//! A process is a slot in a fixed arena: its id, the thread running it,
//! the address space it installs, and a table of I/O descriptors. The
//! zeroth process is the kernel's initial process, running thread 0 in
//! the main address space.
//!
//! Descriptor slots hold `Arc<dyn IoStream>` clones; the reference count
//! is the per-open refcount shared across `fork`. Dropping the last
//! clone releases the backend.
//!
//! Process ids and thread ids are separate arenas. The process slot of
//! an exited process is kept as a zombie until a waiter reaps it, so a
//! fork-returned pid stays resolvable to its main thread for `wait`.

mod exec;
mod fork;

pub use exec::exec;
pub use fork::fork;

extern crate alloc;

use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::io::IoStream;
use crate::mm::vmm;
use crate::sched::{self, Tid};
use crate::sync::intr;

/// Maximum number of processes.
pub const NPROC: usize = 16;

/// I/O descriptor slots per process.
pub const PROCESS_IOMAX: usize = 16;

/// Process identifier: an index into the process arena.
pub type Pid = usize;

const MAIN_PID: Pid = 0;

pub struct Process {
    pub id: Pid,
    pub tid: Tid,
    pub mtag: vmm::Mtag,
    pub iotab: [Option<Arc<dyn IoStream>>; PROCESS_IOMAX],
}

static PROCTAB: Mutex<[Option<Process>; NPROC]> = Mutex::new([const { None }; NPROC]);

/// Install the initial process: thread 0 in the main address space with
/// an empty descriptor table.
pub fn init() {
    let mut table = PROCTAB.lock();
    table[MAIN_PID] = Some(Process {
        id: MAIN_PID,
        tid: sched::MAIN_TID,
        mtag: vmm::main_mtag(),
        iotab: [const { None }; PROCESS_IOMAX],
    });
}

/// Process id of the calling thread.
pub fn current_pid() -> Pid {
    sched::current_proc_id()
}

fn check_fd(fd: usize) -> KernelResult<usize> {
    if fd >= PROCESS_IOMAX {
        return Err(KernelError::DescriptorOutOfRange { fd });
    }
    Ok(fd)
}

/// Clone the stream in descriptor `fd` of the calling process.
pub fn descriptor(fd: usize) -> KernelResult<Arc<dyn IoStream>> {
    let fd = check_fd(fd).map_err(|_| KernelError::BadDescriptor { fd })?;
    let pid = current_pid();
    intr::with_disabled(|| {
        let table = PROCTAB.lock();
        let proc = table[pid].as_ref().ok_or(KernelError::ProcessNotFound { pid })?;
        proc.iotab[fd]
            .as_ref()
            .cloned()
            .ok_or(KernelError::BadDescriptor { fd })
    })
}

/// Install a stream into descriptor `fd`, replacing (and thereby
/// releasing) any previous occupant.
pub fn set_descriptor(fd: usize, stream: Arc<dyn IoStream>) -> KernelResult<()> {
    let fd = check_fd(fd)?;
    let pid = current_pid();
    let old = intr::with_disabled(|| {
        let mut table = PROCTAB.lock();
        let proc = table[pid].as_mut().ok_or(KernelError::ProcessNotFound { pid })?;
        Ok::<_, KernelError>(proc.iotab[fd].replace(stream))
    })?;
    drop(old);
    Ok(())
}

/// Remove and return the stream in descriptor `fd`.
pub fn take_descriptor(fd: usize) -> KernelResult<Arc<dyn IoStream>> {
    let fd = check_fd(fd).map_err(|_| KernelError::BadDescriptor { fd })?;
    let pid = current_pid();
    intr::with_disabled(|| {
        let mut table = PROCTAB.lock();
        let proc = table[pid].as_mut().ok_or(KernelError::ProcessNotFound { pid })?;
        proc.iotab[fd].take().ok_or(KernelError::BadDescriptor { fd })
    })
}

/// Allocate a free process slot, reserving it for a fork in progress.
fn reserve_slot() -> KernelResult<Pid> {
    intr::with_disabled(|| {
        let mut table = PROCTAB.lock();
        for pid in 0..NPROC {
            if table[pid].is_none() {
                // Reserve with a placeholder until the fork completes.
                table[pid] = Some(Process {
                    id: pid,
                    tid: 0,
                    mtag: vmm::main_mtag(),
                    iotab: [const { None }; PROCESS_IOMAX],
                });
                return Ok(pid);
            }
        }
        Err(KernelError::ResourceExhausted { resource: "process slots" })
    })
}

fn release_slot(pid: Pid) {
    intr::with_disabled(|| {
        PROCTAB.lock()[pid] = None;
    });
}

fn with_proc<R>(pid: Pid, f: impl FnOnce(&mut Process) -> R) -> KernelResult<R> {
    intr::with_disabled(|| {
        let mut table = PROCTAB.lock();
        let proc = table[pid].as_mut().ok_or(KernelError::ProcessNotFound { pid })?;
        Ok(f(proc))
    })
}

/// Block until process `pid`'s main thread exits; `wait(0)` waits for
/// any child thread. Returns the joined thread id.
///
/// Process and thread ids live in different arenas, so a targeted wait
/// resolves the fork-returned pid to its main thread through the process
/// table. The process slot of an exited process lingers as a zombie
/// precisely so this resolution stays valid until someone waits; the
/// waiter reaps both the thread slot (via join) and the zombie process
/// slot.
pub fn wait(pid: Pid) -> KernelResult<Tid> {
    if pid == 0 {
        let tid = sched::join_any()?;
        release_zombie_of(tid);
        return Ok(tid);
    }
    if pid >= NPROC {
        return Err(KernelError::ProcessNotFound { pid });
    }
    let tid = intr::with_disabled(|| PROCTAB.lock()[pid].as_ref().map(|p| p.tid))
        .ok_or(KernelError::ProcessNotFound { pid })?;
    let tid = sched::join(tid)?;
    release_slot_if_tid(pid, tid);
    Ok(tid)
}

/// Drop the zombie process slot whose main thread was just joined, if
/// the joined thread was one (spawned kernel threads have no slot).
fn release_zombie_of(tid: Tid) {
    intr::with_disabled(|| {
        let mut table = PROCTAB.lock();
        for slot in table.iter_mut() {
            if slot.as_ref().is_some_and(|p| p.tid == tid) {
                *slot = None;
                return;
            }
        }
    });
}

/// Free `pid` only while it still names the joined thread; a concurrent
/// waiter may have reaped it and a new fork reused the slot.
fn release_slot_if_tid(pid: Pid, tid: Tid) {
    intr::with_disabled(|| {
        let mut table = PROCTAB.lock();
        if table[pid].as_ref().is_some_and(|p| p.tid == tid) {
            table[pid] = None;
        }
    });
}

/// Terminate the calling process: reclaim its user address space, close
/// every descriptor, and exit the thread. The process slot stays behind
/// as a zombie so `wait` can still resolve the pid to the exited thread;
/// the waiter releases it.
pub fn exit() -> ! {
    let pid = current_pid();

    // Drop every descriptor; backends release when their last clone
    // goes.
    if let Ok(streams) = with_proc(pid, |proc| {
        let mut taken: [Option<Arc<dyn IoStream>>; PROCESS_IOMAX] =
            [const { None }; PROCESS_IOMAX];
        for (slot, stream) in proc.iotab.iter_mut().enumerate() {
            taken[slot] = stream.take();
        }
        taken
    }) {
        drop(streams);
    }

    // Give the user half of the address space back to the main space.
    let old = vmm::switch_to_main_space();
    sched::set_current_mtag(vmm::main_mtag());
    if old == vmm::main_mtag() {
        vmm::unmap_and_free_user();
    } else {
        vmm::reclaim_user_space(old);
    }

    sched::exit_current()
}
