//! Process forking
//!
//! `fork` clones the calling process: a deep copy of its user address
//! space, a duplicated descriptor table (each slot retains a reference to
//! the shared stream), and a child thread that resumes from the parent's
//! saved trap frame with a return value of 0. The parent receives the
//! child's process id. No copy-on-write; every user page is copied
//! outright.

extern crate alloc;

use alloc::sync::Arc;

use crate::arch::riscv64::trap::TrapFrame;
use crate::error::KernelResult;
use crate::io::IoStream;
use crate::mm::vmm;
use crate::process::{Pid, Process, PROCESS_IOMAX};
use crate::sched::{self, Tid};
use crate::sync::intr;

/// Fork the calling process from its saved trap frame.
pub fn fork(parent_frame: &TrapFrame) -> KernelResult<Pid> {
    let parent_pid = super::current_pid();
    let child_pid = super::reserve_slot()?;

    // Duplicate the descriptor table: each clone bumps the per-open
    // refcount, so backends stay alive until the last holder closes.
    let iotab = match super::with_proc(parent_pid, |proc| {
        let mut dup: [Option<Arc<dyn IoStream>>; PROCESS_IOMAX] = [const { None }; PROCESS_IOMAX];
        for (slot, stream) in proc.iotab.iter().enumerate() {
            dup[slot] = stream.clone();
        }
        dup
    }) {
        Ok(iotab) => iotab,
        Err(e) => {
            super::release_slot(child_pid);
            return Err(e);
        }
    };

    // Deep-copy the parent's user pages into a fresh space.
    let child_mtag = match vmm::clone_user_space() {
        Ok(mtag) => mtag,
        Err(e) => {
            super::release_slot(child_pid);
            return Err(e);
        }
    };

    // The child goes onto the ready list inside fork_to_user, and a
    // timer tick could schedule it immediately; creating the thread and
    // finishing the process entry share one interrupt-disabled section
    // so the child can never run against the reserved placeholder.
    let spawned = intr::with_disabled(|| -> KernelResult<Tid> {
        let child_tid = sched::fork_to_user(child_pid, child_mtag, parent_frame)?;
        super::PROCTAB.lock()[child_pid] = Some(Process {
            id: child_pid,
            tid: child_tid,
            mtag: child_mtag,
            iotab,
        });
        Ok(child_tid)
    });

    match spawned {
        Ok(_) => Ok(child_pid),
        Err(e) => {
            vmm::reclaim_user_space(child_mtag);
            super::release_slot(child_pid);
            Err(e)
        }
    }
}
