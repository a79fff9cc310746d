//! System-call dispatcher
//!
//! An environment call from user mode lands here with the saved trap
//! frame. The call number is in argument register 7, arguments in 0..5;
//! the result goes back in register 0 and `sepc` advances past the
//! `ecall`. Every user pointer is validated through the VMM before the
//! kernel touches it: U always, plus R for buffers the kernel reads and
//! W for buffers it writes. Errors return as small negative integers.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use crate::arch::riscv64::trap::{TrapFrame, REG_A0, REG_A7};
use crate::error::{errno, KernelError};
use crate::io::{Control, IoStream, IOCTL_SETPOS};
use crate::mm::page_table::PteFlags;
use crate::mm::vmm;
use crate::process;
use crate::sched;
use crate::timer;

pub const SYS_EXIT: u64 = 0;
pub const SYS_MSGOUT: u64 = 1;
pub const SYS_DEVOPEN: u64 = 2;
pub const SYS_FSOPEN: u64 = 3;
pub const SYS_CLOSE: u64 = 4;
pub const SYS_READ: u64 = 5;
pub const SYS_WRITE: u64 = 6;
pub const SYS_IOCTL: u64 = 7;
pub const SYS_EXEC: u64 = 8;
pub const SYS_WAIT: u64 = 9;
pub const SYS_USLEEP: u64 = 10;
pub const SYS_FORK: u64 = 11;

/// Entry from the trap handler: dispatch, then advance the pc and store
/// the result.
pub fn handle(tf: &mut TrapFrame) {
    let result = dispatch(tf);
    tf.sepc = tf.sepc.wrapping_add(4);
    tf.regs[REG_A0] = result as u64;
}

fn dispatch(tf: &mut TrapFrame) -> i64 {
    let a = |i: usize| tf.regs[REG_A0 + i] as usize;
    match tf.regs[REG_A7] {
        SYS_EXIT => process::exit(),
        SYS_MSGOUT => sys_msgout(a(0)),
        SYS_DEVOPEN => sys_devopen(a(0), a(1), a(2)),
        SYS_FSOPEN => sys_fsopen(a(0), a(1)),
        SYS_CLOSE => sys_close(a(0)),
        SYS_READ => sys_read(a(0), a(1), a(2)),
        SYS_WRITE => sys_write(a(0), a(1), a(2)),
        SYS_IOCTL => sys_ioctl(a(0), a(1), a(2)),
        SYS_EXEC => sys_exec(a(0)),
        SYS_WAIT => sys_wait(a(0)),
        SYS_USLEEP => sys_usleep(a(0)),
        SYS_FORK => sys_fork(tf),
        _ => -errno::EINVAL,
    }
}

fn result_to_ret(result: Result<i64, KernelError>) -> i64 {
    match result {
        Ok(v) => v,
        Err(e) => e.to_errno(),
    }
}

/// Copy a validated user C string into the kernel.
fn user_cstr(ptr: usize) -> Result<String, KernelError> {
    let len = vmm::validate_user_cstr(ptr, PteFlags::U | PteFlags::R)
        .ok_or(KernelError::InvalidAddress { addr: ptr })?;
    let mut bytes = vec![0u8; len];
    // SAFETY: validate_user_cstr just confirmed every byte of
    // [ptr, ptr+len] is mapped user-readable; SUM is set.
    unsafe {
        core::ptr::copy_nonoverlapping(ptr as *const u8, bytes.as_mut_ptr(), len);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn sys_msgout(msg: usize) -> i64 {
    result_to_ret((|| {
        let text = user_cstr(msg)?;
        let tid = sched::current_tid();
        crate::println!("Thread <{}:{}> says: {}", sched::thread_name(tid), tid, text);
        Ok(0)
    })())
}

fn open_into_fd(fd: usize, stream: Arc<dyn IoStream>) -> Result<i64, KernelError> {
    process::set_descriptor(fd, stream)?;
    Ok(0)
}

fn sys_devopen(fd: usize, name: usize, instance: usize) -> i64 {
    result_to_ret((|| {
        if fd >= process::PROCESS_IOMAX {
            return Err(KernelError::DescriptorOutOfRange { fd });
        }
        let name = user_cstr(name)?;
        let stream = crate::drivers::device_open(name.as_bytes(), instance)?;
        open_into_fd(fd, stream)
    })())
}

fn sys_fsopen(fd: usize, name: usize) -> i64 {
    result_to_ret((|| {
        if fd >= process::PROCESS_IOMAX {
            return Err(KernelError::DescriptorOutOfRange { fd });
        }
        let name = user_cstr(name)?;
        let stream = crate::fs::open(name.as_bytes())?;
        open_into_fd(fd, stream)
    })())
}

fn sys_close(fd: usize) -> i64 {
    result_to_ret((|| {
        // Dropping the clone releases the backend once it is the last.
        drop(process::take_descriptor(fd)?);
        Ok(0)
    })())
}

fn sys_read(fd: usize, buf: usize, len: usize) -> i64 {
    result_to_ret((|| {
        let stream = process::descriptor(fd)?;
        if !vmm::validate_user_ptr(buf, len, PteFlags::U | PteFlags::W) {
            return Err(KernelError::InvalidAddress { addr: buf });
        }
        // SAFETY: The whole range was just validated user-writable; SUM
        // lets the kernel store through it.
        let dst = unsafe { core::slice::from_raw_parts_mut(buf as *mut u8, len) };
        let n = stream.read(dst)?;
        Ok(n as i64)
    })())
}

fn sys_write(fd: usize, buf: usize, len: usize) -> i64 {
    result_to_ret((|| {
        let stream = process::descriptor(fd)?;
        if !vmm::validate_user_ptr(buf, len, PteFlags::U | PteFlags::R) {
            return Err(KernelError::InvalidAddress { addr: buf });
        }
        // SAFETY: The whole range was just validated user-readable.
        let src = unsafe { core::slice::from_raw_parts(buf as *const u8, len) };
        let n = stream.write(src)?;
        Ok(n as i64)
    })())
}

fn sys_ioctl(fd: usize, cmd: usize, arg: usize) -> i64 {
    result_to_ret((|| {
        let stream = process::descriptor(fd)?;

        // SETPOS reads a u64 from arg; the other opcodes write one.
        let required = match cmd {
            IOCTL_SETPOS => PteFlags::U | PteFlags::R,
            _ => PteFlags::U | PteFlags::W,
        };
        if !vmm::validate_user_ptr(arg, core::mem::size_of::<u64>(), required) {
            return Err(KernelError::InvalidAddress { addr: arg });
        }

        let arg_value = if cmd == IOCTL_SETPOS {
            // SAFETY: Validated user-readable just above.
            unsafe { core::ptr::read_unaligned(arg as *const u64) }
        } else {
            0
        };

        let op = Control::decode(cmd, arg_value)?;
        let value = stream.control(op)?;

        if cmd != IOCTL_SETPOS {
            // SAFETY: Validated user-writable just above.
            unsafe {
                core::ptr::write_unaligned(arg as *mut u64, value);
            }
        }
        Ok(0)
    })())
}

fn sys_exec(fd: usize) -> i64 {
    result_to_ret((|| {
        // The image stream leaves the descriptor table before the load,
        // so it is not inherited by the new program.
        let image = process::take_descriptor(fd)?;
        process::exec(image)?;
        // exec only returns on failure.
        unreachable!("exec returned without error");
    })())
}

fn sys_wait(pid: usize) -> i64 {
    result_to_ret(process::wait(pid).map(|tid| tid as i64))
}

fn sys_usleep(microseconds: usize) -> i64 {
    result_to_ret((|| {
        if microseconds == 0 {
            return Err(KernelError::InvalidArgument {
                name: "microseconds",
                value: "zero duration",
            });
        }
        let ticks = microseconds as u64 * (timer::TIMER_FREQ / 1_000_000);
        timer::sleep_ticks(ticks);
        Ok(0)
    })())
}

fn sys_fork(tf: &TrapFrame) -> i64 {
    result_to_ret(process::fork(tf).map(|pid| pid as i64))
}
