//! Uniform I/O stream abstraction
//!
//! Every byte-addressed backend in the kernel (block device, filesystem
//! file, in-memory buffer) presents the same four operations behind
//! [`IoStream`]. Descriptor tables, the ELF loader and the filesystem all
//! talk to this trait and never to a concrete backend.
//!
//! Streams are handed around as `Arc<dyn IoStream>`; the reference count
//! is the per-open refcount that `fork` bumps and `close` drops. Backends
//! release their resources in `close`, which every implementation keeps
//! idempotent and also invokes from `Drop`.

pub mod memory;

use crate::error::{KernelError, KernelResult};

/// Raw control opcodes of the ioctl ABI.
pub const IOCTL_GETLEN: usize = 1;
pub const IOCTL_GETPOS: usize = 2;
pub const IOCTL_SETPOS: usize = 3;
pub const IOCTL_GETBLKSZ: usize = 4;

/// A decoded control request.
///
/// The getters return their value in the `Ok` payload; `SetPos` returns 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    GetLen,
    GetPos,
    SetPos(u64),
    GetBlkSz,
}

impl Control {
    /// Decode a raw opcode. `arg` is the 64-bit value read from the
    /// caller for `SETPOS`; getters ignore it.
    pub fn decode(cmd: usize, arg: u64) -> KernelResult<Self> {
        match cmd {
            IOCTL_GETLEN => Ok(Self::GetLen),
            IOCTL_GETPOS => Ok(Self::GetPos),
            IOCTL_SETPOS => Ok(Self::SetPos(arg)),
            IOCTL_GETBLKSZ => Ok(Self::GetBlkSz),
            _ => Err(KernelError::OperationNotSupported { operation: "ioctl" }),
        }
    }
}

/// The stream vtable: close, read, write, control.
///
/// Guarantees common to all backends:
/// - `read`/`write` advance the stream cursor by exactly the byte count
///   they return; short transfers are permitted.
/// - `read` returning 0 means end-of-stream.
/// - `SetPos` rejects positions outside the backend's valid range.
pub trait IoStream: Send + Sync {
    /// Release backend resources. Idempotent.
    fn close(&self);

    fn read(&self, buf: &mut [u8]) -> KernelResult<usize>;

    fn write(&self, buf: &[u8]) -> KernelResult<usize>;

    fn control(&self, op: Control) -> KernelResult<u64>;
}

/// Read exactly `buf.len()` bytes or fail.
pub fn read_exact(io: &dyn IoStream, buf: &mut [u8]) -> KernelResult<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = io.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(KernelError::FsError(crate::error::FsError::IoError));
        }
        filled += n;
    }
    Ok(())
}

/// Reposition the stream cursor.
pub fn seek(io: &dyn IoStream, pos: u64) -> KernelResult<()> {
    io.control(Control::SetPos(pos)).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelResult;

    #[test_case]
    fn control_decoding() -> KernelResult<()> {
        assert_eq!(Control::decode(IOCTL_GETLEN, 7)?, Control::GetLen);
        assert_eq!(Control::decode(IOCTL_SETPOS, 7)?, Control::SetPos(7));
        assert!(Control::decode(99, 0).is_err());
        Ok(())
    }
}
