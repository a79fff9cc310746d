//! In-memory literal stream
//!
//! Wraps a byte buffer behind the [`IoStream`] vtable: a fixed-size
//! backing store with a cursor. Used for embedded executable images and
//! as the test double for anything that consumes a stream.

extern crate alloc;

use alloc::boxed::Box;

use spin::Mutex;

use super::{Control, IoStream};
use crate::error::{KernelError, KernelResult};

enum Buf {
    Owned(Box<[u8]>),
    Static(&'static [u8]),
}

impl Buf {
    fn len(&self) -> usize {
        match self {
            Buf::Owned(b) => b.len(),
            Buf::Static(b) => b.len(),
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Buf::Owned(b) => b,
            Buf::Static(b) => b,
        }
    }
}

struct MemoryIoInner {
    buf: Buf,
    pos: usize,
    closed: bool,
}

/// A literal stream over a fixed-size byte buffer.
pub struct MemoryIo {
    inner: Mutex<MemoryIoInner>,
}

impl MemoryIo {
    /// Writable stream owning its buffer.
    pub fn new(buf: Box<[u8]>) -> Self {
        Self {
            inner: Mutex::new(MemoryIoInner {
                buf: Buf::Owned(buf),
                pos: 0,
                closed: false,
            }),
        }
    }

    /// Read-only stream over borrowed bytes (embedded images).
    pub fn from_static(bytes: &'static [u8]) -> Self {
        Self {
            inner: Mutex::new(MemoryIoInner {
                buf: Buf::Static(bytes),
                pos: 0,
                closed: false,
            }),
        }
    }
}

impl IoStream for MemoryIo {
    fn close(&self) {
        self.inner.lock().closed = true;
    }

    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(KernelError::StreamClosed);
        }
        let pos = inner.pos;
        let remaining = inner.buf.len().saturating_sub(pos);
        let n = buf.len().min(remaining);
        buf[..n].copy_from_slice(&inner.buf.bytes()[pos..pos + n]);
        inner.pos += n;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(KernelError::StreamClosed);
        }
        let pos = inner.pos;
        let remaining = inner.buf.len().saturating_sub(pos);
        let n = buf.len().min(remaining);
        match &mut inner.buf {
            Buf::Owned(bytes) => bytes[pos..pos + n].copy_from_slice(&buf[..n]),
            Buf::Static(_) => {
                return Err(KernelError::ReadOnlyDevice { device: "memio" });
            }
        }
        inner.pos += n;
        Ok(n)
    }

    fn control(&self, op: Control) -> KernelResult<u64> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(KernelError::StreamClosed);
        }
        match op {
            Control::GetLen => Ok(inner.buf.len() as u64),
            Control::GetPos => Ok(inner.pos as u64),
            Control::SetPos(pos) => {
                if pos > inner.buf.len() as u64 {
                    return Err(KernelError::InvalidArgument {
                        name: "pos",
                        value: "beyond end of buffer",
                    });
                }
                inner.pos = pos as usize;
                Ok(0)
            }
            // A literal stream has no natural block size; report one byte.
            Control::GetBlkSz => Ok(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::error::KernelResult;

    #[test_case]
    fn cursor_tracks_reads_and_writes() -> KernelResult<()> {
        let io = MemoryIo::new(vec![0u8; 16].into_boxed_slice());
        assert_eq!(io.write(b"hello")?, 5);
        assert_eq!(io.control(Control::GetPos)?, 5);

        io.control(Control::SetPos(0))?;
        let mut buf = [0u8; 5];
        assert_eq!(io.read(&mut buf)?, 5);
        assert_eq!(&buf, b"hello");
        Ok(())
    }

    #[test_case]
    fn reads_stop_at_end() -> KernelResult<()> {
        let io = MemoryIo::new(vec![7u8; 4].into_boxed_slice());
        let mut buf = [0u8; 8];
        assert_eq!(io.read(&mut buf)?, 4);
        assert_eq!(io.read(&mut buf)?, 0);
        Ok(())
    }

    #[test_case]
    fn set_pos_rejects_out_of_range() -> KernelResult<()> {
        let io = MemoryIo::new(vec![0u8; 4].into_boxed_slice());
        assert!(io.control(Control::SetPos(4)).is_ok());
        assert!(io.control(Control::SetPos(5)).is_err());
        Ok(())
    }

    #[test_case]
    fn static_buffers_reject_writes() -> KernelResult<()> {
        static BYTES: [u8; 4] = [1, 2, 3, 4];
        let io = MemoryIo::from_static(&BYTES);
        assert!(io.write(b"x").is_err());
        let mut buf = [0u8; 4];
        io.read(&mut buf)?;
        assert_eq!(buf, BYTES);
        Ok(())
    }

    #[test_case]
    fn closed_streams_reject_operations() -> KernelResult<()> {
        let io = MemoryIo::new(vec![0u8; 4].into_boxed_slice());
        io.close();
        assert!(io.read(&mut [0u8; 1]).is_err());
        assert!(io.control(Control::GetLen).is_err());
        Ok(())
    }
}
