//! Safe global initialization
//!
//! Provides a safe alternative to `static mut` for globals that are
//! created once during boot (device handles, the mounted filesystem).

use core::sync::atomic::{AtomicPtr, Ordering};

/// A cell that can be written to only once.
///
/// Similar to `std::sync::OnceLock` but works in no_std environments.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceLock<T> {
    /// Create a new empty OnceLock
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: The pointer is non-null, meaning `set()` has previously
            // stored a valid, heap-allocated `T` via `Box::into_raw()`. The
            // Acquire ordering on the load synchronizes-with the Release in
            // `set()`, ensuring the pointed-to data is fully initialized
            // before we read it. The 'static lifetime is valid because the
            // allocation is leaked for the lifetime of the kernel.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell with a value.
    ///
    /// Returns Ok(()) if initialization succeeds, Err(value) if already
    /// initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        let boxed = alloc::boxed::Box::new(value);
        let ptr = alloc::boxed::Box::into_raw(boxed);

        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: `ptr` was obtained from `Box::into_raw()` above and
                // the compare_exchange failed, so nobody else has taken
                // ownership of this pointer; reclaim it to avoid a leak.
                let boxed = unsafe { alloc::boxed::Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }

    /// True once `set` has succeeded.
    pub fn is_initialized(&self) -> bool {
        !self.inner.load(Ordering::Acquire).is_null()
    }
}

// SAFETY: OnceLock hands out only shared references to T after a
// release/acquire handoff; it is Sync whenever T can be shared.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}
// SAFETY: Ownership of the boxed T moves with the cell.
unsafe impl<T: Send> Send for OnceLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelResult;

    #[test_case]
    fn set_once_then_read() -> KernelResult<()> {
        let cell: OnceLock<u32> = OnceLock::new();
        assert!(cell.get().is_none());
        assert!(cell.set(7).is_ok());
        assert_eq!(cell.get(), Some(&7));
        // A second set returns the rejected value.
        assert_eq!(cell.set(9), Err(9));
        assert_eq!(cell.get(), Some(&7));
        Ok(())
    }
}
