//! The single coarse lock serializing every mutation of server state.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

/// A spinlock mutex
pub struct SpinLock<T: ?Sized> {
    /// Whether or not the spinlock is taken
    is_locked: AtomicBool,
    /// The protected data
    data: UnsafeCell<T>,
}

// SAFETY: The spinlock guarantees exclusive access to the interior
unsafe impl<T: Send> Sync for SpinLock<T> {}
// SAFETY: Sending the lock sends the interior along with it
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a spinlock around the given data
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            is_locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Locks the mutex. The mutex is automatically unlocked when the returned
    /// `SpinLockGuard` is dropped
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<T> {
        while self.is_locked.swap(true, Ordering::Acquire) {
            while self.is_locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        SpinLockGuard(self)
    }

    /// Unlocks the mutex
    ///
    /// # Safety
    ///
    /// This must only be called by the destructor of the `SpinLockGuard` that
    /// locked this mutex
    #[inline]
    unsafe fn unlock(&self) {
        self.is_locked.store(false, Ordering::Release);
    }
}

/// Grants access to the interior of a [`SpinLock`] for as long as it lives
pub struct SpinLockGuard<'locked, T>(&'locked SpinLock<T>);

impl<T> SpinLockGuard<'_, T> {
    /// Returns a pointer to the spinlock's data
    const fn get_pointer(&self) -> NonNull<T> {
        // SAFETY: pointers to `data` are nonnull
        unsafe { NonNull::new_unchecked(self.0.data.get()) }
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: Since the lock has been acquired, we have exclusive access
        // to the interior
        unsafe { self.get_pointer().as_ref() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: Since the lock has been acquired, we have exclusive access
        // to the interior
        unsafe { self.get_pointer().as_mut() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: We trust the creator of this guard to do so only for proper
        // locking, and so this is the correct time to unlock the mutex
        unsafe {
            self.0.unlock();
        }
    }
}
