//! Shared utility functions and traits

use std::sync::{Mutex, MutexGuard};

/// Extension trait for locking a [`Mutex`] from callback context.
///
/// Timer and transport callbacks must never take the process down, so a
/// poisoned lock is recovered instead of propagated. All state guarded this
/// way stays consistent across a panic (flags, slots, counters).
///
/// # Example
///
/// ```
/// use std::sync::Mutex;
/// use virtual_keyboard::utils::MutexExt;
///
/// let reports = Mutex::new(Vec::new());
/// reports.lock_recover().push(0x01u8);
/// assert_eq!(*reports.lock_recover(), vec![0x01]);
/// ```
pub trait MutexExt<T> {
    /// Lock the mutex, taking over the data if a previous holder panicked.
    fn lock_recover(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_recover(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
