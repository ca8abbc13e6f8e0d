use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock that survives a poisoned mutex; guarded state stays consistent
/// because no lock holder panics mid-update.
pub(crate) trait MutexExt<T> {
    fn guard(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn guard(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
