pub mod multimap;
pub mod sos;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, carrying on with the inner value if a holder panicked
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
