//! Shared plumbing used by the event bus and the storage backends.

pub mod listeners;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use listeners::{Listeners, Subscription};

/// Lock a mutex, recovering the guard if a handler panicked while holding it.
/// None of the guarded state can be left half-updated by a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
