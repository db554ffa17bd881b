// src/utils/mod.rs

pub mod crypto;
pub mod hash;
pub mod jwt;
pub mod observer;

use std::sync::{Mutex, MutexGuard};

/// Locks a std mutex, recovering the data if a listener panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
