//! Process-wide single-flight guard.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lets exactly one caller at a time use the state it wraps. Later callers
/// block until the current one is done.
pub struct SingleFlight<T> {
    inner: Mutex<T>,
}

impl<T> SingleFlight<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    /// Wait for exclusive access.
    ///
    /// If a previous holder panicked, access is still granted and
    /// `Flight::recovered` tells the caller the state may be mid-operation.
    pub fn enter(&self) -> Flight<'_, T> {
        match self.inner.lock() {
            Ok(guard) => Flight { guard, recovered: false },
            Err(poisoned) => {
                warn!("previous scan panicked, recovering shared state");
                self.inner.clear_poison();
                Flight { guard: poisoned.into_inner(), recovered: true }
            }
        }
    }
}

pub struct Flight<'a, T> {
    guard: MutexGuard<'a, T>,
    recovered: bool,
}

impl<T> Flight<'_, T> {
    pub fn recovered(&self) -> bool {
        self.recovered
    }
}

impl<T> Deref for Flight<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for Flight<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
