//! Copies of another process's handles, owned by the calling process.

use tracing::trace;

use crate::system::kernel::{HandleRecord, Kernel, RawHandle};

/// A duplicated handle that is closed exactly once, when dropped.
pub struct DuplicatedHandle<'k, K: Kernel + ?Sized> {
    kernel: &'k K,
    raw: RawHandle,
}

impl<'k, K: Kernel + ?Sized> DuplicatedHandle<'k, K> {
    /// Duplicate `record`'s handle out of `process`.
    ///
    /// Handles close between the snapshot and this call, and some need rights
    /// we don't have, so failure is routine and only yields `None`.
    pub fn new(kernel: &'k K, process: RawHandle, record: &HandleRecord) -> Option<Self> {
        match kernel.duplicate_handle(process, record.handle_value) {
            Ok(raw) => Some(Self { kernel, raw }),
            Err(e) => {
                trace!(
                    pid = record.owner_pid,
                    handle = record.handle_value,
                    error = %e,
                    "skipping handle that could not be duplicated"
                );
                None
            }
        }
    }

    pub fn raw(&self) -> RawHandle {
        self.raw
    }
}

impl<K: Kernel + ?Sized> Drop for DuplicatedHandle<'_, K> {
    fn drop(&mut self) {
        self.kernel.close_handle(self.raw);
    }
}
