//! The kernel surface the open-files scan depends on.
//!
//! Everything above this trait is platform independent: the real backend lives
//! in `system::winapi`, and tests drive the same pipeline with scripted kernels.

use std::fmt;
use std::io;
use std::thread::{self, JoinHandle};

/// A handle value, valid in whichever process it was issued for.
pub type RawHandle = usize;

/// An NT status code as returned by the native API.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NtStatus(pub i32);

impl NtStatus {
    pub const SUCCESS: NtStatus = NtStatus(0);
    pub const BUFFER_OVERFLOW: NtStatus = NtStatus(0x8000_0005_u32 as i32);
    pub const INFO_LENGTH_MISMATCH: NtStatus = NtStatus(0xC000_0004_u32 as i32);
    pub const ACCESS_DENIED: NtStatus = NtStatus(0xC000_0022_u32 as i32);
    pub const BUFFER_TOO_SMALL: NtStatus = NtStatus(0xC000_0023_u32 as i32);
    pub const INVALID_HANDLE: NtStatus = NtStatus(0xC000_0008_u32 as i32);

    /// Same test as `NT_SUCCESS`: informational and success codes are non-negative.
    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    /// Whether the call failed only because the caller's buffer was too small.
    pub fn is_too_small(self) -> bool {
        self == Self::INFO_LENGTH_MISMATCH
            || self == Self::BUFFER_OVERFLOW
            || self == Self::BUFFER_TOO_SMALL
    }

    pub fn code(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NtStatus(0x{:08X})", self.code())
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.code())
    }
}

/// One entry of the system-wide handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleRecord {
    pub owner_pid: u32,
    pub handle_value: RawHandle,
    pub object_type_index: u16,
    pub access_mask: u32,
}

/// What the caller may assume about a worker after terminating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The thread is gone; memory it was writing into can be released.
    Joined,
    /// The thread was abandoned and may still run; memory it holds must be leaked.
    Detached,
}

/// A thread running the name-query loop that can be forcibly stopped.
///
/// Terminating consumes the value, so a stopped worker's identity can never be
/// handed out again.
pub trait WorkerThread: Send + Sized {
    fn from_join(handle: JoinHandle<()>) -> Self;

    fn terminate(self) -> Termination;
}

/// Portable worker: it can only be abandoned, never killed.
#[derive(Debug)]
pub struct DetachedWorker(JoinHandle<()>);

impl WorkerThread for DetachedWorker {
    fn from_join(handle: JoinHandle<()>) -> Self {
        Self(handle)
    }

    fn terminate(self) -> Termination {
        // Dropping a JoinHandle detaches the thread.
        drop(self.0);
        Termination::Detached
    }
}

/// Native calls needed to list and resolve another process's handles.
pub trait Kernel: Send + Sync + 'static {
    type Thread: WorkerThread;

    /// System-wide handle enumeration in the `SystemExtendedHandleInformation`
    /// layout (see `snapshot::encode_handle_table`).
    fn query_handle_table(&self, buf: &mut [u8], return_len: &mut u32) -> NtStatus;

    /// Duplicate `handle` out of `process` into the calling process with the
    /// same access rights.
    fn duplicate_handle(&self, process: RawHandle, handle: RawHandle) -> io::Result<RawHandle>;

    fn close_handle(&self, handle: RawHandle);

    /// `ObjectNameInformation` query. May block forever on some object types.
    fn query_object_name(&self, handle: RawHandle, buf: &mut [u8], return_len: &mut u32) -> NtStatus;

    /// Start the thread that runs name queries.
    fn spawn_worker(&self, body: Box<dyn FnOnce() + Send + 'static>) -> io::Result<Self::Thread> {
        thread::Builder::new()
            .name("pfiles-name-query".into())
            .spawn(body)
            .map(Self::Thread::from_join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(NtStatus::SUCCESS.is_success());
        assert!(!NtStatus::INFO_LENGTH_MISMATCH.is_success());
        assert!(NtStatus::INFO_LENGTH_MISMATCH.is_too_small());
        assert!(NtStatus::BUFFER_OVERFLOW.is_too_small());
        assert!(NtStatus::BUFFER_TOO_SMALL.is_too_small());
        assert!(!NtStatus::ACCESS_DENIED.is_too_small());
        assert_eq!(format!("{}", NtStatus::INFO_LENGTH_MISMATCH), "0xC0000004");
    }
}
