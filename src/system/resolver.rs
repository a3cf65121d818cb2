//! Hang-safe handle name resolution.
//!
//! `NtQueryObject(ObjectNameInformation)` never returns for some objects
//! (synchronous pipes with no data, a few device objects). The only way to get
//! control back from such a call is to kill the thread making it, so queries
//! run on a dedicated worker and the caller waits with a timeout. A worker that
//! misses the deadline is terminated and a fresh one is started lazily by the
//! next query; a killed thread is never resumed.

use std::io;
use std::mem;
use std::slice;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::system::buffer::{grow_until_fits, Fit, Grow, Growth, GrowthPolicy};
use crate::system::kernel::{Kernel, NtStatus, RawHandle, Termination, WorkerThread};
use crate::system::name::{NameBuffer, MAX_NAME_BUFFER, MIN_NAME_BUFFER};

/// Outcome of resolving one handle. Only `Name` ends up in scan results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Name(String),
    /// The object exists but has an empty name.
    Unnamed,
    /// The query failed with something other than "buffer too small".
    Failed(NtStatus),
    /// The worker missed the deadline and was terminated.
    TimedOut,
    /// No usable answer: no memory, a malformed reply, or the size never settled.
    Unresolvable,
}

/// Request for the worker: query `handle` into `len` bytes at `buf`.
struct Job {
    handle: RawHandle,
    buf: *mut u8,
    len: usize,
}

// SAFETY: the buffer is only touched by the worker while the caller is blocked
// waiting for the reply, or after the caller has given up ownership of it.
unsafe impl Send for Job {}

struct Done {
    status: NtStatus,
    return_len: u32,
}

/// A running worker and its one-slot request/response channel.
struct Lease<T> {
    thread: T,
    start: SyncSender<Job>,
    finished: Receiver<Done>,
}

impl<T: WorkerThread> Lease<T> {
    fn spawn<K: Kernel<Thread = T>>(kernel: &Arc<K>) -> io::Result<Self> {
        let (start, jobs) = mpsc::sync_channel(1);
        let (done, finished) = mpsc::sync_channel(1);
        let worker_kernel = Arc::clone(kernel);
        let thread = kernel.spawn_worker(Box::new(move || name_query_loop(&*worker_kernel, jobs, done)))?;
        Ok(Self { thread, start, finished })
    }

    fn terminate(self) -> Termination {
        let termination = self.thread.terminate();
        drop(self.start);
        drop(self.finished);
        termination
    }
}

fn name_query_loop<K: Kernel + ?Sized>(kernel: &K, jobs: Receiver<Job>, done: SyncSender<Done>) {
    // Ends once the owning lease drops its sender
    while let Ok(job) = jobs.recv() {
        // SAFETY: see `Job`; the caller keeps the buffer alive until it reads `Done`.
        let buf = unsafe { slice::from_raw_parts_mut(job.buf, job.len) };
        let mut return_len = 0u32;
        let status = kernel.query_object_name(job.handle, buf, &mut return_len);
        if done.send(Done { status, return_len }).is_err() {
            break;
        }
    }
}

enum RoundTrip {
    Finished(NameBuffer, Done),
    TimedOut,
    WorkerLost,
}

/// Resolves duplicated handles to object names, one at a time.
///
/// Not thread safe on purpose: it has a single request slot, so owners keep it
/// behind the single-flight guard.
pub struct Resolver<K: Kernel> {
    kernel: Arc<K>,
    lease: Option<Lease<K::Thread>>,
    name_buffer_hint: usize,
    max_attempts: usize,
    workers_spawned: u64,
    workers_terminated: u64,
}

impl<K: Kernel> Resolver<K> {
    /// `name_buffer_hint` is clamped to a size a name query can use, and at
    /// least one attempt is always made.
    pub fn new(kernel: Arc<K>, name_buffer_hint: usize, max_attempts: usize) -> Self {
        Self {
            kernel,
            lease: None,
            name_buffer_hint: name_buffer_hint.clamp(MIN_NAME_BUFFER, MAX_NAME_BUFFER),
            max_attempts: max_attempts.max(1),
            workers_spawned: 0,
            workers_terminated: 0,
        }
    }

    pub fn has_worker(&self) -> bool {
        self.lease.is_some()
    }

    pub fn workers_spawned(&self) -> u64 {
        self.workers_spawned
    }

    pub fn workers_terminated(&self) -> u64 {
        self.workers_terminated
    }

    /// Terminate the current worker, if any. The next query starts a new one.
    pub fn discard_worker(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.terminate();
            self.workers_terminated += 1;
        }
    }

    /// Resolve `handle`, waiting at most `timeout` for each kernel query.
    ///
    /// Only a failure to start the worker is an error; everything else is a
    /// per-handle outcome.
    pub fn resolve(&mut self, handle: RawHandle, timeout: Duration) -> Result<Resolution> {
        let initial = self.name_buffer_hint;
        let policy = GrowthPolicy {
            growth: Growth::Reported,
            max_size: MAX_NAME_BUFFER,
            max_attempts: self.max_attempts,
        };

        let outcome = grow_until_fits(initial, policy, |size| {
            let Some(name) = NameBuffer::try_new(size) else {
                warn!(handle, size, "no memory for name buffer, skipping handle");
                return Ok(Fit::Done(Resolution::Unresolvable));
            };

            Ok(match self.round_trip(handle, name, timeout)? {
                RoundTrip::TimedOut => Fit::Done(Resolution::TimedOut),
                RoundTrip::WorkerLost => Fit::Done(Resolution::Unresolvable),
                // The undersized buffer is dropped here, before the next attempt
                RoundTrip::Finished(_, done) if done.status.is_too_small() => {
                    trace!(handle, size, required = done.return_len, "name buffer too small");
                    Fit::TooSmall { required: done.return_len as usize }
                }
                RoundTrip::Finished(_, done) if !done.status.is_success() => {
                    Fit::Done(Resolution::Failed(done.status))
                }
                RoundTrip::Finished(name, _) => Fit::Done(match name.decode() {
                    Some(path) if path.is_empty() => Resolution::Unnamed,
                    Some(path) => Resolution::Name(path),
                    None => Resolution::Unresolvable,
                }),
            })
        });

        match outcome {
            Ok(resolution) => Ok(resolution),
            Err(Grow::Failed(e)) => Err(e),
            Err(Grow::Exhausted { size }) => {
                debug!(handle, size, "name size never settled, skipping handle");
                Ok(Resolution::Unresolvable)
            }
        }
    }

    /// Hand one query to the worker and wait for it.
    fn round_trip(&mut self, handle: RawHandle, mut name: NameBuffer, timeout: Duration) -> Result<RoundTrip> {
        let lease = match self.lease.take() {
            Some(lease) => lease,
            None => {
                let lease = Lease::spawn(&self.kernel).map_err(Error::WorkerSpawn)?;
                self.workers_spawned += 1;
                debug!(spawned = self.workers_spawned, "started name query worker");
                lease
            }
        };

        let bytes = name.as_bytes_mut();
        let job = Job { handle, buf: bytes.as_mut_ptr(), len: bytes.len() };
        if lease.start.send(job).is_err() {
            warn!(handle, "name query worker exited unexpectedly");
            lease.terminate();
            self.workers_terminated += 1;
            return Ok(RoundTrip::WorkerLost);
        }

        match lease.finished.recv_timeout(timeout) {
            Ok(done) => {
                self.lease = Some(lease);
                Ok(RoundTrip::Finished(name, done))
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(handle, ?timeout, "name query did not return, terminating worker");
                match lease.terminate() {
                    Termination::Joined => drop(name),
                    // The abandoned thread may still write into the buffer
                    Termination::Detached => mem::forget(name),
                }
                self.workers_terminated += 1;
                Ok(RoundTrip::TimedOut)
            }
            Err(RecvTimeoutError::Disconnected) => {
                // The worker died after its query returned, so the buffer is free again
                warn!(handle, "name query worker exited unexpectedly");
                lease.terminate();
                self.workers_terminated += 1;
                Ok(RoundTrip::WorkerLost)
            }
        }
    }
}
