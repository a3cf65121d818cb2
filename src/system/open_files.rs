//! Open-files scan: snapshot, filter, duplicate, resolve, collect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::system::duplicate::DuplicatedHandle;
use crate::system::guard::{Flight, SingleFlight};
use crate::system::kernel::{Kernel, RawHandle};
use crate::system::name::NAME_BUFFER_HINT;
use crate::system::resolver::{Resolution, Resolver};
use crate::system::snapshot::HandleTableSnapshot;

/// Tunables for a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    /// How long one name query may take before its worker is killed.
    pub name_timeout: Duration,
    /// First name buffer size in bytes.
    pub name_buffer_hint: usize,
    /// Upper bound on "buffer too small" retries per handle.
    pub max_name_attempts: usize,
    pub snapshot_initial_size: usize,
    pub snapshot_max_size: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            name_timeout: Duration::from_millis(100),
            name_buffer_hint: NAME_BUFFER_HINT,
            max_name_attempts: 8,
            snapshot_initial_size: 0x20000,
            snapshot_max_size: 512 * 1024 * 1024,
        }
    }
}

/// Per-scan counters, mostly for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Handles in the system-wide snapshot.
    pub handles_total: usize,
    /// Handles owned by the target process.
    pub handles_owned: usize,
    pub duplicated: usize,
    pub resolved: usize,
    pub unnamed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Scan {
    /// Resolved names in handle-table order.
    pub paths: Vec<String>,
    pub stats: ScanStats,
    pub elapsed: Duration,
}

/// Lists the names of the handles a process has open.
///
/// Scans are serialized: a second caller waits until the first one is done,
/// because all of them share one name-query worker.
pub struct OpenFiles<K: Kernel> {
    kernel: Arc<K>,
    options: ScanOptions,
    resolver: SingleFlight<Resolver<K>>,
}

impl<K: Kernel> OpenFiles<K> {
    pub fn new(kernel: K, options: ScanOptions) -> Self {
        let kernel = Arc::new(kernel);
        let resolver = Resolver::new(Arc::clone(&kernel), options.name_buffer_hint, options.max_name_attempts);
        Self { kernel, options, resolver: SingleFlight::new(resolver) }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Names of the handles `pid` has open. `process` must be a handle to that
    /// process with `PROCESS_DUP_HANDLE` access.
    pub fn collect(&self, pid: u32, process: RawHandle) -> Result<Vec<String>> {
        self.scan(pid, process).map(|scan| scan.paths)
    }

    /// Like `collect`, with counters.
    pub fn scan(&self, pid: u32, process: RawHandle) -> Result<Scan> {
        let mut resolver = self.enter();
        let started = Instant::now();

        let snapshot = HandleTableSnapshot::take(
            &*self.kernel,
            self.options.snapshot_initial_size,
            self.options.snapshot_max_size,
        )?;

        let mut scan = Scan::default();
        scan.stats.handles_total = snapshot.len();

        for record in snapshot.records().filter(|r| r.owner_pid == pid) {
            scan.stats.handles_owned += 1;

            // Closed at the end of this iteration whatever happens
            let Some(handle) = DuplicatedHandle::new(&*self.kernel, process, &record) else {
                continue;
            };
            scan.stats.duplicated += 1;

            match resolver.resolve(handle.raw(), self.options.name_timeout)? {
                Resolution::Name(path) => {
                    scan.paths
                        .try_reserve(1)
                        .map_err(|_| Error::OutOfMemory { what: "result", size: scan.paths.len() + 1 })?;
                    trace!(pid, handle = record.handle_value, %path, "resolved");
                    scan.paths.push(path);
                    scan.stats.resolved += 1;
                }
                Resolution::Unnamed => scan.stats.unnamed += 1,
                Resolution::TimedOut => {
                    debug!(pid, handle = record.handle_value, "name query timed out");
                    scan.stats.timed_out += 1;
                }
                Resolution::Failed(status) => {
                    trace!(pid, handle = record.handle_value, %status, "name query failed");
                    scan.stats.failed += 1;
                }
                Resolution::Unresolvable => scan.stats.failed += 1,
            }
        }

        scan.elapsed = started.elapsed();
        info!(
            pid,
            files = scan.paths.len(),
            owned = scan.stats.handles_owned,
            timed_out = scan.stats.timed_out,
            elapsed_ms = scan.elapsed.as_millis() as u64,
            "open files scan finished"
        );
        Ok(scan)
    }

    /// Worker threads started and terminated so far.
    pub fn worker_counts(&self) -> (u64, u64) {
        let resolver = self.enter();
        (resolver.workers_spawned(), resolver.workers_terminated())
    }

    /// Exclusive access to the resolver. After a panicked scan the worker may
    /// still hold a request from it, so it is replaced.
    fn enter(&self) -> Flight<'_, Resolver<K>> {
        let mut resolver = self.resolver.enter();
        if resolver.recovered() {
            resolver.discard_worker();
        }
        resolver
    }
}
