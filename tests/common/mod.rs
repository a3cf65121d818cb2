//! Scripted kernel for driving the open-files pipeline without Windows.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use pfiles::system::kernel::DetachedWorker;
use pfiles::system::name::encode_object_name;
use pfiles::system::snapshot::encode_handle_table;
use pfiles::{HandleRecord, Kernel, NtStatus, RawHandle, ScanOptions, WorkerThread};

/// How the name query answers for one handle.
#[derive(Debug, Clone)]
pub enum Behavior {
    Name(String),
    Unnamed,
    /// Never returns.
    Hang,
    Fail(NtStatus),
    /// Report "too small" with each of these sizes in turn, then behave as the inner one.
    TooSmall(Vec<u32>, Box<Behavior>),
}

pub fn name(path: &str) -> Behavior {
    Behavior::Name(path.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Snapshot,
    Duplicate { process: RawHandle, handle: RawHandle },
    Close { handle: RawHandle },
    Query { handle: RawHandle },
}

/// Blocks the first snapshot until opened.
#[derive(Default)]
pub struct Gate {
    state: Mutex<(bool, bool)>,
    cv: Condvar,
}

impl Gate {
    fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        if state.0 {
            return;
        }
        state.0 = true;
        self.cv.notify_all();
        while !state.1 {
            state = self.cv.wait(state).unwrap();
        }
    }

    pub fn wait_entered(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.0 {
            state = self.cv.wait(state).unwrap();
        }
    }

    pub fn open(&self) {
        self.state.lock().unwrap().1 = true;
        self.cv.notify_all();
    }
}

#[derive(Default)]
struct State {
    next_dup: RawHandle,
    /// duplicated value -> source value
    open: HashMap<RawHandle, RawHandle>,
    duplicated: usize,
    closed: usize,
    /// (source value, buffer size) per name query
    name_sizes: Vec<(RawHandle, usize)>,
    too_small_served: HashMap<RawHandle, usize>,
    events: Vec<Event>,
}

#[derive(Default)]
pub struct MockKernel {
    records: Vec<HandleRecord>,
    behaviors: HashMap<RawHandle, Behavior>,
    undup: HashSet<RawHandle>,
    fail_spawn: bool,
    snapshot_status: Option<NtStatus>,
    gate: Option<Arc<Gate>>,
    panic_next_snapshot: AtomicBool,
    state: Mutex<State>,
}

impl MockKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(mut self, pid: u32, value: RawHandle, behavior: Behavior) -> Self {
        self.records.push(HandleRecord {
            owner_pid: pid,
            handle_value: value,
            object_type_index: 37,
            access_mask: 0x0012_019F,
        });
        self.behaviors.insert(value, behavior);
        self
    }

    /// A handle whose duplication fails.
    pub fn closed_handle(mut self, pid: u32, value: RawHandle) -> Self {
        self = self.handle(pid, value, name(r"\Device\Unreachable"));
        self.undup.insert(value);
        self
    }

    pub fn failing_spawn(mut self) -> Self {
        self.fail_spawn = true;
        self
    }

    pub fn failing_snapshot(mut self, status: NtStatus) -> Self {
        self.snapshot_status = Some(status);
        self
    }

    pub fn gated(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Make the next snapshot panic on the scanning thread.
    pub fn panic_next_snapshot(&self) {
        self.panic_next_snapshot.store(true, Ordering::SeqCst);
    }

    pub fn open_handles(&self) -> usize {
        self.state.lock().unwrap().open.len()
    }

    pub fn duplicated(&self) -> usize {
        self.state.lock().unwrap().duplicated
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    /// Buffer sizes offered for the handle with source value `value`.
    pub fn name_sizes(&self, value: RawHandle) -> Vec<usize> {
        let state = self.state.lock().unwrap();
        state.name_sizes.iter().filter(|(v, _)| *v == value).map(|(_, size)| *size).collect()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    fn answer(&self, value: RawHandle, behavior: &Behavior, buf: &mut [u8], return_len: &mut u32) -> NtStatus {
        match behavior {
            Behavior::Name(path) => encode_object_name(path, buf, return_len),
            Behavior::Unnamed => encode_object_name("", buf, return_len),
            Behavior::Fail(status) => *status,
            Behavior::Hang => loop {
                thread::park();
            },
            Behavior::TooSmall(sizes, then) => {
                let served = {
                    let mut state = self.state.lock().unwrap();
                    let served = state.too_small_served.entry(value).or_insert(0);
                    *served += 1;
                    *served - 1
                };
                match sizes.get(served) {
                    Some(&size) => {
                        *return_len = size;
                        NtStatus::INFO_LENGTH_MISMATCH
                    }
                    None => self.answer(value, then, buf, return_len),
                }
            }
        }
    }
}

impl Kernel for MockKernel {
    type Thread = DetachedWorker;

    fn query_handle_table(&self, buf: &mut [u8], return_len: &mut u32) -> NtStatus {
        self.state.lock().unwrap().events.push(Event::Snapshot);
        if self.panic_next_snapshot.swap(false, Ordering::SeqCst) {
            panic!("snapshot blew up");
        }
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        if let Some(status) = self.snapshot_status {
            return status;
        }
        encode_handle_table(&self.records, buf, return_len)
    }

    fn duplicate_handle(&self, process: RawHandle, handle: RawHandle) -> io::Result<RawHandle> {
        let mut state = self.state.lock().unwrap();
        state.events.push(Event::Duplicate { process, handle });
        if self.undup.contains(&handle) {
            return Err(io::Error::from_raw_os_error(6));
        }
        state.next_dup += 1;
        let dup = 0x1_0000 + state.next_dup * 4;
        state.open.insert(dup, handle);
        state.duplicated += 1;
        Ok(dup)
    }

    fn close_handle(&self, handle: RawHandle) {
        let mut state = self.state.lock().unwrap();
        state.events.push(Event::Close { handle });
        assert!(state.open.remove(&handle).is_some(), "closed unknown handle {handle:#x}");
        state.closed += 1;
    }

    fn query_object_name(&self, handle: RawHandle, buf: &mut [u8], return_len: &mut u32) -> NtStatus {
        let value = {
            let mut state = self.state.lock().unwrap();
            state.events.push(Event::Query { handle });
            let Some(&value) = state.open.get(&handle) else {
                return NtStatus::INVALID_HANDLE;
            };
            state.name_sizes.push((value, buf.len()));
            value
        };
        // Lock released: a hanging answer must not block the caller's bookkeeping
        match self.behaviors.get(&value) {
            Some(behavior) => self.answer(value, behavior, buf, return_len),
            None => NtStatus::INVALID_HANDLE,
        }
    }

    fn spawn_worker(&self, body: Box<dyn FnOnce() + Send + 'static>) -> io::Result<DetachedWorker> {
        if self.fail_spawn {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "no threads left"));
        }
        thread::Builder::new()
            .name("mock-name-query".into())
            .spawn(body)
            .map(DetachedWorker::from_join)
    }
}

/// Short timeout and a tiny first snapshot so growth is exercised.
pub fn options() -> ScanOptions {
    ScanOptions {
        name_timeout: Duration::from_millis(50),
        snapshot_initial_size: 64,
        ..ScanOptions::default()
    }
}
