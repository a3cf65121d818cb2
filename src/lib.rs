//! pfiles — list the files a Windows process has open.
//!
//! The scan snapshots the system handle table, duplicates every handle the
//! target process owns and asks the kernel for its name. Name queries can hang
//! forever on pipes and some devices, so they run on a worker thread that is
//! killed and replaced when it misses its deadline.
//!
//! The pipeline is written against the [`Kernel`] trait; the Windows backend
//! is [`system::winapi::WinKernel`].

pub mod config;
pub mod error;
pub mod system;

pub use error::{Error, Result};
pub use system::dos_path::DeviceMap;
pub use system::kernel::{HandleRecord, Kernel, NtStatus, RawHandle, Termination, WorkerThread};
pub use system::open_files::{OpenFiles, Scan, ScanOptions, ScanStats};
pub use system::resolver::{Resolution, Resolver};

#[cfg(windows)]
pub use system::winapi::{open_files, ProcessHandle, WinKernel};
