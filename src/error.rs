//! Call-level failures of an open-files scan.
//!
//! Anything that only affects a single handle is skipped inside the scan and
//! never shows up here.

use std::io;

use thiserror::Error;

use crate::system::kernel::NtStatus;

/// `ERROR_NOT_ENOUGH_MEMORY`
const ERROR_NOT_ENOUGH_MEMORY: i32 = 8;

#[derive(Debug, Error)]
pub enum Error {
    #[error("out of memory growing the {what} buffer to {size} bytes")]
    OutOfMemory { what: &'static str, size: usize },

    #[error("{api} failed with NTSTATUS {status}")]
    Kernel { api: &'static str, status: NtStatus },

    #[error("could not start the name query worker: {0}")]
    WorkerSpawn(#[source] io::Error),

    #[error("could not open process {pid}: {source}")]
    OpenProcess {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// OS-level code for the failure, for callers that map errors onto their
    /// own exception or errno scheme.
    pub fn os_code(&self) -> i32 {
        match self {
            Error::OutOfMemory { .. } => ERROR_NOT_ENOUGH_MEMORY,
            Error::Kernel { status, .. } => status.0,
            Error::WorkerSpawn(e) | Error::OpenProcess { source: e, .. } => e.raw_os_error().unwrap_or(0),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_codes() {
        let oom = Error::OutOfMemory { what: "snapshot", size: 64 };
        assert_eq!(oom.os_code(), 8);

        let kernel = Error::Kernel { api: "NtQuerySystemInformation", status: NtStatus::ACCESS_DENIED };
        assert_eq!(kernel.os_code() as u32, 0xC000_0022);
        assert_eq!(kernel.to_string(), "NtQuerySystemInformation failed with NTSTATUS 0xC0000022");

        let spawn = Error::WorkerSpawn(io::Error::from_raw_os_error(1455));
        assert_eq!(spawn.os_code(), 1455);
    }
}
