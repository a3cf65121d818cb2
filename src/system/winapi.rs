//! Windows backend for the open-files scan:
//! - System-wide handle table via NtQuerySystemInformation(SystemExtendedHandleInformation)
//! - Handle duplication out of the target process (DuplicateHandle)
//! - Object names via NtQueryObject(ObjectNameInformation)
//! - Killable name-query worker (SuspendThread + TerminateThread)
//! - Drive letter to device mapping (GetLogicalDrives + QueryDosDeviceW)

use std::ffi::c_void;
use std::io;
use std::os::windows::io::AsRawHandle;
use std::sync::OnceLock;
use std::thread::JoinHandle;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, HANDLE, WAIT_OBJECT_0,
};
use windows::Win32::Storage::FileSystem::{GetLogicalDrives, QueryDosDeviceW};
use windows::Win32::System::Threading::{
    GetCurrentProcess, OpenProcess, SuspendThread, TerminateThread, WaitForSingleObject,
    INFINITE, PROCESS_DUP_HANDLE,
};

use crate::error::{Error, Result};
use crate::system::kernel::{Kernel, NtStatus, RawHandle, Termination, WorkerThread};
use crate::system::open_files::{OpenFiles, ScanOptions};

/// The real kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct WinKernel;

impl Kernel for WinKernel {
    type Thread = KillableWorker;

    fn query_handle_table(&self, buf: &mut [u8], return_len: &mut u32) -> NtStatus {
        use ntapi::ntexapi::{NtQuerySystemInformation, SystemExtendedHandleInformation};

        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let status = unsafe {
            NtQuerySystemInformation(
                SystemExtendedHandleInformation,
                buf.as_mut_ptr() as *mut _,
                len,
                return_len,
            )
        };
        NtStatus(status)
    }

    fn duplicate_handle(&self, process: RawHandle, handle: RawHandle) -> io::Result<RawHandle> {
        let mut duplicated = HANDLE::default();
        unsafe {
            DuplicateHandle(
                HANDLE(process as *mut c_void),
                HANDLE(handle as *mut c_void),
                GetCurrentProcess(),
                &mut duplicated,
                0,
                false,
                DUPLICATE_SAME_ACCESS,
            )
        }
        .map_err(io::Error::from)?;
        Ok(duplicated.0 as RawHandle)
    }

    fn close_handle(&self, handle: RawHandle) {
        unsafe {
            let _ = CloseHandle(HANDLE(handle as *mut c_void));
        }
    }

    fn query_object_name(&self, handle: RawHandle, buf: &mut [u8], return_len: &mut u32) -> NtStatus {
        use ntapi::ntobapi::{NtQueryObject, ObjectNameInformation};

        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let status = unsafe {
            NtQueryObject(
                handle as *mut _,
                ObjectNameInformation,
                buf.as_mut_ptr() as *mut _,
                len,
                return_len,
            )
        };
        NtStatus(status)
    }
}

/// Name-query worker that can be killed while stuck inside the kernel.
#[derive(Debug)]
pub struct KillableWorker(JoinHandle<()>);

impl WorkerThread for KillableWorker {
    fn from_join(handle: JoinHandle<()>) -> Self {
        Self(handle)
    }

    fn terminate(self) -> Termination {
        let thread = HANDLE(self.0.as_raw_handle());
        let gone = unsafe {
            SuspendThread(thread);
            let killed = TerminateThread(thread, 1).is_ok();
            // Only wait forever if the kill actually went through
            WaitForSingleObject(thread, if killed { INFINITE } else { 0 }) == WAIT_OBJECT_0
        };
        // Dropping the JoinHandle closes the thread handle
        drop(self.0);

        if gone {
            Termination::Joined
        } else {
            Termination::Detached
        }
    }
}

/// Target process opened with `PROCESS_DUP_HANDLE`, closed on drop.
pub struct ProcessHandle {
    pid: u32,
    handle: HANDLE,
}

impl ProcessHandle {
    pub fn open(pid: u32) -> Result<Self> {
        let handle = unsafe { OpenProcess(PROCESS_DUP_HANDLE, false, pid) }
            .map_err(|e| Error::OpenProcess { pid, source: io::Error::from(e) })?;
        Ok(Self { pid, handle })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn raw(&self) -> RawHandle {
        self.handle.0 as RawHandle
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

static SHARED: OnceLock<OpenFiles<WinKernel>> = OnceLock::new();

/// Set the options of the process-wide scanner. Returns `false` if it was
/// already initialized, in which case the options are ignored.
pub fn configure(options: ScanOptions) -> bool {
    let mut fresh = false;
    SHARED.get_or_init(|| {
        fresh = true;
        OpenFiles::new(WinKernel, options)
    });
    fresh
}

/// The process-wide scanner. Every scan in the process goes through it so they
/// share one guard and one worker.
pub fn shared() -> &'static OpenFiles<WinKernel> {
    SHARED.get_or_init(|| OpenFiles::new(WinKernel, ScanOptions::default()))
}

/// Open `pid` and list the names of its open handles.
pub fn open_files(pid: u32) -> Result<Vec<String>> {
    let process = ProcessHandle::open(pid)?;
    shared().collect(pid, process.raw())
}

/// `(device, drive)` pairs such as `("\Device\HarddiskVolume3", "C:")`.
pub fn drive_devices() -> Vec<(String, String)> {
    let mut devices = Vec::new();
    let mask = unsafe { GetLogicalDrives() };

    for (bit, letter) in (b'A'..=b'Z').enumerate() {
        if mask & (1 << bit) == 0 {
            continue;
        }
        let drive = format!("{}:", letter as char);
        let wide: Vec<u16> = drive.encode_utf16().chain(std::iter::once(0)).collect();
        let mut target = vec![0u16; 1024];

        let len = unsafe { QueryDosDeviceW(PCWSTR(wide.as_ptr()), Some(&mut target)) } as usize;
        if len == 0 {
            continue;
        }
        // The result is a list of NUL-terminated strings; the first is current
        let end = target[..len].iter().position(|&c| c == 0).unwrap_or(len);
        devices.push((String::from_utf16_lossy(&target[..end]), drive));
    }

    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_files_of_current_process() {
        let dir = std::env::temp_dir().join(format!("pfiles-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("held-open.txt");
        let _file = std::fs::File::create(&path).unwrap();

        let names = open_files(std::process::id()).unwrap();
        assert!(
            names.iter().any(|n| n.ends_with("held-open.txt")),
            "own file handle missing from {names:?}"
        );
    }

    #[test]
    fn test_system_drive_is_mapped() {
        let devices = drive_devices();
        assert!(devices.iter().any(|(device, _)| device.starts_with(r"\Device\")));
    }
}
