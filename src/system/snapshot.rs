//! Point-in-time copy of the system-wide handle table.
//!
//! `NtQuerySystemInformation(SystemExtendedHandleInformation)` does not report a
//! usable size up front, so the buffer is doubled until the table fits.

use std::mem;
use std::ptr;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::system::buffer::{grow_until_fits, AlignedBuf, Fit, Grow, Growth, GrowthPolicy};
use crate::system::kernel::{HandleRecord, Kernel, NtStatus};

/// `SYSTEM_HANDLE_INFORMATION_EX` header.
#[repr(C)]
#[derive(Clone, Copy)]
struct TableHeader {
    number_of_handles: usize,
    reserved: usize,
}

/// `SYSTEM_HANDLE_TABLE_ENTRY_INFO_EX`
#[repr(C)]
#[derive(Clone, Copy)]
struct TableEntry {
    object: usize,
    unique_process_id: usize,
    handle_value: usize,
    granted_access: u32,
    creator_back_trace_index: u16,
    object_type_index: u16,
    handle_attributes: u32,
    reserved: u32,
}

const HEADER_SIZE: usize = mem::size_of::<TableHeader>();
const ENTRY_SIZE: usize = mem::size_of::<TableEntry>();

/// Every handle open on the system when the snapshot was taken.
pub struct HandleTableSnapshot {
    buf: AlignedBuf,
    count: usize,
}

impl HandleTableSnapshot {
    /// Query the kernel, starting at `initial_size` bytes and doubling up to
    /// `max_size`.
    pub fn take<K: Kernel + ?Sized>(kernel: &K, initial_size: usize, max_size: usize) -> Result<Self> {
        let policy = GrowthPolicy {
            growth: Growth::Double,
            max_size,
            max_attempts: usize::BITS as usize,
        };

        let buf = grow_until_fits(initial_size, policy, |size| {
            let mut buf = AlignedBuf::try_alloc(size).ok_or(Error::OutOfMemory { what: "handle table", size })?;
            let mut return_len = 0u32;
            let status = kernel.query_handle_table(buf.as_bytes_mut(), &mut return_len);

            if status == NtStatus::INFO_LENGTH_MISMATCH {
                trace!(size, return_len, "handle table buffer too small");
                return Ok(Fit::TooSmall { required: return_len as usize });
            }
            if !status.is_success() {
                return Err(Error::Kernel { api: "NtQuerySystemInformation", status });
            }
            Ok(Fit::Done(buf))
        })
        .map_err(|e| match e {
            Grow::Failed(e) => e,
            Grow::Exhausted { size } => Error::OutOfMemory { what: "handle table", size },
        })?;

        let snapshot = Self::parse(buf);
        debug!(handles = snapshot.count, bytes = snapshot.buf.len(), "took handle table snapshot");
        Ok(snapshot)
    }

    fn parse(buf: AlignedBuf) -> Self {
        let bytes = buf.as_bytes();
        if bytes.len() < HEADER_SIZE {
            return Self { buf, count: 0 };
        }
        // SAFETY: at least HEADER_SIZE bytes are readable; read_unaligned has no alignment requirement.
        let header = unsafe { ptr::read_unaligned(bytes.as_ptr().cast::<TableHeader>()) };

        // Never trust the count beyond what the buffer can hold
        let fits = (bytes.len() - HEADER_SIZE) / ENTRY_SIZE;
        let count = header.number_of_handles.min(fits);
        Self { buf, count }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Records in kernel enumeration order.
    pub fn records(&self) -> impl Iterator<Item = HandleRecord> + '_ {
        let bytes = self.buf.as_bytes();
        (0..self.count).map(move |i| {
            let offset = HEADER_SIZE + i * ENTRY_SIZE;
            // SAFETY: `parse` clamped `count` so every entry lies inside the buffer.
            let entry = unsafe { ptr::read_unaligned(bytes.as_ptr().add(offset).cast::<TableEntry>()) };
            HandleRecord {
                owner_pid: u32::try_from(entry.unique_process_id).unwrap_or(u32::MAX),
                handle_value: entry.handle_value,
                object_type_index: entry.object_type_index,
                access_mask: entry.granted_access,
            }
        })
    }
}

/// Write `records` into `buf` in the `SystemExtendedHandleInformation` layout.
///
/// Behaves like the kernel: if `buf` is too small nothing is written and
/// `STATUS_INFO_LENGTH_MISMATCH` is returned. `return_len` always receives the
/// size needed.
pub fn encode_handle_table(records: &[HandleRecord], buf: &mut [u8], return_len: &mut u32) -> NtStatus {
    let required = HEADER_SIZE + records.len() * ENTRY_SIZE;
    *return_len = u32::try_from(required).unwrap_or(u32::MAX);
    if buf.len() < required {
        return NtStatus::INFO_LENGTH_MISMATCH;
    }

    let header = TableHeader { number_of_handles: records.len(), reserved: 0 };
    // SAFETY: `required` bytes are writable, checked above.
    unsafe {
        ptr::write_unaligned(buf.as_mut_ptr().cast::<TableHeader>(), header);
        for (i, record) in records.iter().enumerate() {
            let entry = TableEntry {
                object: 0,
                unique_process_id: record.owner_pid as usize,
                handle_value: record.handle_value,
                granted_access: record.access_mask,
                creator_back_trace_index: 0,
                object_type_index: record.object_type_index,
                handle_attributes: 0,
                reserved: 0,
            };
            let offset = HEADER_SIZE + i * ENTRY_SIZE;
            ptr::write_unaligned(buf.as_mut_ptr().add(offset).cast::<TableEntry>(), entry);
        }
    }
    NtStatus::SUCCESS
}
