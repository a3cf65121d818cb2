//! `OBJECT_NAME_INFORMATION` buffers.
//!
//! The kernel writes a `UNICODE_STRING` header whose `Buffer` points back into
//! the same allocation, directly after the header.

use std::mem;
use std::ptr;

use crate::system::buffer::AlignedBuf;
use crate::system::kernel::NtStatus;

#[repr(C)]
#[derive(Clone, Copy)]
struct UnicodeString {
    length: u16,
    maximum_length: u16,
    buffer: usize,
}

const HEADER_SIZE: usize = mem::size_of::<UnicodeString>();

/// First guess for a name: room for `MAX_PATH` wide characters plus a terminator.
pub const NAME_BUFFER_HINT: usize = (260 + 1) * 2;

/// Smallest buffer worth offering: the header plus a short name.
pub const MIN_NAME_BUFFER: usize = 64;

/// Lengths are 16-bit, so no valid answer needs more than this.
pub const MAX_NAME_BUFFER: usize = HEADER_SIZE + u16::MAX as usize + 1;

pub struct NameBuffer {
    buf: AlignedBuf,
}

impl NameBuffer {
    pub fn try_new(size: usize) -> Option<Self> {
        AlignedBuf::try_alloc(size).map(|buf| Self { buf })
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_bytes_mut()
    }

    /// Read the name the kernel wrote. `None` if the header is malformed or
    /// points outside the buffer; an empty string for unnamed objects.
    pub fn decode(&self) -> Option<String> {
        let bytes = self.buf.as_bytes();
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        // SAFETY: HEADER_SIZE bytes are readable.
        let header = unsafe { ptr::read_unaligned(bytes.as_ptr().cast::<UnicodeString>()) };
        let length = header.length as usize;
        if length == 0 {
            return Some(String::new());
        }

        let offset = header.buffer.checked_sub(bytes.as_ptr() as usize)?;
        let end = offset.checked_add(length)?;
        let chars = bytes.get(offset..end)?;
        let units: Vec<u16> = chars
            .chunks_exact(2)
            .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
            .collect();
        Some(String::from_utf16_lossy(&units))
    }
}

/// Write `name` into `buf` the way `NtQueryObject(ObjectNameInformation)` does.
pub fn encode_object_name(name: &str, buf: &mut [u8], return_len: &mut u32) -> NtStatus {
    let units: Vec<u16> = name.encode_utf16().collect();
    // `maximum_length` covers the terminator and must stay even
    let length = (units.len() * 2).min((u16::MAX as usize - 2) & !1);
    let required = HEADER_SIZE + length + 2;
    *return_len = required as u32;
    if buf.len() < required {
        return NtStatus::INFO_LENGTH_MISMATCH;
    }

    let header = UnicodeString {
        length: length as u16,
        maximum_length: (length + 2) as u16,
        buffer: buf.as_ptr() as usize + HEADER_SIZE,
    };
    // SAFETY: `required` bytes are writable, checked above.
    unsafe { ptr::write_unaligned(buf.as_mut_ptr().cast::<UnicodeString>(), header) };

    let chars = &mut buf[HEADER_SIZE..required];
    let kept = units.iter().take(length / 2);
    for (slot, unit) in chars.chunks_exact_mut(2).zip(kept.chain(std::iter::once(&0))) {
        slot.copy_from_slice(&unit.to_ne_bytes());
    }
    NtStatus::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_then_decode() {
        let mut name = NameBuffer::try_new(NAME_BUFFER_HINT).unwrap();
        let mut needed = 0;
        let path = r"\Device\HarddiskVolume1\Users\Ünïcode\file.txt";
        let status = encode_object_name(path, name.as_bytes_mut(), &mut needed);
        assert_eq!(status, NtStatus::SUCCESS);
        assert_eq!(name.decode().as_deref(), Some(path));
    }

    #[test]
    fn test_too_small_reports_required_size() {
        let mut name = NameBuffer::try_new(HEADER_SIZE + 4).unwrap();
        let mut needed = 0;
        let status = encode_object_name(r"\Device\Afd", name.as_bytes_mut(), &mut needed);
        assert_eq!(status, NtStatus::INFO_LENGTH_MISMATCH);
        assert_eq!(needed as usize, HEADER_SIZE + 11 * 2 + 2);
    }

    #[test]
    fn test_longest_name_keeps_valid_lengths() {
        let mut name = NameBuffer::try_new(MAX_NAME_BUFFER).unwrap();
        let mut needed = 0;
        let path = "a".repeat(32_767);
        let status = encode_object_name(&path, name.as_bytes_mut(), &mut needed);
        assert_eq!(status, NtStatus::SUCCESS);

        let header = unsafe { ptr::read_unaligned(name.as_bytes_mut().as_ptr().cast::<UnicodeString>()) };
        assert_eq!(header.length, 65_532);
        assert_eq!(header.maximum_length, 65_534);
        assert_eq!(needed as usize, HEADER_SIZE + 65_534);
        assert_eq!(name.decode().map(|n| n.len()), Some(32_766));
    }

    #[test]
    fn test_unnamed_object() {
        let name = NameBuffer::try_new(NAME_BUFFER_HINT).unwrap();
        assert_eq!(name.decode().as_deref(), Some(""));
    }

    #[test]
    fn test_pointer_outside_buffer_is_rejected() {
        let mut name = NameBuffer::try_new(64).unwrap();
        let header = UnicodeString { length: 8, maximum_length: 10, buffer: 0x10 };
        unsafe { ptr::write_unaligned(name.as_bytes_mut().as_mut_ptr().cast::<UnicodeString>(), header) };
        assert_eq!(name.decode(), None);
    }
}
