//! Little-endian integer, GUID and FILETIME decode helpers shared by the
//! block header and entry decoders.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// A little-endian-encoded 16-byte Windows GUID, displayed in the canonical
/// `{8-4-4-4-12}` hex form (libfguid's `_copy_to_utf8_string` convention).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guid(pub [u8; 16]);

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[3], b[2], b[1], b[0],
            b[5], b[4],
            b[7], b[6],
            b[8], b[9],
            b[10], b[11], b[12], b[13], b[14], b[15],
        )
    }
}

/// A Windows FILETIME: 100ns ticks since 1601-01-01 00:00:00 UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTime(pub u64);

const FILETIME_TO_UNIX_EPOCH_TICKS: u64 = 116_444_736_000_000_000;

impl FileTime {
    /// Seconds since the Unix epoch, saturating to 0 for timestamps that
    /// predate 1970 (which a well-formed BitLocker volume never produces).
    pub fn to_unix_secs(self) -> u64 {
        self.0
            .saturating_sub(FILETIME_TO_UNIX_EPOCH_TICKS)
            .checked_div(10_000_000)
            .unwrap_or(0)
    }
}

pub fn read_guid(buf: &[u8]) -> Guid {
    let mut g = [0u8; 16];
    g.copy_from_slice(&buf[0..16]);
    Guid(g)
}

pub fn read_filetime(buf: &[u8]) -> FileTime {
    FileTime(LittleEndian::read_u64(&buf[0..8]))
}
