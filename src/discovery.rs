//! Signature probe over the first sector of a backing volume.
//!
//! Grounded in `libbde_metadata_read`'s signature check (the `"-FVE-FS-"`
//! byte string compared at the top of `libbde_metadata_read` in
//! `libbde_metadata.c`); the boot-sector layout that locates the first
//! metadata offset is not present in the retrieved `original_source` and is
//! filled in here per the conventions spec.md §4.1/§6 describe (see
//! DESIGN.md for the exact field offsets chosen).

use crate::error::{BdeError, Result};
use byteorder::{ByteOrder, LittleEndian};

pub const FVE_SIGNATURE: &[u8; 8] = b"-FVE-FS-";

/// Which of the three on-disk boot-sector conventions was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Windows Vista: only the first metadata offset is in the boot sector;
    /// the other two are back-filled from the first metadata block.
    Vista,
    /// Windows 7 and later: all three offsets are in the boot sector.
    Seven,
    /// BitLocker To Go (removable media): same encoding as `Seven`,
    /// distinguished only by the OEM/layout marker byte.
    ToGo,
}

#[derive(Debug, Clone, Copy)]
pub struct Discovery {
    pub layout: Layout,
    pub triplet: [u64; 3],
    pub sector_size: u32,
}

const LAYOUT_MARKER_OFFSET: usize = 0x1a8;
const TRIPLET_OFFSET: usize = 0x1b0;
const SECTOR_SIZE_OFFSET: usize = 0x0b;

/// Probes a 512-byte boot sector and returns the discovered layout and
/// metadata triplet. For `Vista`, `triplet[1]` and `triplet[2]` are `0` and
/// must be back-filled by the caller from the first metadata block (spec
/// §4.1: "the only layout where later blocks inform earlier offsets").
pub fn probe(boot_sector: &[u8]) -> Result<Discovery> {
    if boot_sector.len() < 512 {
        return Err(BdeError::Corrupt("boot sector shorter than 512 bytes"));
    }
    if &boot_sector[3..11] != FVE_SIGNATURE {
        return Err(BdeError::BadSignature);
    }

    let sector_size = LittleEndian::read_u16(&boot_sector[SECTOR_SIZE_OFFSET..SECTOR_SIZE_OFFSET + 2]) as u32;
    let sector_size = if sector_size == 0 { 512 } else { sector_size };

    let layout_marker = boot_sector[LAYOUT_MARKER_OFFSET];
    let (layout, triplet) = match layout_marker {
        0x00 => {
            let first = LittleEndian::read_u64(&boot_sector[TRIPLET_OFFSET..TRIPLET_OFFSET + 8]);
            (Layout::Vista, [first, 0, 0])
        }
        0x01 | 0x02 => {
            let first = LittleEndian::read_u64(&boot_sector[TRIPLET_OFFSET..TRIPLET_OFFSET + 8]);
            let second = LittleEndian::read_u64(&boot_sector[TRIPLET_OFFSET + 8..TRIPLET_OFFSET + 16]);
            let third = LittleEndian::read_u64(&boot_sector[TRIPLET_OFFSET + 16..TRIPLET_OFFSET + 24]);
            let layout = if layout_marker == 0x01 { Layout::Seven } else { Layout::ToGo };
            (layout, [first, second, third])
        }
        _ => return Err(BdeError::UnsupportedVersion),
    };

    log::debug!("boot sector probe: layout={layout:?} triplet={triplet:?} sector_size={sector_size}");
    Ok(Discovery { layout, triplet, sector_size })
}
