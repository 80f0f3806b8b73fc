//! Volume handle: discovery, metadata block reading with cross-replica
//! fallback, unlock state, and the decrypting read facade (spec §3/§4.8,
//! §5, §6).
//!
//! The sector-buffered read loop is grounded in the teacher's
//! `filesystem.rs::DecryptedReader` (decrypt one sector into a scratch
//! buffer, slice out the requested range); generalized here from a
//! `Read`/`Seek` stream over a single sector index to a `read(offset, len)`
//! facade that can span many sectors and stitch in the relocated volume
//! header (spec §4.7 "Volume-header relocation", §8 scenario S6).

use crate::discovery::{self, Layout};
use crate::error::{BdeError, Result};
use crate::metadata::{self, BlockHeaderFields, MetadataSet, BLOCK_SIZE};
use crate::primitives::{FileTime, Guid};
use crate::sector::SectorCipher;
use crate::unlock::{self, Credential};
use std::io::{Read, Seek, SeekFrom};
use std::sync::Mutex;

/// Consumed backing-device interface (spec §6). `len` supports volume-size
/// clamping and physical-offset validation in `read`.
pub trait BackingReader: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize>;
    fn len(&self) -> std::io::Result<u64>;
}

/// Blanket `BackingReader` for any `Read + Seek` stream, serialized behind a
/// mutex (spec §5 `Exclusive` discipline). Implement `BackingReader`
/// directly on your own type for the `Positional` (pread-style, lock-free)
/// discipline instead.
pub struct ExclusiveReader<R> {
    inner: Mutex<R>,
}

impl<R> ExclusiveReader<R> {
    pub fn new(inner: R) -> Self {
        ExclusiveReader { inner: Mutex::new(inner) }
    }
}

impl<R: Read + Seek + Send> BackingReader for ExclusiveReader<R> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "backing reader mutex poisoned"))?;
        guard.seek(SeekFrom::Start(offset))?;
        guard.read(buf)
    }

    fn len(&self) -> std::io::Result<u64> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "backing reader mutex poisoned"))?;
        let current = guard.stream_position()?;
        let end = guard.seek(SeekFrom::End(0))?;
        guard.seek(SeekFrom::Start(current))?;
        Ok(end)
    }
}

/// Snapshot returned by `locked_info` (spec §6).
#[derive(Debug, Clone)]
pub struct LockedInfo {
    pub version: u16,
    pub identifier: Guid,
    pub encryption_method: u32,
    pub creation_time: FileTime,
    pub volume_size: u64,
}

enum State {
    Locked,
    Unlocked(SectorCipher),
}

/// The opened volume handle (spec §3 "Volume handle"). `open`/`unlock`/
/// `close` take `&mut self`; once unlocked, `read` takes `&self` and is safe
/// to call concurrently from multiple threads provided the backing reader
/// supports concurrent reads (spec §5).
pub struct VolumeHandle<R> {
    reader: R,
    sector_size: u32,
    volume_size: u64,
    metadata: MetadataSet,
    volume_header_offset: u64,
    volume_header_size: u64,
    state: State,
    pending_password: Option<String>,
    pending_recovery: Option<[u32; 8]>,
    pending_external_key: Option<[u8; 32]>,
}

fn credential_kind(credential: &Credential) -> &'static str {
    match credential {
        Credential::Password(_) => "password",
        Credential::RecoveryPassword(_) => "recovery password",
        Credential::ExternalKey(_) => "external key",
    }
}

fn read_exact_at<R: BackingReader>(reader: &R, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read_at(offset + filled as u64, &mut buf[filled..])?;
        if n == 0 {
            return Err(BdeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backing reader returned EOF before buffer was filled",
            )));
        }
        filled += n;
    }
    Ok(())
}

/// Reads and validates one candidate metadata replica (spec §4.2): block
/// header signature/version, the replica's own embedded triplet matching
/// the one discovery found, the 48-byte metadata header, then the entries.
fn try_read_block<R: BackingReader>(
    reader: &R,
    offset: u64,
    expected_triplet: [u64; 3],
) -> Result<(BlockHeaderFields, MetadataSet)> {
    let mut block = vec![0u8; BLOCK_SIZE];
    read_exact_at(reader, offset, &mut block)?;

    let header = metadata::parse_block_header(&block)?;
    if header.triplet != expected_triplet {
        return Err(BdeError::Corrupt("replica's embedded triplet does not match the discovered triplet"));
    }

    let meta_header_buf =
        &block[metadata::BLOCK_HEADER_SIZE..metadata::BLOCK_HEADER_SIZE + metadata::METADATA_HEADER_SIZE];
    let meta_header = metadata::parse_metadata_header(meta_header_buf)?;

    let entries_start = metadata::BLOCK_HEADER_SIZE + metadata::METADATA_HEADER_SIZE;
    let entries_end = metadata::BLOCK_HEADER_SIZE + meta_header.metadata_size as usize;
    if entries_end > block.len() {
        return Err(BdeError::Corrupt("metadata_size extends past the 4096-byte block"));
    }
    let entries_buf = &block[entries_start..entries_end];

    let metadata_set = MetadataSet::parse(&meta_header, entries_buf)?;
    Ok((header, metadata_set))
}

impl<R: BackingReader> VolumeHandle<R> {
    /// Opens a volume: probes the boot sector, back-fills the Vista triplet
    /// from the first metadata block if needed, then reads metadata
    /// replicas in order until one validates (spec §4.1/§4.2).
    pub fn open(reader: R) -> Result<Self> {
        let mut boot_sector = [0u8; 512];
        read_exact_at(&reader, 0, &mut boot_sector)?;
        let discovered = discovery::probe(&boot_sector)?;

        let mut triplet = discovered.triplet;
        if discovered.layout == Layout::Vista {
            let mut first_block = vec![0u8; BLOCK_SIZE];
            read_exact_at(&reader, triplet[0], &mut first_block)?;
            let header = metadata::parse_block_header(&first_block)?;
            triplet = header.triplet;
        }

        let mut last_err = None;
        let mut parsed = None;
        let mut block_header = None;
        for &offset in triplet.iter() {
            match try_read_block(&reader, offset, triplet) {
                Ok((header, metadata_set)) => {
                    block_header = Some(header);
                    parsed = Some(metadata_set);
                    break;
                }
                Err(e) => {
                    log::warn!("metadata replica at offset {offset:#x} failed to validate: {e}");
                    last_err = Some(e);
                }
            }
        }

        let metadata_set =
            parsed.ok_or_else(|| last_err.unwrap_or(BdeError::Corrupt("no metadata replica validated")))?;
        let block_header = block_header.expect("parsed implies block_header was set");

        let (volume_header_offset, volume_header_size) = match metadata_set.volume_header {
            Some(os) => (os.offset, os.size),
            None => (block_header.volume_header_offset, 0),
        };

        // Spec §4.2 step 2: for a v2 header, `volume_size` is the decrypted
        // address space bound, not the physical backing-device length
        // (which includes trailing metadata/padding beyond the plaintext
        // volume). Fall back to the device length only for a v1 header,
        // which carries no `volume_size` field at all.
        let volume_size = if block_header.volume_size > 0 {
            block_header.volume_size
        } else {
            reader.len()?
        };

        Ok(VolumeHandle {
            reader,
            sector_size: discovered.sector_size,
            volume_size,
            metadata: metadata_set,
            volume_header_offset,
            volume_header_size,
            state: State::Locked,
            pending_password: None,
            pending_recovery: None,
            pending_external_key: None,
        })
    }

    pub fn locked_info(&self) -> LockedInfo {
        LockedInfo {
            version: self.metadata.version,
            identifier: self.metadata.volume_identifier,
            encryption_method: self.metadata.encryption_method,
            creation_time: self.metadata.creation_time,
            volume_size: self.volume_size,
        }
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.pending_password = Some(password.into());
    }

    /// Parses the canonical `"NNNNNN-NNNNNN-...-NNNNNN"` (8 groups) form.
    pub fn set_recovery_password(&mut self, ascii_digits: &str) -> Result<()> {
        let groups = crate::keys::parse_recovery_password(ascii_digits)
            .ok_or(BdeError::Corrupt("recovery password is not 8 groups of 6 digits"))?;
        self.pending_recovery = Some(groups);
        Ok(())
    }

    pub fn set_external_key(&mut self, key: [u8; 32]) {
        self.pending_external_key = Some(key);
    }

    /// Runs the unlock orchestrator (spec §4.6) over whichever credentials
    /// were set, trying password, then external key, then recovery, and
    /// surfacing the last error if none authenticate.
    pub fn unlock(&mut self) -> Result<()> {
        let mut candidates = Vec::new();
        if let Some(p) = self.pending_password.take() {
            candidates.push(Credential::Password(p));
        }
        if let Some(k) = self.pending_external_key.take() {
            candidates.push(Credential::ExternalKey(k));
        }
        if let Some(g) = self.pending_recovery.take() {
            candidates.push(Credential::RecoveryPassword(g));
        }
        if candidates.is_empty() {
            return Err(BdeError::NoMatchingProtector);
        }

        let mut last_err = BdeError::NoMatchingProtector;
        for credential in candidates {
            let kind = credential_kind(&credential);
            match unlock::unlock(&self.metadata, &credential) {
                Ok(fvek) => {
                    log::debug!("unlock succeeded with {kind} credential");
                    let cipher = SectorCipher::new(self.metadata.encryption_method, &fvek)?;
                    self.state = State::Unlocked(cipher);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("{kind} credential did not unlock the volume: {e}");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Reverts to the locked state. Dropping the previous `SectorCipher`
    /// zeroizes the FVEK/tweak key (spec §4.9).
    pub fn close(&mut self) {
        self.state = State::Locked;
        self.pending_password = None;
        self.pending_recovery = None;
        self.pending_external_key = None;
    }

    /// Maps a logical byte offset to its physical location on the backing
    /// device, applying volume-header relocation (spec §4.7) when the
    /// offset falls inside `[0, volume_header_size)`.
    fn physical_offset(&self, logical_offset: u64) -> u64 {
        if self.volume_header_size > 0 && logical_offset < self.volume_header_size {
            self.volume_header_offset + logical_offset
        } else {
            logical_offset
        }
    }

    /// `read(offset, len)` (spec §4.8/§8 boundary behaviors): reads are
    /// clamped to `[0, volume_size)`, a straddling read is truncated, and a
    /// read before unlock fails with `Locked`.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let cipher = match &self.state {
            State::Unlocked(c) => c,
            State::Locked => return Err(BdeError::Locked),
        };

        if offset >= self.volume_size || len == 0 {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(len as u64).min(self.volume_size);
        let mut out = Vec::with_capacity((end - offset) as usize);

        let sector_size = self.sector_size as u64;
        let mut logical = offset;
        let mut scratch = vec![0u8; self.sector_size as usize];
        while logical < end {
            let sector_index = logical / sector_size;
            let sector_logical_start = sector_index * sector_size;
            let physical_start = self.physical_offset(sector_logical_start);

            read_exact_at(&self.reader, physical_start, &mut scratch)?;
            cipher.decrypt_sector(sector_index, &mut scratch)?;

            let offset_in_sector = (logical - sector_logical_start) as usize;
            let want_from_sector = (end - logical).min(sector_size - offset_in_sector as u64) as usize;
            out.extend_from_slice(&scratch[offset_in_sector..offset_in_sector + want_from_sector]);
            logical += want_from_sector as u64;
        }

        Ok(out)
    }
}
