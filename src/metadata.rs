//! FVE metadata block reader and TLV entry decoder.
//!
//! Grounded directly in `libbde_metadata_read` (`libbde_metadata.c`): the
//! signature check, version dispatch (v1 `mft_mirror_cluster_block` vs v2
//! `volume_header_offset`), the 48-byte metadata header layout, and the
//! entry-type dispatch (`0x0002` VMK, `0x0003` FVEK, `0x0007` description,
//! `0x000f` volume header block, `0x000b` reserved/unconsumed) all follow
//! that function's validation order. Exact byte offsets inside the 64-byte
//! block header are an implementation choice documented in DESIGN.md (the
//! retrieved `original_source` does not include the struct layout, only the
//! field-access logic).

use crate::error::{BdeError, Result};
use crate::primitives::{read_filetime, read_guid, FileTime, Guid};
use byteorder::{ByteOrder, LittleEndian};

pub const BLOCK_SIZE: usize = 4096;
pub const BLOCK_HEADER_SIZE: usize = 64;
pub const METADATA_HEADER_SIZE: usize = 48;

const ENTRY_TYPE_VOLUME_MASTER_KEY: u16 = 0x0002;
const ENTRY_TYPE_FULL_VOLUME_ENCRYPTION_KEY: u16 = 0x0003;
const ENTRY_TYPE_DESCRIPTION: u16 = 0x0007;
const ENTRY_TYPE_VOLUME_HEADER_BLOCK: u16 = 0x000f;
const ENTRY_TYPE_SECONDARY_FVEK: u16 = 0x000b;

const VALUE_TYPE_ERASED: u16 = 0x0000;
const VALUE_TYPE_KEY: u16 = 0x0001;
const VALUE_TYPE_UNICODE_STRING: u16 = 0x0002;
const VALUE_TYPE_STRETCH_KEY: u16 = 0x0003;
const VALUE_TYPE_USE_KEY: u16 = 0x0004;
const VALUE_TYPE_AES_CCM_ENCRYPTED_KEY: u16 = 0x0005;
const VALUE_TYPE_TPM_ENCODED_KEY: u16 = 0x0006;
const VALUE_TYPE_VALIDATION: u16 = 0x0007;
const VALUE_TYPE_VOLUME_MASTER_KEY: u16 = 0x0008;
const VALUE_TYPE_EXTERNAL_KEY: u16 = 0x0009;
const VALUE_TYPE_UPDATE: u16 = 0x000a;
const VALUE_TYPE_ERROR_LOG: u16 = 0x000b;
const VALUE_TYPE_OFFSET_AND_SIZE: u16 = 0x000f;

/// Windows protector type recognized on a VMK entry (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionType {
    ClearKey,
    Tpm,
    StartupKey,
    TpmAndPin,
    RecoveryKey,
    Password,
    Unknown(u16),
}

impl From<u16> for ProtectionType {
    fn from(v: u16) -> Self {
        match v {
            0x0000 => ProtectionType::ClearKey,
            0x0100 => ProtectionType::Tpm,
            0x0200 => ProtectionType::StartupKey,
            0x0500 => ProtectionType::TpmAndPin,
            0x0800 => ProtectionType::RecoveryKey,
            0x2000 => ProtectionType::Password,
            other => ProtectionType::Unknown(other),
        }
    }
}

/// `{nonce[12], mac[16], ciphertext}` — total length must be >= 28.
#[derive(Debug, Clone)]
pub struct AesCcmEnvelope {
    pub nonce: [u8; 12],
    pub mac: [u8; 16],
    pub ciphertext: Vec<u8>,
}

impl AesCcmEnvelope {
    fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 28 {
            return Err(BdeError::Corrupt("AES-CCM envelope shorter than 28 bytes"));
        }
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&payload[0..12]);
        let mut mac = [0u8; 16];
        mac.copy_from_slice(&payload[12..28]);
        Ok(AesCcmEnvelope {
            nonce,
            mac,
            ciphertext: payload[28..].to_vec(),
        })
    }
}

/// `{encryption_method, salt, encrypted_inner}` (spec §3).
#[derive(Debug, Clone)]
pub struct StretchKeyRecord {
    pub encryption_method: u32,
    pub salt: [u8; 16],
    pub encrypted_inner: AesCcmEnvelope,
}

impl StretchKeyRecord {
    fn parse(payload: &[u8], depth: u8) -> Result<Self> {
        if payload.len() < 20 {
            return Err(BdeError::Corrupt("stretch key record shorter than 20 bytes"));
        }
        let encryption_method = LittleEndian::read_u32(&payload[0..4]);
        let mut salt = [0u8; 16];
        salt.copy_from_slice(&payload[4..20]);

        let nested = decode_entries(&payload[20..], depth + 1)?;
        let encrypted_inner = nested
            .into_iter()
            .find_map(|e| match e.value {
                EntryValue::AesCcmEncryptedKey(env) => Some(env),
                _ => None,
            })
            .ok_or(BdeError::Corrupt("stretch key record missing AES-CCM envelope"))?;

        Ok(StretchKeyRecord {
            encryption_method,
            salt,
            encrypted_inner,
        })
    }
}

/// A two-offset `OFFSET_AND_SIZE` value: `(offset, size)`.
#[derive(Debug, Clone, Copy)]
pub struct OffsetAndSize {
    pub offset: u64,
    pub size: u64,
}

/// One decoded Volume Master Key record (spec §3).
#[derive(Debug, Clone)]
pub struct Vmk {
    pub identifier: Guid,
    pub last_modified: FileTime,
    pub protection_type: ProtectionType,
    pub stretch_key: Option<StretchKeyRecord>,
    pub aes_ccm_encrypted_key: Option<AesCcmEnvelope>,
    /// Supplemented from a sibling `DESCRIPTION` entry (see SPEC_FULL.md §3).
    pub description: Option<String>,
}

impl Vmk {
    fn parse(payload: &[u8], depth: u8) -> Result<Self> {
        if payload.len() < 28 {
            return Err(BdeError::Corrupt("VMK entry shorter than 28 bytes"));
        }
        let identifier = read_guid(&payload[0..16]);
        let last_modified = read_filetime(&payload[16..24]);
        let protection_type = ProtectionType::from(LittleEndian::read_u16(&payload[26..28]));

        let nested = decode_entries(&payload[28..], depth + 1)?;
        let mut stretch_key = None;
        let mut aes_ccm_encrypted_key = None;
        for e in nested {
            match e.value {
                EntryValue::StretchKey(sk) => stretch_key = Some(sk),
                EntryValue::AesCcmEncryptedKey(env) => aes_ccm_encrypted_key = Some(env),
                _ => {}
            }
        }

        Ok(Vmk {
            identifier,
            last_modified,
            protection_type,
            stretch_key,
            aes_ccm_encrypted_key,
            description: None,
        })
    }
}

/// The typed payload of one metadata entry (spec §3/§4.3).
#[derive(Debug, Clone)]
pub enum EntryValue {
    Erased,
    Key(Vec<u8>),
    UnicodeString(Vec<u8>),
    StretchKey(StretchKeyRecord),
    UseKey(Vec<u8>),
    AesCcmEncryptedKey(AesCcmEnvelope),
    TpmEncodedKey(Vec<u8>),
    Validation(Vec<u8>),
    VolumeMasterKey(Box<Vmk>),
    ExternalKey(Vec<u8>),
    Update(Vec<u8>),
    ErrorLog(Vec<u8>),
    OffsetAndSize(OffsetAndSize),
    /// Unknown value type: preserved verbatim, never projected.
    Opaque(Vec<u8>),
}

/// One TLV metadata entry, including its framing fields (SPEC_FULL.md §4.3:
/// `raw_type`/`version` are kept even for entries that don't become a typed
/// projection).
#[derive(Debug, Clone)]
pub struct MetadataEntry {
    pub raw_type: u16,
    pub value_type: u16,
    pub version: u16,
    pub value: EntryValue,
}

fn decode_entry_value(value_type: u16, payload: &[u8], depth: u8) -> Result<EntryValue> {
    Ok(match value_type {
        VALUE_TYPE_ERASED => EntryValue::Erased,
        VALUE_TYPE_KEY => EntryValue::Key(payload.to_vec()),
        VALUE_TYPE_UNICODE_STRING => EntryValue::UnicodeString(payload.to_vec()),
        VALUE_TYPE_STRETCH_KEY => EntryValue::StretchKey(StretchKeyRecord::parse(payload, depth)?),
        VALUE_TYPE_USE_KEY => EntryValue::UseKey(payload.to_vec()),
        VALUE_TYPE_AES_CCM_ENCRYPTED_KEY => EntryValue::AesCcmEncryptedKey(AesCcmEnvelope::parse(payload)?),
        VALUE_TYPE_TPM_ENCODED_KEY => EntryValue::TpmEncodedKey(payload.to_vec()),
        VALUE_TYPE_VALIDATION => EntryValue::Validation(payload.to_vec()),
        VALUE_TYPE_VOLUME_MASTER_KEY => EntryValue::VolumeMasterKey(Box::new(Vmk::parse(payload, depth)?)),
        VALUE_TYPE_EXTERNAL_KEY => EntryValue::ExternalKey(payload.to_vec()),
        VALUE_TYPE_UPDATE => EntryValue::Update(payload.to_vec()),
        VALUE_TYPE_ERROR_LOG => EntryValue::ErrorLog(payload.to_vec()),
        VALUE_TYPE_OFFSET_AND_SIZE => {
            if payload.len() < 16 {
                return Err(BdeError::Corrupt("OFFSET_AND_SIZE shorter than 16 bytes"));
            }
            EntryValue::OffsetAndSize(OffsetAndSize {
                offset: LittleEndian::read_u64(&payload[0..8]),
                size: LittleEndian::read_u64(&payload[8..16]),
            })
        }
        _ => EntryValue::Opaque(payload.to_vec()),
    })
}

/// Decodes a flat concatenation of TLV entries (spec §4.3). `depth` bounds
/// recursion the same way the outer entry's `entry_size` bounds the slice —
/// nesting in this format is at most two levels (VMK -> stretch key ->
/// AES-CCM envelope), so depth 2 is already generous headroom.
fn decode_entries(mut buf: &[u8], depth: u8) -> Result<Vec<MetadataEntry>> {
    if depth > 4 {
        return Err(BdeError::Corrupt("entry nesting exceeded bound"));
    }
    let mut entries = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 8 {
            return Err(BdeError::Corrupt("truncated entry header"));
        }
        let entry_size = LittleEndian::read_u16(&buf[0..2]) as usize;
        let entry_type = LittleEndian::read_u16(&buf[2..4]);
        let value_type = LittleEndian::read_u16(&buf[4..6]);
        let version = LittleEndian::read_u16(&buf[6..8]);

        if entry_size < 8 || entry_size > buf.len() {
            return Err(BdeError::Corrupt("entry_size out of bounds"));
        }
        let payload = &buf[8..entry_size];
        let value = decode_entry_value(value_type, payload, depth)?;

        entries.push(MetadataEntry {
            raw_type: entry_type,
            value_type,
            version,
            value,
        });

        buf = &buf[entry_size..];
    }
    Ok(entries)
}

/// Parsed result of one FVE metadata block (spec §3).
#[derive(Debug, Clone)]
pub struct MetadataSet {
    pub version: u16,
    pub metadata_size: u32,
    pub header_size: u32,
    pub volume_identifier: Guid,
    pub next_nonce_counter: u32,
    pub encryption_method: u32,
    pub creation_time: FileTime,
    pub entries: Vec<MetadataEntry>,

    pub disk_password_vmk: Option<Vmk>,
    pub external_key_vmk: Option<Vmk>,
    pub fvek_envelope: Option<AesCcmEnvelope>,
    /// Entry type `0x000b`: recognized but reserved (SPEC_FULL.md §3).
    pub secondary_fvek: Option<AesCcmEnvelope>,
    pub volume_header: Option<OffsetAndSize>,
}

fn find_description(entries: &[MetadataEntry], before_index: usize) -> Option<String> {
    entries[..before_index].iter().rev().find_map(|e| {
        if e.raw_type != ENTRY_TYPE_DESCRIPTION {
            return None;
        }
        match &e.value {
            EntryValue::UnicodeString(bytes) => decode_utf16le(bytes),
            _ => None,
        }
    })
}

fn decode_utf16le(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| LittleEndian::read_u16(c))
        .collect();
    String::from_utf16(&units).ok()
}

impl MetadataSet {
    /// Parses the `metadata_size - 48` byte payload that follows the 64-byte
    /// block header and 48-byte metadata header.
    pub fn parse(header: &MetadataHeaderFields, entries_buf: &[u8]) -> Result<Self> {
        let entries = decode_entries(entries_buf, 0)?;

        let mut disk_password_vmk = None;
        let mut external_key_vmk = None;
        let mut fvek_envelope = None;
        let mut secondary_fvek = None;
        let mut volume_header = None;

        for (idx, entry) in entries.iter().enumerate() {
            match (entry.raw_type, &entry.value) {
                (ENTRY_TYPE_VOLUME_MASTER_KEY, EntryValue::VolumeMasterKey(vmk)) => {
                    let mut vmk = (**vmk).clone();
                    vmk.description = find_description(&entries, idx);
                    match vmk.protection_type {
                        ProtectionType::RecoveryKey => disk_password_vmk = Some(vmk),
                        ProtectionType::Password | ProtectionType::StartupKey => external_key_vmk = Some(vmk),
                        _ => {}
                    }
                }
                (ENTRY_TYPE_FULL_VOLUME_ENCRYPTION_KEY, EntryValue::AesCcmEncryptedKey(env)) => {
                    fvek_envelope = Some(env.clone());
                }
                (ENTRY_TYPE_SECONDARY_FVEK, EntryValue::AesCcmEncryptedKey(env)) => {
                    secondary_fvek = Some(env.clone());
                }
                (ENTRY_TYPE_VOLUME_HEADER_BLOCK, EntryValue::OffsetAndSize(os)) => {
                    volume_header = Some(*os);
                }
                _ => {}
            }
        }

        Ok(MetadataSet {
            version: header.version,
            metadata_size: header.metadata_size,
            header_size: header.header_size,
            volume_identifier: header.volume_identifier,
            next_nonce_counter: header.next_nonce_counter,
            encryption_method: header.encryption_method,
            creation_time: header.creation_time,
            entries,
            disk_password_vmk,
            external_key_vmk,
            fvek_envelope,
            secondary_fvek,
            volume_header,
        })
    }
}

/// The 48-byte metadata header, laid out exactly as spec §6 specifies.
#[derive(Debug, Clone)]
pub struct MetadataHeaderFields {
    pub metadata_size: u32,
    pub version: u16,
    pub header_size: u32,
    pub metadata_size_copy: u32,
    pub volume_identifier: Guid,
    pub next_nonce_counter: u32,
    pub encryption_method: u32,
    pub creation_time: FileTime,
}

pub fn parse_metadata_header(buf: &[u8]) -> Result<MetadataHeaderFields> {
    if buf.len() < METADATA_HEADER_SIZE {
        return Err(BdeError::Corrupt("metadata header shorter than 48 bytes"));
    }
    let metadata_size = LittleEndian::read_u32(&buf[0..4]);
    let version = LittleEndian::read_u32(&buf[4..8]);
    let header_size = LittleEndian::read_u32(&buf[8..12]);
    let metadata_size_copy = LittleEndian::read_u32(&buf[12..16]);
    let volume_identifier = read_guid(&buf[16..32]);
    let next_nonce_counter = LittleEndian::read_u32(&buf[32..36]);
    let encryption_method = LittleEndian::read_u32(&buf[36..40]);
    let creation_time = read_filetime(&buf[40..48]);

    if metadata_size != metadata_size_copy {
        return Err(BdeError::Corrupt("metadata_size != metadata_size_copy"));
    }
    if !(METADATA_HEADER_SIZE as u32..=(BLOCK_SIZE - BLOCK_HEADER_SIZE) as u32).contains(&metadata_size) {
        return Err(BdeError::Corrupt("metadata_size out of bounds"));
    }
    if version != 1 {
        return Err(BdeError::UnsupportedVersion);
    }

    Ok(MetadataHeaderFields {
        metadata_size,
        version: version as u16,
        header_size,
        metadata_size_copy,
        volume_identifier,
        next_nonce_counter,
        encryption_method,
        creation_time,
    })
}

/// The fixed fields read out of the 64-byte block header (spec §4.2/§6).
/// `volume_header_offset` and `volume_size` are v2-only and `0` for a v1
/// header; `mft_mirror_cluster_block_number` is v1-only and `0` for v2
/// (spec §4.2 step 2: "for v1 capture `mft_mirror_cluster_block`, for v2
/// capture `volume_size` and `volume_header_offset`").
#[derive(Debug, Clone, Copy)]
pub struct BlockHeaderFields {
    pub version: u16,
    pub triplet: [u64; 3],
    pub mft_mirror_cluster_block_number: u64,
    pub volume_header_offset: u64,
    pub volume_size: u64,
}

const OFF_VERSION: usize = 10;
const OFF_TRIPLET: usize = 24;
const OFF_V1_MFT_MIRROR: usize = 48;
const OFF_V2_VOLUME_HEADER_OFFSET: usize = 48;
const OFF_V2_VOLUME_SIZE: usize = 56;

/// Validates and parses the 64-byte block header at the start of a
/// candidate 4096-byte metadata block (spec §4.2, steps 1-2).
pub fn parse_block_header(block: &[u8]) -> Result<BlockHeaderFields> {
    if block.len() < BLOCK_HEADER_SIZE {
        return Err(BdeError::Corrupt("metadata block shorter than 64 bytes"));
    }
    if &block[0..8] != crate::discovery::FVE_SIGNATURE {
        return Err(BdeError::BadSignature);
    }
    let version = LittleEndian::read_u16(&block[OFF_VERSION..OFF_VERSION + 2]);
    if version != 1 && version != 2 {
        return Err(BdeError::UnsupportedVersion);
    }

    let mut triplet = [0u64; 3];
    for (i, slot) in triplet.iter_mut().enumerate() {
        let start = OFF_TRIPLET + i * 8;
        *slot = LittleEndian::read_u64(&block[start..start + 8]);
    }

    let (mft_mirror_cluster_block_number, volume_header_offset, volume_size) = if version == 1 {
        (
            LittleEndian::read_u64(&block[OFF_V1_MFT_MIRROR..OFF_V1_MFT_MIRROR + 8]),
            0,
            0,
        )
    } else {
        (
            0,
            LittleEndian::read_u64(&block[OFF_V2_VOLUME_HEADER_OFFSET..OFF_V2_VOLUME_HEADER_OFFSET + 8]),
            LittleEndian::read_u64(&block[OFF_V2_VOLUME_SIZE..OFF_V2_VOLUME_SIZE + 8]),
        )
    };

    Ok(BlockHeaderFields {
        version,
        triplet,
        mft_mirror_cluster_block_number,
        volume_header_offset,
        volume_size,
    })
}
