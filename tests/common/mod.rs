//! Synthetic FVE volume builder shared by the integration tests.
//!
//! There is no publicly available BitLocker test corpus in this
//! environment, so fixtures are built by hand, re-deriving keys and
//! sealing AES-CCM envelopes with the same normative algorithms
//! (SPEC_FULL.md §4.4/§4.5/§4.7) the library itself implements, the same
//! way a from-scratch crypto test suite builds its own vectors absent a
//! published reference set.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use byteorder::{ByteOrder, LittleEndian};
use cbc::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};
use ccm::aead::Aead;
use ccm::{
    consts::{U12, U16},
    Ccm,
};
use bitlocker_rs::BackingReader;
use sha2::{Digest, Sha256};
use xts_mode::Xts128;

/// A plain in-memory backing reader (the `Positional` discipline from spec
/// §5 — no locking needed since `&[u8]` reads are already safe to share).
pub struct MemReader(pub Vec<u8>);

impl BackingReader for MemReader {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let start = offset as usize;
        if start >= self.0.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.0.len() - start);
        buf[..n].copy_from_slice(&self.0[start..start + n]);
        Ok(n)
    }

    fn len(&self) -> std::io::Result<u64> {
        Ok(self.0.len() as u64)
    }
}

pub const SECTOR_SIZE: u64 = 512;
pub const BLOCK_SIZE: usize = 4096;

const ENTRY_TYPE_VOLUME_MASTER_KEY: u16 = 0x0002;
const ENTRY_TYPE_FULL_VOLUME_ENCRYPTION_KEY: u16 = 0x0003;
const ENTRY_TYPE_VOLUME_HEADER_BLOCK: u16 = 0x000f;
const VALUE_TYPE_VOLUME_MASTER_KEY: u16 = 0x0008;
const VALUE_TYPE_STRETCH_KEY: u16 = 0x0003;
const VALUE_TYPE_AES_CCM_ENCRYPTED_KEY: u16 = 0x0005;
const VALUE_TYPE_OFFSET_AND_SIZE: u16 = 0x000f;

pub const PROTECTION_TYPE_PASSWORD: u16 = 0x2000;
pub const PROTECTION_TYPE_RECOVERY_KEY: u16 = 0x0800;

type Aes128Ccm = Ccm<Aes128, U16, U12>;

/// Re-derives the password stretch key exactly as SPEC_FULL.md §4.4 (and
/// `src/keys.rs`) specify, so fixtures sealed here are openable by the
/// library's own unlock pipeline.
pub fn derive_from_password(password: &str, salt: [u8; 16]) -> [u8; 32] {
    let mut utf16le = Vec::with_capacity(password.len() * 2);
    for unit in password.encode_utf16() {
        utf16le.extend_from_slice(&unit.to_le_bytes());
    }
    let first = Sha256::digest(&utf16le);
    let h0: [u8; 32] = Sha256::digest(first).into();
    stretch(h0, salt)
}

/// Re-derives the recovery-password stretch key exactly as SPEC_FULL.md
/// §4.4 (and `src/keys.rs::derive_from_recovery_password`) specify: each
/// group must be a multiple of 11 with `group / 11 <= 0xFFFF`, packed as
/// little-endian `u16`s into a 16-byte buffer before the double-SHA256 seed.
pub fn derive_from_recovery_password(groups: &[u32; 8], salt: [u8; 16]) -> [u8; 32] {
    let mut packed = [0u8; 16];
    for (i, &g) in groups.iter().enumerate() {
        assert_eq!(g % 11, 0, "recovery group {i} must be a multiple of 11");
        let divided: u16 = (g / 11).try_into().expect("recovery group divided by 11 must fit in u16");
        packed[i * 2..i * 2 + 2].copy_from_slice(&divided.to_le_bytes());
    }
    let first = Sha256::digest(packed);
    let h0: [u8; 32] = Sha256::digest(first).into();
    stretch(h0, salt)
}

fn stretch(initial_hash: [u8; 32], salt: [u8; 16]) -> [u8; 32] {
    let mut last = [0u8; 32];
    let mut hash_count: u64 = 0;
    let mut buf = [0u8; 88];
    buf[32..64].copy_from_slice(&initial_hash);
    buf[64..80].copy_from_slice(&salt);
    for _ in 0..(1u64 << 20) {
        buf[0..32].copy_from_slice(&last);
        buf[80..88].copy_from_slice(&hash_count.to_le_bytes());
        let digest = Sha256::digest(buf);
        last.copy_from_slice(&digest);
        hash_count += 1;
    }
    last
}

/// Seals `plaintext` under AES-128-CCM, returning `(ciphertext, mac)` split
/// from the aead crate's ciphertext||tag convention (mirrors
/// `src/ccm.rs::decrypt`'s un-splitting).
pub fn seal_ccm(key: &[u8; 32], nonce: [u8; 12], plaintext: &[u8]) -> (Vec<u8>, [u8; 16]) {
    // AES-CCM keys in this format are 16 or 32 bytes; fixtures here always
    // use the 32-byte stretch/VMK keys directly, truncated to 16 for the
    // AES-128 variant used by the inner FVEK/stretch wraps in these tests.
    let cipher = Aes128Ccm::new(GenericArray::from_slice(&key[0..16]));
    let sealed = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .expect("CCM seal should not fail for well-formed fixture input");
    let split = sealed.len() - 16;
    let mut mac = [0u8; 16];
    mac.copy_from_slice(&sealed[split..]);
    (sealed[..split].to_vec(), mac)
}

/// Builds an "unwrapped key block" plaintext (spec §3): `data_size`@[16..18],
/// inner `version=1`@[20..22], key material at [28..].
pub fn unwrapped_block(data_size: u16, key_material: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; (28 + key_material.len()).max(60)];
    LittleEndian::write_u16(&mut buf[16..18], data_size);
    LittleEndian::write_u16(&mut buf[20..22], 1);
    buf[28..28 + key_material.len()].copy_from_slice(key_material);
    buf
}

fn entry(entry_type: u16, value_type: u16, payload: &[u8]) -> Vec<u8> {
    let entry_size = (8 + payload.len()) as u16;
    let mut buf = vec![0u8; 8];
    LittleEndian::write_u16(&mut buf[0..2], entry_size);
    LittleEndian::write_u16(&mut buf[2..4], entry_type);
    LittleEndian::write_u16(&mut buf[4..6], value_type);
    LittleEndian::write_u16(&mut buf[6..8], 1);
    buf.extend_from_slice(payload);
    buf
}

fn aes_ccm_entry(entry_type: u16, nonce: [u8; 12], mac: [u8; 16], ciphertext: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(28 + ciphertext.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&mac);
    payload.extend_from_slice(ciphertext);
    entry(entry_type, VALUE_TYPE_AES_CCM_ENCRYPTED_KEY, &payload)
}

/// Builds one complete `VOLUME_MASTER_KEY` TLV entry from an already-derived
/// stretch key: stretch key -> AES-CCM(ccm_key) -> AES-CCM(vmk), under the
/// given `protection_type`.
fn build_vmk_entry(stretch_key: [u8; 32], protection_type: u16, salt: [u8; 16], vmk: [u8; 32], nonce_seed: u8) -> Vec<u8> {
    let ccm_key_material = [nonce_seed.wrapping_add(1); 32];

    let inner_plain = unwrapped_block(0x2c, &ccm_key_material);
    let inner_nonce = [nonce_seed; 12];
    let (inner_ct, inner_mac) = seal_ccm(&stretch_key, inner_nonce, &inner_plain);
    let stretch_inner_entry = aes_ccm_entry(0, inner_nonce, inner_mac, &inner_ct);

    let mut stretch_payload = Vec::new();
    stretch_payload.extend_from_slice(&0x8000u32.to_le_bytes()); // encryption_method, unused by unlock
    stretch_payload.extend_from_slice(&salt);
    stretch_payload.extend_from_slice(&stretch_inner_entry);
    let stretch_entry = entry(0, VALUE_TYPE_STRETCH_KEY, &stretch_payload);

    let vmk_plain = unwrapped_block(0x2c, &vmk);
    let outer_nonce = [nonce_seed.wrapping_add(2); 12];
    let (outer_ct, outer_mac) = seal_ccm(&ccm_key_material, outer_nonce, &vmk_plain);
    let wrapped_vmk_entry = aes_ccm_entry(0, outer_nonce, outer_mac, &outer_ct);

    let mut vmk_payload = Vec::new();
    vmk_payload.extend_from_slice(&[0xaa; 16]); // identifier
    vmk_payload.extend_from_slice(&[0u8; 8]); // last_modified
    vmk_payload.extend_from_slice(&[0u8; 2]); // reserved
    vmk_payload.extend_from_slice(&protection_type.to_le_bytes());
    vmk_payload.extend_from_slice(&stretch_entry);
    vmk_payload.extend_from_slice(&wrapped_vmk_entry);

    entry(ENTRY_TYPE_VOLUME_MASTER_KEY, VALUE_TYPE_VOLUME_MASTER_KEY, &vmk_payload)
}

/// Builds one complete `VOLUME_MASTER_KEY` TLV entry for a password
/// protector: password -> stretch key -> AES-CCM(ccm_key) -> AES-CCM(vmk).
pub fn build_password_vmk_entry(password: &str, salt: [u8; 16], vmk: [u8; 32], nonce_seed: u8) -> Vec<u8> {
    let stretch_key = derive_from_password(password, salt);
    build_vmk_entry(stretch_key, PROTECTION_TYPE_PASSWORD, salt, vmk, nonce_seed)
}

/// Builds one complete `VOLUME_MASTER_KEY` TLV entry for a recovery-password
/// protector (spec §8 S2): recovery groups -> stretch key -> AES-CCM(ccm_key)
/// -> AES-CCM(vmk), under `RECOVERY_KEY = 0x0800`.
pub fn build_recovery_vmk_entry(groups: &[u32; 8], salt: [u8; 16], vmk: [u8; 32], nonce_seed: u8) -> Vec<u8> {
    let stretch_key = derive_from_recovery_password(groups, salt);
    build_vmk_entry(stretch_key, PROTECTION_TYPE_RECOVERY_KEY, salt, vmk, nonce_seed)
}

/// Builds the `FULL_VOLUME_ENCRYPTION_KEY` TLV entry, AES-CCM sealed under
/// the VMK.
pub fn build_fvek_entry(vmk: [u8; 32], fvek_data_size: u16, fvek_key_material: &[u8], nonce_seed: u8) -> Vec<u8> {
    let plain = unwrapped_block(fvek_data_size, fvek_key_material);
    let nonce = [nonce_seed; 12];
    let (ct, mac) = seal_ccm(&vmk, nonce, &plain);
    aes_ccm_entry(ENTRY_TYPE_FULL_VOLUME_ENCRYPTION_KEY, nonce, mac, &ct)
}

/// Builds a `VOLUME_HEADER_BLOCK` `OFFSET_AND_SIZE` entry.
pub fn build_volume_header_entry(offset: u64, size: u64) -> Vec<u8> {
    let mut payload = vec![0u8; 16];
    LittleEndian::write_u64(&mut payload[0..8], offset);
    LittleEndian::write_u64(&mut payload[8..16], size);
    entry(ENTRY_TYPE_VOLUME_HEADER_BLOCK, VALUE_TYPE_OFFSET_AND_SIZE, &payload)
}

/// Builds one 4096-byte metadata replica block.
pub fn build_metadata_block(triplet: [u64; 3], encryption_method: u32, volume_size: u64, entries: &[u8]) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE];
    block[0..8].copy_from_slice(b"-FVE-FS-");
    LittleEndian::write_u16(&mut block[10..12], 2); // block header version (v2: volume_header_offset/volume_size trailer)
    for (i, off) in triplet.iter().enumerate() {
        let start = 24 + i * 8;
        LittleEndian::write_u64(&mut block[start..start + 8], *off);
    }
    LittleEndian::write_u64(&mut block[48..56], 0); // volume_header_offset (unused; VOLUME_HEADER_BLOCK entry takes precedence)
    LittleEndian::write_u64(&mut block[56..64], volume_size);

    let metadata_size = (48 + entries.len()) as u32;
    LittleEndian::write_u32(&mut block[64..68], metadata_size);
    LittleEndian::write_u32(&mut block[68..72], 1); // metadata header version, must be 1
    LittleEndian::write_u32(&mut block[72..76], 48); // header_size
    LittleEndian::write_u32(&mut block[76..80], metadata_size); // metadata_size_copy
    block[80..96].copy_from_slice(&[0xbb; 16]); // volume_identifier
    LittleEndian::write_u32(&mut block[96..100], 0); // next_nonce_counter
    LittleEndian::write_u32(&mut block[100..104], encryption_method);
    LittleEndian::write_u64(&mut block[104..112], 0); // creation_time

    block[112..112 + entries.len()].copy_from_slice(entries);
    block
}

/// Builds a 512-byte boot sector with the "Seven" layout (full triplet
/// present, no Vista back-fill needed).
pub fn build_boot_sector(triplet: [u64; 3]) -> Vec<u8> {
    let mut buf = vec![0u8; 512];
    buf[3..11].copy_from_slice(b"-FVE-FS-");
    LittleEndian::write_u16(&mut buf[0x0b..0x0d], SECTOR_SIZE as u16);
    buf[0x1a8] = 0x01; // Seven layout marker
    for (i, off) in triplet.iter().enumerate() {
        let start = 0x1b0 + i * 8;
        LittleEndian::write_u64(&mut buf[start..start + 8], *off);
    }
    buf
}

/// Encrypts one sector of AES-CBC-128 ciphertext the way `src/sector.rs`
/// decrypts it: IV = AES-ECB-encrypt(key, LE16(byte_offset)).
pub fn cbc128_encrypt_sector(key: &[u8; 16], logical_sector_number: u64, plaintext: &[u8]) -> Vec<u8> {
    let byte_offset = logical_sector_number * SECTOR_SIZE;
    let mut iv_block = GenericArray::clone_from_slice(&[0u8; 16]);
    iv_block[0..8].copy_from_slice(&byte_offset.to_le_bytes());
    let cipher = Aes128::new(GenericArray::from_slice(key));
    cipher.encrypt_block(&mut iv_block);

    let mut buf = plaintext.to_vec();
    type Enc = cbc::Encryptor<Aes128>;
    let enc = Enc::new(GenericArray::from_slice(key), &iv_block);
    enc.encrypt_padded_mut::<NoPadding>(&mut buf, plaintext.len())
        .expect("plaintext length is already a multiple of the AES block size")
        .to_vec()
}

/// Supplies `Xts128` with the tweak input the same way `src/sector.rs` does:
/// the sector number as a little-endian 16-byte value.
fn sector_number_tweak(sector_number: u128) -> [u8; 16] {
    sector_number.to_le_bytes()
}

/// Encrypts one sector of AES-XTS-256 ciphertext, data key first / tweak key
/// second (the order `src/sector.rs::SectorCipher::decrypt_sector` expects).
pub fn xts256_encrypt_sector(data_key: &[u8; 32], tweak_key: &[u8; 32], logical_sector_number: u64, plaintext: &[u8]) -> Vec<u8> {
    let xts = Xts128::new(Aes256::new(GenericArray::from_slice(data_key)), Aes256::new(GenericArray::from_slice(tweak_key)));
    let mut buf = plaintext.to_vec();
    xts.encrypt_area(&mut buf, buf.len(), logical_sector_number as u128, sector_number_tweak);
    buf
}

/// Dispatches sector encryption by `encryption_method`, covering the modes
/// the integration tests exercise (CBC-128 and XTS-256).
fn encrypt_sector_for_method(method: u32, fvek_key_material: &[u8], logical_sector_number: u64, plaintext: &[u8]) -> Vec<u8> {
    match method {
        0x8000 => {
            let mut key = [0u8; 16];
            key.copy_from_slice(&fvek_key_material[0..16]);
            cbc128_encrypt_sector(&key, logical_sector_number, plaintext)
        }
        0x8005 => {
            let mut data_key = [0u8; 32];
            data_key.copy_from_slice(&fvek_key_material[0..32]);
            let mut tweak_key = [0u8; 32];
            tweak_key.copy_from_slice(&fvek_key_material[32..64]);
            xts256_encrypt_sector(&data_key, &tweak_key, logical_sector_number, plaintext)
        }
        other => panic!("test fixture does not support encryption_method {other:#x}"),
    }
}

/// A minimal end-to-end synthetic volume: boot sector, 3 metadata replicas
/// (optionally with the first corrupted), and one CBC-128 encrypted data
/// region placed after the metadata, for verifying `read()`.
pub struct SyntheticVolume {
    pub device: Vec<u8>,
    pub password: String,
    pub fvek: [u8; 16],
    pub data_region_offset: u64,
    /// The v2 block header's `volume_size` (spec §4.2 step 2) — the
    /// decrypted-address-space bound, deliberately smaller than
    /// `device.len()` (trailing padding follows it) so boundary tests
    /// exercise the metadata field rather than the physical device length.
    pub volume_size: u64,
}

pub fn build_synthetic_volume(password: &str, corrupt_first_replica: bool) -> SyntheticVolume {
    build_synthetic_volume_with_method(password, corrupt_first_replica, 0x8000, &[0x22u8; 16])
}

/// Like `build_synthetic_volume`, but with a caller-chosen `encryption_method`
/// and FVEK key material (so XTS/diffuser modes can be exercised too).
pub fn build_synthetic_volume_with_method(
    password: &str,
    corrupt_first_replica: bool,
    encryption_method: u32,
    fvek_key_material: &[u8],
) -> SyntheticVolume {
    let salt = [0x42u8; 16];
    let vmk = [0x11u8; 32];
    let vmk_entry = build_password_vmk_entry(password, salt, vmk, 7);
    build_synthetic_volume_with_vmk_entry(password, corrupt_first_replica, encryption_method, fvek_key_material, vmk, vmk_entry)
}

/// Like `build_synthetic_volume_with_method`, but keyed by a recovery
/// password protector (spec §8 S2) instead of a regular password. The
/// returned volume's `password` field is empty; unlock it with
/// `VolumeHandle::set_recovery_password`.
pub fn build_synthetic_volume_with_recovery(groups: &[u32; 8], encryption_method: u32, fvek_key_material: &[u8]) -> SyntheticVolume {
    let salt = [0x99u8; 16];
    let vmk = [0x55u8; 32];
    let vmk_entry = build_recovery_vmk_entry(groups, salt, vmk, 7);
    build_synthetic_volume_with_vmk_entry("", false, encryption_method, fvek_key_material, vmk, vmk_entry)
}

fn build_synthetic_volume_with_vmk_entry(
    password: &str,
    corrupt_first_replica: bool,
    encryption_method: u32,
    fvek_key_material: &[u8],
    vmk: [u8; 32],
    vmk_entry: Vec<u8>,
) -> SyntheticVolume {
    let fvek_data_size = match fvek_key_material.len() {
        16 => 0x1c,
        32 => 0x2c,
        64 => 0x4c,
        other => panic!("unsupported FVEK key material length {other} in test fixture"),
    };

    let fvek_entry = build_fvek_entry(vmk, fvek_data_size, fvek_key_material, 99);
    let mut entries = Vec::new();
    entries.extend_from_slice(&vmk_entry);
    entries.extend_from_slice(&fvek_entry);

    let triplet = [0x10000u64, 0x11000u64, 0x12000u64];

    let data_region_offset = 0x13000u64;
    let data_sectors = 4u64;
    let volume_size = data_region_offset + data_sectors * SECTOR_SIZE;
    let device_len = (volume_size + BLOCK_SIZE as u64) as usize; // trailing padding past volume_size

    let mut blocks: Vec<Vec<u8>> = (0..3)
        .map(|_| build_metadata_block(triplet, encryption_method, volume_size, &entries))
        .collect();
    if corrupt_first_replica {
        blocks[0][0] = 0x00; // wreck the "-FVE-FS-" signature
    }

    let mut device = vec![0u8; device_len];

    device[0..512].copy_from_slice(&build_boot_sector(triplet));
    for (block, &offset) in blocks.iter().zip(triplet.iter()) {
        let start = offset as usize;
        device[start..start + BLOCK_SIZE].copy_from_slice(block);
    }

    let mut fvek = [0u8; 16];
    fvek.copy_from_slice(&fvek_key_material[0..16]);
    for s in 0..data_sectors {
        let plaintext: Vec<u8> = (0..SECTOR_SIZE as usize).map(|i| (s as usize * 16 + i) as u8).collect();
        // Data sectors are addressed by logical sector number counted from
        // the start of the plaintext volume; here the data region starts
        // immediately after metadata with no relocation, so logical sector
        // number equals (data_region_offset/SECTOR_SIZE) + s.
        let logical_sector = data_region_offset / SECTOR_SIZE + s;
        let ct = encrypt_sector_for_method(encryption_method, fvek_key_material, logical_sector, &plaintext);
        let start = (data_region_offset + s * SECTOR_SIZE) as usize;
        device[start..start + SECTOR_SIZE as usize].copy_from_slice(&ct);
    }

    SyntheticVolume { device, password: password.to_string(), fvek, data_region_offset, volume_size }
}

/// A synthetic volume with volume-header relocation (spec §4.7/§8 S6): the
/// first two logical sectors are served from ciphertext at
/// `volume_header_offset`, while the third logical sector is served
/// directly (physical offset == logical offset).
pub struct RelocatedVolume {
    pub device: Vec<u8>,
    pub password: String,
}

pub fn build_synthetic_volume_with_relocation(password: &str) -> RelocatedVolume {
    let salt = [0x77u8; 16];
    let vmk = [0x33u8; 32];
    let fvek = [0x44u8; 16];
    let volume_header_offset = 0x5000u64;
    let volume_header_size = 1024u64;

    let vmk_entry = build_password_vmk_entry(password, salt, vmk, 13);
    let fvek_entry = build_fvek_entry(vmk, 0x1c, &fvek, 200);
    let header_entry = build_volume_header_entry(volume_header_offset, volume_header_size);
    let mut entries = Vec::new();
    entries.extend_from_slice(&vmk_entry);
    entries.extend_from_slice(&fvek_entry);
    entries.extend_from_slice(&header_entry);

    let triplet = [0x10000u64, 0x11000u64, 0x12000u64];
    let encryption_method = 0x8000u32;
    let volume_size = volume_header_size + SECTOR_SIZE; // sectors 0,1 (header) + sector 2 (direct)
    let block = build_metadata_block(triplet, encryption_method, volume_size, &entries);

    let device_len = 0x13000usize;
    let mut device = vec![0u8; device_len];
    device[0..512].copy_from_slice(&build_boot_sector(triplet));
    for &offset in triplet.iter() {
        let start = offset as usize;
        device[start..start + BLOCK_SIZE].copy_from_slice(&block);
    }

    // Relocated header: logical sectors 0 and 1, physically stored at
    // `volume_header_offset`.
    let header_plain: Vec<u8> = (0..(volume_header_size as usize)).map(|i| i as u8).collect();
    for sector in 0..(volume_header_size / SECTOR_SIZE) {
        let chunk = &header_plain[(sector * SECTOR_SIZE) as usize..((sector + 1) * SECTOR_SIZE) as usize];
        let ct = cbc128_encrypt_sector(&fvek, sector, chunk);
        let start = (volume_header_offset + sector * SECTOR_SIZE) as usize;
        device[start..start + SECTOR_SIZE as usize].copy_from_slice(&ct);
    }

    // Direct (non-relocated) logical sector 2, physically at offset
    // 2 * SECTOR_SIZE == logical offset (no relocation applies here).
    let direct_sector: u64 = volume_header_size / SECTOR_SIZE;
    let direct_plain: Vec<u8> = (0..SECTOR_SIZE as usize).map(|i| (0x80 + i) as u8).collect();
    let ct = cbc128_encrypt_sector(&fvek, direct_sector, &direct_plain);
    let start = (direct_sector * SECTOR_SIZE) as usize;
    device[start..start + SECTOR_SIZE as usize].copy_from_slice(&ct);

    RelocatedVolume { device, password: password.to_string() }
}
