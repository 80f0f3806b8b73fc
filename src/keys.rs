//! Password and recovery-password key derivation (spec §4.4).
//!
//! The stretch loop's constants and byte layout are normative per spec —
//! reproduced exactly, not adapted from any corpus source. The "try
//! candidates in order, return the first that authenticates" *shape* of
//! `unlock` (src/unlock.rs) is grounded in the teacher's
//! `volume.rs::try_header_at_offset`, which tries PBKDF2 parameter
//! combinations the same way this crate tries password-then-recovery.

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

const STRETCH_ROUNDS: u64 = 1 << 20;

/// The stretch-loop state, hashed round after round (spec §4.4). Zeroized
/// on drop since `last_sha256_hash` becomes the AES-CCM key.
#[derive(Zeroize, ZeroizeOnDrop)]
struct StretchState {
    last_sha256_hash: [u8; 32],
    initial_sha256_hash: [u8; 32],
    salt: [u8; 16],
    hash_count: u64,
}

impl StretchState {
    fn to_bytes(&self) -> [u8; 88] {
        let mut buf = [0u8; 88];
        buf[0..32].copy_from_slice(&self.last_sha256_hash);
        buf[32..64].copy_from_slice(&self.initial_sha256_hash);
        buf[64..80].copy_from_slice(&self.salt);
        buf[80..88].copy_from_slice(&self.hash_count.to_le_bytes());
        buf
    }
}

/// Runs the normative 2^20-round SHA-256 stretch loop and returns the
/// 32-byte AES-CCM key. `initial_hash` is `SHA-256(SHA-256(bytes))` of the
/// password UTF-16LE encoding, or of the packed recovery-password buffer.
fn stretch(initial_hash: [u8; 32], salt: [u8; 16]) -> [u8; 32] {
    let mut state = StretchState {
        last_sha256_hash: [0u8; 32],
        initial_sha256_hash: initial_hash,
        salt,
        hash_count: 0,
    };
    for _ in 0..STRETCH_ROUNDS {
        let digest = Sha256::digest(state.to_bytes());
        state.last_sha256_hash.copy_from_slice(&digest);
        state.hash_count += 1;
    }
    state.last_sha256_hash
}

fn double_sha256(bytes: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(bytes);
    Sha256::digest(first).into()
}

/// Derives the AES-CCM key for a password protector (spec §4.4, password
/// path). `password` is encoded UTF-16LE internally.
pub fn derive_from_password(password: &str, salt: [u8; 16]) -> [u8; 32] {
    let mut utf16le = Vec::with_capacity(password.len() * 2);
    for unit in password.encode_utf16() {
        utf16le.extend_from_slice(&unit.to_le_bytes());
    }
    let h0 = double_sha256(&utf16le);
    utf16le.zeroize();
    stretch(h0, salt)
}

/// Error returned when a recovery-password group fails the `mod 11` /
/// `<= 0xFFFF` validation (spec §4.4, §8 invariant 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRecoveryGroup {
    pub group_index: usize,
    pub value: u32,
}

/// Validates and packs the 8 recovery-password groups, then runs the same
/// stretch loop (spec §4.4, recovery path).
pub fn derive_from_recovery_password(
    groups: &[u32; 8],
    salt: [u8; 16],
) -> std::result::Result<[u8; 32], InvalidRecoveryGroup> {
    let mut packed = [0u8; 16];
    for (i, &g) in groups.iter().enumerate() {
        if g % 11 != 0 {
            return Err(InvalidRecoveryGroup { group_index: i, value: g });
        }
        let divided = g / 11;
        if divided > 0xFFFF {
            return Err(InvalidRecoveryGroup { group_index: i, value: g });
        }
        let divided = divided as u16;
        packed[i * 2..i * 2 + 2].copy_from_slice(&divided.to_le_bytes());
    }
    let h0 = double_sha256(&packed);
    Ok(stretch(h0, salt))
}

/// Parses the canonical 8x6-digit recovery password string
/// (`"NNNNNN-NNNNNN-..."`, 8 groups separated by any non-digit) into the
/// group array `derive_from_recovery_password` expects.
pub fn parse_recovery_password(input: &str) -> Option<[u32; 8]> {
    let mut groups = [0u32; 8];
    let mut idx = 0;
    for token in input.split(|c: char| !c.is_ascii_digit()) {
        if token.is_empty() {
            continue;
        }
        if idx >= 8 {
            return None;
        }
        groups[idx] = token.parse().ok()?;
        idx += 1;
    }
    if idx != 8 {
        return None;
    }
    Some(groups)
}
