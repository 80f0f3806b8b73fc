//! Unlock orchestrator (spec §4.6): selects a VMK candidate for the supplied
//! credential, derives the AES-CCM key, unwraps the VMK, then unwraps the
//! FVEK under the VMK.
//!
//! The "try password, fall back to recovery" ordering follows the same
//! try-candidates-in-order shape as the teacher's
//! `volume.rs::try_header_at_offset`, narrowed to this format's single
//! deterministic derivation per credential kind instead of the teacher's
//! brute-force search over hash/cipher combinations.

use crate::ccm;
use crate::error::{BdeError, Result};
use crate::keys;
use crate::metadata::{AesCcmEnvelope, MetadataSet, Vmk};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A credential supplied to `unlock` (spec §6: `set_password` /
/// `set_recovery_password` / `set_external_key`).
#[derive(Zeroize, ZeroizeOnDrop)]
pub enum Credential {
    Password(String),
    RecoveryPassword([u32; 8]),
    ExternalKey([u8; 32]),
}

fn unwrap_vmk(key: &[u8], stretch: &AesCcmEnvelope) -> Result<[u8; 32]> {
    let unwrapped = ccm::decrypt(key, stretch)?;
    validate_unwrapped_header(&unwrapped, 0x2c)?;
    let mut vmk = [0u8; 32];
    vmk.copy_from_slice(&unwrapped[28..60]);
    Ok(vmk)
}

/// Validates the unwrapped-key-block header (spec §3/§4.6 step 3): inner
/// `version == 1` and `data_size` equal to the single value callers require
/// (strict acceptance only of the listed value, per spec §9's resolved
/// open question — no `0x2c`-like variants are tolerated).
fn validate_unwrapped_header(data: &[u8], expected_data_size: u16) -> Result<()> {
    if data.len() < 28 {
        return Err(BdeError::WrongCredential);
    }
    let data_size = u16::from_le_bytes([data[16], data[17]]);
    let version = u16::from_le_bytes([data[20], data[21]]);
    if version != 1 || data_size != expected_data_size {
        return Err(BdeError::WrongCredential);
    }
    // `data_size` counts bytes from its own field offset (16), so the key
    // material callers slice out afterwards (e.g. `unwrapped[28..60]` for
    // `expected_data_size == 0x2c`) needs `16 + data_size` bytes, not just
    // `data_size` bytes.
    if data.len() < 16 + expected_data_size as usize {
        return Err(BdeError::WrongCredential);
    }
    Ok(())
}

fn derive_stretch_key(vmk: &Vmk, credential: &Credential) -> Result<Option<[u8; 32]>> {
    let stretch = match &vmk.stretch_key {
        Some(s) => s,
        None => return Ok(None),
    };
    Ok(match credential {
        Credential::Password(password) => Some(keys::derive_from_password(password, stretch.salt)),
        Credential::RecoveryPassword(groups) => {
            keys::derive_from_recovery_password(groups, stretch.salt).ok()
        }
        Credential::ExternalKey(bytes) => Some(*bytes),
    })
}

/// Attempts to unwrap the VMK for one candidate using one credential. A
/// `stretch_key`-less VMK (e.g. `CLEAR_KEY`) is out of scope here and
/// returns `NoMatchingProtector`.
fn unwrap_vmk_with_candidate(vmk: &Vmk, credential: &Credential) -> Result<[u8; 32]> {
    let wrapped = vmk
        .aes_ccm_encrypted_key
        .as_ref()
        .ok_or(BdeError::NoMatchingProtector)?;
    let stretch = vmk.stretch_key.as_ref().ok_or(BdeError::NoMatchingProtector)?;

    let mut ccm_key = derive_stretch_key(vmk, credential)?.ok_or(BdeError::WrongCredential)?;
    let unwrapped_stretch = ccm::decrypt(&ccm_key, &stretch.encrypted_inner);
    ccm_key.zeroize();
    let mut stretch_key = unwrapped_stretch.map_err(|_| BdeError::WrongCredential)?;
    validate_unwrapped_header(&stretch_key, 0x2c).map_err(|_| BdeError::WrongCredential)?;
    let aes_ccm_key = &stretch_key[28..60];

    let result = unwrap_vmk(aes_ccm_key, wrapped);
    stretch_key.zeroize();
    result
}

/// Unwraps the FVEK envelope under the VMK (spec §4.6 step 4). Accepts
/// `data_size` in `{0x1c, 0x2c, 0x4c}` and returns the raw key-material
/// bytes (16, 32, or 64 bytes respectively) for `SectorCipher::new`.
///
/// `data_size` counts bytes from its own field offset (16), not from the
/// start of the key material at 28 — the same convention `unwrap_vmk` uses
/// when it slices `unwrapped[28..60]` for `data_size == 0x2c` (`16 + 0x2c
/// == 60`). The end offset for a given `data_size` is therefore `16 +
/// data_size`, not `data_size` itself.
fn unwrap_fvek(vmk: &[u8; 32], envelope: &AesCcmEnvelope) -> Result<Vec<u8>> {
    let mut unwrapped = ccm::decrypt(vmk, envelope)?;
    if unwrapped.len() < 28 {
        return Err(BdeError::Corrupt("unwrapped FVEK block shorter than 28 bytes"));
    }
    let data_size = u16::from_le_bytes([unwrapped[16], unwrapped[17]]) as usize;
    let version = u16::from_le_bytes([unwrapped[20], unwrapped[21]]);
    if version != 1 {
        return Err(BdeError::Corrupt("unwrapped FVEK block has unsupported inner version"));
    }
    let end = 16 + data_size;

    let key = match data_size {
        0x1c if unwrapped.len() >= end => unwrapped[28..end].to_vec(),
        0x2c if unwrapped.len() >= end => unwrapped[28..end].to_vec(),
        0x4c if unwrapped.len() >= end => {
            let mut combined = unwrapped[28..16 + 0x2c].to_vec();
            combined.extend_from_slice(&unwrapped[16 + 0x2c..end]);
            combined
        }
        _ => {
            unwrapped.zeroize();
            return Err(BdeError::Corrupt("unsupported FVEK data_size"));
        }
    };
    unwrapped.zeroize();
    Ok(key)
}

/// Runs the full unlock pipeline (spec §4.6): selects the VMK candidate for
/// the credential kind, derives the AES-CCM key, unwraps the VMK, then
/// unwraps the FVEK. If both password and recovery credentials are tried by
/// the caller in sequence and the first returns `WrongCredential`, the
/// second should be attempted (spec §4.6 final paragraph) — that fallback
/// is the caller's responsibility (`VolumeHandle::unlock`) since it may
/// combine multiple `Credential`s.
pub fn unlock(metadata: &MetadataSet, credential: &Credential) -> Result<Vec<u8>> {
    let candidate = match credential {
        Credential::RecoveryPassword(_) => metadata
            .disk_password_vmk
            .as_ref()
            .ok_or(BdeError::NoMatchingProtector)?,
        Credential::Password(_) | Credential::ExternalKey(_) => metadata
            .external_key_vmk
            .as_ref()
            .ok_or(BdeError::NoMatchingProtector)?,
    };

    let mut vmk = unwrap_vmk_with_candidate(candidate, credential)?;
    let fvek_envelope = metadata
        .fvek_envelope
        .as_ref()
        .ok_or(BdeError::Corrupt("metadata has no FULL_VOLUME_ENCRYPTION_KEY entry"))?;
    let fvek = unwrap_fvek(&vmk, fvek_envelope);
    vmk.zeroize();
    fvek
}
