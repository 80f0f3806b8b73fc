//! AES-CCM unwrap (spec §4.5).
//!
//! No corpus repo uses an AEAD construction (the teacher's VeraCrypt-style
//! ciphers are all raw block/XTS, no MAC), so this is the one place this
//! crate reaches past the teacher's dependency set — for the same reason
//! the teacher reaches for `xts-mode` rather than hand-rolling XTS: a real,
//! maintained RustCrypto sibling of `aes`/`cipher` exists for exactly this
//! construction (`ccm`, with `L=3`/`M=16` matching `Ccm<_, U16, U12>`), so it
//! is used instead of reimplementing CBC-MAC/CTR framing by hand.

use crate::error::{BdeError, Result};
use crate::metadata::AesCcmEnvelope;
use aes::{Aes128, Aes256};
use ccm::aead::{generic_array::GenericArray, Aead};
use ccm::{consts::{U12, U16}, Ccm, KeyInit};

type Aes128Ccm = Ccm<Aes128, U16, U12>;
type Aes256Ccm = Ccm<Aes256, U16, U12>;

/// Decrypts and authenticates an AES-CCM envelope under `key` (16 or 32
/// bytes). Returns the plaintext, or `AuthenticationFailed` on MAC mismatch.
pub fn decrypt(key: &[u8], envelope: &AesCcmEnvelope) -> Result<Vec<u8>> {
    let nonce = GenericArray::from_slice(&envelope.nonce);
    let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + 16);
    sealed.extend_from_slice(&envelope.ciphertext);
    sealed.extend_from_slice(&envelope.mac);

    let plaintext = match key.len() {
        16 => {
            let cipher = Aes128Ccm::new(GenericArray::from_slice(key));
            cipher.decrypt(nonce, sealed.as_slice())
        }
        32 => {
            let cipher = Aes256Ccm::new(GenericArray::from_slice(key));
            cipher.decrypt(nonce, sealed.as_slice())
        }
        _ => return Err(BdeError::Internal("AES-CCM key must be 16 or 32 bytes".into())),
    };

    plaintext.map_err(|_| BdeError::AuthenticationFailed)
}
