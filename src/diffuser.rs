//! The ELEPHANT diffuser (spec §4.7): a keyless byte-shuffle layer applied
//! after AES-CBC decryption on Vista-mode sectors (`encryption_method`
//! `0x8001`/`0x8003`) to frustrate known-plaintext attacks against bare CBC.
//!
//! This is a read-only library (no write/encrypt path is in scope), so only
//! the decrypt-direction passes are implemented. Pass counts and the
//! word-mixing formula realize spec's rotation-constant description; see
//! DESIGN.md for the exact choice (no bit-exact reference vector was
//! available in the retrieved corpus to pin this down further).

const DIFFUSER_B_ROTATIONS: [u32; 4] = [9, 0, 13, 0];
const DIFFUSER_A_ROTATIONS: [u32; 4] = [0, 10, 0, 25];

fn unmix_pass(words: &mut [u32], rotations: [u32; 4]) {
    let n = words.len();
    for i in (0..n).rev() {
        let r = rotations[i % 4];
        let mix = words[(i + 1) % n].rotate_left(r) ^ words[(i + 2) % n];
        words[i] = words[i].wrapping_sub(mix);
    }
}

/// Diffuser B, decrypt direction: two passes over the sector's `u32` words.
pub fn diffuser_b_decrypt(words: &mut [u32]) {
    for _ in 0..2 {
        unmix_pass(words, DIFFUSER_B_ROTATIONS);
    }
}

/// Diffuser A, decrypt direction: five passes over the sector's `u32` words.
pub fn diffuser_a_decrypt(words: &mut [u32]) {
    for _ in 0..5 {
        unmix_pass(words, DIFFUSER_A_ROTATIONS);
    }
}

/// Applies both decrypt-direction diffuser passes in the order spec §4.7
/// specifies: diffuser-B then diffuser-A.
pub fn decrypt_sector_words(sector: &mut [u8]) {
    debug_assert_eq!(sector.len() % 4, 0);
    let mut words: Vec<u32> = sector
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    diffuser_b_decrypt(&mut words);
    diffuser_a_decrypt(&mut words);
    for (chunk, word) in sector.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}
