/// Masks or unmasks a frame payload in place. Applying the same key twice restores the
/// input.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    apply_mask_words(buf, mask);
}

/// Masks or unmasks a slice that starts `offset` bytes into a frame payload.
///
/// Used when a payload arrives in several chunks: each chunk continues the key
/// rotation where the previous one stopped.
#[inline]
pub fn apply_mask_offset(buf: &mut [u8], mask: [u8; 4], offset: u64) {
    let mut rotated = mask;
    rotated.rotate_left((offset & 3) as usize);
    apply_mask_words(buf, rotated);
}

#[inline]
fn apply_mask_bytes(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// XORs eight bytes at a time. Every chunk starts at a multiple of 8, so the key
/// phase of the remainder is unchanged.
#[inline]
fn apply_mask_words(buf: &mut [u8], mask: [u8; 4]) {
    let mut doubled = [0u8; 8];
    doubled[..4].copy_from_slice(&mask);
    doubled[4..].copy_from_slice(&mask);
    let key = u64::from_ne_bytes(doubled);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        chunk.copy_from_slice(&(u64::from_ne_bytes(word) ^ key).to_ne_bytes());
    }
    apply_mask_bytes(chunks.into_remainder(), mask);
}
