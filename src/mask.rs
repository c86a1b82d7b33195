//! XOR masking for client-to-server frames (RFC 6455 §5.3).

/// Mask/unmask a payload in place. Masking is an involution, so the same
/// call both applies and removes a mask.
///
/// The key repeats with period 4, which divides the 8-byte word size, so
/// the bulk of the buffer is processed a word at a time with the key
/// doubled into a `u64`; the sub-word tail falls back to byte XOR. Both
/// sides load with native byte order, so the word XOR equals the byte-wise
/// XOR on either endianness.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let doubled = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut words = buf.chunks_exact_mut(8);
    for chunk in &mut words {
        let word: [u8; 8] = chunk.try_into().expect("8-byte chunk");
        chunk.copy_from_slice(&(u64::from_ne_bytes(word) ^ doubled).to_ne_bytes());
    }

    for (i, byte) in words.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}
