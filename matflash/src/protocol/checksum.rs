//! Boot-mode frame checksum.
//!
//! Every frame of the boot-mode protocol ends with a single byte chosen so
//! that the sum of all frame bytes, including the checksum itself, is zero
//! modulo 256.

/// Compute the checksum byte for `data`.
///
/// This is the two's-complement negation of the byte sum: the sum is taken
/// modulo 256, bitwise inverted, and incremented by one.
pub fn checksum(data: &[u8]) -> u8 {
    let sum = data
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Check a byte range whose last byte is its own checksum.
///
/// Returns `false` for an empty slice.
pub fn verify(frame: &[u8]) -> bool {
    !frame.is_empty()
        && frame
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b))
            == 0
}
