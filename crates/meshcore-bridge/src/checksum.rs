//! Fletcher-16 checksum used by the bridge envelope
//!
//! Two running sums modulo 255, combined as `(sum2 << 8) | sum1`. This catches
//! line noise and truncation; it is not an integrity mechanism against an
//! adversary.
//!
//! The arithmetic is modulo 255, so a byte of `0x00` and a byte of `0xFF` are
//! indistinguishable. Substituting one for the other is the checksum's known
//! blind spot.

/// Compute the Fletcher-16 checksum of `data`
pub fn fletcher16(data: &[u8]) -> u16 {
    let mut sum1: u16 = 0;
    let mut sum2: u16 = 0;

    for &byte in data {
        sum1 = (sum1 + byte as u16) % 255;
        sum2 = (sum2 + sum1) % 255;
    }

    (sum2 << 8) | sum1
}

/// Check `data` against a received checksum
pub fn validate_checksum(data: &[u8], received: u16) -> bool {
    fletcher16(data) == received
}
