//! Checksummed envelope for broker transports
//!
//! Envelope layout:
//! - Bytes 0-1: Magic `0xC03E` (big-endian)
//! - Bytes 2-3: Fletcher-16 of the payload (little-endian)
//! - Bytes 4+: Serialized mesh packet

use bytes::{BufMut, Bytes, BytesMut};

use crate::checksum::fletcher16;
use crate::config::BRIDGE_PACKET_MAGIC;
use crate::error::{BridgeError, Result};

/// Envelope header size (magic + checksum)
pub const ENVELOPE_HEADER_SIZE: usize = 4;

/// Wrap a serialized mesh packet
pub fn wrap(payload: &[u8]) -> Bytes {
    let mut envelope = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + payload.len());
    envelope.put_u16(BRIDGE_PACKET_MAGIC);
    envelope.put_u16_le(fletcher16(payload));
    envelope.put_slice(payload);
    envelope.freeze()
}

/// Validate an envelope and return the mesh packet it carries
pub fn unwrap(envelope: &[u8]) -> Result<Bytes> {
    if envelope.len() < ENVELOPE_HEADER_SIZE {
        return Err(BridgeError::TooShort {
            len: envelope.len(),
        });
    }

    let magic = u16::from_be_bytes([envelope[0], envelope[1]]);
    if magic != BRIDGE_PACKET_MAGIC {
        return Err(BridgeError::InvalidMagic { got: magic });
    }

    let received = u16::from_le_bytes([envelope[2], envelope[3]]);
    let payload = &envelope[ENVELOPE_HEADER_SIZE..];
    let calculated = fletcher16(payload);
    if received != calculated {
        return Err(BridgeError::ChecksumMismatch {
            received,
            calculated,
        });
    }

    Ok(Bytes::copy_from_slice(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_layout() {
        let envelope = wrap(b"abcde");
        assert_eq!(&envelope[..2], &[0xC0, 0x3E]);
        // fletcher16("abcde") = 0xC8F0, stored low byte first
        assert_eq!(&envelope[2..4], &[0xF0, 0xC8]);
        assert_eq!(&envelope[4..], b"abcde");
    }

    #[test]
    fn test_round_trip() {
        let packet = [0x15, 0x00, 0xD5, 0x10, 0x20, 0x30];
        assert_eq!(unwrap(&wrap(&packet)).unwrap().as_ref(), &packet);
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let envelope = wrap(&[]);
        assert_eq!(envelope.len(), ENVELOPE_HEADER_SIZE);
        assert!(unwrap(&envelope).unwrap().is_empty());
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(
            unwrap(&[0xC0, 0x3E, 0x00]),
            Err(BridgeError::TooShort { len: 3 })
        ));
    }

    #[test]
    fn test_invalid_magic() {
        let mut envelope = wrap(b"packet").to_vec();
        envelope[0] = 0x94;
        assert!(matches!(
            unwrap(&envelope),
            Err(BridgeError::InvalidMagic { got: 0x943E })
        ));
    }

    #[test]
    fn test_corruption_detected() {
        let packet: Vec<u8> = (1..=40u8).collect();
        let envelope = wrap(&packet).to_vec();

        let mut mismatches = 0;
        let mut total = 0;
        for index in 2..envelope.len() {
            let mut corrupted = envelope.clone();
            corrupted[index] ^= 0x5A;
            total += 1;
            if matches!(unwrap(&corrupted), Err(BridgeError::ChecksumMismatch { .. })) {
                mismatches += 1;
            }
        }
        assert!(mismatches * 256 >= total * 255, "{mismatches}/{total}");
    }
}
