//! Remaining length encoding/decoding for MQTT.
//!
//! The remaining length uses 7 bits per byte for the value, with the high bit
//! indicating whether more bytes follow. Groups are stored least significant
//! first and at most four groups are allowed:
//! - 0-127: 1 byte
//! - 128-16383: 2 bytes
//! - 16384-2097151: 3 bytes
//! - 2097152-268435455: 4 bytes

use crate::error::{ProtocolError, Result};

/// Largest value representable in four groups.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Maximum number of bytes in an encoded remaining length.
pub const MAX_ENCODED_LEN: usize = 4;

/// Continuation bit of a length group.
pub const CONTINUATION_BIT: u8 = 0x80;

/// Decode a remaining length from the start of a buffer.
///
/// Returns `Ok(Some((value, bytes_consumed)))` if successful,
/// `Ok(None)` if more data is needed, or `Err` if four groups were read
/// and the last one still had its continuation bit set.
///
/// # Example
/// ```
/// use tidemq_core::varint::decode;
/// let buf = [0x80, 0x01]; // Encodes 128
/// let (value, consumed) = decode(&buf).unwrap().unwrap();
/// assert_eq!(value, 128);
/// assert_eq!(consumed, 2);
/// ```
pub fn decode(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().take(MAX_ENCODED_LEN).enumerate() {
        value += ((byte & 0x7F) as usize) * multiplier;

        if (byte & CONTINUATION_BIT) == 0 {
            return Ok(Some((value, i + 1)));
        }

        if i == MAX_ENCODED_LEN - 1 {
            return Err(ProtocolError::InvalidRemainingLength.into());
        }

        multiplier *= 128;
    }

    // Need more bytes
    Ok(None)
}

/// Encode a remaining length, appending to a Vec.
///
/// Returns the number of bytes written.
///
/// # Example
/// ```
/// use tidemq_core::varint::encode_to_vec;
/// let mut buf = Vec::new();
/// let written = encode_to_vec(300, &mut buf).unwrap();
/// assert_eq!(written, 2);
/// assert_eq!(&buf, &[0xAC, 0x02]);
/// ```
pub fn encode_to_vec(mut value: usize, buf: &mut Vec<u8>) -> Result<usize> {
    if value > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::RemainingLengthOverflow(value).into());
    }

    let start = buf.len();
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= CONTINUATION_BIT;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
    Ok(buf.len() - start)
}

/// Calculate the number of bytes needed to encode a value.
///
/// # Example
/// ```
/// use tidemq_core::varint::encoded_len;
/// assert_eq!(encoded_len(0), 1);
/// assert_eq!(encoded_len(127), 1);
/// assert_eq!(encoded_len(128), 2);
/// assert_eq!(encoded_len(16383), 2);
/// assert_eq!(encoded_len(16384), 3);
/// ```
pub fn encoded_len(mut value: usize) -> usize {
    let mut len = 0;
    loop {
        len += 1;
        value /= 128;
        if value == 0 {
            break;
        }
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_byte() {
        assert_eq!(decode(&[0]).unwrap(), Some((0, 1)));
        assert_eq!(decode(&[0x7F]).unwrap(), Some((127, 1)));
    }

    #[test]
    fn test_decode_two_bytes() {
        assert_eq!(decode(&[0x80, 0x01]).unwrap(), Some((128, 2)));
        assert_eq!(decode(&[0xFF, 0x7F]).unwrap(), Some((16383, 2)));
    }

    #[test]
    fn test_decode_four_bytes() {
        assert_eq!(
            decode(&[0x80, 0x80, 0x80, 0x01]).unwrap(),
            Some((2097152, 4))
        );
        assert_eq!(
            decode(&[0xFF, 0xFF, 0xFF, 0x7F]).unwrap(),
            Some((MAX_REMAINING_LENGTH, 4))
        );
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        assert_eq!(decode(&[0x05, 0xFF, 0xFF]).unwrap(), Some((5, 1)));
    }

    #[test]
    fn test_decode_incomplete() {
        assert_eq!(decode(&[]).unwrap(), None);
        assert_eq!(decode(&[0x80]).unwrap(), None);
        assert_eq!(decode(&[0x80, 0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn test_decode_invalid() {
        // Fourth byte still has the continuation bit
        assert!(decode(&[0x80, 0x80, 0x80, 0x80]).is_err());
        assert!(decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_err());
    }

    #[test]
    fn test_encode_rejects_overflow() {
        let mut buf = Vec::new();
        assert!(encode_to_vec(MAX_REMAINING_LENGTH + 1, &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encoding_uses_minimal_groups() {
        let cases = [
            (0usize, 1usize),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
            (MAX_REMAINING_LENGTH, 4),
        ];

        for (value, groups) in cases {
            let mut buf = Vec::new();
            assert_eq!(encode_to_vec(value, &mut buf).unwrap(), groups);
            assert_eq!(encoded_len(value), groups);
            // Only the last group may be zero-valued without continuation.
            assert_eq!(buf.last().unwrap() & CONTINUATION_BIT, 0);
            let (decoded, consumed) = decode(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, groups);
        }
    }

    #[test]
    fn test_roundtrip_sampled_range() {
        // Step through the whole range with a prime stride.
        let mut value = 0usize;
        while value <= MAX_REMAINING_LENGTH {
            let mut buf = Vec::new();
            encode_to_vec(value, &mut buf).unwrap();
            assert_eq!(decode(&buf).unwrap(), Some((value, buf.len())));
            value += 65_521;
        }
    }
}
