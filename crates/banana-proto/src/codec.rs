//! Token header codec and primitive emitters.
//!
//! The decoding half is deliberately incremental: [`scan_header`] inspects
//! a buffer without consuming it and reports either a complete header, a
//! need for more bytes, or a fatal framing error. Body extraction is the
//! caller's job, because whether a body is acceptable (and how much of it
//! to buffer) depends on the schema in effect, which this crate knows
//! nothing about.
//!
//! The encoding half appends tokens to a [`BytesMut`]. Integer tokens pick
//! INT/NEG or LONGINT/LONGNEG based on [`limits::SMALL_INT_BOUND`];
//! big-integer magnitudes are big-endian with no leading zeros, sign
//! carried by the tag.

use bytes::{BufMut, BytesMut};

use crate::{
    errors::BananaError,
    limits::{self, MAX_HEADER_BYTES},
    tokens::TokenTag,
};

/// A decoded token header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// The header integer (value, body length, or open count, depending on
    /// the tag).
    pub value: u64,
    /// The raw tag byte. May be an unknown tag; the receive engine decides
    /// what that means.
    pub tag_byte: u8,
    /// Bytes consumed by the header plus the tag byte.
    pub consumed: usize,
}

impl Header {
    /// The tag, if the tag byte is a known one.
    #[must_use]
    pub fn tag(&self) -> Option<TokenTag> {
        TokenTag::from_u8(self.tag_byte)
    }
}

/// Result of scanning for a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderScan {
    /// A complete header (and tag byte) is available.
    Complete(Header),
    /// The buffer ends before the tag byte; feed more data.
    NeedMore,
}

/// Scan `buf` for the next token header.
///
/// # Errors
///
/// Returns [`BananaError`] when the header prefix exceeds
/// [`MAX_HEADER_BYTES`] digits, whether or not the tag byte has arrived —
/// a hostile peer must not be able to stall us with an endless prefix.
/// Also rejects headers whose value overflows `u64`.
pub fn scan_header(buf: &[u8]) -> Result<HeaderScan, BananaError> {
    let mut pos = 0;
    while pos < buf.len() && buf[pos] < 0x80 {
        pos += 1;
    }
    if pos > MAX_HEADER_BYTES {
        return Err(BananaError::new(format!(
            "token prefix is limited to {} bytes",
            MAX_HEADER_BYTES
        )));
    }
    if pos == buf.len() {
        return Ok(HeaderScan::NeedMore);
    }

    let mut value: u128 = 0;
    for (place, &digit) in buf[..pos].iter().enumerate() {
        if digit == 0 {
            continue;
        }
        if place >= 10 {
            // ten base-128 digits already cover the full u64 range
            return Err(BananaError::new("token header overflows 64 bits"));
        }
        value += u128::from(digit) << (7 * place);
    }
    if value > u128::from(u64::MAX) {
        return Err(BananaError::new("token header overflows 64 bits"));
    }

    Ok(HeaderScan::Complete(Header {
        value: value as u64,
        tag_byte: buf[pos],
        consumed: pos + 1,
    }))
}

/// Append the base-128 header for `value` followed by `tag`.
pub fn write_header(out: &mut BytesMut, value: u64, tag: TokenTag) {
    let mut v = value;
    if v == 0 {
        out.put_u8(0);
    }
    while v != 0 {
        out.put_u8((v & 0x7f) as u8);
        v >>= 7;
    }
    out.put_u8(tag.to_u8());
}

/// Append an integer token, choosing INT/NEG or LONGINT/LONGNEG.
pub fn write_int(out: &mut BytesMut, value: i64) {
    if value >= limits::SMALL_INT_BOUND {
        let magnitude = magnitude_from_u64(value as u64);
        write_header(out, magnitude.len() as u64, TokenTag::LongInt);
        out.put_slice(&magnitude);
    } else if value >= 0 {
        write_header(out, value as u64, TokenTag::Int);
    } else if value >= -limits::SMALL_INT_BOUND {
        write_header(out, value.unsigned_abs(), TokenTag::Neg);
    } else {
        let magnitude = magnitude_from_u64(value.unsigned_abs());
        write_header(out, magnitude.len() as u64, TokenTag::LongNeg);
        out.put_slice(&magnitude);
    }
}

/// Append a big-integer token from a sign and a big-endian magnitude.
///
/// The magnitude is normalized (leading zeros stripped) before emission so
/// equal values always encode identically.
pub fn write_big_int(out: &mut BytesMut, negative: bool, magnitude: &[u8]) {
    let trimmed = strip_leading_zeros(magnitude);
    let tag = if negative { TokenTag::LongNeg } else { TokenTag::LongInt };
    write_header(out, trimmed.len() as u64, tag);
    out.put_slice(trimmed);
}

/// Append a byte-string token.
pub fn write_bytes(out: &mut BytesMut, body: &[u8]) {
    write_header(out, body.len() as u64, TokenTag::String);
    out.put_slice(body);
}

/// Append a vocabulary back-reference token.
pub fn write_vocab_ref(out: &mut BytesMut, index: u64) {
    write_header(out, index, TokenTag::Vocab);
}

/// Append a float token: zero header, 8 big-endian body bytes.
pub fn write_float(out: &mut BytesMut, value: f64) {
    write_header(out, 0, TokenTag::Float);
    out.put_slice(&value.to_be_bytes());
}

/// Append an OPEN token carrying the per-direction open count.
pub fn write_open(out: &mut BytesMut, open_id: u64) {
    write_header(out, open_id, TokenTag::Open);
}

/// Append a CLOSE token for the given open count.
pub fn write_close(out: &mut BytesMut, open_id: u64) {
    write_header(out, open_id, TokenTag::Close);
}

/// Append an ABORT token for the given open count.
pub fn write_abort(out: &mut BytesMut, open_id: u64) {
    write_header(out, open_id, TokenTag::Abort);
}

/// Append an ERROR token.
///
/// # Errors
///
/// The message must fit [`limits::ERROR_SIZE_LIMIT`]; a longer one would be
/// rejected by any conformant peer.
pub fn write_error(out: &mut BytesMut, message: &[u8]) -> Result<(), BananaError> {
    if message.len() as u64 > limits::ERROR_SIZE_LIMIT {
        return Err(BananaError::new(format!(
            "error string is too long to send ({})",
            message.len()
        )));
    }
    write_header(out, message.len() as u64, TokenTag::Error);
    out.put_slice(message);
    Ok(())
}

/// Big-endian magnitude of a `u64`, leading zeros stripped. Zero encodes
/// as a single zero byte.
#[must_use]
pub fn magnitude_from_u64(value: u64) -> Vec<u8> {
    if value == 0 {
        return vec![0];
    }
    strip_leading_zeros(&value.to_be_bytes()).to_vec()
}

/// Interpret a big-endian magnitude as a `u64`, if it fits.
#[must_use]
pub fn magnitude_to_u64(magnitude: &[u8]) -> Option<u64> {
    let trimmed = strip_leading_zeros(magnitude);
    if trimmed.len() > 8 {
        return None;
    }
    let mut value: u64 = 0;
    for byte in trimmed {
        value = (value << 8) | u64::from(*byte);
    }
    Some(value)
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let mut start = 0;
    while start + 1 < bytes.len() && bytes[start] == 0 {
        start += 1;
    }
    if bytes.is_empty() {
        &[0u8; 1]
    } else {
        &bytes[start..]
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn scan_one(buf: &[u8]) -> Header {
        match scan_header(buf).expect("should scan") {
            HeaderScan::Complete(h) => h,
            HeaderScan::NeedMore => panic!("expected a complete header"),
        }
    }

    #[test]
    fn known_vectors() {
        let mut out = BytesMut::new();
        write_int(&mut out, 0);
        assert_eq!(&out[..], &[0x00, 0x81]);

        let mut out = BytesMut::new();
        write_int(&mut out, 1);
        assert_eq!(&out[..], &[0x01, 0x81]);

        let mut out = BytesMut::new();
        write_int(&mut out, 127);
        assert_eq!(&out[..], &[0x7f, 0x81]);

        let mut out = BytesMut::new();
        write_int(&mut out, 128);
        assert_eq!(&out[..], &[0x00, 0x01, 0x81]);

        let mut out = BytesMut::new();
        write_int(&mut out, -1);
        assert_eq!(&out[..], &[0x01, 0x83]);
    }

    #[test]
    fn small_int_boundary_switches_tags() {
        let mut out = BytesMut::new();
        write_int(&mut out, (1 << 31) - 1);
        assert_eq!(scan_one(&out).tag(), Some(TokenTag::Int));

        let mut out = BytesMut::new();
        write_int(&mut out, 1 << 31);
        assert_eq!(scan_one(&out).tag(), Some(TokenTag::LongInt));

        let mut out = BytesMut::new();
        write_int(&mut out, -(1 << 31));
        assert_eq!(scan_one(&out).tag(), Some(TokenTag::Neg));

        let mut out = BytesMut::new();
        write_int(&mut out, -(1 << 31) - 1);
        assert_eq!(scan_one(&out).tag(), Some(TokenTag::LongNeg));
    }

    #[test]
    fn need_more_on_partial_header() {
        assert_eq!(scan_header(&[0x01]).unwrap(), HeaderScan::NeedMore);
        assert_eq!(scan_header(&[]).unwrap(), HeaderScan::NeedMore);
    }

    #[test]
    fn oversized_prefix_is_fatal() {
        let buf = vec![0x01u8; MAX_HEADER_BYTES + 1];
        assert!(scan_header(&buf).is_err());
        // and with a tag terminator present too
        let mut buf = vec![0x01u8; MAX_HEADER_BYTES + 1];
        buf.push(TokenTag::Int.to_u8());
        assert!(scan_header(&buf).is_err());
    }

    #[test]
    fn exactly_64_digit_prefix_is_accepted() {
        let mut buf = vec![0x00u8; MAX_HEADER_BYTES];
        buf.push(TokenTag::Int.to_u8());
        let h = scan_one(&buf);
        assert_eq!(h.value, 0);
        assert_eq!(h.consumed, MAX_HEADER_BYTES + 1);
    }

    #[test]
    fn header_overflow_is_fatal() {
        // 2^64 encoded base-128: ten digits then a 2
        let mut buf = vec![0x00u8; 9];
        buf.push(0x02);
        buf.push(TokenTag::Int.to_u8());
        assert!(scan_header(&buf).is_err());
    }

    #[test]
    fn magnitude_normalization() {
        assert_eq!(magnitude_from_u64(0), vec![0]);
        assert_eq!(magnitude_from_u64(0x1234), vec![0x12, 0x34]);
        assert_eq!(magnitude_to_u64(&[0, 0, 0x12, 0x34]), Some(0x1234));
        assert_eq!(magnitude_to_u64(&[1, 0, 0, 0, 0, 0, 0, 0, 0]), None);
    }

    #[test]
    fn float_token_is_fixed_width() {
        let mut out = BytesMut::new();
        write_float(&mut out, 1.5);
        let h = scan_one(&out);
        assert_eq!(h.tag(), Some(TokenTag::Float));
        assert_eq!(out.len() - h.consumed, limits::FLOAT_BODY_BYTES);
        let body: [u8; 8] = out[h.consumed..].try_into().unwrap();
        assert_eq!(f64::from_be_bytes(body), 1.5);
    }

    #[test]
    fn oversized_error_refused() {
        let mut out = BytesMut::new();
        let msg = vec![b'x'; limits::ERROR_SIZE_LIMIT as usize + 1];
        assert!(write_error(&mut out, &msg).is_err());
        assert!(out.is_empty());
    }

    proptest! {
        #[test]
        fn header_round_trip(value in any::<u64>()) {
            let mut out = BytesMut::new();
            write_header(&mut out, value, TokenTag::Open);
            let h = scan_one(&out);
            prop_assert_eq!(h.value, value);
            prop_assert_eq!(h.tag(), Some(TokenTag::Open));
            prop_assert_eq!(h.consumed, out.len());
        }

        #[test]
        fn int_round_trip(value in any::<i64>()) {
            let mut out = BytesMut::new();
            write_int(&mut out, value);
            let h = scan_one(&out);
            let decoded: i64 = match h.tag().unwrap() {
                TokenTag::Int => h.value as i64,
                TokenTag::Neg => -(h.value as i64),
                TokenTag::LongInt => {
                    magnitude_to_u64(&out[h.consumed..]).unwrap() as i64
                }
                TokenTag::LongNeg => {
                    let m = magnitude_to_u64(&out[h.consumed..]).unwrap();
                    (m as i64).wrapping_neg()
                }
                other => panic!("unexpected tag {:?}", other),
            };
            prop_assert_eq!(decoded, value);
        }

        #[test]
        fn magnitude_round_trip(value in any::<u64>()) {
            let m = magnitude_from_u64(value);
            prop_assert_eq!(magnitude_to_u64(&m), Some(value));
            // normalized: no redundant leading zero
            if value != 0 {
                prop_assert!(m[0] != 0);
            }
        }

        #[test]
        fn scan_never_panics(buf in proptest::collection::vec(any::<u8>(), 0..200)) {
            let _ = scan_header(&buf);
        }
    }
}
