//! Token tag bytes.
//!
//! Tags occupy the range `0x80..=0xFF`: the high bit terminates the
//! base-128 header that precedes every tag. The low seven bits select the
//! token kind.

/// Token kinds on the wire.
///
/// # Representation
///
/// The `#[repr(u8)]` values are the literal wire bytes and must never
/// change.
///
/// # Security
///
/// `from_u8` is total and returns `None` for unknown tags. Unknown tags
/// MUST be treated as a fatal framing error by the receive engine, never
/// skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenTag {
    /// Legacy list framing from the first-generation protocol. Recognized
    /// so that an old peer produces a clear error instead of garbage.
    List = 0x80,
    /// Non-negative integer below 2^31, value carried in the header.
    Int = 0x81,
    /// Byte string; header is the body length.
    String = 0x82,
    /// Negative integer with magnitude at most 2^31, carried in the header.
    Neg = 0x83,
    /// IEEE-754 double; 8 big-endian body bytes, header is zero.
    Float = 0x84,
    /// Positive big integer; header is the length of the big-endian
    /// magnitude body.
    LongInt = 0x85,
    /// Negative big integer; sign lives in the tag, not the magnitude.
    LongNeg = 0x86,
    /// Back-reference into the negotiated vocabulary table; header is the
    /// table index, the body is empty.
    Vocab = 0x87,
    /// Begin a composite sequence; header is the per-direction open count.
    Open = 0x88,
    /// End the innermost composite sequence; header repeats its open count.
    Close = 0x89,
    /// Abandon the innermost composite sequence.
    Abort = 0x8A,
    /// Fatal diagnostic from the peer; header is the message length.
    Error = 0x8D,
}

impl TokenTag {
    /// The literal wire byte.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Decode a wire byte, `None` for unknown tags.
    #[must_use]
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x80 => Some(Self::List),
            0x81 => Some(Self::Int),
            0x82 => Some(Self::String),
            0x83 => Some(Self::Neg),
            0x84 => Some(Self::Float),
            0x85 => Some(Self::LongInt),
            0x86 => Some(Self::LongNeg),
            0x87 => Some(Self::Vocab),
            0x88 => Some(Self::Open),
            0x89 => Some(Self::Close),
            0x8A => Some(Self::Abort),
            0x8D => Some(Self::Error),
            _ => None,
        }
    }

    /// Short name used in diagnostics and violation messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::List => "LIST",
            Self::Int => "INT",
            Self::String => "STRING",
            Self::Neg => "NEG",
            Self::Float => "FLOAT",
            Self::LongInt => "LONGINT",
            Self::LongNeg => "LONGNEG",
            Self::Vocab => "VOCAB",
            Self::Open => "OPEN",
            Self::Close => "CLOSE",
            Self::Abort => "ABORT",
            Self::Error => "ERROR",
        }
    }

    /// True for tags that are always structurally legal, regardless of the
    /// schema in effect: ABORT, CLOSE and ERROR. These are the only tags
    /// exempt from `check_token`.
    #[must_use]
    pub const fn always_legal(self) -> bool {
        matches!(self, Self::Abort | Self::Close | Self::Error)
    }

    /// True for tags whose header declares a body length that follows the
    /// tag byte (STRING, LONGINT, LONGNEG, ERROR).
    #[must_use]
    pub const fn has_body(self) -> bool {
        matches!(self, Self::String | Self::LongInt | Self::LongNeg | Self::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        for byte in 0x80..=0xFFu8 {
            if let Some(tag) = TokenTag::from_u8(byte) {
                assert_eq!(tag.to_u8(), byte);
            }
        }
    }

    #[test]
    fn unknown_tags_rejected() {
        assert_eq!(TokenTag::from_u8(0x8B), None);
        assert_eq!(TokenTag::from_u8(0x8C), None);
        assert_eq!(TokenTag::from_u8(0xFF), None);
    }

    #[test]
    fn low_bytes_are_not_tags() {
        // Bytes without the high bit are header digits, never tags.
        for byte in 0x00..0x80u8 {
            assert_eq!(TokenTag::from_u8(byte), None);
        }
    }
}
