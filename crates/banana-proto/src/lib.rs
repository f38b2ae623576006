//! # Banana Protocol: Wire Format
//!
//! This crate implements the token layer of the Banana object-serialization
//! protocol. A Banana byte stream is a flat sequence of *tokens*; object
//! structure is expressed with OPEN/CLOSE framing tokens rather than an
//! outer length-prefixed envelope.
//!
//! ## Token encoding
//!
//! Every token starts with a *header*: an unsigned integer encoded base-128,
//! little-endian, seven payload bits per byte. The header is terminated by
//! the *tag byte*, which always has its high bit set. The meaning of the
//! header value depends on the tag (a small integer for INT, a byte count
//! for STRING, an open-sequence counter for OPEN/CLOSE, and so on). Some
//! tags are followed by a body of exactly `header` bytes (STRING, LONGINT,
//! LONGNEG, ERROR) or a fixed 8 bytes (FLOAT).
//!
//! ## Security Properties
//!
//! - **Bounded headers**: a header longer than [`limits::MAX_HEADER_BYTES`]
//!   is a fatal protocol error, not a recoverable violation. A conformant
//!   peer never produces one.
//!
//! - **Validation before buffering**: the incremental decoder exposes the
//!   header (tag + declared size) before any body bytes are accumulated, so
//!   callers can reject oversized bodies without allocating for them.
//!
//! - **No unsafe parsing**: all decoding is plain slice inspection with
//!   explicit bounds checks.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod errors;
pub mod limits;
pub mod tokens;

pub use codec::{scan_header, Header, HeaderScan};
pub use errors::{BananaError, NegotiationError, RemoteNegotiationError, TokenError, Violation};
pub use tokens::TokenTag;
