//! Wire-level size limits.
//!
//! These bound what a peer can make us buffer before any schema has had a
//! chance to object. Schema constraints tighten these further; they never
//! loosen them.

/// Maximum length of a token header (the base-128 prefix). A conformant
/// peer never needs more than ten bytes for a 64-bit value; 64 leaves
/// generous headroom for big-integer lengths while still bounding the
/// scan. Exceeding it is fatal.
pub const MAX_HEADER_BYTES: usize = 64;

/// Default cap on the body of long tokens (STRING, LONGINT, LONGNEG,
/// ERROR) when no schema is in effect.
pub const SIZE_LIMIT: u64 = 1000;

/// Inbound ERROR tokens above this size indicate a hostile peer and are
/// dropped without reading the body.
pub const ERROR_SIZE_LIMIT: u64 = SIZE_LIMIT;

/// FLOAT bodies are exactly this many bytes, IEEE-754 big-endian.
pub const FLOAT_BODY_BYTES: usize = 8;

/// Send-side failsafe on slicer stack depth. Hitting it means a runaway
/// object graph (the reference tracker breaks genuine cycles long before
/// this).
pub const MAX_SLICE_DEPTH: usize = 10_000;

/// Values with |v| below this bound travel as INT/NEG; anything larger
/// switches to LONGINT/LONGNEG.
pub const SMALL_INT_BOUND: i64 = 1 << 31;
