//! Error types shared by every layer of the protocol.
//!
//! Two severities exist and are never conflated:
//!
//! - [`Violation`]: a schema or policy rejection, local to one object
//!   subtree. The connection survives; only the offending subtree is
//!   discarded.
//! - [`BananaError`]: a framing-level protocol error. The connection is
//!   dropped, after a best-effort diagnostic to the peer.
//!
//! Negotiation has its own pair: [`NegotiationError`] for local failures
//! and [`RemoteNegotiationError`] when the peer already explained itself
//! (in which case no further diagnostic is sent back, to avoid error
//! ping-pong).

use thiserror::Error;

/// A recoverable, subtree-local schema rejection.
///
/// Carries an optional `location`: the dotted path from the root of the
/// object graph to the node being processed when the violation was raised
/// (e.g. `<root>.[2].{}[name]`). The location is set once, by whichever
/// layer notices it first, and never overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct Violation {
    /// What was rejected and why.
    pub message: String,
    /// Path from the object-graph root to the offending node.
    pub location: Option<String>,
}

impl Violation {
    /// New violation with no location yet.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), location: None }
    }

    /// Record the location, unless one was already set.
    pub fn set_location(&mut self, location: impl Into<String>) {
        if self.location.is_none() {
            self.location = Some(location.into());
        }
    }

    /// Append context to the message, used to annotate inbound/outbound
    /// method-result violations.
    #[must_use]
    pub fn annotated(mut self, context: &str) -> Self {
        self.message.push_str(" ");
        self.message.push_str(context);
        self
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "violation (at {}): {}", loc, self.message),
            None => write!(f, "violation: {}", self.message),
        }
    }
}

/// A fatal framing error. The connection must be dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct BananaError {
    /// What went wrong.
    pub message: String,
    /// Path to the node being processed when the stream broke down.
    pub location: Option<String>,
}

impl BananaError {
    /// New fatal error with no location.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), location: None }
    }

    /// Record the location, unless one was already set.
    pub fn set_location(&mut self, location: impl Into<String>) {
        if self.location.is_none() {
            self.location = Some(location.into());
        }
    }
}

impl std::fmt::Display for BananaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "banana error (in {}): {}", loc, self.message),
            None => write!(f, "banana error: {}", self.message),
        }
    }
}

/// Outcome of a pre-acceptance token check: either severity may apply.
///
/// A schema that merely dislikes the token raises the recoverable side; a
/// token that violates the base protocol (wrong tag in a structural
/// position) raises the fatal side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// The schema rejects this token; discard the subtree.
    #[error(transparent)]
    Violation(#[from] Violation),
    /// The token breaks the framing; drop the connection.
    #[error(transparent)]
    Fatal(#[from] BananaError),
}

/// A locally-detected failure during the pre-Banana handshake. Fatal to the
/// negotiation; the connection is dropped after a best-effort diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("negotiation failed: {0}")]
pub struct NegotiationError(pub String);

/// The peer reported a negotiation failure of its own. The connection is
/// dropped and no diagnostic is sent back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("peer abandoned negotiation: {0}")]
pub struct RemoteNegotiationError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_location_set_once() {
        let mut v = Violation::new("string too long");
        v.set_location("<root>.[2]");
        v.set_location("<root>");
        assert_eq!(v.location.as_deref(), Some("<root>.[2]"));
        assert_eq!(v.to_string(), "violation (at <root>.[2]): string too long");
    }

    #[test]
    fn token_error_severities_are_distinct() {
        let soft: TokenError = Violation::new("no").into();
        let hard: TokenError = BananaError::new("bad tag").into();
        assert!(matches!(soft, TokenError::Violation(_)));
        assert!(matches!(hard, TokenError::Fatal(_)));
    }
}
