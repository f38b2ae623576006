//! Serialized failures.
//!
//! Application-level exceptions cross the wire as a `copyable` of class
//! `failure`: the exception type name, its string rendering, a truncated
//! traceback, and the chain of ancestor type names. The caller gets a
//! [`RemoteFailure`] reconstructed from those fields — never a live
//! exception object.

use std::collections::BTreeMap;

use banana_proto::Violation;

use crate::value::{CopyableValue, Value};

/// Tracebacks are capped near this size before transmission.
pub const TRACEBACK_LIMIT: usize = 1900;

const TRUNCATION_MARKER: &str = "\n\n-- TRACEBACK TRUNCATED --\n";

/// The copyable class name failures travel under.
pub const FAILURE_CLASS: &str = "failure";

/// A shadow of a failure that happened on the other side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    /// The failure type name, e.g. `"ValueError"` or `"Violation"`.
    pub kind: String,
    /// String rendering of the failure value.
    pub message: String,
    /// Remote traceback text, possibly truncated, possibly just
    /// "Traceback unavailable".
    pub traceback: String,
    /// Ancestor type names, outermost first, for `check`-style matching.
    pub parents: Vec<String>,
}

impl RemoteFailure {
    /// A failure with no traceback and a single-entry parents chain.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let kind = kind.into();
        Self {
            parents: vec![kind.clone()],
            kind,
            message: message.into(),
            traceback: "Traceback unavailable\n".to_string(),
        }
    }

    /// Structural `trap`-style matching: does any entry of the parents
    /// chain (or the type itself) equal `name`?
    #[must_use]
    pub fn check(&self, name: &str) -> bool {
        self.kind == name || self.parents.iter().any(|p| p == name)
    }

    /// Render to the wire shape, truncating the traceback.
    #[must_use]
    pub fn to_copyable(&self) -> CopyableValue {
        let mut traceback = self.traceback.clone();
        if traceback.len() > TRACEBACK_LIMIT {
            traceback.truncate(TRACEBACK_LIMIT);
            traceback.push_str(TRUNCATION_MARKER);
        }
        let mut fields = BTreeMap::new();
        fields.insert("type".to_string(), Value::Bytes(self.kind.clone().into_bytes()));
        fields.insert("value".to_string(), Value::Bytes(self.message.clone().into_bytes()));
        fields.insert("traceback".to_string(), Value::Bytes(traceback.into_bytes()));
        fields.insert(
            "parents".to_string(),
            Value::list(self.parents.iter().map(|p| Value::Bytes(p.clone().into_bytes())).collect()),
        );
        CopyableValue { class_name: FAILURE_CLASS.to_string(), fields }
    }

    /// Reconstruct from the wire shape.
    ///
    /// # Errors
    ///
    /// Returns a [`Violation`] when a field is missing or has the wrong
    /// type — the constraint system normally catches this first.
    pub fn from_copyable(copyable: &CopyableValue) -> Result<Self, Violation> {
        if copyable.class_name != FAILURE_CLASS {
            return Err(Violation::new(format!(
                "expected a '{}' copyable, got '{}'",
                FAILURE_CLASS, copyable.class_name
            )));
        }
        let text = |name: &str| -> Result<String, Violation> {
            match copyable.fields.get(name) {
                Some(Value::Bytes(b)) => Ok(String::from_utf8_lossy(b).into_owned()),
                Some(Value::Unicode(s)) => Ok(s.clone()),
                _ => Err(Violation::new(format!("failure is missing field '{}'", name))),
            }
        };
        let parents = match copyable.fields.get("parents") {
            Some(Value::List(items)) => items
                .lock()
                .iter()
                .map(|v| match v {
                    Value::Bytes(b) => Ok(String::from_utf8_lossy(b).into_owned()),
                    Value::Unicode(s) => Ok(s.clone()),
                    _ => Err(Violation::new("failure parents must be strings")),
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        Ok(Self {
            kind: text("type")?,
            message: text("value")?,
            traceback: text("traceback")?,
            parents,
        })
    }
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[remote failure: {}: {}]", self.kind, self.message)
    }
}

impl From<Violation> for RemoteFailure {
    fn from(v: Violation) -> Self {
        Self::new("Violation", v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_through_copyable() {
        let f = RemoteFailure {
            kind: "ValueError".into(),
            message: "no".into(),
            traceback: "line 1\nline 2\n".into(),
            parents: vec!["ValueError".into(), "Exception".into()],
        };
        let copied = RemoteFailure::from_copyable(&f.to_copyable()).unwrap();
        assert_eq!(copied, f);
        assert!(copied.check("Exception"));
        assert!(!copied.check("KeyError"));
    }

    #[test]
    fn oversized_traceback_is_truncated() {
        let f = RemoteFailure {
            kind: "E".into(),
            message: "m".into(),
            traceback: "x".repeat(5000),
            parents: vec!["E".into()],
        };
        let wire = f.to_copyable();
        match wire.fields.get("traceback") {
            Some(Value::Bytes(b)) => {
                assert!(b.len() < 2000);
                assert!(b.ends_with(TRUNCATION_MARKER.as_bytes()));
            }
            other => panic!("unexpected traceback field: {:?}", other),
        }
    }
}
