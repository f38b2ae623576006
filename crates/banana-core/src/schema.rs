//! The constraint system.
//!
//! Constraints validate untrusted input at three points, cheapest first:
//!
//! 1. [`Constraint::check_token`] — before a token body is buffered, from
//!    nothing but the tag and the declared size. This is what bounds memory
//!    against hostile senders.
//! 2. [`Constraint::check_opentype`] — when an OPEN sequence announces what
//!    kind of composite follows, before any child state exists.
//! 3. [`Constraint::check_object`] — on fully-built objects: outbound
//!    values before transmission, and inbound values that arrive via a
//!    `reference` token (which bypassed the token-level checks under a
//!    different schema).
//!
//! Every constraint can also report its worst-case wire footprint
//! ([`Constraint::max_size`]) and stack depth ([`Constraint::max_depth`]),
//! or signal [`UnboundedSchema`] when no static bound exists. Shared
//! subtrees are detected during the computation so the bound itself cannot
//! recurse forever.

use std::collections::BTreeMap;
use std::sync::Arc;

use banana_proto::{limits, BananaError, TokenError, TokenTag, Violation};

use crate::value::Value;

/// The index-token tuple naming a composite kind, e.g. `("list",)` or
/// `("copyable", "failure")`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opentype(pub Vec<Vec<u8>>);

impl Opentype {
    /// Build from string parts.
    #[must_use]
    pub fn of(parts: &[&str]) -> Self {
        Self(parts.iter().map(|p| p.as_bytes().to_vec()).collect())
    }

    /// Number of index tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no index tokens have accumulated yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The first index token.
    #[must_use]
    pub fn first(&self) -> Option<&[u8]> {
        self.0.first().map(Vec::as_slice)
    }

    /// True if `self` is a prefix of `full`.
    #[must_use]
    pub fn is_prefix_of(&self, full: &Opentype) -> bool {
        full.0.len() >= self.0.len() && full.0[..self.0.len()] == self.0[..]
    }
}

impl std::fmt::Debug for Opentype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", String::from_utf8_lossy(part))?;
        }
        write!(f, ")")
    }
}

/// Raised when a constraint has no static size or depth bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("schema has no static bound")]
pub struct UnboundedSchema;

/// Policy for fields or arguments not named by the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownPolicy {
    /// Unknown names are a violation.
    #[default]
    Reject,
    /// Unknown names are consumed and discarded. The value still gets
    /// built, so this makes the schema unbounded.
    Ignore,
    /// Unknown names are accepted unconstrained. Unbounded.
    Accept,
}

/// One named field of an attribute constraint.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    /// Field name.
    pub name: String,
    /// Constraint on the field value.
    pub constraint: Arc<Constraint>,
    /// False for optional fields.
    pub required: bool,
}

/// A composable validation policy.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// Accept anything (no bound).
    Any,
    /// Accept only the null value.
    Nothing,
    /// Accept a boolean; `Some(v)` additionally pins the value.
    Boolean(Option<bool>),
    /// Accept integers. `max_bytes`: `None` caps at machine integers
    /// (INT/NEG only); `Some(n)` also admits big integers whose magnitude
    /// fits `n` bytes.
    Integer {
        /// Big-integer magnitude cap; `None` means machine integers only.
        max_bytes: Option<u64>,
    },
    /// Accept integers or floats.
    Number {
        /// Big-integer magnitude cap.
        max_bytes: u64,
    },
    /// Accept a byte string of bounded length (`None`: unbounded).
    ByteString {
        /// Maximum body length in bytes.
        max_length: Option<u64>,
    },
    /// Accept a UTF-8 string whose encoded form is bounded.
    Unicode {
        /// Maximum encoded length in bytes.
        max_length: Option<u64>,
    },
    /// Accept a tuple with exactly these per-element constraints.
    Tuple(Vec<Arc<Constraint>>),
    /// Accept a list with a length cap and a per-item constraint.
    List {
        /// Per-item constraint.
        item: Arc<Constraint>,
        /// Maximum number of items (`None`: unbounded).
        max_length: Option<u64>,
    },
    /// Accept a dict with key/value constraints and a key-count cap.
    Dict {
        /// Constraint on keys.
        key: Arc<Constraint>,
        /// Constraint on values.
        value: Arc<Constraint>,
        /// Maximum number of keys (`None`: unbounded).
        max_keys: Option<u64>,
    },
    /// Accept a named-field value object (`copyable` on the wire).
    Attributes {
        /// The copyable class name this schema applies to; `None` accepts
        /// any class.
        class_name: Option<String>,
        /// Per-field schemas.
        fields: Vec<FieldSchema>,
        /// What to do with fields not listed.
        unknown: UnknownPolicy,
    },
    /// Accept anything matching one of the alternatives.
    Poly(Vec<Arc<Constraint>>),
    /// The field/argument is optional; delegates to the inner constraint
    /// when present. Only meaningful inside attribute and method schemas.
    Optional(Arc<Constraint>),
    /// The object may be referenced multiple times within the scope, up to
    /// `ref_limit` times (`None`: no limit).
    Shared {
        /// Inner constraint.
        inner: Arc<Constraint>,
        /// Maximum number of references within the scope.
        ref_limit: Option<u64>,
    },
    /// Accept a serialized failure (the `("copyable", "failure")` shape).
    Failure,
    /// Accept a remote capability claiming the named interface.
    Interface {
        /// Required interface name.
        name: String,
    },
}

/// Wire cost of an OPEN..CLOSE envelope: header+OPEN, a worst-case index
/// token, header+CLOSE.
const OPEN_BYTES: u64 = 64 + 1 + (64 + 1 + 1000) + 64 + 1;
/// Wire cost of one small-integer token.
const INT_BYTES: u64 = 64 + 1;

impl Constraint {
    fn name(&self) -> &'static str {
        match self {
            Constraint::Any => "Any",
            Constraint::Nothing => "Nothing",
            Constraint::Boolean(_) => "BooleanConstraint",
            Constraint::Integer { .. } => "IntegerConstraint",
            Constraint::Number { .. } => "NumberConstraint",
            Constraint::ByteString { .. } => "StringConstraint",
            Constraint::Unicode { .. } => "UnicodeConstraint",
            Constraint::Tuple(_) => "TupleConstraint",
            Constraint::List { .. } => "ListConstraint",
            Constraint::Dict { .. } => "DictConstraint",
            Constraint::Attributes { .. } => "AttributeDictConstraint",
            Constraint::Poly(_) => "PolyConstraint",
            Constraint::Optional(_) => "Optional",
            Constraint::Shared { .. } => "Shared",
            Constraint::Failure => "FailureConstraint",
            Constraint::Interface { .. } => "InterfaceConstraint",
        }
    }

    /// Check a primitive token against this constraint, before its body is
    /// buffered. Never called for ABORT, CLOSE or ERROR.
    ///
    /// # Errors
    ///
    /// [`TokenError::Violation`] when the schema rejects the token;
    /// [`TokenError::Fatal`] when the token cannot appear here at all
    /// under the base protocol.
    pub fn check_token(&self, tag: TokenTag, size: u64) -> Result<(), TokenError> {
        use TokenTag as T;
        let reject = || -> Result<(), TokenError> {
            Err(Violation::new(format!("{} token rejected by {}", tag.name(), self.name())).into())
        };
        let cap = |limit: Option<u64>| -> Result<(), TokenError> {
            match limit {
                Some(max) if size > max => {
                    Err(Violation::new(format!("token too large: {}>{}", size, max)).into())
                }
                _ => Ok(()),
            }
        };
        match self {
            Constraint::Any | Constraint::Poly(_) => match tag {
                T::String | T::LongInt | T::LongNeg => cap(Some(limits::SIZE_LIMIT)),
                _ => Ok(()),
            },
            Constraint::Nothing | Constraint::Boolean(_) => match tag {
                T::Open => Ok(()),
                // structurally impossible under this schema, not a mere
                // preference: drop the connection
                _ => Err(BananaError::new(format!(
                    "invalid token type {} for {}",
                    tag.name(),
                    self.name()
                ))
                .into()),
            },
            Constraint::Integer { max_bytes } => match tag {
                T::Int | T::Neg => Ok(()),
                T::LongInt | T::LongNeg if max_bytes.is_some() => cap(*max_bytes),
                _ => reject(),
            },
            Constraint::Number { max_bytes } => match tag {
                T::Int | T::Neg | T::Float => Ok(()),
                T::LongInt | T::LongNeg => cap(Some(*max_bytes)),
                _ => reject(),
            },
            Constraint::ByteString { max_length } => match tag {
                T::String => cap(*max_length),
                T::Vocab => Ok(()),
                _ => reject(),
            },
            Constraint::Unicode { .. }
            | Constraint::Tuple(_)
            | Constraint::List { .. }
            | Constraint::Dict { .. }
            | Constraint::Attributes { .. }
            | Constraint::Failure
            | Constraint::Interface { .. } => match tag {
                T::Open => Ok(()),
                _ => reject(),
            },
            Constraint::Optional(inner) | Constraint::Shared { inner, .. } => {
                inner.check_token(tag, size)
            }
        }
    }

    /// The OPEN types this constraint admits: `None` means all.
    fn opentypes(&self) -> Option<Vec<Opentype>> {
        match self {
            Constraint::Any | Constraint::Poly(_) => None,
            Constraint::Nothing => Some(vec![Opentype::of(&["none"])]),
            Constraint::Boolean(_) => Some(vec![Opentype::of(&["boolean"])]),
            Constraint::Integer { .. } | Constraint::Number { .. } => Some(vec![]),
            Constraint::ByteString { .. } => Some(vec![]),
            Constraint::Unicode { .. } => Some(vec![Opentype::of(&["unicode"])]),
            Constraint::Tuple(_) => Some(vec![Opentype::of(&["tuple"])]),
            Constraint::List { .. } => Some(vec![Opentype::of(&["list"])]),
            Constraint::Dict { .. } => Some(vec![Opentype::of(&["dict"])]),
            Constraint::Attributes { class_name, .. } => Some(vec![match class_name {
                Some(name) => Opentype::of(&["copyable", name]),
                None => Opentype::of(&["copyable"]),
            }]),
            Constraint::Failure => Some(vec![Opentype::of(&["copyable", "failure"])]),
            Constraint::Interface { .. } => Some(vec![Opentype::of(&["my-reference"])]),
            Constraint::Optional(inner) | Constraint::Shared { inner, .. } => inner.opentypes(),
        }
    }

    /// Check an announced (possibly still partial) OPEN type.
    ///
    /// # Errors
    ///
    /// Returns a [`Violation`] if no admissible opentype matches the
    /// accumulated index tokens, not even as a prefix.
    pub fn check_opentype(&self, opentype: &Opentype) -> Result<(), Violation> {
        let Some(admissible) = self.opentypes() else { return Ok(()) };
        for candidate in &admissible {
            if candidate == opentype || opentype.is_prefix_of(candidate) {
                return Ok(());
            }
        }
        // `reference` sequences resolve to an already-checked object and
        // are validated post-resolution by check_object instead.
        if opentype.first() == Some(b"reference") {
            return Ok(());
        }
        Err(Violation::new(format!("unacceptable OPEN type {:?}", opentype)))
    }

    /// Validate a fully-built object.
    ///
    /// # Errors
    ///
    /// Returns a [`Violation`] describing the first mismatch.
    pub fn check_object(&self, obj: &Value) -> Result<(), Violation> {
        match self {
            Constraint::Any => Ok(()),
            Constraint::Nothing => match obj {
                Value::None => Ok(()),
                _ => Err(Violation::new("not None")),
            },
            Constraint::Boolean(forced) => match obj {
                Value::Bool(b) => match forced {
                    Some(want) if b != want => Err(Violation::new(format!("not {}", want))),
                    _ => Ok(()),
                },
                _ => Err(Violation::new("not a bool")),
            },
            Constraint::Integer { max_bytes } => match (obj, max_bytes) {
                (Value::Int(v), None) => {
                    if *v >= limits::SMALL_INT_BOUND || *v < -limits::SMALL_INT_BOUND {
                        Err(Violation::new("number too large"))
                    } else {
                        Ok(())
                    }
                }
                (Value::Int(_), Some(_)) => Ok(()),
                (Value::BigInt(b), Some(max)) => {
                    if b.magnitude.len() as u64 > *max {
                        Err(Violation::new("number too large"))
                    } else {
                        Ok(())
                    }
                }
                (Value::BigInt(_), None) => Err(Violation::new("number too large")),
                _ => Err(Violation::new("not a number")),
            },
            Constraint::Number { max_bytes } => match obj {
                Value::Float(_) => Ok(()),
                _ => Constraint::Integer { max_bytes: Some(*max_bytes) }.check_object(obj),
            },
            Constraint::ByteString { max_length } => match obj {
                Value::Bytes(b) => match max_length {
                    Some(max) if b.len() as u64 > *max => Err(Violation::new("string too long")),
                    _ => Ok(()),
                },
                _ => Err(Violation::new("not a String")),
            },
            Constraint::Unicode { max_length } => match obj {
                Value::Unicode(s) => match max_length {
                    Some(max) if s.len() as u64 > *max => Err(Violation::new("string too long")),
                    _ => Ok(()),
                },
                _ => Err(Violation::new("not a unicode string")),
            },
            Constraint::Tuple(elements) => match obj {
                Value::Tuple(items) => {
                    if items.len() != elements.len() {
                        return Err(Violation::new("wrong size tuple"));
                    }
                    for (item, c) in items.iter().zip(elements) {
                        c.check_object(item)?;
                    }
                    Ok(())
                }
                _ => Err(Violation::new("not a tuple")),
            },
            Constraint::List { item, max_length } => match obj {
                Value::List(list) => {
                    let list = list.lock();
                    if let Some(max) = max_length {
                        if list.len() as u64 > *max {
                            return Err(Violation::new("list too long"));
                        }
                    }
                    for entry in list.iter() {
                        item.check_object(entry)?;
                    }
                    Ok(())
                }
                _ => Err(Violation::new("not a list")),
            },
            Constraint::Dict { key, value, max_keys } => match obj {
                Value::Dict(map) => {
                    let map = map.lock();
                    if let Some(max) = max_keys {
                        if map.len() as u64 > *max {
                            return Err(Violation::new(format!(
                                "dict keys={} > maxKeys={}",
                                map.len(),
                                max
                            )));
                        }
                    }
                    for (k, v) in map.iter() {
                        key.check_object(&k.clone().into_value())?;
                        value.check_object(v)?;
                    }
                    Ok(())
                }
                _ => Err(Violation::new("not a dictionary")),
            },
            Constraint::Attributes { class_name, fields, unknown } => match obj {
                Value::Copyable(c) => {
                    if let Some(want) = class_name {
                        if &c.class_name != want {
                            return Err(Violation::new(format!(
                                "is not a '{}' copyable",
                                want
                            )));
                        }
                    }
                    check_fields(&c.fields, fields, *unknown)
                }
                _ => Err(Violation::new("not a copyable")),
            },
            Constraint::Poly(alternatives) => {
                for c in alternatives {
                    if c.check_object(obj).is_ok() {
                        return Ok(());
                    }
                }
                Err(Violation::new("does not satisfy any alternative"))
            }
            Constraint::Optional(inner) | Constraint::Shared { inner, .. } => {
                inner.check_object(obj)
            }
            Constraint::Failure => failure_constraint().check_object(obj),
            Constraint::Interface { name } => match obj {
                Value::Remote(handle) => {
                    if handle.interface_name() == Some(name.as_str()) {
                        Ok(())
                    } else {
                        Err(Violation::new(format!("does not provide interface {}", name)))
                    }
                }
                Value::Local(local) => {
                    if local.object().interface_name() == Some(name.as_str()) {
                        Ok(())
                    } else {
                        Err(Violation::new(format!("does not provide interface {}", name)))
                    }
                }
                _ => Err(Violation::new("not a remote reference")),
            },
        }
    }

    /// Worst-case bytes buffered while enforcing this constraint.
    ///
    /// # Errors
    ///
    /// [`UnboundedSchema`] when no static bound exists, including when the
    /// computation revisits a shared subtree (self-referential schema).
    pub fn max_size(&self, seen: &mut Vec<*const Constraint>) -> Result<u64, UnboundedSchema> {
        let this = self as *const Constraint;
        if seen.contains(&this) {
            return Err(UnboundedSchema);
        }
        seen.push(this);
        let result = self.max_size_inner(seen);
        seen.pop();
        result
    }

    fn max_size_inner(&self, seen: &mut Vec<*const Constraint>) -> Result<u64, UnboundedSchema> {
        match self {
            Constraint::Any => Err(UnboundedSchema),
            Constraint::Nothing => Ok(OPEN_BYTES),
            Constraint::Boolean(_) => Ok(OPEN_BYTES + INT_BYTES),
            Constraint::Integer { max_bytes: None } => Ok(INT_BYTES),
            Constraint::Integer { max_bytes: Some(n) } => Ok(INT_BYTES + n),
            Constraint::Number { max_bytes } => Ok((INT_BYTES + 8).max(INT_BYTES + max_bytes)),
            Constraint::ByteString { max_length } | Constraint::Unicode { max_length } => {
                match max_length {
                    Some(n) => Ok(64 + 1 + n),
                    None => Err(UnboundedSchema),
                }
            }
            Constraint::Tuple(elements) => {
                let mut total = OPEN_BYTES;
                for c in elements {
                    total += c.max_size(seen)?;
                }
                Ok(total)
            }
            Constraint::List { item, max_length } => match max_length {
                Some(n) => Ok(OPEN_BYTES + n * item.max_size(seen)?),
                None => Err(UnboundedSchema),
            },
            Constraint::Dict { key, value, max_keys } => match max_keys {
                Some(n) => {
                    let per_entry = key.max_size(seen)? + value.max_size(seen)?;
                    Ok(OPEN_BYTES + n * per_entry)
                }
                None => Err(UnboundedSchema),
            },
            Constraint::Attributes { fields, unknown, .. } => {
                if !matches!(unknown, UnknownPolicy::Reject) {
                    return Err(UnboundedSchema);
                }
                let mut total = OPEN_BYTES;
                for f in fields {
                    total += 64 + 1 + f.name.len() as u64;
                    total += f.constraint.max_size(seen)?;
                }
                Ok(total)
            }
            Constraint::Poly(alternatives) => {
                let mut best = 0;
                for c in alternatives {
                    best = best.max(c.max_size(seen)?);
                }
                Ok(best)
            }
            Constraint::Optional(inner) | Constraint::Shared { inner, .. } => {
                inner.max_size(seen)
            }
            Constraint::Failure => failure_constraint().max_size_inner(seen),
            Constraint::Interface { .. } => Ok(OPEN_BYTES + INT_BYTES + 2 * (64 + 1 + 200)),
        }
    }

    /// Worst-case unslicer stack depth while enforcing this constraint.
    ///
    /// # Errors
    ///
    /// [`UnboundedSchema`] as for [`Constraint::max_size`].
    pub fn max_depth(&self, seen: &mut Vec<*const Constraint>) -> Result<u64, UnboundedSchema> {
        let this = self as *const Constraint;
        if seen.contains(&this) {
            return Err(UnboundedSchema);
        }
        seen.push(this);
        let result = match self {
            Constraint::Any => Err(UnboundedSchema),
            Constraint::Nothing
            | Constraint::Integer { .. }
            | Constraint::Number { .. }
            | Constraint::ByteString { .. }
            | Constraint::Interface { .. } => Ok(1),
            Constraint::Boolean(_) | Constraint::Unicode { .. } => Ok(2),
            Constraint::Tuple(elements) => {
                let mut deepest = 1;
                for c in elements {
                    deepest = deepest.max(c.max_depth(seen)?);
                }
                Ok(1 + deepest)
            }
            Constraint::List { item, max_length } => match max_length {
                Some(_) => Ok(1 + item.max_depth(seen)?),
                None => Err(UnboundedSchema),
            },
            Constraint::Dict { key, value, max_keys } => match max_keys {
                Some(_) => Ok(1 + key.max_depth(seen)?.max(value.max_depth(seen)?)),
                None => Err(UnboundedSchema),
            },
            Constraint::Attributes { fields, unknown, .. } => {
                if !matches!(unknown, UnknownPolicy::Reject) {
                    return Err(UnboundedSchema);
                }
                let mut deepest = 1;
                for f in fields {
                    deepest = deepest.max(f.constraint.max_depth(seen)?);
                }
                Ok(1 + deepest)
            }
            Constraint::Poly(alternatives) => {
                let mut deepest = 1;
                for c in alternatives {
                    deepest = deepest.max(c.max_depth(seen)?);
                }
                Ok(deepest)
            }
            Constraint::Optional(inner) | Constraint::Shared { inner, .. } => {
                inner.max_depth(seen)
            }
            Constraint::Failure => failure_constraint().max_depth(seen),
        };
        seen.pop();
        result
    }
}

fn check_fields(
    actual: &BTreeMap<String, Value>,
    schemas: &[FieldSchema],
    unknown: UnknownPolicy,
) -> Result<(), Violation> {
    for (name, value) in actual {
        match schemas.iter().find(|f| &f.name == name) {
            Some(field) => field.constraint.check_object(value)?,
            None => match unknown {
                UnknownPolicy::Reject => {
                    return Err(Violation::new(format!("key '{}' not in schema", name)))
                }
                UnknownPolicy::Ignore | UnknownPolicy::Accept => {}
            },
        }
    }
    let missing: Vec<&str> = schemas
        .iter()
        .filter(|f| f.required && !actual.contains_key(&f.name))
        .map(|f| f.name.as_str())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Violation::new(format!("object is missing required keys: {}", missing.join(","))))
    }
}

/// The attribute shape of a serialized failure.
pub fn failure_constraint() -> Constraint {
    let field = |name: &str, c: Constraint| FieldSchema {
        name: name.to_string(),
        constraint: Arc::new(c),
        required: true,
    };
    Constraint::Attributes {
        class_name: Some("failure".to_string()),
        fields: vec![
            field("type", Constraint::ByteString { max_length: Some(200) }),
            field("value", Constraint::ByteString { max_length: Some(1000) }),
            field("traceback", Constraint::ByteString { max_length: Some(2000) }),
            field(
                "parents",
                Constraint::List {
                    item: Arc::new(Constraint::ByteString { max_length: Some(200) }),
                    max_length: Some(30),
                },
            ),
        ],
        unknown: UnknownPolicy::Reject,
    }
}

/// The schema of one remotely-invokable method: per-argument constraints,
/// required-argument names, and a result constraint.
#[derive(Debug, Clone)]
pub struct MethodSchema {
    /// Method name.
    pub name: String,
    /// Arguments in declaration order (used to map positional calls).
    pub arguments: Vec<FieldSchema>,
    /// Constraint on the response, if any.
    pub response: Option<Arc<Constraint>>,
    /// Policy for argument names not listed.
    pub unknown: UnknownPolicy,
}

impl MethodSchema {
    /// New schema; arguments wrapped in [`Constraint::Optional`] become
    /// non-required.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        arguments: Vec<(&str, Constraint)>,
        response: Option<Constraint>,
    ) -> Self {
        Self {
            name: name.into(),
            arguments: arguments
                .into_iter()
                .map(|(arg_name, c)| {
                    let required = !matches!(c, Constraint::Optional(_));
                    FieldSchema { name: arg_name.to_string(), constraint: Arc::new(c), required }
                })
                .collect(),
            response: response.map(Arc::new),
            unknown: UnknownPolicy::Reject,
        }
    }

    /// Look up the constraint for one argument name.
    ///
    /// Returns `(accept, constraint)`: `accept=false` means the argument
    /// is known to be ignorable.
    ///
    /// # Errors
    ///
    /// Returns a [`Violation`] for unknown names under
    /// [`UnknownPolicy::Reject`].
    pub fn arg_constraint(
        &self,
        name: &str,
    ) -> Result<(bool, Option<Arc<Constraint>>), Violation> {
        if let Some(field) = self.arguments.iter().find(|f| f.name == name) {
            let c = match &*field.constraint {
                Constraint::Optional(inner) => Arc::clone(inner),
                _ => Arc::clone(&field.constraint),
            };
            return Ok((true, Some(c)));
        }
        match self.unknown {
            UnknownPolicy::Ignore => Ok((false, None)),
            UnknownPolicy::Accept => Ok((true, None)),
            UnknownPolicy::Reject => {
                Err(Violation::new(format!("unknown argument '{}'", name)))
            }
        }
    }

    /// Fold positional arguments into the named-argument map.
    ///
    /// # Errors
    ///
    /// Returns a [`Violation`] for excess positional arguments or a name
    /// given both positionally and by keyword.
    pub fn map_arguments(
        &self,
        positional: Vec<Value>,
        mut named: BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, Violation> {
        if positional.len() > self.arguments.len() {
            return Err(Violation::new(format!(
                "too many positional arguments for {}()",
                self.name
            )));
        }
        for (value, field) in positional.into_iter().zip(&self.arguments) {
            if named.contains_key(&field.name) {
                return Err(Violation::new(format!(
                    "got multiple values for argument '{}'",
                    field.name
                )));
            }
            named.insert(field.name.clone(), value);
        }
        Ok(named)
    }

    /// Inbound check, after every argument has individually passed: are
    /// all required arguments present?
    ///
    /// # Errors
    ///
    /// Returns a [`Violation`] naming the first missing argument.
    pub fn check_args(&self, args: &BTreeMap<String, Value>) -> Result<(), Violation> {
        for field in &self.arguments {
            if field.required && !args.contains_key(&field.name) {
                return Err(Violation::new(format!(
                    "missing required argument '{}'",
                    field.name
                )));
            }
        }
        Ok(())
    }

    /// Outbound check before transmission: every argument against its
    /// constraint, then required-presence.
    ///
    /// # Errors
    ///
    /// Returns the first argument [`Violation`].
    pub fn check_all_args(&self, args: &BTreeMap<String, Value>) -> Result<(), Violation> {
        for (name, value) in args {
            let (accept, constraint) = self.arg_constraint(name)?;
            if !accept {
                continue;
            }
            if let Some(c) = constraint {
                c.check_object(value).map_err(|mut v| {
                    v.set_location(format!("{}({})", self.name, name));
                    v
                })?;
            }
        }
        self.check_args(args)
    }

    /// Check a result value against the response constraint. `inbound`
    /// selects the context annotation on failure.
    ///
    /// # Errors
    ///
    /// Returns the annotated [`Violation`].
    pub fn check_results(&self, result: &Value, inbound: bool) -> Result<(), Violation> {
        let Some(response) = &self.response else { return Ok(()) };
        response.check_object(result).map_err(|v| {
            v.annotated(if inbound { "in inbound method results" } else { "in outbound method results" })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(c: &Constraint) -> Result<u64, UnboundedSchema> {
        c.max_size(&mut Vec::new())
    }

    #[test]
    fn string_constraint_rejects_by_size_before_buffering() {
        let c = Constraint::ByteString { max_length: Some(10) };
        assert!(c.check_token(TokenTag::String, 10).is_ok());
        let err = c.check_token(TokenTag::String, 11).unwrap_err();
        assert!(matches!(err, TokenError::Violation(_)));
        // and the wrong kind entirely
        assert!(matches!(
            c.check_token(TokenTag::Int, 0),
            Err(TokenError::Violation(_))
        ));
    }

    #[test]
    fn strict_tasters_are_fatal() {
        let c = Constraint::Boolean(None);
        assert!(matches!(
            c.check_token(TokenTag::String, 3),
            Err(TokenError::Fatal(_))
        ));
        assert!(c.check_token(TokenTag::Open, 0).is_ok());
    }

    #[test]
    fn opentype_prefix_matching() {
        let c = Constraint::Failure;
        assert!(c.check_opentype(&Opentype::of(&["copyable"])).is_ok());
        assert!(c.check_opentype(&Opentype::of(&["copyable", "failure"])).is_ok());
        assert!(c.check_opentype(&Opentype::of(&["copyable", "other"])).is_err());
        assert!(c.check_opentype(&Opentype::of(&["list"])).is_err());
    }

    #[test]
    fn container_bounds_compose() {
        let list = Constraint::List {
            item: Arc::new(Constraint::Integer { max_bytes: None }),
            max_length: Some(4),
        };
        let expected = OPEN_BYTES + 4 * INT_BYTES;
        assert_eq!(bound(&list), Ok(expected));
        assert_eq!(list.max_depth(&mut Vec::new()), Ok(2));

        let unbounded = Constraint::List {
            item: Arc::new(Constraint::Any),
            max_length: Some(4),
        };
        assert_eq!(bound(&unbounded), Err(UnboundedSchema));
    }

    #[test]
    fn shared_subtree_recursion_is_unbounded_not_a_hang() {
        // A schema that contains itself through an Arc'd alternative.
        let leaf = Arc::new(Constraint::Integer { max_bytes: None });
        let poly = Arc::new(Constraint::Poly(vec![Arc::clone(&leaf)]));
        let nested = Constraint::List { item: Arc::clone(&poly), max_length: Some(2) };
        assert!(bound(&nested).is_ok());

        // revisiting the same node within one walk reports unbounded
        let mut seen = vec![poly.as_ref() as *const Constraint];
        assert_eq!(poly.max_size(&mut seen), Err(UnboundedSchema));
    }

    #[test]
    fn object_checks() {
        let c = Constraint::Tuple(vec![
            Arc::new(Constraint::Integer { max_bytes: None }),
            Arc::new(Constraint::ByteString { max_length: Some(5) }),
        ]);
        let good = Value::tuple(vec![Value::Int(3), Value::Bytes(b"ok".to_vec())]);
        assert!(c.check_object(&good).is_ok());
        let wrong_arity = Value::tuple(vec![Value::Int(3)]);
        assert!(c.check_object(&wrong_arity).is_err());
        let too_long = Value::tuple(vec![Value::Int(3), Value::Bytes(b"toolong".to_vec())]);
        assert!(c.check_object(&too_long).is_err());
    }

    #[test]
    fn method_schema_argument_mapping() {
        let schema = MethodSchema::new(
            "add",
            vec![
                ("a", Constraint::Integer { max_bytes: None }),
                ("b", Constraint::Integer { max_bytes: None }),
            ],
            Some(Constraint::Integer { max_bytes: None }),
        );

        let args = schema
            .map_arguments(vec![Value::Int(1)], BTreeMap::from([("b".into(), Value::Int(2))]))
            .unwrap();
        assert!(schema.check_all_args(&args).is_ok());

        let dup = schema.map_arguments(
            vec![Value::Int(1)],
            BTreeMap::from([("a".into(), Value::Int(2))]),
        );
        assert!(dup.is_err());

        let missing = BTreeMap::from([("a".into(), Value::Int(1))]);
        let err = schema.check_args(&missing).unwrap_err();
        assert!(err.message.contains("missing required argument 'b'"));

        let err = schema.check_results(&Value::Bytes(b"no".to_vec()), true).unwrap_err();
        assert!(err.message.contains("in inbound method results"));
    }
}
