//! Opentype resolution and the process-wide registries.
//!
//! A [`Registry`] is a flat map from opentype to unslicer factory, split
//! into a top-level table and a below-top-level table, fixed at
//! construction. The process-wide tables — copyable class names and
//! remote interfaces — are mutex-guarded and populated at startup;
//! registering the same name twice is a configuration error, never a
//! silent overwrite.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use banana_proto::Violation;

use crate::schema::{failure_constraint, Constraint, MethodSchema, Opentype};
use crate::unslicer::Unslicer;
use crate::unslicers::{
    BooleanUnslicer, CopyableUnslicer, DictUnslicer, ListUnslicer, NoneUnslicer,
    ReferenceUnslicer, SetUnslicer, TupleUnslicer, UnicodeUnslicer, VocabUnslicer,
};

/// Copyable field names longer than this are rejected before buffering.
pub const MAX_ATTRIBUTE_NAME_LEN: u64 = 200;

type Factory = Box<dyn Fn() -> Box<dyn Unslicer> + Send + Sync>;

/// Duplicate registration under an already-taken name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{0}' is already registered")]
pub struct AlreadyRegistered(pub String);

/// Maps opentypes to unslicer factories for one connection flavor.
pub struct Registry {
    top: HashMap<Opentype, Factory>,
    open: HashMap<Opentype, Factory>,
    max_index_len: u64,
}

fn builtin_table() -> HashMap<Opentype, Factory> {
    let mut table: HashMap<Opentype, Factory> = HashMap::new();
    let mut put = |name: &str, f: Factory| {
        table.insert(Opentype::of(&[name]), f);
    };
    put("list", Box::new(|| Box::new(ListUnslicer::default()) as Box<dyn Unslicer>));
    put("tuple", Box::new(|| Box::new(TupleUnslicer::default()) as Box<dyn Unslicer>));
    put("dict", Box::new(|| Box::new(DictUnslicer::default()) as Box<dyn Unslicer>));
    put("set", Box::new(|| Box::new(SetUnslicer::mutable()) as Box<dyn Unslicer>));
    put("immutable-set", Box::new(|| Box::new(SetUnslicer::immutable()) as Box<dyn Unslicer>));
    put("none", Box::new(|| Box::new(NoneUnslicer) as Box<dyn Unslicer>));
    put("boolean", Box::new(|| Box::new(BooleanUnslicer::default()) as Box<dyn Unslicer>));
    put("unicode", Box::new(|| Box::new(UnicodeUnslicer::default()) as Box<dyn Unslicer>));
    put("reference", Box::new(|| Box::new(ReferenceUnslicer::default()) as Box<dyn Unslicer>));
    table
}

impl Registry {
    /// Registry for plain serialization connections: every builtin type
    /// at every level.
    #[must_use]
    pub fn banana() -> Self {
        ensure_builtin_copyables();
        Self::from_tables(builtin_table(), builtin_table())
    }

    /// Registry for broker connections: `call`/`answer`/`error` at top
    /// level, builtins plus the capability opentypes below.
    #[must_use]
    pub fn pb() -> Self {
        ensure_builtin_copyables();
        let mut top: HashMap<Opentype, Factory> = HashMap::new();
        top.insert(
            Opentype::of(&["call"]),
            Box::new(|| Box::new(crate::call::CallUnslicer::default()) as Box<dyn Unslicer>),
        );
        top.insert(
            Opentype::of(&["answer"]),
            Box::new(|| Box::new(crate::call::AnswerUnslicer::default()) as Box<dyn Unslicer>),
        );
        top.insert(
            Opentype::of(&["error"]),
            Box::new(|| Box::new(crate::call::ErrorUnslicer::default()) as Box<dyn Unslicer>),
        );

        let mut open = builtin_table();
        open.insert(
            Opentype::of(&["my-reference"]),
            Box::new(|| {
                Box::new(crate::call::MyReferenceUnslicer::default()) as Box<dyn Unslicer>
            }),
        );
        open.insert(
            Opentype::of(&["your-reference"]),
            Box::new(|| {
                Box::new(crate::call::YourReferenceUnslicer::default()) as Box<dyn Unslicer>
            }),
        );
        open.insert(
            Opentype::of(&["their-reference"]),
            Box::new(|| {
                Box::new(crate::call::TheirReferenceUnslicer::default()) as Box<dyn Unslicer>
            }),
        );
        Self::from_tables(top, open)
    }

    fn from_tables(top: HashMap<Opentype, Factory>, open: HashMap<Opentype, Factory>) -> Self {
        let max_index_len = top
            .keys()
            .chain(open.keys())
            .filter_map(|k| k.first().map(|p| p.len() as u64))
            .chain(["copyable".len() as u64, "vocab".len() as u64])
            .max()
            .unwrap_or(0);
        Self { top, open, max_index_len }
    }

    /// Resolve an accumulated opentype into an unslicer. `Ok(None)` means
    /// more index tokens are required before committing.
    ///
    /// # Errors
    ///
    /// [`Violation`] for opentypes that cannot match anything registered.
    pub fn open(
        &self,
        opentype: &Opentype,
        top_level: bool,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        if top_level && *opentype == Opentype::of(&["vocab"]) {
            return Ok(Some(Box::<VocabUnslicer>::default()));
        }
        if opentype.first() == Some(b"copyable") {
            return match opentype.len() {
                1 => Ok(None),
                2 => {
                    let class_name = String::from_utf8_lossy(&opentype.0[1]).into_owned();
                    match copyable_schema(&class_name) {
                        Some(constraint) => {
                            Ok(Some(Box::new(CopyableUnslicer::new(class_name, constraint))))
                        }
                        None => Err(Violation::new(format!(
                            "unknown copyable class '{}'",
                            class_name
                        ))),
                    }
                }
                _ => Err(Violation::new("copyable opentype has too many index tokens")),
            };
        }
        let table = if top_level { &self.top } else { &self.open };
        if let Some(factory) = table.get(opentype) {
            return Ok(Some(factory()));
        }
        if table.keys().any(|k| opentype.is_prefix_of(k) && k.len() > opentype.len()) {
            return Ok(None);
        }
        Err(Violation::new(format!(
            "unknown {}OPEN type {:?}",
            if top_level { "top-level " } else { "" },
            opentype
        )))
    }

    /// Upper bound on the next index token's length, given what has
    /// accumulated so far.
    #[must_use]
    pub fn max_index_token_len(&self, accumulated: &Opentype) -> u64 {
        if accumulated.first() == Some(b"copyable") {
            return max_copyable_name_len();
        }
        self.max_index_len
    }
}

static COPYABLES: Lazy<RwLock<HashMap<String, Option<Arc<Constraint>>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static REMOTE_INTERFACES: Lazy<RwLock<HashMap<String, Arc<RemoteInterface>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn ensure_builtin_copyables() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        COPYABLES
            .write()
            .entry(crate::failure::FAILURE_CLASS.to_string())
            .or_insert_with(|| Some(Arc::new(failure_constraint())));
    });
}

/// Register a copyable class name, with an optional constraint applied to
/// every received instance.
///
/// # Errors
///
/// [`AlreadyRegistered`] if the name is taken.
pub fn register_copyable(
    name: &str,
    constraint: Option<Constraint>,
) -> Result<(), AlreadyRegistered> {
    ensure_builtin_copyables();
    let mut table = COPYABLES.write();
    if table.contains_key(name) {
        return Err(AlreadyRegistered(name.to_string()));
    }
    table.insert(name.to_string(), constraint.map(Arc::new));
    Ok(())
}

/// The registered constraint for a copyable class; outer `None` means the
/// class is unknown.
#[must_use]
pub fn copyable_schema(name: &str) -> Option<Option<Arc<Constraint>>> {
    ensure_builtin_copyables();
    COPYABLES.read().get(name).cloned()
}

fn max_copyable_name_len() -> u64 {
    ensure_builtin_copyables();
    COPYABLES.read().keys().map(|k| k.len() as u64).max().unwrap_or(0)
}

/// A named collection of remotely-callable method schemas.
#[derive(Debug)]
pub struct RemoteInterface {
    /// The interface name capabilities claim on the wire.
    pub name: String,
    methods: HashMap<String, Arc<MethodSchema>>,
}

impl RemoteInterface {
    /// Build an interface from its method schemas.
    #[must_use]
    pub fn new(name: impl Into<String>, methods: Vec<MethodSchema>) -> Self {
        Self {
            name: name.into(),
            methods: methods.into_iter().map(|m| (m.name.clone(), Arc::new(m))).collect(),
        }
    }

    /// Look up one method's schema.
    #[must_use]
    pub fn method(&self, name: &str) -> Option<Arc<MethodSchema>> {
        self.methods.get(name).cloned()
    }
}

/// Register a remote interface at startup.
///
/// # Errors
///
/// [`AlreadyRegistered`] if the name is taken.
pub fn register_remote_interface(
    interface: RemoteInterface,
) -> Result<Arc<RemoteInterface>, AlreadyRegistered> {
    let mut table = REMOTE_INTERFACES.write();
    if table.contains_key(&interface.name) {
        return Err(AlreadyRegistered(interface.name));
    }
    let interface = Arc::new(interface);
    table.insert(interface.name.clone(), Arc::clone(&interface));
    Ok(interface)
}

/// Look up a registered remote interface.
#[must_use]
pub fn remote_interface(name: &str) -> Option<Arc<RemoteInterface>> {
    REMOTE_INTERFACES.read().get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_resolution() {
        let r = Registry::banana();
        assert!(r.open(&Opentype::of(&["list"]), false).unwrap().is_some());
        assert!(r.open(&Opentype::of(&["vocab"]), true).unwrap().is_some());
        assert!(r.open(&Opentype::of(&["vocab"]), false).is_err());
        assert!(r.open(&Opentype::of(&["no-such-type"]), false).is_err());
    }

    #[test]
    fn copyable_needs_two_index_tokens() {
        let r = Registry::banana();
        assert!(r.open(&Opentype::of(&["copyable"]), false).unwrap().is_none());
        assert!(r
            .open(&Opentype::of(&["copyable", "failure"]), false)
            .unwrap()
            .is_some());
        assert!(r.open(&Opentype::of(&["copyable", "no-such-class"]), false).is_err());
    }

    #[test]
    fn pb_top_level_is_restricted() {
        let r = Registry::pb();
        assert!(r.open(&Opentype::of(&["call"]), true).unwrap().is_some());
        assert!(r.open(&Opentype::of(&["list"]), true).is_err());
        assert!(r.open(&Opentype::of(&["list"]), false).unwrap().is_some());
        assert!(r.open(&Opentype::of(&["my-reference"]), false).unwrap().is_some());
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        register_copyable("test-dup-class", None).unwrap();
        assert_eq!(
            register_copyable("test-dup-class", None),
            Err(AlreadyRegistered("test-dup-class".to_string()))
        );
    }
}
