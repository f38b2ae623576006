//! Builtin unslicers for the container and leaf opentypes.
//!
//! Cycle handling follows the mutability split: mutable containers
//! (lists, dicts, sets) register their shared allocation in the reference
//! table from `start`, *before* being populated, so a descendant
//! `reference` token pointing back at an ancestor resolves to the
//! still-filling container itself. Immutable tuples register a promise
//! instead and resolve it once every element (including cyclic ones) is
//! available; the completion state lives behind an `Arc` because the
//! resolution may happen after the frame has left the stack.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;

use banana_proto::{BananaError, TokenError, TokenTag, Violation};

use crate::promise::Promise;
use crate::registry;
use crate::schema::{Constraint, Opentype};
use crate::unslicer::{Closed, Obj, UnsliceCx, Unslicer, VocabTable};
use crate::value::{CopyableValue, Key, Value};

fn constraint_token_check(
    constraint: &Option<Arc<Constraint>>,
    tag: TokenTag,
    size: u64,
) -> Result<(), TokenError> {
    match constraint {
        Some(c) => c.check_token(tag, size),
        None => Ok(()),
    }
}

fn open_with_constraint(
    constraint: &Option<Arc<Constraint>>,
    opentype: &Opentype,
    cx: &mut UnsliceCx<'_>,
) -> Result<Option<Box<dyn Unslicer>>, Violation> {
    if let Some(c) = constraint {
        c.check_opentype(opentype)?;
    }
    let child = cx.open_child(opentype)?;
    Ok(child.map(|mut child| {
        if let Some(c) = constraint {
            child.set_constraint(Arc::clone(c));
        }
        child
    }))
}

/// `("list",)` — a mutable sequence, registered before population.
#[derive(Default)]
pub struct ListUnslicer {
    list: Option<Arc<Mutex<Vec<Value>>>>,
    max_length: Option<u64>,
    item_constraint: Option<Arc<Constraint>>,
}

impl ListUnslicer {
    fn full(&self) -> bool {
        match (&self.list, self.max_length) {
            (Some(list), Some(max)) => list.lock().len() as u64 >= max,
            _ => false,
        }
    }
}

impl Unslicer for ListUnslicer {
    fn set_constraint(&mut self, constraint: Arc<Constraint>) {
        if let Constraint::List { item, max_length } = &*constraint {
            self.item_constraint = Some(Arc::clone(item));
            self.max_length = *max_length;
        }
    }

    fn start(&mut self, count: u64, cx: &mut UnsliceCx<'_>) -> Result<(), Violation> {
        let list = Arc::new(Mutex::new(Vec::new()));
        self.list = Some(Arc::clone(&list));
        cx.set_object(count, Obj::Ready(Value::List(list)));
        Ok(())
    }

    fn check_token(&self, tag: TokenTag, size: u64) -> Result<(), TokenError> {
        if self.full() {
            return Err(Violation::new("the list is full").into());
        }
        constraint_token_check(&self.item_constraint, tag, size)
    }

    fn do_open(
        &mut self,
        opentype: &Opentype,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        if self.full() {
            return Err(Violation::new("the list is full"));
        }
        open_with_constraint(&self.item_constraint, opentype, cx)
    }

    fn receive_child(
        &mut self,
        obj: Obj,
        _ready: Option<Promise<Value>>,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        if self.full() {
            return Err(Violation::new("the list is full"));
        }
        let list = self.list.as_ref().expect("started");
        match obj {
            Obj::Ready(v) => list.lock().push(v),
            Obj::Pending(p) => {
                // placeholder now, real value patched in at resolution
                let index = {
                    let mut guard = list.lock();
                    guard.push(Value::None);
                    guard.len() - 1
                };
                let list = Arc::clone(list);
                p.when_resolved(move |v| {
                    list.lock()[index] = v.clone();
                });
            }
        }
        Ok(())
    }

    fn receive_close(&mut self, _cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        Ok(Closed::ready(Value::List(Arc::clone(self.list.as_ref().expect("started")))))
    }

    fn describe(&self) -> String {
        let len = self.list.as_ref().map_or(0, |l| l.lock().len());
        format!("[{}]", len)
    }
}

struct TupleState {
    items: Mutex<Vec<Value>>,
    unresolved: Mutex<usize>,
    finished: Mutex<bool>,
    promise: Promise<Value>,
}

impl TupleState {
    fn try_complete(&self) -> Option<Value> {
        if !*self.finished.lock() || *self.unresolved.lock() > 0 {
            return None;
        }
        let tuple = Value::Tuple(Arc::new(self.items.lock().clone()));
        self.promise.resolve(tuple.clone());
        Some(tuple)
    }
}

/// `("tuple",)` — immutable, so cycles resolve through a promise that
/// fires once every element is available.
pub struct TupleUnslicer {
    state: Arc<TupleState>,
    constraints: Option<Vec<Arc<Constraint>>>,
}

impl Default for TupleUnslicer {
    fn default() -> Self {
        Self {
            state: Arc::new(TupleState {
                items: Mutex::new(Vec::new()),
                unresolved: Mutex::new(0),
                finished: Mutex::new(false),
                promise: Promise::new(),
            }),
            constraints: None,
        }
    }
}

impl TupleUnslicer {
    fn position_constraint(&self) -> Result<Option<Arc<Constraint>>, Violation> {
        let Some(constraints) = &self.constraints else { return Ok(None) };
        let at = self.state.items.lock().len();
        match constraints.get(at) {
            Some(c) => Ok(Some(Arc::clone(c))),
            None => Err(Violation::new("the tuple is full")),
        }
    }
}

impl Unslicer for TupleUnslicer {
    fn set_constraint(&mut self, constraint: Arc<Constraint>) {
        if let Constraint::Tuple(elements) = &*constraint {
            self.constraints = Some(elements.clone());
        }
    }

    fn start(&mut self, count: u64, cx: &mut UnsliceCx<'_>) -> Result<(), Violation> {
        cx.set_object(count, Obj::Pending(self.state.promise.clone()));
        Ok(())
    }

    fn check_token(&self, tag: TokenTag, size: u64) -> Result<(), TokenError> {
        constraint_token_check(&self.position_constraint()?, tag, size)
    }

    fn do_open(
        &mut self,
        opentype: &Opentype,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        open_with_constraint(&self.position_constraint()?, opentype, cx)
    }

    fn receive_child(
        &mut self,
        obj: Obj,
        _ready: Option<Promise<Value>>,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        match obj {
            Obj::Ready(v) => self.state.items.lock().push(v),
            Obj::Pending(p) => {
                let index = {
                    let mut items = self.state.items.lock();
                    items.push(Value::None);
                    items.len() - 1
                };
                *self.state.unresolved.lock() += 1;
                let state = Arc::clone(&self.state);
                p.when_resolved(move |v| {
                    state.items.lock()[index] = v.clone();
                    *state.unresolved.lock() -= 1;
                    state.try_complete();
                });
            }
        }
        Ok(())
    }

    fn receive_close(&mut self, _cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        if let Some(constraints) = &self.constraints {
            if self.state.items.lock().len() != constraints.len() {
                return Err(Violation::new("wrong size tuple"));
            }
        }
        *self.state.finished.lock() = true;
        match self.state.try_complete() {
            Some(tuple) => Ok(Closed::ready(tuple)),
            None => Ok(Closed::Obj {
                obj: Obj::Pending(self.state.promise.clone()),
                ready: None,
            }),
        }
    }

    fn describe(&self) -> String {
        format!("[{}]", self.state.items.lock().len())
    }
}

/// `("set",)` and `("immutable-set",)`. Elements are keys, so no cycle
/// bookkeeping applies; a pending or unhashable element is stream
/// corruption.
pub struct SetUnslicer {
    set: Option<Arc<Mutex<BTreeSet<Key>>>>,
    immutable: bool,
    items: BTreeSet<Key>,
}

impl SetUnslicer {
    /// A mutable-set unslicer.
    #[must_use]
    pub fn mutable() -> Self {
        Self { set: None, immutable: false, items: BTreeSet::new() }
    }

    /// An immutable-set unslicer.
    #[must_use]
    pub fn immutable() -> Self {
        Self { set: None, immutable: true, items: BTreeSet::new() }
    }
}

impl Unslicer for SetUnslicer {
    fn start(&mut self, count: u64, cx: &mut UnsliceCx<'_>) -> Result<(), Violation> {
        if !self.immutable {
            let set = Arc::new(Mutex::new(BTreeSet::new()));
            self.set = Some(Arc::clone(&set));
            cx.set_object(count, Obj::Ready(Value::Set(set)));
        }
        Ok(())
    }

    fn do_open(
        &mut self,
        opentype: &Opentype,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        cx.open_child(opentype)
    }

    fn receive_child(
        &mut self,
        obj: Obj,
        _ready: Option<Promise<Value>>,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        let key = match &obj {
            Obj::Ready(v) => v.to_key(),
            Obj::Pending(_) => None,
        };
        let Some(key) = key else {
            return Err(cx.abandon(BananaError::new("unhashable set element")));
        };
        match &self.set {
            Some(set) => {
                set.lock().insert(key);
            }
            None => {
                self.items.insert(key);
            }
        }
        Ok(())
    }

    fn receive_close(&mut self, _cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        match &self.set {
            Some(set) => Ok(Closed::ready(Value::Set(Arc::clone(set)))),
            None => Ok(Closed::ready(Value::ImmutableSet(Arc::new(std::mem::take(
                &mut self.items,
            ))))),
        }
    }

    fn describe(&self) -> String {
        let len = match &self.set {
            Some(set) => set.lock().len(),
            None => self.items.len(),
        };
        format!("{{set:{}}}", len)
    }
}

/// `("dict",)` — alternating key/value children.
#[derive(Default)]
pub struct DictUnslicer {
    dict: Option<Arc<Mutex<BTreeMap<Key, Value>>>>,
    key: Option<Key>,
    getting_key: bool,
    key_constraint: Option<Arc<Constraint>>,
    value_constraint: Option<Arc<Constraint>>,
    max_keys: Option<u64>,
}

impl DictUnslicer {
    fn active_constraint(&self) -> &Option<Arc<Constraint>> {
        if self.getting_key {
            &self.key_constraint
        } else {
            &self.value_constraint
        }
    }

    fn full(&self) -> bool {
        match (&self.dict, self.max_keys) {
            (Some(d), Some(max)) => d.lock().len() as u64 >= max,
            _ => false,
        }
    }
}

impl Unslicer for DictUnslicer {
    fn set_constraint(&mut self, constraint: Arc<Constraint>) {
        if let Constraint::Dict { key, value, max_keys } = &*constraint {
            self.key_constraint = Some(Arc::clone(key));
            self.value_constraint = Some(Arc::clone(value));
            self.max_keys = *max_keys;
        }
    }

    fn start(&mut self, count: u64, cx: &mut UnsliceCx<'_>) -> Result<(), Violation> {
        let dict = Arc::new(Mutex::new(BTreeMap::new()));
        self.dict = Some(Arc::clone(&dict));
        self.getting_key = true;
        cx.set_object(count, Obj::Ready(Value::Dict(dict)));
        Ok(())
    }

    fn check_token(&self, tag: TokenTag, size: u64) -> Result<(), TokenError> {
        if self.full() {
            return Err(Violation::new("the dict is full").into());
        }
        constraint_token_check(self.active_constraint(), tag, size)
    }

    fn do_open(
        &mut self,
        opentype: &Opentype,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        if self.full() {
            return Err(Violation::new("the dict is full"));
        }
        let constraint = self.active_constraint().clone();
        open_with_constraint(&constraint, opentype, cx)
    }

    fn receive_child(
        &mut self,
        obj: Obj,
        _ready: Option<Promise<Value>>,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        let dict = Arc::clone(self.dict.as_ref().expect("started"));
        if self.getting_key {
            let key = match &obj {
                Obj::Ready(v) => v.to_key(),
                Obj::Pending(_) => {
                    return Err(cx.abandon(BananaError::new(
                        "incomplete object as dictionary key",
                    )))
                }
            };
            let Some(key) = key else {
                return Err(cx.abandon(BananaError::new("unhashable dictionary key")));
            };
            if dict.lock().contains_key(&key) {
                return Err(cx.abandon(BananaError::new(format!(
                    "duplicate key {:?}",
                    key
                ))));
            }
            self.key = Some(key);
        } else {
            let key = self.key.take().expect("value follows key");
            match obj {
                Obj::Ready(v) => {
                    dict.lock().insert(key, v);
                }
                Obj::Pending(p) => {
                    dict.lock().insert(key.clone(), Value::None);
                    p.when_resolved(move |v| {
                        dict.lock().insert(key, v.clone());
                    });
                }
            }
        }
        self.getting_key = !self.getting_key;
        Ok(())
    }

    fn receive_close(&mut self, cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        if !self.getting_key {
            return Err(cx.abandon(BananaError::new("dict ended between key and value")));
        }
        Ok(Closed::ready(Value::Dict(Arc::clone(self.dict.as_ref().expect("started")))))
    }

    fn describe(&self) -> String {
        match (&self.key, self.getting_key) {
            (Some(key), false) => format!("{{}}[{:?}]", key),
            _ => "{}".to_string(),
        }
    }
}

/// `("none",)` — no body tokens at all.
#[derive(Default)]
pub struct NoneUnslicer;

impl Unslicer for NoneUnslicer {
    fn check_token(&self, _tag: TokenTag, _size: u64) -> Result<(), TokenError> {
        Err(BananaError::new("a none sequence does not accept any tokens").into())
    }

    fn do_open(
        &mut self,
        _opentype: &Opentype,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        Err(Violation::new("a none sequence does not accept sub-objects"))
    }

    fn receive_child(
        &mut self,
        _obj: Obj,
        _ready: Option<Promise<Value>>,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        Err(Violation::new("a none sequence does not accept children"))
    }

    fn receive_close(&mut self, _cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        Ok(Closed::ready(Value::None))
    }

    fn describe(&self) -> String {
        "<none>".to_string()
    }
}

/// `("boolean",)` — exactly one INT body token, 0 or 1.
#[derive(Default)]
pub struct BooleanUnslicer {
    value: Option<bool>,
    forced: Option<bool>,
    constrained: bool,
}

impl Unslicer for BooleanUnslicer {
    fn set_constraint(&mut self, constraint: Arc<Constraint>) {
        if let Constraint::Boolean(forced) = &*constraint {
            self.constrained = true;
            self.forced = *forced;
        }
    }

    fn check_token(&self, tag: TokenTag, _size: u64) -> Result<(), TokenError> {
        if tag != TokenTag::Int {
            return Err(BananaError::new("boolean sequences only accept an INT token").into());
        }
        if self.value.is_some() {
            return Err(BananaError::new("boolean sequences only accept one token").into());
        }
        Ok(())
    }

    fn do_open(
        &mut self,
        _opentype: &Opentype,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        Err(Violation::new("boolean sequences do not accept sub-objects"))
    }

    fn receive_child(
        &mut self,
        obj: Obj,
        _ready: Option<Promise<Value>>,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        let Obj::Ready(Value::Int(i)) = obj else {
            return Err(Violation::new("boolean body must be an integer"));
        };
        let value = i != 0;
        if let Some(want) = self.forced {
            if value != want {
                return Err(Violation::new(format!("this boolean can only be {}", want)));
            }
        }
        self.value = Some(value);
        Ok(())
    }

    fn receive_close(&mut self, _cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        Ok(Closed::ready(Value::Bool(self.value.unwrap_or(false))))
    }

    fn describe(&self) -> String {
        "<bool>".to_string()
    }
}

/// `("unicode",)` — one UTF-8 encoded STRING body token.
#[derive(Default)]
pub struct UnicodeUnslicer {
    string: Option<String>,
    max_length: Option<u64>,
}

impl Unslicer for UnicodeUnslicer {
    fn set_constraint(&mut self, constraint: Arc<Constraint>) {
        match &*constraint {
            Constraint::Unicode { max_length } | Constraint::ByteString { max_length } => {
                self.max_length = *max_length;
            }
            _ => {}
        }
    }

    fn check_token(&self, tag: TokenTag, size: u64) -> Result<(), TokenError> {
        if tag != TokenTag::String && tag != TokenTag::Vocab {
            return Err(BananaError::new("unicode sequences only accept strings").into());
        }
        if self.string.is_some() {
            return Err(BananaError::new("already received a string").into());
        }
        if let Some(max) = self.max_length {
            if size > max {
                return Err(Violation::new(format!("token too large: {}>{}", size, max)).into());
            }
        }
        Ok(())
    }

    fn do_open(
        &mut self,
        _opentype: &Opentype,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        Err(Violation::new("unicode sequences do not accept sub-objects"))
    }

    fn receive_child(
        &mut self,
        obj: Obj,
        _ready: Option<Promise<Value>>,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        let Obj::Ready(Value::Bytes(bytes)) = obj else {
            return Err(Violation::new("unicode body must be a string"));
        };
        match String::from_utf8(bytes) {
            Ok(s) => {
                self.string = Some(s);
                Ok(())
            }
            Err(_) => Err(Violation::new("invalid UTF-8 in unicode sequence")),
        }
    }

    fn receive_close(&mut self, _cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        match self.string.take() {
            Some(s) => Ok(Closed::ready(Value::Unicode(s))),
            None => Err(Violation::new("unicode sequence without a body")),
        }
    }

    fn describe(&self) -> String {
        "<unicode>".to_string()
    }
}

/// `("reference",)` — resolve a back-reference to an earlier object in
/// this scope. An unknown id is stream corruption, not a policy matter.
#[derive(Default)]
pub struct ReferenceUnslicer {
    obj: Option<Obj>,
    constraint: Option<Arc<Constraint>>,
}

impl Unslicer for ReferenceUnslicer {
    fn set_constraint(&mut self, constraint: Arc<Constraint>) {
        self.constraint = Some(constraint);
    }

    fn check_token(&self, tag: TokenTag, _size: u64) -> Result<(), TokenError> {
        if tag != TokenTag::Int {
            return Err(BananaError::new("reference sequences only accept INTs").into());
        }
        if self.obj.is_some() {
            return Err(BananaError::new("reference sequences only accept one int").into());
        }
        Ok(())
    }

    fn do_open(
        &mut self,
        _opentype: &Opentype,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        Err(Violation::new("reference sequences do not accept sub-objects"))
    }

    fn receive_child(
        &mut self,
        obj: Obj,
        _ready: Option<Promise<Value>>,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        let Obj::Ready(Value::Int(id)) = obj else {
            return Err(Violation::new("reference body must be an integer"));
        };
        if id < 0 {
            return Err(cx.abandon(BananaError::new("negative reference id")));
        }
        let Some(referenced) = cx.get_object(id as u64) else {
            return Err(cx.abandon(BananaError::new(format!("dangling reference {}", id))));
        };
        if let (Some(c), Obj::Ready(v)) = (&self.constraint, &referenced) {
            // the referenced object was validated under whatever schema
            // was in effect when it arrived; this position's schema must
            // also agree
            c.check_object(v)?;
        }
        self.obj = Some(referenced);
        Ok(())
    }

    fn receive_close(&mut self, cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        match self.obj.take() {
            Some(obj) => Ok(Closed::Obj { obj, ready: None }),
            None => Err(cx.abandon(BananaError::new("reference sequence ended too early"))),
        }
    }

    fn describe(&self) -> String {
        "<reference>".to_string()
    }
}

/// `("vocab",)` — alternating INT keys and STRING values, top level only.
#[derive(Default)]
pub struct VocabUnslicer {
    table: VocabTable,
    key: Option<u64>,
}

impl Unslicer for VocabUnslicer {
    fn check_token(&self, tag: TokenTag, _size: u64) -> Result<(), TokenError> {
        if self.key.is_none() {
            if tag != TokenTag::Int {
                return Err(BananaError::new("vocab tables only accept INT keys").into());
            }
        } else if tag != TokenTag::String {
            return Err(BananaError::new("vocab tables only accept STRING values").into());
        }
        Ok(())
    }

    fn do_open(
        &mut self,
        _opentype: &Opentype,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        Err(Violation::new("vocab tables do not accept sub-objects"))
    }

    fn receive_child(
        &mut self,
        obj: Obj,
        _ready: Option<Promise<Value>>,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        match self.key.take() {
            None => {
                let Obj::Ready(Value::Int(k)) = obj else {
                    return Err(Violation::new("vocab key must be an integer"));
                };
                if k < 0 {
                    return Err(Violation::new("vocab keys must be non-negative"));
                }
                if self.table.contains_key(&(k as u64)) {
                    return Err(cx.abandon(BananaError::new(format!(
                        "duplicate vocab key {}",
                        k
                    ))));
                }
                self.key = Some(k as u64);
            }
            Some(key) => {
                let Obj::Ready(Value::Bytes(bytes)) = obj else {
                    return Err(Violation::new("vocab value must be a string"));
                };
                self.table.insert(key, bytes);
            }
        }
        Ok(())
    }

    fn receive_close(&mut self, cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        if self.key.is_some() {
            return Err(cx.abandon(BananaError::new("vocab table ended between key and value")));
        }
        Ok(Closed::Vocab(std::mem::take(&mut self.table)))
    }

    fn describe(&self) -> String {
        match self.key {
            Some(k) => format!("<vocabdict>[{}]", k),
            None => "<vocabdict>".to_string(),
        }
    }
}

/// `("copyable", classname)` — named fields for a registered class.
pub struct CopyableUnslicer {
    class_name: String,
    post_check: Option<Arc<Constraint>>,
    attr_name: Option<String>,
    fields: BTreeMap<String, Value>,
}

impl CopyableUnslicer {
    /// Unslicer for one registered copyable class; `post_check` runs on
    /// the completed object.
    #[must_use]
    pub fn new(class_name: String, post_check: Option<Arc<Constraint>>) -> Self {
        Self { class_name, post_check, attr_name: None, fields: BTreeMap::new() }
    }
}

impl Unslicer for CopyableUnslicer {
    fn check_token(&self, tag: TokenTag, size: u64) -> Result<(), TokenError> {
        if self.attr_name.is_none() {
            if tag != TokenTag::String && tag != TokenTag::Vocab {
                return Err(BananaError::new("copyable field names must be strings").into());
            }
            if size > registry::MAX_ATTRIBUTE_NAME_LEN {
                return Err(Violation::new("copyable field name too long").into());
            }
        }
        Ok(())
    }

    fn do_open(
        &mut self,
        opentype: &Opentype,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        if self.attr_name.is_none() {
            return Err(Violation::new("copyable field name must be a string, not an object"));
        }
        cx.open_child(opentype)
    }

    fn receive_child(
        &mut self,
        obj: Obj,
        _ready: Option<Promise<Value>>,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        match self.attr_name.take() {
            None => {
                let Obj::Ready(Value::Bytes(bytes)) = obj else {
                    return Err(Violation::new("copyable field name must be a string"));
                };
                let name = String::from_utf8(bytes)
                    .map_err(|_| Violation::new("copyable field name must be UTF-8"))?;
                if self.fields.contains_key(&name) {
                    return Err(cx.abandon(BananaError::new(format!(
                        "duplicate attribute name '{}'",
                        name
                    ))));
                }
                self.attr_name = Some(name);
            }
            Some(name) => match obj {
                Obj::Ready(v) => {
                    self.fields.insert(name, v);
                }
                Obj::Pending(_) => {
                    return Err(cx
                        .abandon(BananaError::new("unreferenceable object in attribute")));
                }
            },
        }
        Ok(())
    }

    fn receive_close(&mut self, cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        if self.attr_name.is_some() {
            return Err(cx.abandon(BananaError::new("copyable ended between name and value")));
        }
        let value = Value::Copyable(Arc::new(CopyableValue {
            class_name: std::mem::take(&mut self.class_name),
            fields: std::mem::take(&mut self.fields),
        }));
        if let Some(c) = &self.post_check {
            c.check_object(&value)?;
        }
        Ok(Closed::ready(value))
    }

    fn describe(&self) -> String {
        match &self.attr_name {
            Some(name) => format!("<{}>.{}", self.class_name, name),
            None => format!("<{}>", self.class_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_constraint_narrowing() {
        let mut u = ListUnslicer::default();
        u.set_constraint(Arc::new(Constraint::List {
            item: Arc::new(Constraint::Integer { max_bytes: None }),
            max_length: Some(2),
        }));
        assert!(u.check_token(TokenTag::Int, 0).is_ok());
        assert!(matches!(
            u.check_token(TokenTag::String, 3),
            Err(TokenError::Violation(_))
        ));
    }

    #[test]
    fn boolean_rejects_extra_tokens() {
        let mut u = BooleanUnslicer::default();
        assert!(u.check_token(TokenTag::Int, 1).is_ok());
        u.value = Some(true);
        assert!(matches!(
            u.check_token(TokenTag::Int, 0),
            Err(TokenError::Fatal(_))
        ));
    }
}
