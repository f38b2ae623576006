//! The send-side stack machine.
//!
//! [`SendEngine::pump`] drains a FIFO queue of top-level items, driving a
//! stack of [`Slicer`] frames. Each frame produces its children one step
//! at a time: primitives become tokens immediately, composites push a
//! child frame (after the reference scope has had a chance to substitute
//! a back-reference), and exhaustion pops the frame and emits CLOSE.
//!
//! The OPEN/push pair is atomic with respect to failure: a child whose
//! slicer cannot even be constructed produces no OPEN (and therefore no
//! ABORT); a child that fails mid-body emits ABORT then CLOSE before the
//! failure propagates to its parent via `child_aborted`.

use std::collections::{BTreeMap, HashMap, VecDeque};

use bytes::BytesMut;

use banana_proto::{codec, limits, BananaError, Violation};

use crate::promise::Promise;
use crate::schema::Opentype;
use crate::unslicer::{CapabilityWire, EngineHooks};
use crate::value::{Key, Value};

/// Why a queued send did not complete.
#[derive(Debug, Clone, PartialEq)]
pub enum SendError {
    /// The object (or part of it) was rejected before or during slicing.
    Violation(Violation),
    /// The transport went away with the item still queued or in flight.
    ConnectionLost,
}

/// Completion value of one queued send.
pub type SendOutcome = Result<(), SendError>;

/// One step of a slicer's production.
pub enum SliceStep {
    /// The next child value.
    Item(Value),
    /// This frame is exhausted.
    Done,
}

/// A producer for one composite value's token sequence.
pub trait Slicer: Send {
    /// The index tokens announcing this frame.
    fn opentype(&self) -> Opentype;

    /// False only for synthetic frames that frame themselves (none in the
    /// builtin set).
    fn send_open(&self) -> bool {
        true
    }

    /// True when repeat sends of this object should become back-references.
    fn track_references(&self) -> bool {
        false
    }

    /// Whether descendants may suspend serialization under this frame.
    fn streamable(&self, parent: bool) -> bool {
        parent
    }

    /// Whether body strings of this frame may be vocab-compressed.
    fn allows_vocab(&self) -> bool {
        true
    }

    /// Produce the next child.
    ///
    /// # Errors
    ///
    /// A [`Violation`] abandons this frame: ABORT+CLOSE are emitted and
    /// the parent is notified.
    fn next(&mut self) -> Result<SliceStep, Violation>;

    /// A child of this frame failed. Return the violation to give up on
    /// this frame as well, or `None` to absorb and continue producing.
    fn child_aborted(&mut self, violation: Violation) -> Option<Violation> {
        Some(violation)
    }

    /// One path component for violation locations.
    fn describe(&self) -> String;

    /// Scoped frames: has `ident` already been sent in this scope?
    fn lookup_reference(&self, _ident: usize) -> Option<u64> {
        None
    }

    /// Scoped frames: record `ident` as sent under `refid`, keeping the
    /// value alive so the allocation cannot be reused within the scope.
    /// Return false to defer to an outer scope.
    fn register_reference(&mut self, _ident: usize, _refid: u64, _keep: &Value) -> bool {
        false
    }
}

/// Reference bookkeeping for one scope: identity to (kept value, refid).
#[derive(Default)]
pub struct SendScope {
    refs: HashMap<usize, (Value, u64)>,
}

impl SendScope {
    /// Look up an identity.
    #[must_use]
    pub fn lookup(&self, ident: usize) -> Option<u64> {
        self.refs.get(&ident).map(|(_, refid)| *refid)
    }

    /// Record an identity.
    pub fn register(&mut self, ident: usize, refid: u64, keep: &Value) {
        self.refs.insert(ident, (keep.clone(), refid));
    }

    /// Drop everything recorded.
    pub fn clear(&mut self) {
        self.refs.clear();
    }
}

/// Slicer over a fixed, precomputed token body. Used for references and
/// capability sequences, whose bodies are known at push time.
pub struct ConstSlicer {
    opentype: Opentype,
    body: VecDeque<Value>,
    desc: String,
}

impl ConstSlicer {
    /// Build from opentype parts and body values.
    #[must_use]
    pub fn new(opentype: Opentype, body: Vec<Value>, desc: impl Into<String>) -> Self {
        Self { opentype, body: body.into(), desc: desc.into() }
    }

    /// The back-reference sequence for an already-sent object.
    #[must_use]
    pub fn reference(refid: u64) -> Self {
        Self::new(
            Opentype::of(&["reference"]),
            vec![Value::Int(refid as i64)],
            format!("<reference-{}>", refid),
        )
    }

    /// The wire sequence for a capability.
    #[must_use]
    pub fn capability(wire: CapabilityWire) -> Self {
        match wire {
            CapabilityWire::MyReference { clid, interface, url } => {
                let mut body = vec![Value::Int(clid as i64)];
                if interface.is_some() || url.is_some() {
                    body.push(Value::Bytes(interface.unwrap_or_default().into_bytes()));
                    if let Some(url) = url {
                        body.push(Value::Bytes(url.into_bytes()));
                    }
                }
                Self::new(
                    Opentype::of(&["my-reference"]),
                    body,
                    format!("<my-reference-{}>", clid),
                )
            }
            CapabilityWire::YourReference { clid } => Self::new(
                Opentype::of(&["your-reference"]),
                vec![Value::Int(clid as i64)],
                format!("<your-reference-{}>", clid),
            ),
            CapabilityWire::TheirReference { gift_id, url } => Self::new(
                Opentype::of(&["their-reference"]),
                vec![Value::Int(gift_id as i64), Value::Bytes(url.into_bytes())],
                format!("<their-reference-{}>", gift_id),
            ),
        }
    }
}

impl Slicer for ConstSlicer {
    fn opentype(&self) -> Opentype {
        self.opentype.clone()
    }

    fn next(&mut self) -> Result<SliceStep, Violation> {
        Ok(match self.body.pop_front() {
            Some(v) => SliceStep::Item(v),
            None => SliceStep::Done,
        })
    }

    fn describe(&self) -> String {
        self.desc.clone()
    }
}

struct SeqSlicer {
    opentype: Opentype,
    items: Vec<Value>,
    at: usize,
    tracked: bool,
}

impl SeqSlicer {
    fn new(opentype: Opentype, items: Vec<Value>, tracked: bool) -> Self {
        Self { opentype, items, at: 0, tracked }
    }
}

impl Slicer for SeqSlicer {
    fn opentype(&self) -> Opentype {
        self.opentype.clone()
    }

    fn track_references(&self) -> bool {
        self.tracked
    }

    fn next(&mut self) -> Result<SliceStep, Violation> {
        if self.at >= self.items.len() {
            return Ok(SliceStep::Done);
        }
        self.at += 1;
        Ok(SliceStep::Item(self.items[self.at - 1].clone()))
    }

    fn describe(&self) -> String {
        format!("[{}]", self.at.saturating_sub(1))
    }
}

struct DictSlicer {
    entries: Vec<(Key, Value)>,
    at: usize,
    value_next: bool,
}

impl Slicer for DictSlicer {
    fn opentype(&self) -> Opentype {
        Opentype::of(&["dict"])
    }

    fn track_references(&self) -> bool {
        true
    }

    fn next(&mut self) -> Result<SliceStep, Violation> {
        if self.at >= self.entries.len() {
            return Ok(SliceStep::Done);
        }
        let (key, value) = &self.entries[self.at];
        if self.value_next {
            self.value_next = false;
            self.at += 1;
            Ok(SliceStep::Item(value.clone()))
        } else {
            self.value_next = true;
            Ok(SliceStep::Item(key.clone().into_value()))
        }
    }

    fn describe(&self) -> String {
        match self.entries.get(self.at) {
            Some((key, _)) if self.value_next => format!("{{}}[{:?}]", key),
            _ => "{}".to_string(),
        }
    }
}

struct CopyableSlicer {
    class_name: String,
    entries: Vec<(String, Value)>,
    at: usize,
    value_next: bool,
}

impl Slicer for CopyableSlicer {
    fn opentype(&self) -> Opentype {
        Opentype(vec![b"copyable".to_vec(), self.class_name.clone().into_bytes()])
    }

    fn next(&mut self) -> Result<SliceStep, Violation> {
        if self.at >= self.entries.len() {
            return Ok(SliceStep::Done);
        }
        let (name, value) = &self.entries[self.at];
        if self.value_next {
            self.value_next = false;
            self.at += 1;
            Ok(SliceStep::Item(value.clone()))
        } else {
            self.value_next = true;
            Ok(SliceStep::Item(Value::Bytes(name.clone().into_bytes())))
        }
    }

    fn describe(&self) -> String {
        format!("<{}>", self.class_name)
    }
}

struct VocabSlicer {
    entries: Vec<(u64, Vec<u8>)>,
    at: usize,
    value_next: bool,
}

impl Slicer for VocabSlicer {
    fn opentype(&self) -> Opentype {
        Opentype::of(&["vocab"])
    }

    fn allows_vocab(&self) -> bool {
        // the table definition must not compress itself with the table it
        // is defining
        false
    }

    fn next(&mut self) -> Result<SliceStep, Violation> {
        if self.at >= self.entries.len() {
            return Ok(SliceStep::Done);
        }
        let (key, value) = &self.entries[self.at];
        if self.value_next {
            self.value_next = false;
            self.at += 1;
            Ok(SliceStep::Item(Value::Bytes(value.clone())))
        } else {
            self.value_next = true;
            Ok(SliceStep::Item(Value::Int(*key as i64)))
        }
    }

    fn describe(&self) -> String {
        "<vocab>".to_string()
    }
}

/// Build the type-specific slicer for a composite value. Capabilities go
/// through the hooks, which own clid assignment and gift bookkeeping.
fn slicer_for_value(
    value: &Value,
    hooks: &mut dyn EngineHooks,
) -> Result<Box<dyn Slicer>, Violation> {
    Ok(match value {
        Value::List(items) => Box::new(SeqSlicer::new(
            Opentype::of(&["list"]),
            items.lock().clone(),
            true,
        )),
        Value::Tuple(items) => {
            Box::new(SeqSlicer::new(Opentype::of(&["tuple"]), items.to_vec(), true))
        }
        Value::Set(items) => Box::new(SeqSlicer::new(
            Opentype::of(&["set"]),
            items.lock().iter().cloned().map(Key::into_value).collect(),
            true,
        )),
        Value::ImmutableSet(items) => Box::new(SeqSlicer::new(
            Opentype::of(&["immutable-set"]),
            items.iter().cloned().map(Key::into_value).collect(),
            false,
        )),
        Value::Dict(map) => Box::new(DictSlicer {
            entries: map.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            at: 0,
            value_next: false,
        }),
        Value::Copyable(c) => Box::new(CopyableSlicer {
            class_name: c.class_name.clone(),
            entries: c.fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            at: 0,
            value_next: false,
        }),
        Value::None => Box::new(ConstSlicer::new(Opentype::of(&["none"]), vec![], "<none>")),
        Value::Bool(b) => Box::new(ConstSlicer::new(
            Opentype::of(&["boolean"]),
            vec![Value::Int(i64::from(*b))],
            "<bool>",
        )),
        Value::Unicode(s) => Box::new(ConstSlicer::new(
            Opentype::of(&["unicode"]),
            vec![Value::Bytes(s.clone().into_bytes())],
            "<unicode>",
        )),
        Value::Local(local) => Box::new(ConstSlicer::capability(hooks.slice_local(local)?)),
        Value::Remote(handle) => Box::new(ConstSlicer::capability(hooks.slice_remote(handle)?)),
        Value::Int(_) | Value::BigInt(_) | Value::Float(_) | Value::Bytes(_)
        | Value::Pending(_) => {
            return Err(Violation::new(format!("cannot slice a {} here", value.kind())))
        }
    })
}

enum SendItem {
    Value(Value),
    Slicer(Box<dyn Slicer>),
    Vocab(BTreeMap<u64, Vec<u8>>),
}

/// Handle used to enqueue sends from outside the engine (the broker's
/// dispatch path queues answers while the engine is elsewhere borrowed).
#[derive(Clone, Default)]
pub struct SendQueue {
    inner: std::sync::Arc<parking_lot::Mutex<VecDeque<(SendItem, Promise<SendOutcome>)>>>,
}

impl SendQueue {
    /// Queue a plain value.
    pub fn queue_value(&self, value: Value) -> Promise<SendOutcome> {
        let done = Promise::new();
        self.inner.lock().push_back((SendItem::Value(value), done.clone()));
        done
    }

    /// Queue a custom slicer (call/answer/error sequences).
    pub fn queue_slicer(&self, slicer: Box<dyn Slicer>) -> Promise<SendOutcome> {
        let done = Promise::new();
        self.inner.lock().push_back((SendItem::Slicer(slicer), done.clone()));
        done
    }

    /// Queue a vocabulary switch. The table takes effect for values
    /// queued after this point; the defining message itself is never
    /// compressed by it.
    pub fn queue_vocab(&self, table: BTreeMap<u64, Vec<u8>>) -> Promise<SendOutcome> {
        let done = Promise::new();
        self.inner.lock().push_back((SendItem::Vocab(table), done.clone()));
        done
    }

    fn pop(&self) -> Option<(SendItem, Promise<SendOutcome>)> {
        self.inner.lock().pop_front()
    }

    fn drain(&self) -> Vec<(SendItem, Promise<SendOutcome>)> {
        self.inner.lock().drain(..).collect()
    }
}

struct SendFrame {
    slicer: Box<dyn Slicer>,
    open_id: Option<u64>,
    streamable: bool,
}

/// Progress report from one pump pass.
pub enum PumpProgress {
    /// The queue is drained and the stack is empty.
    Idle,
    /// Serialization is suspended on this promise; pump again after it
    /// resolves.
    Blocked(Promise<Value>),
}

/// The send-side engine.
pub struct SendEngine {
    queue: SendQueue,
    stack: Vec<SendFrame>,
    current: Option<Promise<SendOutcome>>,
    waiting_child: Option<Promise<Value>>,
    open_count: u64,
    outgoing_vocab: HashMap<Vec<u8>, u64>,
    root_scope: SendScope,
    streamable: bool,
    lost: bool,
}

impl SendEngine {
    /// New engine. `streamable` governs whether top-level sends allow
    /// suspension by default.
    #[must_use]
    pub fn new(streamable: bool) -> Self {
        Self {
            queue: SendQueue::default(),
            stack: Vec::new(),
            current: None,
            waiting_child: None,
            open_count: 0,
            outgoing_vocab: HashMap::new(),
            root_scope: SendScope::default(),
            streamable,
            lost: false,
        }
    }

    /// A clonable handle for enqueueing.
    #[must_use]
    pub fn queue(&self) -> SendQueue {
        self.queue.clone()
    }

    /// Queue a value for transmission.
    pub fn send(&mut self, value: Value) -> Promise<SendOutcome> {
        self.queue.queue_value(value)
    }

    /// Serialize as much as possible into `out`.
    ///
    /// # Errors
    ///
    /// A [`BananaError`] means the send side is corrupt (runaway depth);
    /// the caller must drop the connection.
    pub fn pump(
        &mut self,
        out: &mut BytesMut,
        hooks: &mut dyn EngineHooks,
    ) -> Result<PumpProgress, BananaError> {
        if self.lost {
            return Ok(PumpProgress::Idle);
        }
        loop {
            // a child we suspended on earlier
            if let Some(promise) = self.waiting_child.take() {
                match promise.peek() {
                    Some(value) => self.send_child(out, value, hooks)?,
                    None => {
                        self.waiting_child = Some(promise.clone());
                        return Ok(PumpProgress::Blocked(promise));
                    }
                }
                continue;
            }

            if self.stack.is_empty() {
                // a top-level primitive finishes without ever pushing a
                // frame; settle its completion here
                if let Some(done) = self.current.take() {
                    done.resolve(Ok(()));
                }
                self.root_scope.clear();
                match self.queue.pop() {
                    None => return Ok(PumpProgress::Idle),
                    Some((item, done)) => {
                        self.current = Some(done);
                        match item {
                            SendItem::Value(v) => self.send_child(out, v, hooks)?,
                            SendItem::Slicer(slicer) => {
                                self.push_slicer(out, slicer, None);
                            }
                            SendItem::Vocab(table) => {
                                let entries: Vec<(u64, Vec<u8>)> =
                                    table.iter().map(|(k, v)| (*k, v.clone())).collect();
                                self.outgoing_vocab = table
                                    .into_iter()
                                    .map(|(index, bytes)| (bytes, index))
                                    .collect();
                                self.push_slicer(
                                    out,
                                    Box::new(VocabSlicer {
                                        entries,
                                        at: 0,
                                        value_next: false,
                                    }),
                                    None,
                                );
                            }
                        }
                        // an immediately-failed top-level item leaves the
                        // stack empty with current resolved
                        continue;
                    }
                }
            }

            if self.stack.len() > limits::MAX_SLICE_DEPTH {
                return Err(BananaError::new("slicer stack overflow"));
            }

            let step = self.stack.last_mut().expect("stack non-empty").slicer.next();
            match step {
                Ok(SliceStep::Done) => {
                    let frame = self.stack.pop().expect("stack non-empty");
                    if let Some(open_id) = frame.open_id {
                        codec::write_close(out, open_id);
                    }
                    if self.stack.is_empty() {
                        if let Some(done) = self.current.take() {
                            done.resolve(Ok(()));
                        }
                    }
                }
                Ok(SliceStep::Item(value)) => self.send_child(out, value, hooks)?,
                Err(violation) => {
                    self.handle_send_violation(out, violation, true, true)?;
                }
            }
        }
    }

    fn send_child(
        &mut self,
        out: &mut BytesMut,
        value: Value,
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), BananaError> {
        match value {
            Value::Int(i) => {
                codec::write_int(out, i);
                Ok(())
            }
            Value::BigInt(ref b) => {
                codec::write_big_int(out, b.negative, &b.magnitude);
                Ok(())
            }
            Value::Float(f) => {
                codec::write_float(out, f);
                Ok(())
            }
            Value::Bytes(ref bytes) => {
                let vocab_ok = self.stack.last().map_or(true, |f| f.slicer.allows_vocab());
                match self.outgoing_vocab.get(bytes) {
                    Some(index) if vocab_ok => codec::write_vocab_ref(out, *index),
                    _ => codec::write_bytes(out, bytes),
                }
                Ok(())
            }
            Value::Pending(promise) => {
                if !self.stack.iter().all(|f| f.streamable) {
                    let v = Violation::new("parent not streamable");
                    return self.handle_send_violation(out, v, true, true);
                }
                self.waiting_child = Some(promise);
                Ok(())
            }
            composite => {
                // repeat sends within the scope become back-references
                let existing = composite.identity().and_then(|ident| {
                    self.stack
                        .iter()
                        .rev()
                        .find_map(|f| f.slicer.lookup_reference(ident))
                        .or_else(|| self.root_scope.lookup(ident))
                });
                if let Some(refid) = existing {
                    self.push_slicer(out, Box::new(ConstSlicer::reference(refid)), None);
                    return Ok(());
                }
                match slicer_for_value(&composite, hooks) {
                    Ok(slicer) => {
                        self.push_slicer(out, slicer, Some(&composite));
                        Ok(())
                    }
                    Err(violation) => {
                        // no OPEN was emitted for the failing child, so no
                        // ABORT is owed; just tell the parent
                        self.handle_send_violation(out, violation, false, false)
                    }
                }
            }
        }
    }

    fn push_slicer(&mut self, out: &mut BytesMut, slicer: Box<dyn Slicer>, value: Option<&Value>) {
        let parent_streamable = self.stack.last().map_or(self.streamable, |f| f.streamable);
        let mut open_id = None;
        if slicer.send_open() {
            let id = self.open_count;
            self.open_count += 1;
            codec::write_open(out, id);
            open_id = Some(id);
            if slicer.track_references() {
                if let Some(value) = value {
                    if let Some(ident) = value.identity() {
                        let claimed = self
                            .stack
                            .iter_mut()
                            .rev()
                            .any(|f| f.slicer.register_reference(ident, id, value));
                        if !claimed {
                            self.root_scope.register(ident, id, value);
                        }
                    }
                }
            }
            let allow_vocab = slicer.allows_vocab();
            for part in slicer.opentype().0 {
                match self.outgoing_vocab.get(&part) {
                    Some(index) if allow_vocab => codec::write_vocab_ref(out, *index),
                    _ => codec::write_bytes(out, &part),
                }
            }
        }
        let streamable = slicer.streamable(parent_streamable);
        self.stack.push(SendFrame { slicer, open_id, streamable });
    }

    fn handle_send_violation(
        &mut self,
        out: &mut BytesMut,
        mut violation: Violation,
        mut do_pop: bool,
        mut send_abort: bool,
    ) -> Result<(), BananaError> {
        violation.set_location(self.describe());
        tracing::debug!(%violation, "send-side violation");

        loop {
            if self.stack.is_empty() {
                // the top-level item itself was unsendable
                if let Some(done) = self.current.take() {
                    done.resolve(Err(SendError::Violation(violation)));
                }
                return Ok(());
            }

            if send_abort {
                if let Some(open_id) = self.stack.last().and_then(|f| f.open_id) {
                    codec::write_abort(out, open_id);
                }
            }
            if do_pop {
                let frame = self.stack.pop().expect("stack non-empty");
                if let Some(open_id) = frame.open_id {
                    codec::write_close(out, open_id);
                }
                if self.stack.is_empty() {
                    if let Some(done) = self.current.take() {
                        done.resolve(Err(SendError::Violation(violation)));
                    }
                    return Ok(());
                }
            }

            match self.stack.last_mut().expect("stack non-empty").slicer.child_aborted(violation)
            {
                None => return Ok(()), // absorbed, keep producing
                Some(v) => {
                    violation = v;
                    do_pop = true;
                    send_abort = true;
                }
            }
        }
    }

    /// Swap the outgoing vocabulary (see [`SendQueue::queue_vocab`]).
    pub fn set_outgoing_vocabulary(
        &mut self,
        table: BTreeMap<u64, Vec<u8>>,
    ) -> Promise<SendOutcome> {
        self.queue.queue_vocab(table)
    }

    /// Fail everything queued or in flight; the transport is gone.
    pub fn connection_lost(&mut self) {
        self.lost = true;
        if let Some(done) = self.current.take() {
            done.resolve(Err(SendError::ConnectionLost));
        }
        for (_, done) in self.queue.drain() {
            done.resolve(Err(SendError::ConnectionLost));
        }
        self.stack.clear();
        self.waiting_child = None;
    }

    fn describe(&self) -> String {
        let mut parts = vec!["<Root>".to_string()];
        parts.extend(self.stack.iter().map(|f| f.slicer.describe()));
        parts.join(".")
    }
}
