//! The receive-side stack machine.
//!
//! [`ReceiveEngine::feed`] turns raw bytes into tokens and drives a stack
//! of [`Unslicer`] frames, one per nested OPEN..CLOSE sequence. The top of
//! the stack receives every token. Schema checks run *before* token
//! bodies are buffered; a [`Violation`] abandons exactly one subtree
//! (tracked by a discard counter until the frame boundary resynchronizes)
//! while a [`BananaError`] abandons the connection.
//!
//! # Invariants
//!
//! - The bottom frame is always the root unslicer; popping it is fatal.
//! - A CLOSE count must match the open count recorded for the top frame
//!   (LIFO discipline); anything else is stream corruption.
//! - `finish()` runs on every frame that leaves the stack, pop or
//!   violation alike.
//! - The parser never blocks on application logic: an object that is not
//!   ready yet travels as an [`Obj::Pending`] promise instead.

use std::collections::HashMap;

use bytes::{Buf, BytesMut};

use banana_proto::{
    codec::{scan_header, HeaderScan},
    limits, BananaError, TokenError, TokenTag, Violation,
};

use crate::promise::Promise;
use crate::registry::Registry;
use crate::schema::{Constraint, MethodSchema, Opentype};
use crate::value::Value;
use std::sync::Arc;

use crate::failure::RemoteFailure;
use crate::reference::{LocalRef, RemoteHandle};

/// An object, or a promise of one (cycles through immutable containers,
/// and capabilities that need their own connection before they are
/// usable).
#[derive(Debug, Clone)]
pub enum Obj {
    /// The object is complete.
    Ready(Value),
    /// The object will be delivered through the promise.
    Pending(Promise<Value>),
}

impl Obj {
    /// Chain `f` onto availability: immediately for ready objects.
    pub fn when_available(&self, f: impl FnOnce(&Value) + Send + 'static) {
        match self {
            Obj::Ready(v) => f(v),
            Obj::Pending(p) => p.when_resolved(f),
        }
    }
}

/// Vocabulary table: small integer to byte string.
pub type VocabTable = HashMap<u64, Vec<u8>>;

/// What an unslicer hands back from `receive_close`.
pub enum Closed {
    /// An object (possibly pending), plus an optional readiness promise
    /// that fires only once the object is fully usable.
    Obj {
        /// The reconstructed object or its placeholder.
        obj: Obj,
        /// Resolves when the object is usable; `None` when it already is.
        ready: Option<Promise<Value>>,
    },
    /// A new incoming vocabulary table (top level only).
    Vocab(VocabTable),
}

impl Closed {
    /// Shorthand for a complete object with no readiness gate.
    #[must_use]
    pub fn ready(value: Value) -> Self {
        Closed::Obj { obj: Obj::Ready(value), ready: None }
    }
}

/// How a capability value is expressed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityWire {
    /// Export of a local capability.
    MyReference {
        /// Connection-local id.
        clid: u64,
        /// Interface name, sent on first transmission only.
        interface: Option<String>,
        /// Stable URL, sent on first transmission only.
        url: Option<String>,
    },
    /// Returning the peer's own capability to it.
    YourReference {
        /// The peer's clid for the capability.
        clid: u64,
    },
    /// Gifting a third party's capability.
    TheirReference {
        /// Gift id for the decgift acknowledgement.
        gift_id: u64,
        /// Where the recipient can claim the capability.
        url: String,
    },
}

/// The work queue of calls whose arguments have fully resolved. Shared
/// with call unslicers so that a call gated on a slow sub-object can be
/// dispatched later without re-entering the engine.
#[derive(Clone, Default)]
pub struct DispatchQueue {
    inner: std::sync::Arc<parking_lot::Mutex<Vec<ReadyCall>>>,
}

/// One fully-assembled inbound call.
pub struct ReadyCall {
    /// Request id to answer under.
    pub req_id: u64,
    /// Target clid (0 is the broker itself).
    pub clid: u64,
    /// Method name.
    pub method: String,
    /// Named arguments.
    pub args: std::collections::BTreeMap<String, Value>,
    /// The schema that vetted the arguments, if any.
    pub schema: Option<Arc<MethodSchema>>,
}

impl DispatchQueue {
    /// A fresh queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a ready call.
    pub fn push(&self, call: ReadyCall) {
        self.inner.lock().push(call);
    }

    /// Take everything queued so far.
    #[must_use]
    pub fn drain(&self) -> Vec<ReadyCall> {
        std::mem::take(&mut *self.inner.lock())
    }
}

/// Callbacks from the engines into the connection-level object (the
/// broker, or a trivial collector for plain serialization).
///
/// Default implementations reject the RPC-flavored operations so a plain
/// Banana connection only needs [`EngineHooks::received_object`].
#[allow(unused_variables)]
pub trait EngineHooks: Send {
    /// A finished top-level object.
    fn received_object(&mut self, obj: Obj);

    /// A violation reached the root and was absorbed; the connection
    /// continues.
    fn top_level_violation(&mut self, violation: &Violation) {}

    /// Inbound `my-reference`: the peer exports a capability.
    fn remote_reference(
        &mut self,
        clid: u64,
        interface: Option<String>,
        url: Option<String>,
    ) -> Result<Value, Violation> {
        Err(Violation::new("this connection does not carry capabilities"))
    }

    /// Inbound `your-reference`: one of our own capabilities comes home.
    fn local_reference(&mut self, clid: u64) -> Result<Value, Violation> {
        Err(Violation::new("this connection does not carry capabilities"))
    }

    /// Inbound `their-reference`: a gift from a third party.
    fn accept_gift(&mut self, gift_id: u64, url: String) -> Result<Obj, Violation> {
        Err(Violation::new("this connection does not carry capabilities"))
    }

    /// A `call` sequence announced its request id.
    fn begin_call(&mut self, req_id: u64) -> Result<(), Violation> {
        Err(Violation::new("this connection does not dispatch calls"))
    }

    /// Resolve the dispatch target for a clid. Errors for unknown clids.
    fn call_target_exists(&mut self, clid: u64) -> Result<(), Violation> {
        Err(Violation::new("this connection does not dispatch calls"))
    }

    /// The schema for a method on a target, or `None` when the target is
    /// unconstrained. An interface that does not define the method is a
    /// violation.
    fn method_schema(
        &mut self,
        clid: u64,
        method: &str,
    ) -> Result<Option<Arc<MethodSchema>>, Violation> {
        Ok(None)
    }

    /// Whether unconstrained method calls are refused outright.
    fn require_schema(&self) -> bool {
        false
    }

    /// Where assembled calls go for dispatch.
    fn dispatch_queue(&mut self) -> DispatchQueue {
        DispatchQueue::new()
    }

    /// An inbound call failed before dispatch; answer with an error if the
    /// request id is known.
    fn call_failed(&mut self, req_id: u64, violation: Violation) {}

    /// Look up the response constraint for an answer's request id.
    /// Errors for unknown ids.
    fn answer_constraint(&mut self, req_id: u64) -> Result<Option<Arc<Constraint>>, Violation> {
        Err(Violation::new("this connection does not track requests"))
    }

    /// Deliver a successful answer.
    fn complete_answer(&mut self, req_id: u64, result: Obj) {}

    /// Deliver a remote failure for a request.
    fn fail_request(&mut self, req_id: u64, failure: RemoteFailure) {}

    /// Deliver a local violation for a request (the answer could not be
    /// deserialized).
    fn fail_request_violation(&mut self, req_id: u64, violation: Violation) {}

    /// Send side: express a local capability on the wire.
    fn slice_local(&mut self, obj: &LocalRef) -> Result<CapabilityWire, Violation> {
        Err(Violation::new("cannot serialize a capability on this connection"))
    }

    /// Send side: express an imported capability on the wire.
    fn slice_remote(&mut self, handle: &RemoteHandle) -> Result<CapabilityWire, Violation> {
        Err(Violation::new("cannot serialize a capability on this connection"))
    }
}

/// Hooks for a plain (non-RPC) connection: collects finished top-level
/// objects and absorbed violations.
#[derive(Default)]
pub struct CollectingHooks {
    /// Finished top-level objects, oldest first.
    pub received: Vec<Obj>,
    /// Violations that were absorbed at the root.
    pub violations: Vec<Violation>,
}

impl EngineHooks for CollectingHooks {
    fn received_object(&mut self, obj: Obj) {
        self.received.push(obj);
    }

    fn top_level_violation(&mut self, violation: &Violation) {
        self.violations.push(violation.clone());
    }
}

/// Per-call context handed to unslicer methods: the frames below the
/// current one, the hooks, and the registry.
pub struct UnsliceCx<'a> {
    parents: &'a mut [Frame],
    /// Connection-level callbacks.
    pub hooks: &'a mut dyn EngineHooks,
    registry: &'a Registry,
    fatal: Option<BananaError>,
}

impl<'a> UnsliceCx<'a> {
    /// Record an object (or placeholder) under a reference count. Walks
    /// the enclosing frames so the innermost scope stores it.
    pub fn set_object(&mut self, count: u64, obj: Obj) {
        for frame in self.parents.iter_mut().rev() {
            frame.unslicer.set_object(count, obj.clone());
        }
    }

    /// Resolve a reference count against the enclosing scopes.
    #[must_use]
    pub fn get_object(&self, count: u64) -> Option<Obj> {
        for frame in self.parents.iter().rev() {
            if let Some(obj) = frame.unslicer.get_object(count) {
                return Some(obj);
            }
        }
        None
    }

    /// Instantiate an unslicer for a below-top-level opentype. `Ok(None)`
    /// means more index tokens are required.
    ///
    /// # Errors
    ///
    /// [`Violation`] for unknown opentypes.
    pub fn open_child(&mut self, opentype: &Opentype) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        self.registry.open(opentype, false)
    }

    /// Instantiate an unslicer for a top-level opentype.
    ///
    /// # Errors
    ///
    /// [`Violation`] for unknown opentypes.
    pub fn open_top(&mut self, opentype: &Opentype) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        self.registry.open(opentype, true)
    }

    /// Default index-token policy: index tokens are strings (or vocab
    /// references) bounded by the longest registered opentype component.
    ///
    /// # Errors
    ///
    /// [`TokenError::Violation`] for non-string index tokens or oversized
    /// ones.
    pub fn opener_check(
        &self,
        tag: TokenTag,
        size: u64,
        opentype: &Opentype,
    ) -> Result<(), TokenError> {
        match tag {
            TokenTag::String => {
                let max = self.registry.max_index_token_len(opentype);
                if size > max {
                    return Err(Violation::new(format!(
                        "index token is too long, {}>{}",
                        size, max
                    ))
                    .into());
                }
                Ok(())
            }
            TokenTag::Vocab => Ok(()),
            _ => Err(Violation::new(format!(
                "index token {} is not STRING or VOCAB",
                tag.name()
            ))
            .into()),
        }
    }

    /// Escalate to a connection-fatal error from inside an unslicer
    /// method. The engine aborts the connection after the current call
    /// returns.
    pub fn abandon(&mut self, error: BananaError) -> Violation {
        let v = Violation::new(error.message.clone());
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        v
    }
}

/// One receive frame.
///
/// `open_count` is the wire-level OPEN header recorded when the frame was
/// pushed; the matching CLOSE must repeat it. `None` for the root.
pub struct Frame {
    /// The frame's unslicer.
    pub unslicer: Box<dyn Unslicer>,
    /// The OPEN header this frame was created under.
    pub open_count: Option<u64>,
}

/// A consumer for one OPEN..CLOSE sequence.
#[allow(unused_variables)]
pub trait Unslicer: Send {
    /// Attach a constraint. Called at most once, before `start`.
    fn set_constraint(&mut self, constraint: Arc<Constraint>) {}

    /// Initialize the frame. `count` is the reference id this object will
    /// be known by; objects that may be referenced must register
    /// themselves (or a placeholder) via [`UnsliceCx::set_object`].
    ///
    /// # Errors
    ///
    /// A [`Violation`] abandons this frame before it receives anything.
    fn start(&mut self, count: u64, cx: &mut UnsliceCx<'_>) -> Result<(), Violation> {
        Ok(())
    }

    /// Accept or reject a primitive token from its tag and declared size,
    /// before the body is buffered. Not consulted for ABORT, CLOSE or
    /// ERROR.
    ///
    /// # Errors
    ///
    /// [`TokenError`] at either severity.
    fn check_token(&self, tag: TokenTag, size: u64) -> Result<(), TokenError> {
        Ok(())
    }

    /// Like `check_token`, for index tokens during an OPEN sequence.
    ///
    /// # Errors
    ///
    /// [`TokenError`] at either severity.
    fn opener_check_token(
        &self,
        tag: TokenTag,
        size: u64,
        opentype: &Opentype,
        cx: &UnsliceCx<'_>,
    ) -> Result<(), TokenError> {
        cx.opener_check(tag, size, opentype)
    }

    /// Resolve a child opentype into a new unslicer, applying any
    /// per-child constraint. `Ok(None)` requests more index tokens.
    ///
    /// # Errors
    ///
    /// A [`Violation`] discards the announced child subtree.
    fn do_open(
        &mut self,
        opentype: &Opentype,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation>;

    /// Accept one child: a primitive token's value or a completed
    /// composite. `ready` is the child's readiness promise, when it has
    /// one.
    ///
    /// # Errors
    ///
    /// A [`Violation`] marks this frame contaminated.
    fn receive_child(
        &mut self,
        obj: Obj,
        ready: Option<Promise<Value>>,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation>;

    /// A descendant failed. Return the violation to propagate it (this
    /// frame is then popped), or `None` to absorb it and continue.
    fn report_violation(&mut self, violation: Violation, cx: &mut UnsliceCx<'_>) -> Option<Violation> {
        Some(violation)
    }

    /// The matching CLOSE arrived; produce the object.
    ///
    /// # Errors
    ///
    /// A [`Violation`] delivers a failure to the parent instead.
    fn receive_close(&mut self, cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation>;

    /// Always called when the frame leaves the stack, error paths
    /// included.
    ///
    /// # Errors
    ///
    /// A late [`Violation`], e.g. a completing cycle participant whose
    /// constraint could only now be checked.
    fn finish(&mut self, cx: &mut UnsliceCx<'_>) -> Result<(), Violation> {
        Ok(())
    }

    /// One path component for violation locations.
    fn describe(&self) -> String;

    /// Store a reference-table entry. Only scope frames keep state here.
    fn set_object(&mut self, count: u64, obj: Obj) {}

    /// Look up a reference-table entry; `None` defers to outer scopes.
    fn get_object(&self, count: u64) -> Option<Obj> {
        None
    }
}

/// Behavior of the root frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootPolicy {
    /// Accept any top-level object (plain serialization). A top-level
    /// violation is absorbed and the connection continues.
    Plain,
    /// Only OPEN may appear at top level (the RPC broker root); any other
    /// token is fatal.
    OpenOnly,
}

/// The bottom frame: resolves top-level opentypes, owns the per-top-level
/// reference scope, and delivers finished objects to the hooks.
pub struct RootUnslicer {
    policy: RootPolicy,
    constraint: Option<Arc<Constraint>>,
    references: HashMap<u64, Obj>,
}

impl RootUnslicer {
    /// Root with the given policy and optional top-level constraint.
    #[must_use]
    pub fn new(policy: RootPolicy, constraint: Option<Arc<Constraint>>) -> Self {
        Self { policy, constraint, references: HashMap::new() }
    }
}

impl Unslicer for RootUnslicer {
    fn check_token(&self, tag: TokenTag, size: u64) -> Result<(), TokenError> {
        match self.policy {
            RootPolicy::OpenOnly => {
                if tag == TokenTag::Open {
                    Ok(())
                } else {
                    Err(BananaError::new("top-level must be OPEN").into())
                }
            }
            RootPolicy::Plain => match &self.constraint {
                Some(c) => c.check_token(tag, size),
                None => Ok(()),
            },
        }
    }

    fn do_open(
        &mut self,
        opentype: &Opentype,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        if let Some(c) = &self.constraint {
            c.check_opentype(opentype)?;
        }
        let child = cx.open_top(opentype)?;
        Ok(child.map(|mut child| {
            if let Some(c) = &self.constraint {
                child.set_constraint(Arc::clone(c));
            }
            child
        }))
    }

    fn receive_child(
        &mut self,
        obj: Obj,
        _ready: Option<Promise<Value>>,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        // each top-level object is its own reference scope
        self.references.clear();
        cx.hooks.received_object(obj);
        Ok(())
    }

    fn report_violation(&mut self, violation: Violation, cx: &mut UnsliceCx<'_>) -> Option<Violation> {
        tracing::debug!(%violation, "top-level violation absorbed");
        self.references.clear();
        cx.hooks.top_level_violation(&violation);
        None
    }

    fn receive_close(&mut self, cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        Err(cx.abandon(BananaError::new("top-level should never receive CLOSE tokens")))
    }

    fn describe(&self) -> String {
        "<Root>".to_string()
    }

    fn set_object(&mut self, count: u64, obj: Obj) {
        self.references.insert(count, obj);
    }

    fn get_object(&self, count: u64) -> Option<Obj> {
        self.references.get(&count).cloned()
    }
}

/// A fatal receive-side failure and whether the peer should still be told
/// about it.
#[derive(Debug)]
pub struct ReceiveFatal {
    /// What broke.
    pub error: BananaError,
    /// False when the peer reported the problem itself (an ERROR token):
    /// echoing a diagnostic back would ping-pong.
    pub notify_peer: bool,
}

impl From<BananaError> for ReceiveFatal {
    fn from(error: BananaError) -> Self {
        Self { error, notify_peer: true }
    }
}

impl ReceiveFatal {
    /// The best-effort ERROR-token diagnostic to write before dropping
    /// the transport, when one should be sent at all. Delivery is never
    /// guaranteed; the connection is already dying.
    #[must_use]
    pub fn diagnostic_bytes(&self) -> Option<BytesMut> {
        if !self.notify_peer {
            return None;
        }
        let message = self.error.to_string();
        let mut bytes = message.as_bytes();
        if bytes.len() as u64 > limits::ERROR_SIZE_LIMIT {
            bytes = &bytes[..limits::ERROR_SIZE_LIMIT as usize];
        }
        let mut out = BytesMut::new();
        banana_proto::codec::write_error(&mut out, bytes).ok()?;
        Some(out)
    }
}

/// The incremental receive engine.
pub struct ReceiveEngine {
    registry: Arc<Registry>,
    stack: Vec<Frame>,
    buffer: BytesMut,
    skip_bytes: usize,
    discard_count: u64,
    in_open: bool,
    opentype: Opentype,
    inbound_open_count: u64,
    object_counter: u64,
    incoming_vocab: VocabTable,
    abandoned: bool,
}

impl ReceiveEngine {
    /// New engine over a registry, with the given root.
    #[must_use]
    pub fn new(registry: Arc<Registry>, root: RootUnslicer) -> Self {
        Self {
            registry,
            stack: vec![Frame { unslicer: Box::new(root), open_count: None }],
            buffer: BytesMut::new(),
            skip_bytes: 0,
            discard_count: 0,
            in_open: false,
            opentype: Opentype(Vec::new()),
            inbound_open_count: 0,
            object_counter: 0,
            incoming_vocab: VocabTable::new(),
            abandoned: false,
        }
    }

    /// True once a fatal error has abandoned this connection.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// Consume a chunk from the transport.
    ///
    /// # Errors
    ///
    /// [`ReceiveFatal`] on framing corruption; the caller must send the
    /// diagnostic (if requested) and drop the transport. Further chunks
    /// are ignored.
    pub fn feed(&mut self, chunk: &[u8], hooks: &mut dyn EngineHooks) -> Result<(), ReceiveFatal> {
        if self.abandoned {
            return Ok(());
        }
        match self.handle_data(chunk, hooks) {
            Ok(()) => Ok(()),
            Err(mut fatal) => {
                fatal.error.set_location(self.describe());
                tracing::warn!(error = %fatal.error, "abandoning connection");
                self.abandoned = true;
                Err(fatal)
            }
        }
    }

    fn handle_data(
        &mut self,
        chunk: &[u8],
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), ReceiveFatal> {
        let mut chunk = chunk;
        if self.skip_bytes > 0 {
            if chunk.len() <= self.skip_bytes {
                self.skip_bytes -= chunk.len();
                return Ok(());
            }
            chunk = &chunk[self.skip_bytes..];
            self.skip_bytes = 0;
        }
        self.buffer.extend_from_slice(chunk);

        loop {
            let header = match scan_header(&self.buffer)? {
                HeaderScan::NeedMore => break,
                HeaderScan::Complete(h) => h,
            };
            let Some(tag) = header.tag() else {
                return Err(BananaError::new(format!(
                    "invalid type byte 0x{:02x}",
                    header.tag_byte
                ))
                .into());
            };
            let size = header.value;

            let mut rejected = self.discard_count > 0;
            let was_in_open = self.in_open;

            if tag == TokenTag::Open {
                if self.in_open {
                    return Err(BananaError::new("OPEN token followed by OPEN").into());
                }
                // in_open is raised the moment an OPEN is witnessed, even
                // if the sequence is rejected later: a new sequence has
                // started and must be either handled or discarded
                self.in_open = true;
            }

            if !rejected && !tag.always_legal() {
                let check = {
                    let (top, parents) = split_top(&mut self.stack);
                    let cx = UnsliceCx {
                        parents,
                        hooks,
                        registry: &self.registry,
                        fatal: None,
                    };
                    if was_in_open {
                        top.unslicer.opener_check_token(tag, size, &self.opentype, &cx)
                    } else {
                        top.unslicer.check_token(tag, size)
                    }
                };
                match check {
                    Ok(()) => {}
                    Err(TokenError::Fatal(e)) => return Err(e.into()),
                    Err(TokenError::Violation(v)) => {
                        rejected = true;
                        let in_open = self.in_open;
                        self.handle_violation(v, in_open, false, hooks)?;
                        self.in_open = false;
                    }
                }
            }

            if tag == TokenTag::Error && size > limits::ERROR_SIZE_LIMIT {
                return Err(BananaError::new("oversized ERROR token").into());
            }

            let body_len = header.consumed;
            let available = self.buffer.len() - body_len;

            // Each arm either consumes the token and produces an object,
            // consumes a framing token and continues, returns to wait for
            // more bytes, or fails the connection.
            let obj: Value = match tag {
                TokenTag::Open => {
                    self.buffer.advance(body_len);
                    self.inbound_open_count = size;
                    if rejected {
                        if self.in_open {
                            // discarding at the old level; this new
                            // sequence (and its CLOSE) is discarded too
                            self.discard_count += 1;
                            self.in_open = false;
                        }
                        // otherwise the check-phase violation already
                        // started discarding this sequence
                    } else {
                        self.opentype.0.clear();
                    }
                    continue;
                }
                TokenTag::Close => {
                    self.buffer.advance(body_len);
                    if self.discard_count > 0 {
                        self.discard_count -= 1;
                    } else {
                        self.handle_close(size, hooks)?;
                    }
                    continue;
                }
                TokenTag::Abort => {
                    self.buffer.advance(body_len);
                    if rejected {
                        // already discarding this subtree; a second
                        // violation would discard too much
                        continue;
                    }
                    self.handle_violation(
                        Violation::new("ABORT received"),
                        false,
                        false,
                        hooks,
                    )?;
                    continue;
                }
                TokenTag::Error => {
                    let strlen = size as usize;
                    if available < strlen {
                        return Ok(());
                    }
                    let message =
                        String::from_utf8_lossy(&self.buffer[body_len..body_len + strlen])
                            .into_owned();
                    tracing::warn!(%message, "peer reported a protocol error");
                    return Err(ReceiveFatal {
                        error: BananaError::new(format!("remote error: {}", message)),
                        notify_peer: false,
                    });
                }
                TokenTag::List => {
                    return Err(BananaError::new("legacy peer detected").into());
                }
                TokenTag::String => {
                    let strlen = size as usize;
                    if available < strlen {
                        if rejected {
                            self.skip_bytes = strlen - available;
                            self.buffer.clear();
                        }
                        return Ok(());
                    }
                    let body = self.buffer[body_len..body_len + strlen].to_vec();
                    self.buffer.advance(body_len + strlen);
                    Value::Bytes(body)
                }
                TokenTag::Int => {
                    self.buffer.advance(body_len);
                    Value::integer_from_magnitude(false, &size.to_be_bytes())
                }
                TokenTag::Neg => {
                    self.buffer.advance(body_len);
                    Value::integer_from_magnitude(true, &size.to_be_bytes())
                }
                TokenTag::LongInt | TokenTag::LongNeg => {
                    let strlen = size as usize;
                    if available < strlen {
                        if rejected {
                            self.skip_bytes = strlen - available;
                            self.buffer.clear();
                        }
                        return Ok(());
                    }
                    let body = self.buffer[body_len..body_len + strlen].to_vec();
                    self.buffer.advance(body_len + strlen);
                    Value::integer_from_magnitude(tag == TokenTag::LongNeg, &body)
                }
                TokenTag::Vocab => {
                    let Some(bytes) = self.incoming_vocab.get(&size) else {
                        return Err(
                            BananaError::new(format!("unknown vocab index {}", size)).into()
                        );
                    };
                    let bytes = bytes.clone();
                    self.buffer.advance(body_len);
                    Value::Bytes(bytes)
                }
                TokenTag::Float => {
                    if available < limits::FLOAT_BODY_BYTES {
                        return Ok(());
                    }
                    let body: [u8; 8] =
                        self.buffer[body_len..body_len + 8].try_into().expect("8 bytes");
                    self.buffer.advance(body_len + 8);
                    Value::Float(f64::from_be_bytes(body))
                }
            };

            if rejected {
                continue;
            }
            if self.in_open {
                self.handle_open_index(obj, hooks)?;
            } else {
                self.handle_token(Obj::Ready(obj), None, hooks)?;
            }
        }
        Ok(())
    }

    fn handle_open_index(
        &mut self,
        index_token: Value,
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), ReceiveFatal> {
        let Value::Bytes(part) = index_token else {
            return Err(BananaError::new("index token must be a string").into());
        };
        self.opentype.0.push(part);
        let opentype = self.opentype.clone();

        let open_count = self.inbound_open_count;
        let object_count = self.object_counter;
        let (opened, fatal) = {
            let (top, parents) = split_top(&mut self.stack);
            let mut cx = UnsliceCx { parents, hooks, registry: &self.registry, fatal: None };
            let opened = top.unslicer.do_open(&opentype, &mut cx);
            (opened, cx.fatal)
        };
        if let Some(e) = fatal {
            return Err(e.into());
        }
        match opened {
            Err(v) => {
                self.in_open = false;
                self.handle_violation(v, true, false, hooks)?;
                Ok(())
            }
            Ok(None) => Ok(()), // more index tokens required
            Ok(Some(child)) => {
                self.object_counter += 1;
                self.in_open = false;
                self.stack.push(Frame { unslicer: child, open_count: Some(open_count) });
                let (started, fatal) = {
                    let (top, parents) = split_top(&mut self.stack);
                    let mut cx =
                        UnsliceCx { parents, hooks, registry: &self.registry, fatal: None };
                    (top.unslicer.start(object_count, &mut cx), cx.fatal)
                };
                if let Some(e) = fatal {
                    return Err(e.into());
                }
                if let Err(v) = started {
                    self.handle_violation(v, false, false, hooks)?;
                }
                Ok(())
            }
        }
    }

    fn handle_token(
        &mut self,
        obj: Obj,
        ready: Option<Promise<Value>>,
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), ReceiveFatal> {
        let (delivered, fatal) = {
            let (top, parents) = split_top(&mut self.stack);
            let mut cx = UnsliceCx { parents, hooks, registry: &self.registry, fatal: None };
            (top.unslicer.receive_child(obj, ready, &mut cx), cx.fatal)
        };
        if let Some(e) = fatal {
            return Err(e.into());
        }
        if let Err(v) = delivered {
            self.handle_violation(v, false, false, hooks)?;
        }
        Ok(())
    }

    fn handle_close(
        &mut self,
        close_count: u64,
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), ReceiveFatal> {
        let expected = self.stack.last().and_then(|f| f.open_count);
        if expected != Some(close_count) {
            return Err(BananaError::new(format!(
                "lost sync, got CLOSE({}) but expecting {:?}",
                close_count, expected
            ))
            .into());
        }

        let (closed, fatal) = {
            let (top, parents) = split_top(&mut self.stack);
            let mut cx = UnsliceCx { parents, hooks, registry: &self.registry, fatal: None };
            (top.unslicer.receive_close(&mut cx), cx.fatal)
        };
        if let Some(e) = fatal {
            return Err(e.into());
        }
        let closed = match closed {
            Ok(closed) => closed,
            Err(v) => {
                // the frame is finished, so nothing needs discarding; the
                // parent just gets a failure instead of an object
                self.handle_violation(v, false, true, hooks)?;
                return Ok(());
            }
        };

        let (finished, fatal) = {
            let (top, parents) = split_top(&mut self.stack);
            let mut cx = UnsliceCx { parents, hooks, registry: &self.registry, fatal: None };
            (top.unslicer.finish(&mut cx), cx.fatal)
        };
        if let Some(e) = fatal {
            return Err(e.into());
        }
        if let Err(v) = finished {
            self.handle_violation(v, false, true, hooks)?;
            return Ok(());
        }

        self.stack.pop();
        if self.stack.is_empty() {
            return Err(BananaError::new("the root unslicer was destroyed").into());
        }

        match closed {
            Closed::Vocab(table) => {
                if self.stack.len() == 1 {
                    self.incoming_vocab = table;
                    Ok(())
                } else {
                    Err(BananaError::new("vocab sequence below top level").into())
                }
            }
            Closed::Obj { obj, ready } => self.handle_token(obj, ready, hooks),
        }
    }

    fn handle_violation(
        &mut self,
        mut violation: Violation,
        in_open: bool,
        mut in_close: bool,
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), ReceiveFatal> {
        violation.set_location(self.describe());
        tracing::debug!(%violation, in_open, in_close, "handling violation");

        if in_open {
            self.discard_count += 1;
        }

        loop {
            let (reported, fatal) = {
                let (top, parents) = split_top(&mut self.stack);
                let mut cx = UnsliceCx { parents, hooks, registry: &self.registry, fatal: None };
                (top.unslicer.report_violation(violation, &mut cx), cx.fatal)
            };
            if let Some(e) = fatal {
                return Err(e.into());
            }
            let Some(propagated) = reported else {
                return Ok(()); // absorbed
            };
            violation = propagated;

            if !in_close {
                self.discard_count += 1;
            }
            in_close = false;

            let mut old = self.stack.pop().expect("stack never empty here");
            {
                let mut cx = UnsliceCx {
                    parents: &mut self.stack,
                    hooks,
                    registry: &self.registry,
                    fatal: None,
                };
                // the frame already failed once; a second violation from
                // finish adds nothing
                let _ = old.unslicer.finish(&mut cx);
            }

            if self.stack.is_empty() {
                return Err(BananaError::new("the root unslicer was destroyed").into());
            }
        }
    }

    fn describe(&self) -> String {
        self.stack
            .iter()
            .map(|f| f.unslicer.describe())
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn split_top(stack: &mut [Frame]) -> (&mut Frame, &mut [Frame]) {
    let (top, parents) = stack.split_last_mut().expect("stack never empty");
    (top, parents)
}
