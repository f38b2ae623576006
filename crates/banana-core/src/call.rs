//! RPC wire sequences: `call`, `answer`, `error`, and the capability
//! reference opentypes.
//!
//! A `call` is received field by field — request id, target clid, method
//! name, then alternating argument names and values — with the method
//! schema consulted as soon as it is known, so bad arguments are rejected
//! while they are still tokens. Dispatch happens exactly once, and only
//! after every argument (including ones gated on slow sub-objects) has
//! resolved; calls whose arguments resolve late land on the broker's
//! dispatch queue instead of re-entering the engine.
//!
//! `call`, `answer` and `error` sequences are reference scopes of their
//! own: objects serialized inside one can only be back-referenced inside
//! the same sequence.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use banana_proto::{BananaError, TokenError, TokenTag, Violation};

use crate::failure::RemoteFailure;
use crate::promise::Promise;
use crate::schema::{Constraint, MethodSchema, Opentype};
use crate::slicer::{SendScope, SliceStep, Slicer, SendError};
use crate::unslicer::{Closed, DispatchQueue, Obj, ReadyCall, UnsliceCx, Unslicer};
use crate::value::Value;

/// Why a `call_remote` completion handle rejected.
#[derive(Debug)]
pub enum CallError {
    /// The target raised; here is its serialized form.
    Remote(RemoteFailure),
    /// A schema rejected the call or its answer.
    Violation(Violation),
    /// The connection dropped with the request outstanding.
    Disconnected,
    /// The broker was already disconnected when the call was made.
    DeadReference,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Remote(failure) => write!(f, "{}", failure),
            CallError::Violation(v) => write!(f, "{}", v),
            CallError::Disconnected => write!(f, "connection lost before the answer arrived"),
            CallError::DeadReference => write!(f, "calling a stale broker"),
        }
    }
}

impl std::error::Error for CallError {}

impl From<SendError> for CallError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::Violation(v) => CallError::Violation(v),
            SendError::ConnectionLost => CallError::Disconnected,
        }
    }
}

enum Completer {
    Channel(oneshot::Sender<Result<Value, CallError>>),
    Callback(Box<dyn FnOnce(Result<Value, CallError>) + Send>),
}

/// One outstanding outbound request.
pub struct PendingRequest {
    /// Constraint on the answer, from the method schema.
    pub constraint: Option<Arc<Constraint>>,
    /// Method name, for diagnostics.
    pub method: String,
    completer: Option<Completer>,
}

impl PendingRequest {
    fn finish(&mut self, outcome: Result<Value, CallError>) {
        match self.completer.take() {
            Some(Completer::Channel(tx)) => {
                let _ = tx.send(outcome);
            }
            Some(Completer::Callback(f)) => f(outcome),
            None => tracing::warn!(method = %self.method, "request completed twice"),
        }
    }

    /// Deliver the answer.
    pub fn complete(&mut self, result: Value) {
        self.finish(Ok(result));
    }

    /// Reject the request.
    pub fn fail(&mut self, error: CallError) {
        tracing::debug!(method = %self.method, error = %error, "request failed");
        self.finish(Err(error));
    }

    /// Request completed by an external caller: returns the handle to
    /// await.
    pub fn channel(
        method: String,
        constraint: Option<Arc<Constraint>>,
    ) -> (Self, CallHandle) {
        let (tx, rx) = oneshot::channel();
        (
            Self { constraint, method, completer: Some(Completer::Channel(tx)) },
            CallHandle { rx },
        )
    }

    /// Request completed by an internal continuation (decref
    /// acknowledgements and similar bookkeeping calls).
    pub fn callback(
        method: String,
        constraint: Option<Arc<Constraint>>,
        f: impl FnOnce(Result<Value, CallError>) + Send + 'static,
    ) -> Self {
        Self { constraint, method, completer: Some(Completer::Callback(Box::new(f))) }
    }
}

/// Single-fire completion handle returned by `call_remote`.
pub struct CallHandle {
    rx: oneshot::Receiver<Result<Value, CallError>>,
}

impl CallHandle {
    /// Non-blocking poll, for drivers that pump explicitly.
    pub fn try_result(&mut self) -> Option<Result<Value, CallError>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(CallError::Disconnected)),
        }
    }

    /// Await the outcome.
    pub async fn wait(self) -> Result<Value, CallError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::Disconnected),
        }
    }

    /// An already-failed handle, for calls that never made it onto the
    /// wire.
    #[must_use]
    pub fn failed(error: CallError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { rx }
    }
}

// ---------------------------------------------------------------------
// send side

/// Serializes one outbound call.
pub struct CallSlicer {
    req_id: u64,
    clid: u64,
    method: String,
    pairs: Vec<(String, Value)>,
    at: usize,
    stage: u8,
    scope: SendScope,
}

impl CallSlicer {
    /// Build from the validated argument map.
    #[must_use]
    pub fn new(req_id: u64, clid: u64, method: String, args: BTreeMap<String, Value>) -> Self {
        Self {
            req_id,
            clid,
            method,
            pairs: args.into_iter().collect(),
            at: 0,
            stage: 0,
            scope: SendScope::default(),
        }
    }
}

impl Slicer for CallSlicer {
    fn opentype(&self) -> Opentype {
        Opentype::of(&["call"])
    }

    fn next(&mut self) -> Result<SliceStep, Violation> {
        let step = match self.stage {
            0 => {
                self.stage = 1;
                SliceStep::Item(Value::Int(self.req_id as i64))
            }
            1 => {
                self.stage = 2;
                SliceStep::Item(Value::Int(self.clid as i64))
            }
            2 => {
                self.stage = 3;
                SliceStep::Item(Value::Bytes(self.method.clone().into_bytes()))
            }
            3 => {
                if self.at >= self.pairs.len() {
                    return Ok(SliceStep::Done);
                }
                self.stage = 4;
                SliceStep::Item(Value::Bytes(self.pairs[self.at].0.clone().into_bytes()))
            }
            _ => {
                self.stage = 3;
                self.at += 1;
                SliceStep::Item(self.pairs[self.at - 1].1.clone())
            }
        };
        Ok(step)
    }

    fn describe(&self) -> String {
        format!("<call-{}-{}-{}>", self.req_id, self.clid, self.method)
    }

    fn lookup_reference(&self, ident: usize) -> Option<u64> {
        self.scope.lookup(ident)
    }

    fn register_reference(&mut self, ident: usize, refid: u64, keep: &Value) -> bool {
        self.scope.register(ident, refid, keep);
        true
    }
}

/// Serializes one successful answer.
pub struct AnswerSlicer {
    req_id: u64,
    result: Option<Value>,
    stage: u8,
    scope: SendScope,
}

impl AnswerSlicer {
    /// Answer for `req_id` carrying `result`.
    #[must_use]
    pub fn new(req_id: u64, result: Value) -> Self {
        Self { req_id, result: Some(result), stage: 0, scope: SendScope::default() }
    }
}

impl Slicer for AnswerSlicer {
    fn opentype(&self) -> Opentype {
        Opentype::of(&["answer"])
    }

    fn next(&mut self) -> Result<SliceStep, Violation> {
        match self.stage {
            0 => {
                self.stage = 1;
                Ok(SliceStep::Item(Value::Int(self.req_id as i64)))
            }
            1 => {
                self.stage = 2;
                Ok(SliceStep::Item(self.result.take().expect("result set")))
            }
            _ => Ok(SliceStep::Done),
        }
    }

    fn describe(&self) -> String {
        format!("<answer-{}>", self.req_id)
    }

    fn lookup_reference(&self, ident: usize) -> Option<u64> {
        self.scope.lookup(ident)
    }

    fn register_reference(&mut self, ident: usize, refid: u64, keep: &Value) -> bool {
        self.scope.register(ident, refid, keep);
        true
    }
}

/// Serializes one error answer (the failure travels as a copyable).
pub struct ErrorSlicer {
    req_id: u64,
    failure: Option<Value>,
    stage: u8,
    scope: SendScope,
}

impl ErrorSlicer {
    /// Error answer for `req_id`.
    #[must_use]
    pub fn new(req_id: u64, failure: &RemoteFailure) -> Self {
        Self {
            req_id,
            failure: Some(Value::Copyable(Arc::new(failure.to_copyable()))),
            stage: 0,
            scope: SendScope::default(),
        }
    }
}

impl Slicer for ErrorSlicer {
    fn opentype(&self) -> Opentype {
        Opentype::of(&["error"])
    }

    fn next(&mut self) -> Result<SliceStep, Violation> {
        match self.stage {
            0 => {
                self.stage = 1;
                Ok(SliceStep::Item(Value::Int(self.req_id as i64)))
            }
            1 => {
                self.stage = 2;
                Ok(SliceStep::Item(self.failure.take().expect("failure set")))
            }
            _ => Ok(SliceStep::Done),
        }
    }

    fn describe(&self) -> String {
        format!("<error-{}>", self.req_id)
    }

    fn lookup_reference(&self, ident: usize) -> Option<u64> {
        self.scope.lookup(ident)
    }

    fn register_reference(&mut self, ident: usize, refid: u64, keep: &Value) -> bool {
        self.scope.register(ident, refid, keep);
        true
    }
}

// ---------------------------------------------------------------------
// receive side

fn expect_u64(obj: &Obj, what: &str) -> Result<u64, Violation> {
    match obj {
        Obj::Ready(Value::Int(i)) if *i >= 0 => Ok(*i as u64),
        _ => Err(Violation::new(format!("{} must be a non-negative integer", what))),
    }
}

fn expect_string(obj: Obj, what: &str) -> Result<String, Violation> {
    match obj {
        Obj::Ready(Value::Bytes(b)) => String::from_utf8(b)
            .map_err(|_| Violation::new(format!("{} must be UTF-8", what))),
        _ => Err(Violation::new(format!("{} must be a string", what))),
    }
}

struct CallAssembly {
    req_id: u64,
    clid: u64,
    method: String,
    schema: Option<Arc<MethodSchema>>,
    args: Mutex<BTreeMap<String, Value>>,
    unresolved: Mutex<usize>,
    finished: Mutex<bool>,
    dispatched: Mutex<bool>,
    queue: DispatchQueue,
}

impl CallAssembly {
    fn try_dispatch(self: &Arc<Self>) {
        if !*self.finished.lock() || *self.unresolved.lock() > 0 {
            return;
        }
        let mut dispatched = self.dispatched.lock();
        if *dispatched {
            return;
        }
        *dispatched = true;
        self.queue.push(ReadyCall {
            req_id: self.req_id,
            clid: self.clid,
            method: self.method.clone(),
            args: std::mem::take(&mut *self.args.lock()),
            schema: self.schema.clone(),
        });
    }
}

#[derive(Default)]
enum CallStage {
    #[default]
    ReqId,
    Clid,
    Method,
    Args,
}

/// Accumulates one inbound `call` sequence.
#[derive(Default)]
pub struct CallUnslicer {
    stage: CallStage,
    req_id: Option<u64>,
    clid: Option<u64>,
    schema: Option<Arc<MethodSchema>>,
    arg_name: Option<String>,
    ignore_current_arg: bool,
    arg_constraint: Option<Arc<Constraint>>,
    pending: Vec<(Option<String>, Promise<Value>)>,
    args: BTreeMap<String, Value>,
    unresolved: usize,
    method: Option<String>,
    references: HashMap<u64, Obj>,
}

impl Unslicer for CallUnslicer {
    fn check_token(&self, tag: TokenTag, size: u64) -> Result<(), TokenError> {
        match self.stage {
            CallStage::ReqId => {
                if tag == TokenTag::Int {
                    Ok(())
                } else {
                    Err(BananaError::new("request ID must be an INT").into())
                }
            }
            CallStage::Clid => {
                if tag == TokenTag::Int {
                    Ok(())
                } else {
                    Err(BananaError::new("object ID must be an INT").into())
                }
            }
            CallStage::Method => {
                if tag == TokenTag::String || tag == TokenTag::Vocab {
                    Ok(())
                } else {
                    Err(BananaError::new("method name must be a STRING").into())
                }
            }
            CallStage::Args => match &self.arg_name {
                None => {
                    if tag == TokenTag::String || tag == TokenTag::Vocab {
                        Ok(())
                    } else {
                        Err(BananaError::new("argument name must be a STRING").into())
                    }
                }
                Some(_) => match &self.arg_constraint {
                    Some(c) => c.check_token(tag, size),
                    None => Ok(()),
                },
            },
        }
    }

    fn do_open(
        &mut self,
        opentype: &Opentype,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        // check_token admits OPEN only in argument-value position
        if let Some(c) = &self.arg_constraint {
            c.check_opentype(opentype)?;
        }
        let child = cx.open_child(opentype)?;
        Ok(child.map(|mut child| {
            if let Some(c) = &self.arg_constraint {
                child.set_constraint(Arc::clone(c));
            }
            child
        }))
    }

    fn receive_child(
        &mut self,
        obj: Obj,
        ready: Option<Promise<Value>>,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        match self.stage {
            CallStage::ReqId => {
                let req_id = expect_u64(&obj, "request ID")?;
                cx.hooks.begin_call(req_id)?;
                self.req_id = Some(req_id);
                self.stage = CallStage::Clid;
            }
            CallStage::Clid => {
                let clid = expect_u64(&obj, "object ID")?;
                cx.hooks.call_target_exists(clid)?;
                self.clid = Some(clid);
                self.stage = CallStage::Method;
            }
            CallStage::Method => {
                let method = expect_string(obj, "method name")?;
                let clid = self.clid.expect("clid before method");
                let schema = cx.hooks.method_schema(clid, &method)?;
                if cx.hooks.require_schema() && schema.is_none() {
                    return Err(Violation::new(
                        "this broker does not accept unconstrained method calls",
                    ));
                }
                self.schema = schema;
                self.method = Some(method);
                self.stage = CallStage::Args;
            }
            CallStage::Args => match self.arg_name.take() {
                None => {
                    let name = expect_string(obj, "argument name")?;
                    if self.args.contains_key(&name) {
                        return Err(cx.abandon(BananaError::new(format!(
                            "duplicate argument '{}'",
                            name
                        ))));
                    }
                    self.ignore_current_arg = false;
                    self.arg_constraint = None;
                    if let Some(schema) = &self.schema {
                        let (accept, constraint) = schema.arg_constraint(&name)?;
                        self.ignore_current_arg = !accept;
                        self.arg_constraint = constraint;
                    }
                    self.arg_name = Some(name);
                }
                Some(name) => {
                    self.arg_constraint = None;
                    if self.ignore_current_arg {
                        return Ok(());
                    }
                    match obj {
                        Obj::Ready(v) => {
                            self.args.insert(name, v);
                        }
                        Obj::Pending(p) => {
                            self.unresolved += 1;
                            self.pending.push((Some(name), p));
                        }
                    }
                    if let Some(ready) = ready {
                        // dispatch also waits on slow sub-objects that are
                        // referenceable but not yet usable
                        self.unresolved += 1;
                        self.pending.push((None, ready));
                    }
                }
            },
        }
        Ok(())
    }

    fn report_violation(&mut self, violation: Violation, cx: &mut UnsliceCx<'_>) -> Option<Violation> {
        // an ABORT means the sender already knows; anything else deserves
        // an error answer if we know which request to blame
        if violation.message != "ABORT received" {
            if let Some(req_id) = self.req_id {
                cx.hooks.call_failed(req_id, violation.clone());
            }
        }
        Some(violation)
    }

    fn receive_close(&mut self, cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        if !matches!(self.stage, CallStage::Args) || self.arg_name.is_some() {
            return Err(cx.abandon(BananaError::new("'call' sequence ended too early")));
        }
        let assembly = Arc::new(CallAssembly {
            req_id: self.req_id.expect("req id set"),
            clid: self.clid.expect("clid set"),
            method: self.method.take().expect("method set"),
            schema: self.schema.clone(),
            args: Mutex::new(std::mem::take(&mut self.args)),
            unresolved: Mutex::new(self.unresolved),
            finished: Mutex::new(true),
            dispatched: Mutex::new(false),
            queue: cx.hooks.dispatch_queue(),
        });
        for (name, promise) in self.pending.drain(..) {
            let assembly_for_child = Arc::clone(&assembly);
            promise.when_resolved(move |v| {
                if let Some(name) = name {
                    assembly_for_child.args.lock().insert(name, v.clone());
                }
                *assembly_for_child.unresolved.lock() -= 1;
                assembly_for_child.try_dispatch();
            });
        }
        assembly.try_dispatch();
        Ok(Closed::ready(Value::None))
    }

    fn describe(&self) -> String {
        let mut s = "<methodcall".to_string();
        if let Some(req_id) = self.req_id {
            s.push_str(&format!(" reqID={}", req_id));
        }
        if let Some(method) = &self.method {
            s.push_str(&format!(" .{}", method));
        }
        if let Some(arg) = &self.arg_name {
            s.push_str(&format!(" arg[{}]", arg));
        }
        s.push('>');
        s
    }

    fn set_object(&mut self, count: u64, obj: Obj) {
        self.references.insert(count, obj);
    }

    fn get_object(&self, count: u64) -> Option<Obj> {
        self.references.get(&count).cloned()
    }
}

/// Accumulates one inbound `answer` sequence.
#[derive(Default)]
pub struct AnswerUnslicer {
    req_id: Option<u64>,
    constraint: Option<Arc<Constraint>>,
    result: Option<Obj>,
    references: HashMap<u64, Obj>,
}

impl Unslicer for AnswerUnslicer {
    fn check_token(&self, tag: TokenTag, size: u64) -> Result<(), TokenError> {
        if self.req_id.is_none() {
            return if tag == TokenTag::Int {
                Ok(())
            } else {
                Err(BananaError::new("request ID must be an INT").into())
            };
        }
        if self.result.is_some() {
            return Err(BananaError::new("answer sequence has too many parts").into());
        }
        match &self.constraint {
            Some(c) => c.check_token(tag, size).map_err(|e| match e {
                TokenError::Violation(v) => {
                    TokenError::Violation(v.annotated("in inbound method results"))
                }
                fatal => fatal,
            }),
            None => Ok(()),
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
        let child = cx.open_child(opentype)?;
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
        match self.req_id {
            None => {
                let req_id = expect_u64(&obj, "request ID")?;
                // unknown request ids are a violation, not fatal: the
                // request may have been abandoned locally
                self.constraint = cx.hooks.answer_constraint(req_id)?;
                self.req_id = Some(req_id);
            }
            Some(_) => {
                self.result = Some(obj);
            }
        }
        Ok(())
    }

    fn report_violation(&mut self, violation: Violation, cx: &mut UnsliceCx<'_>) -> Option<Violation> {
        if let Some(req_id) = self.req_id {
            cx.hooks.fail_request_violation(req_id, violation.clone());
        }
        Some(violation)
    }

    fn receive_close(&mut self, cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        let (Some(req_id), Some(result)) = (self.req_id, self.result.take()) else {
            return Err(cx.abandon(BananaError::new("answer sequence ended too early")));
        };
        cx.hooks.complete_answer(req_id, result);
        Ok(Closed::ready(Value::None))
    }

    fn describe(&self) -> String {
        match self.req_id {
            Some(req_id) => format!("Answer(req={})", req_id),
            None => "Answer(req=?)".to_string(),
        }
    }

    fn set_object(&mut self, count: u64, obj: Obj) {
        self.references.insert(count, obj);
    }

    fn get_object(&self, count: u64) -> Option<Obj> {
        self.references.get(&count).cloned()
    }
}

/// Accumulates one inbound `error` sequence.
pub struct ErrorUnslicer {
    req_id: Option<u64>,
    failure: Option<RemoteFailure>,
    constraint: Arc<Constraint>,
    references: HashMap<u64, Obj>,
}

impl Default for ErrorUnslicer {
    fn default() -> Self {
        Self {
            req_id: None,
            failure: None,
            constraint: Arc::new(Constraint::Failure),
            references: HashMap::new(),
        }
    }
}

impl Unslicer for ErrorUnslicer {
    fn check_token(&self, tag: TokenTag, size: u64) -> Result<(), TokenError> {
        if self.req_id.is_none() {
            return if tag == TokenTag::Int {
                Ok(())
            } else {
                Err(BananaError::new("request ID must be an INT").into())
            };
        }
        if self.failure.is_some() {
            return Err(BananaError::new("error sequence has too many parts").into());
        }
        self.constraint.check_token(tag, size)
    }

    fn do_open(
        &mut self,
        opentype: &Opentype,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        self.constraint.check_opentype(opentype)?;
        cx.open_child(opentype)
    }

    fn receive_child(
        &mut self,
        obj: Obj,
        _ready: Option<Promise<Value>>,
        cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        match self.req_id {
            None => {
                let req_id = expect_u64(&obj, "request ID")?;
                cx.hooks.answer_constraint(req_id)?;
                self.req_id = Some(req_id);
            }
            Some(_) => {
                let Obj::Ready(Value::Copyable(copyable)) = obj else {
                    return Err(Violation::new("error body must be a failure copyable"));
                };
                self.failure = Some(RemoteFailure::from_copyable(&copyable)?);
            }
        }
        Ok(())
    }

    fn report_violation(&mut self, violation: Violation, cx: &mut UnsliceCx<'_>) -> Option<Violation> {
        // a failure while receiving the failure
        if let Some(req_id) = self.req_id {
            cx.hooks.fail_request_violation(req_id, violation.clone());
        }
        Some(violation)
    }

    fn receive_close(&mut self, cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        let (Some(req_id), Some(failure)) = (self.req_id, self.failure.take()) else {
            return Err(cx.abandon(BananaError::new("error sequence ended too early")));
        };
        cx.hooks.fail_request(req_id, failure);
        Ok(Closed::ready(Value::None))
    }

    fn describe(&self) -> String {
        match self.req_id {
            Some(req_id) => format!("<error-{}>", req_id),
            None => "<error-?>".to_string(),
        }
    }

    fn set_object(&mut self, count: u64, obj: Obj) {
        self.references.insert(count, obj);
    }

    fn get_object(&self, count: u64) -> Option<Obj> {
        self.references.get(&count).cloned()
    }
}

fn string_field_check(tag: TokenTag, size: u64, max: u64) -> Result<(), TokenError> {
    Constraint::ByteString { max_length: Some(max) }.check_token(tag, size)
}

/// Inbound `my-reference`: the peer is exporting a capability to us.
#[derive(Default)]
pub struct MyReferenceUnslicer {
    clid: Option<u64>,
    interface: Option<String>,
    url: Option<String>,
    parts: u8,
}

impl Unslicer for MyReferenceUnslicer {
    fn check_token(&self, tag: TokenTag, size: u64) -> Result<(), TokenError> {
        match self.parts {
            0 => {
                if tag == TokenTag::Int {
                    Ok(())
                } else {
                    Err(BananaError::new("reference ID must be an INT").into())
                }
            }
            1 | 2 => string_field_check(tag, size, 200),
            _ => Err(Violation::new("too many parameters in my-reference").into()),
        }
    }

    fn do_open(
        &mut self,
        _opentype: &Opentype,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        Err(Violation::new("my-reference does not accept sub-objects"))
    }

    fn receive_child(
        &mut self,
        obj: Obj,
        _ready: Option<Promise<Value>>,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        match self.parts {
            0 => self.clid = Some(expect_u64(&obj, "reference ID")?),
            1 => {
                let name = expect_string(obj, "interface name")?;
                self.interface = if name.is_empty() { None } else { Some(name) };
            }
            2 => self.url = Some(expect_string(obj, "reference URL")?),
            _ => return Err(Violation::new("too many my-reference parameters")),
        }
        self.parts += 1;
        Ok(())
    }

    fn receive_close(&mut self, cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        let Some(clid) = self.clid else {
            return Err(cx.abandon(BananaError::new("my-reference ended too early")));
        };
        let value =
            cx.hooks.remote_reference(clid, self.interface.take(), self.url.take())?;
        Ok(Closed::ready(value))
    }

    fn describe(&self) -> String {
        match self.clid {
            Some(clid) => format!("<ref-{}>", clid),
            None => "<ref-?>".to_string(),
        }
    }
}

/// Inbound `your-reference`: one of our capabilities is coming home.
#[derive(Default)]
pub struct YourReferenceUnslicer {
    clid: Option<u64>,
}

impl Unslicer for YourReferenceUnslicer {
    fn check_token(&self, tag: TokenTag, _size: u64) -> Result<(), TokenError> {
        if tag == TokenTag::Int {
            Ok(())
        } else {
            Err(BananaError::new("your-reference ID must be an INT").into())
        }
    }

    fn do_open(
        &mut self,
        _opentype: &Opentype,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        Err(Violation::new("your-reference does not accept sub-objects"))
    }

    fn receive_child(
        &mut self,
        obj: Obj,
        _ready: Option<Promise<Value>>,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        if self.clid.is_some() {
            return Err(Violation::new("too many your-reference parameters"));
        }
        self.clid = Some(expect_u64(&obj, "your-reference ID")?);
        Ok(())
    }

    fn receive_close(&mut self, cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        let Some(clid) = self.clid else {
            return Err(cx.abandon(BananaError::new("your-reference ended too early")));
        };
        Ok(Closed::ready(cx.hooks.local_reference(clid)?))
    }

    fn describe(&self) -> String {
        match self.clid {
            Some(clid) => format!("<your-ref-{}>", clid),
            None => "<your-ref-?>".to_string(),
        }
    }
}

/// Inbound `their-reference`: a capability gifted by a third party. The
/// object may need its own connection before it is usable, so the result
/// can be pending.
#[derive(Default)]
pub struct TheirReferenceUnslicer {
    gift_id: Option<u64>,
    url: Option<String>,
}

impl Unslicer for TheirReferenceUnslicer {
    fn check_token(&self, tag: TokenTag, size: u64) -> Result<(), TokenError> {
        match (self.gift_id, &self.url) {
            (None, _) => {
                if tag == TokenTag::Int {
                    Ok(())
                } else {
                    Err(BananaError::new("their-reference gift ID must be an INT").into())
                }
            }
            (Some(_), None) => string_field_check(tag, size, 200),
            _ => Err(Violation::new("too many parameters in their-reference").into()),
        }
    }

    fn do_open(
        &mut self,
        _opentype: &Opentype,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<Option<Box<dyn Unslicer>>, Violation> {
        Err(Violation::new("their-reference does not accept sub-objects"))
    }

    fn receive_child(
        &mut self,
        obj: Obj,
        _ready: Option<Promise<Value>>,
        _cx: &mut UnsliceCx<'_>,
    ) -> Result<(), Violation> {
        if self.gift_id.is_none() {
            self.gift_id = Some(expect_u64(&obj, "gift ID")?);
        } else if self.url.is_none() {
            self.url = Some(expect_string(obj, "gift URL")?);
        } else {
            return Err(Violation::new("too many their-reference parameters"));
        }
        Ok(())
    }

    fn receive_close(&mut self, cx: &mut UnsliceCx<'_>) -> Result<Closed, Violation> {
        let (Some(gift_id), Some(url)) = (self.gift_id, self.url.take()) else {
            return Err(cx.abandon(BananaError::new("their-reference ended too early")));
        };
        let obj = cx.hooks.accept_gift(gift_id, url)?;
        let ready = match &obj {
            Obj::Pending(p) => Some(p.clone()),
            Obj::Ready(_) => None,
        };
        Ok(Closed::Obj { obj, ready })
    }

    fn describe(&self) -> String {
        match self.gift_id {
            Some(gift_id) => format!("<gift-{}>", gift_id),
            None => "<gift-?>".to_string(),
        }
    }
}
