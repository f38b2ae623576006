//! The per-connection RPC broker.
//!
//! A [`Broker`] owns one send engine and one receive engine over a single
//! negotiated connection, plus the four capability maps: exported objects
//! by identity and clid, imported references by clid (and URL), pending
//! outbound requests by request id, and third-party gifts in transit.
//!
//! The broker is single-threaded per connection: the driver alternates
//! `feed` (inbound bytes) and `pump` (outbound bytes); dispatching of
//! fully-assembled inbound calls and decref housekeeping happen inside
//! `pump`. Clid 0 names the broker itself, whose built-in interface
//! carries the bookkeeping methods `decref`, `decgift` and
//! `getReferenceByName`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::BytesMut;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use banana_proto::{BananaError, Violation};

use crate::call::{
    AnswerSlicer, CallError, CallHandle, CallSlicer, ErrorSlicer, PendingRequest,
};
use crate::failure::RemoteFailure;
use crate::reference::{
    Args, DecrefQueue, LocalRef, ReferenceableTracker, RemoteHandle, RemoteReferenceTracker,
    TubRef,
};
use crate::registry::{self, Registry, RemoteInterface};
use crate::schema::{Constraint, MethodSchema};
use crate::slicer::{PumpProgress, SendEngine, SendQueue};
use crate::tub::TubHandle;
use crate::unslicer::{
    CapabilityWire, DispatchQueue, EngineHooks, Obj, ReadyCall, ReceiveEngine, ReceiveFatal,
    RootPolicy, RootUnslicer,
};
use crate::value::Value;

static BROKER_INTERFACE: Lazy<RemoteInterface> = Lazy::new(|| {
    RemoteInterface::new(
        "RIBroker",
        vec![
            MethodSchema::new(
                "getReferenceByName",
                vec![("name", Constraint::ByteString { max_length: Some(200) })],
                Some(Constraint::Any),
            ),
            MethodSchema::new(
                "decref",
                vec![
                    ("clid", Constraint::Integer { max_bytes: None }),
                    ("count", Constraint::Integer { max_bytes: None }),
                ],
                Some(Constraint::Nothing),
            ),
            MethodSchema::new(
                "decgift",
                vec![
                    ("giftID", Constraint::Integer { max_bytes: None }),
                    ("count", Constraint::Integer { max_bytes: None }),
                ],
                Some(Constraint::Nothing),
            ),
        ],
    )
});

/// Construction-time knobs.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Refuse calls to methods without a schema.
    pub require_schema: bool,
    /// Allow senders to suspend serialization by default.
    pub streamable: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { require_schema: false, streamable: true }
    }
}

struct GiftRecord {
    handle: RemoteHandle,
    gift_id: u64,
    count: u64,
}

/// The connection state shared by both engines.
struct BrokerState {
    disconnected: bool,
    require_schema: bool,
    send_q: SendQueue,
    dispatch_q: DispatchQueue,
    decrefs: DecrefQueue,
    retirements: Arc<Mutex<Vec<u64>>>,
    next_clid: u64,
    next_req_id: u64,
    next_gift_id: u64,
    my_refs_by_ident: HashMap<usize, u64>,
    my_refs_by_clid: HashMap<u64, ReferenceableTracker>,
    your_refs_by_clid: HashMap<u64, RemoteReferenceTracker>,
    your_refs_by_url: HashMap<String, u64>,
    gifts: HashMap<(usize, u64), GiftRecord>,
    gifts_by_id: HashMap<u64, (usize, u64)>,
    waiting: Arc<Mutex<HashMap<u64, PendingRequest>>>,
    active_local_calls: HashSet<u64>,
    tub: Option<TubHandle>,
    peer: Option<TubRef>,
    disconnect_watchers: Vec<Box<dyn FnOnce() + Send>>,
}

impl BrokerState {
    fn allocate_req_id(&mut self) -> u64 {
        let id = self.next_req_id;
        self.next_req_id += 1;
        id
    }

    fn tracker_for_my_reference(&mut self, obj: &LocalRef) -> &mut ReferenceableTracker {
        let ident = obj.identity();
        let clid = match self.my_refs_by_ident.get(&ident) {
            Some(clid) => *clid,
            None => {
                let clid = self.next_clid;
                self.next_clid += 1;
                self.my_refs_by_ident.insert(ident, clid);
                clid
            }
        };
        let url = self
            .tub
            .as_ref()
            .and_then(|tub| tub.lock().url_for_identity(ident));
        self.my_refs_by_clid
            .entry(clid)
            .or_insert_with(|| ReferenceableTracker::new(obj.clone(), clid, url))
    }

    fn queue_internal_call(
        &mut self,
        method: &'static str,
        args: Args,
        on_done: impl FnOnce(Result<Value, CallError>) + Send + 'static,
    ) {
        let schema = BROKER_INTERFACE.method(method).expect("builtin method");
        let req_id = self.allocate_req_id();
        let request = PendingRequest::callback(method.to_string(), schema.response.clone(), on_done);
        self.waiting.lock().insert(req_id, request);
        let done = self
            .send_q
            .queue_slicer(Box::new(CallSlicer::new(req_id, 0, method.to_string(), args)));
        let waiting = Arc::clone(&self.waiting);
        done.when_resolved(move |outcome| {
            if let Err(e) = outcome {
                if let Some(mut request) = waiting.lock().remove(&req_id) {
                    request.fail(e.clone().into());
                }
            }
        });
    }

    /// Turn queued handle-drop notifications into decref calls. The peer
    /// acknowledges each one; the tracker is retired only then.
    fn flush_decrefs(&mut self) {
        for (clid, count) in self.decrefs.drain() {
            if self.disconnected {
                // the peer is gone; it has forgotten us already
                continue;
            }
            tracing::debug!(clid, count, "sending decref");
            let retirements = Arc::clone(&self.retirements);
            let args = BTreeMap::from([
                ("clid".to_string(), Value::Int(clid as i64)),
                ("count".to_string(), Value::Int(count as i64)),
            ]);
            self.queue_internal_call("decref", args, move |outcome| {
                // losing the connection before the ack is fine: the
                // tracker dies with the broker
                if outcome.is_ok() {
                    retirements.lock().push(clid);
                }
            });
        }
        for clid in std::mem::take(&mut *self.retirements.lock()) {
            let idle = self.your_refs_by_clid.get(&clid).is_some_and(|t| t.is_idle());
            if idle {
                if let Some(tracker) = self.your_refs_by_clid.remove(&clid) {
                    if let Some(url) = tracker.url() {
                        self.your_refs_by_url.remove(url);
                    }
                }
            }
        }
    }

    fn queue_error(&mut self, req_id: u64, failure: &RemoteFailure) {
        let done = self.send_q.queue_slicer(Box::new(ErrorSlicer::new(req_id, failure)));
        done.when_resolved(move |outcome| {
            if let Err(e) = outcome {
                tracing::warn!(req_id, error = ?e, "could not deliver error answer");
            }
        });
    }

    fn run_ready_call(&mut self, call: ReadyCall) {
        let ReadyCall { req_id, clid, method, args, schema } = call;
        if !self.active_local_calls.remove(&req_id) {
            tracing::warn!(req_id, "dispatch for an inactive request");
            return;
        }

        if let Some(schema) = &schema {
            if let Err(v) = schema.check_args(&args) {
                self.queue_error(req_id, &RemoteFailure::from(v));
                return;
            }
        }

        let outcome = if clid == 0 {
            self.dispatch_builtin(&method, args)
        } else {
            match self.my_refs_by_clid.get(&clid) {
                Some(tracker) => tracker.obj.object().clone().do_remote_call(&method, args),
                None => Err(RemoteFailure::new("Violation", format!("unknown clid {}", clid))),
            }
        };

        // exactly one of answer/error goes out, even if the result then
        // flunks the response schema
        match outcome {
            Ok(result) => {
                if let Some(schema) = &schema {
                    if let Err(v) = schema.check_results(&result, false) {
                        self.queue_error(req_id, &RemoteFailure::from(v));
                        return;
                    }
                }
                let done = self.send_q.queue_slicer(Box::new(AnswerSlicer::new(req_id, result)));
                done.when_resolved(move |outcome| {
                    if let Err(e) = outcome {
                        tracing::warn!(req_id, error = ?e, "could not deliver answer");
                    }
                });
            }
            Err(failure) => self.queue_error(req_id, &failure),
        }
    }

    fn dispatch_builtin(&mut self, method: &str, args: Args) -> Result<Value, RemoteFailure> {
        let int_arg = |name: &str| -> Result<u64, RemoteFailure> {
            match args.get(name) {
                Some(Value::Int(i)) if *i >= 0 => Ok(*i as u64),
                _ => Err(RemoteFailure::new(
                    "Violation",
                    format!("missing or invalid argument '{}'", name),
                )),
            }
        };
        match method {
            "decref" => {
                let clid = int_arg("clid")?;
                let count = int_arg("count")?;
                if clid == 0 {
                    return Err(RemoteFailure::new("Violation", "cannot decref the broker"));
                }
                if let Some(tracker) = self.my_refs_by_clid.get_mut(&clid) {
                    if tracker.decref(count) {
                        tracing::debug!(clid, "retiring exported reference");
                        let ident = tracker.obj.identity();
                        self.my_refs_by_clid.remove(&clid);
                        self.my_refs_by_ident.remove(&ident);
                    }
                }
                Ok(Value::None)
            }
            "decgift" => {
                let gift_id = int_arg("giftID")?;
                let count = int_arg("count")?;
                if let Some(key) = self.gifts_by_id.get(&gift_id).copied() {
                    let expired = {
                        let record = self.gifts.get_mut(&key).expect("gift tables consistent");
                        record.count = record.count.saturating_sub(count);
                        record.count == 0
                    };
                    if expired {
                        if let Some(record) = self.gifts.remove(&key) {
                            tracing::debug!(
                                clid = record.handle.clid(),
                                gift_id,
                                "gift fully released"
                            );
                        }
                        self.gifts_by_id.remove(&gift_id);
                    }
                }
                Ok(Value::None)
            }
            "getReferenceByName" => {
                let name = match args.get("name") {
                    Some(Value::Bytes(b)) => String::from_utf8_lossy(b).into_owned(),
                    _ => {
                        return Err(RemoteFailure::new(
                            "Violation",
                            "missing or invalid argument 'name'",
                        ))
                    }
                };
                let found = self.tub.as_ref().and_then(|tub| tub.lock().lookup(&name));
                match found {
                    Some(obj) => Ok(Value::Local(obj)),
                    None => Err(RemoteFailure::new(
                        "KeyError",
                        format!("no published reference named '{}'", name),
                    )),
                }
            }
            other => Err(RemoteFailure::new(
                "Violation",
                format!("method '{}' not defined in RIBroker", other),
            )),
        }
    }
}

impl EngineHooks for BrokerState {
    fn received_object(&mut self, _obj: Obj) {
        // top-level sequences on a broker connection do their work through
        // the other hooks; nothing is delivered as a plain object
    }

    fn remote_reference(
        &mut self,
        clid: u64,
        interface: Option<String>,
        url: Option<String>,
    ) -> Result<Value, Violation> {
        let decrefs = self.decrefs.clone();
        let tracker = self
            .your_refs_by_clid
            .entry(clid)
            .or_insert_with(|| RemoteReferenceTracker::new(clid, url.clone(), interface, decrefs));
        let handle = tracker.get_ref();
        if let Some(url) = tracker.url() {
            self.your_refs_by_url.insert(url.to_string(), clid);
        }
        Ok(Value::Remote(handle))
    }

    fn local_reference(&mut self, clid: u64) -> Result<Value, Violation> {
        match self.my_refs_by_clid.get(&clid) {
            Some(tracker) => Ok(Value::Local(tracker.obj.clone())),
            None => Err(Violation::new(format!("unknown clid {}", clid))),
        }
    }

    fn accept_gift(&mut self, gift_id: u64, url: String) -> Result<Obj, Violation> {
        let local = self.tub.as_ref().and_then(|tub| tub.lock().lookup_url(&url));
        match local {
            Some(obj) => {
                let args = BTreeMap::from([
                    ("giftID".to_string(), Value::Int(gift_id as i64)),
                    ("count".to_string(), Value::Int(1)),
                ]);
                self.queue_internal_call("decgift", args, |_| {});
                Ok(Obj::Ready(Value::Local(obj)))
            }
            None => {
                // claiming the gift needs a connection to a third tub,
                // which this broker cannot make on its own
                tracing::warn!(%url, "gift points at an unreachable tub");
                Ok(Obj::Pending(crate::promise::Promise::new()))
            }
        }
    }

    fn begin_call(&mut self, req_id: u64) -> Result<(), Violation> {
        if !self.active_local_calls.insert(req_id) {
            return Err(Violation::new(format!("duplicate request ID {}", req_id)));
        }
        Ok(())
    }

    fn call_target_exists(&mut self, clid: u64) -> Result<(), Violation> {
        if clid == 0 || self.my_refs_by_clid.contains_key(&clid) {
            Ok(())
        } else {
            Err(Violation::new(format!("unknown clid {}", clid)))
        }
    }

    fn method_schema(
        &mut self,
        clid: u64,
        method: &str,
    ) -> Result<Option<Arc<MethodSchema>>, Violation> {
        if clid == 0 {
            return match BROKER_INTERFACE.method(method) {
                Some(schema) => Ok(Some(schema)),
                None => Err(Violation::new(format!(
                    "method '{}' not defined in {}",
                    method, BROKER_INTERFACE.name
                ))),
            };
        }
        let tracker = self
            .my_refs_by_clid
            .get(&clid)
            .ok_or_else(|| Violation::new(format!("unknown clid {}", clid)))?;
        let Some(interface_name) = tracker.obj.object().interface_name() else {
            return Ok(None);
        };
        let Some(interface) = registry::remote_interface(interface_name) else {
            return Err(Violation::new(format!(
                "unknown remote interface '{}'",
                interface_name
            )));
        };
        match interface.method(method) {
            Some(schema) => Ok(Some(schema)),
            None => Err(Violation::new(format!(
                "method '{}' not defined in {}",
                method, interface.name
            ))),
        }
    }

    fn require_schema(&self) -> bool {
        self.require_schema
    }

    fn dispatch_queue(&mut self) -> DispatchQueue {
        self.dispatch_q.clone()
    }

    fn call_failed(&mut self, req_id: u64, violation: Violation) {
        self.active_local_calls.remove(&req_id);
        tracing::debug!(req_id, %violation, "inbound call failed");
        self.queue_error(req_id, &RemoteFailure::from(violation));
    }

    fn answer_constraint(&mut self, req_id: u64) -> Result<Option<Arc<Constraint>>, Violation> {
        match self.waiting.lock().get(&req_id) {
            Some(request) => Ok(request.constraint.clone()),
            None => Err(Violation::new(format!("non-existent reqID {}", req_id))),
        }
    }

    fn complete_answer(&mut self, req_id: u64, result: Obj) {
        let Some(request) = self.waiting.lock().remove(&req_id) else {
            tracing::warn!(req_id, "answer for an unknown request");
            return;
        };
        let mut request = request;
        match result {
            Obj::Ready(value) => request.complete(value),
            Obj::Pending(p) => p.when_resolved(move |value| {
                let mut request = request;
                request.complete(value.clone());
            }),
        }
    }

    fn fail_request(&mut self, req_id: u64, failure: RemoteFailure) {
        if let Some(mut request) = self.waiting.lock().remove(&req_id) {
            request.fail(CallError::Remote(failure));
        }
    }

    fn fail_request_violation(&mut self, req_id: u64, violation: Violation) {
        if let Some(mut request) = self.waiting.lock().remove(&req_id) {
            request.fail(CallError::Violation(violation));
        }
    }

    fn slice_local(&mut self, obj: &LocalRef) -> Result<CapabilityWire, Violation> {
        let interface = obj.object().interface_name().map(str::to_string);
        let tracker = self.tracker_for_my_reference(obj);
        let clid = tracker.clid;
        if tracker.send() {
            Ok(CapabilityWire::MyReference {
                clid,
                interface: Some(interface.unwrap_or_default()),
                url: tracker.url.clone(),
            })
        } else {
            Ok(CapabilityWire::MyReference { clid, interface: None, url: None })
        }
    }

    fn slice_remote(&mut self, handle: &RemoteHandle) -> Result<CapabilityWire, Violation> {
        if handle.decref_key() == self.decrefs.key() {
            // one of this connection's own imports, going home
            return Ok(CapabilityWire::YourReference { clid: handle.clid() });
        }
        // third-party reference: gift it by URL
        let Some(url) = handle.url() else {
            return Err(Violation::new("cannot gift an unnamed remote reference"));
        };
        let key = (handle.decref_key(), handle.clid());
        if let Some(record) = self.gifts.get_mut(&key) {
            record.count += 1;
            return Ok(CapabilityWire::TheirReference {
                gift_id: record.gift_id,
                url: url.to_string(),
            });
        }
        let gift_id = self.next_gift_id;
        self.next_gift_id += 1;
        self.gifts
            .insert(key, GiftRecord { handle: handle.clone(), gift_id, count: 1 });
        self.gifts_by_id.insert(gift_id, key);
        Ok(CapabilityWire::TheirReference { gift_id, url: url.to_string() })
    }
}

/// One connection's RPC endpoint.
pub struct Broker {
    send: SendEngine,
    recv: ReceiveEngine,
    state: BrokerState,
}

impl Broker {
    /// Build a broker for a freshly negotiated connection. `peer` is the
    /// negotiated peer identity, used to detach from the tub's broker
    /// table on connection loss.
    #[must_use]
    pub fn new(config: BrokerConfig, tub: Option<TubHandle>, peer: Option<TubRef>) -> Self {
        let registry = Arc::new(Registry::pb());
        let send = SendEngine::new(config.streamable);
        let recv =
            ReceiveEngine::new(registry, RootUnslicer::new(RootPolicy::OpenOnly, None));
        let state = BrokerState {
            disconnected: false,
            require_schema: config.require_schema,
            send_q: send.queue(),
            dispatch_q: DispatchQueue::new(),
            decrefs: DecrefQueue::new(),
            retirements: Arc::new(Mutex::new(Vec::new())),
            next_clid: 1, // 0 is the broker itself
            next_req_id: 0,
            next_gift_id: 0,
            my_refs_by_ident: HashMap::new(),
            my_refs_by_clid: HashMap::new(),
            your_refs_by_clid: HashMap::new(),
            your_refs_by_url: HashMap::new(),
            gifts: HashMap::new(),
            gifts_by_id: HashMap::new(),
            waiting: Arc::new(Mutex::new(HashMap::new())),
            active_local_calls: HashSet::new(),
            tub,
            peer,
            disconnect_watchers: Vec::new(),
        };
        Self { send, recv, state }
    }

    /// Feed inbound transport bytes.
    ///
    /// # Errors
    ///
    /// [`ReceiveFatal`] on framing corruption: the driver sends the
    /// diagnostic if requested, then calls [`Broker::connection_lost`] and
    /// drops the transport.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), ReceiveFatal> {
        self.recv.feed(chunk, &mut self.state)
    }

    /// Run housekeeping (decrefs, ready dispatches) and serialize pending
    /// output into `out`.
    ///
    /// # Errors
    ///
    /// [`BananaError`] when the send side is corrupt; drop the connection.
    pub fn pump(&mut self, out: &mut BytesMut) -> Result<PumpProgress, BananaError> {
        self.state.flush_decrefs();
        for call in self.state.dispatch_q.drain() {
            self.state.run_ready_call(call);
        }
        self.send.pump(out, &mut self.state)
    }

    /// Invoke a method on an imported capability.
    ///
    /// Always returns a handle: local failures (stale broker, schema
    /// rejection of the arguments) come back through it, never as panics
    /// or synchronous errors.
    pub fn call_remote(
        &mut self,
        target: &RemoteHandle,
        method: &str,
        positional: Vec<Value>,
        named: Args,
    ) -> CallHandle {
        if self.state.disconnected {
            return CallHandle::failed(CallError::DeadReference);
        }

        let schema = match target.interface_name() {
            Some(interface_name) => match registry::remote_interface(interface_name) {
                Some(interface) => match interface.method(method) {
                    Some(schema) => Some(schema),
                    None => {
                        return CallHandle::failed(CallError::Violation(Violation::new(
                            format!("{} does not offer {}", interface.name, method),
                        )))
                    }
                },
                None => None,
            },
            None => None,
        };

        let args = match &schema {
            Some(schema) => {
                match schema
                    .map_arguments(positional, named)
                    .and_then(|args| schema.check_all_args(&args).map(|()| args))
                {
                    Ok(args) => args,
                    Err(v) => return CallHandle::failed(CallError::Violation(v)),
                }
            }
            None => {
                if !positional.is_empty() {
                    return CallHandle::failed(CallError::Violation(Violation::new(
                        "positional arguments require a remote interface",
                    )));
                }
                named
            }
        };

        let req_id = self.state.allocate_req_id();
        let (request, handle) = PendingRequest::channel(
            method.to_string(),
            schema.as_ref().and_then(|s| s.response.clone()),
        );
        self.state.waiting.lock().insert(req_id, request);

        let done = self.state.send_q.queue_slicer(Box::new(CallSlicer::new(
            req_id,
            target.clid(),
            method.to_string(),
            args,
        )));
        // if argument serialization fails partway, the request must still
        // be failed; nobody else will answer it
        let waiting = Arc::clone(&self.state.waiting);
        done.when_resolved(move |outcome| {
            if let Err(e) = outcome {
                if let Some(mut request) = waiting.lock().remove(&req_id) {
                    request.fail(e.clone().into());
                }
            }
        });
        handle
    }

    /// Ask the peer's tub for a published reference by name.
    pub fn get_reference_by_name(&mut self, name: &str) -> CallHandle {
        if self.state.disconnected {
            return CallHandle::failed(CallError::DeadReference);
        }
        let req_id = self.state.allocate_req_id();
        let schema = BROKER_INTERFACE.method("getReferenceByName").expect("builtin method");
        let (request, handle) =
            PendingRequest::channel("getReferenceByName".to_string(), schema.response.clone());
        self.state.waiting.lock().insert(req_id, request);
        let args = BTreeMap::from([(
            "name".to_string(),
            Value::Bytes(name.as_bytes().to_vec()),
        )]);
        let done = self.state.send_q.queue_slicer(Box::new(CallSlicer::new(
            req_id,
            0,
            "getReferenceByName".to_string(),
            args,
        )));
        let waiting = Arc::clone(&self.state.waiting);
        done.when_resolved(move |outcome| {
            if let Err(e) = outcome {
                if let Some(mut request) = waiting.lock().remove(&req_id) {
                    request.fail(e.clone().into());
                }
            }
        });
        handle
    }

    /// Negotiate a new outgoing-vocabulary table with the peer's decoder.
    /// Takes effect for everything queued after this call.
    pub fn set_outgoing_vocabulary(&mut self, table: BTreeMap<u64, Vec<u8>>) {
        let done = self.send.set_outgoing_vocabulary(table);
        done.when_resolved(|outcome| {
            if let Err(e) = outcome {
                tracing::warn!(error = ?e, "vocabulary update failed to serialize");
            }
        });
    }

    /// Register a callback for connection teardown.
    pub fn notify_on_disconnect(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.state.disconnect_watchers.push(Box::new(callback));
    }

    /// Number of live exported-reference trackers (tests and debugging).
    #[must_use]
    pub fn exported_references(&self) -> usize {
        self.state.my_refs_by_clid.len()
    }

    /// Number of live imported-reference trackers (tests and debugging).
    #[must_use]
    pub fn imported_references(&self) -> usize {
        self.state.your_refs_by_clid.len()
    }

    /// The transport is gone: fail every outstanding request with a
    /// disconnection error (distinct from any RPC-level failure), clear
    /// the capability tables, notify watchers, detach from the tub.
    pub fn connection_lost(&mut self) {
        if self.state.disconnected {
            return;
        }
        self.state.disconnected = true;
        tracing::debug!("broker connection lost");

        for (_, mut request) in self.state.waiting.lock().drain() {
            request.fail(CallError::Disconnected);
        }
        self.state.my_refs_by_ident.clear();
        self.state.my_refs_by_clid.clear();
        self.state.your_refs_by_clid.clear();
        self.state.your_refs_by_url.clear();
        self.state.gifts.clear();
        self.state.gifts_by_id.clear();
        self.state.active_local_calls.clear();
        self.send.connection_lost();

        for watcher in self.state.disconnect_watchers.drain(..) {
            watcher();
        }
        if let (Some(tub), Some(peer)) = (&self.state.tub, &self.state.peer) {
            tub.lock().broker_detached(peer);
        }
    }
}
