//! In-memory engine and broker pairs.
//!
//! Most protocol behavior needs no sockets at all: the send engine
//! produces bytes, the receive engine consumes them, and a loop pumping
//! both directions until quiescence is a whole connection. Tests that
//! need real interleaving or partitions use [`crate::SimTransport`]
//! instead.

use bytes::BytesMut;

use banana_core::broker::{Broker, BrokerConfig};
use banana_core::promise::Promise;
use banana_core::registry::Registry;
use banana_core::slicer::{PumpProgress, SendEngine, SendOutcome};
use banana_core::tub::TubHandle;
use banana_core::unslicer::{
    CollectingHooks, Obj, ReceiveEngine, ReceiveFatal, RootPolicy, RootUnslicer,
};
use banana_core::value::Value;
use banana_core::TubRef;
use std::sync::Arc;

/// A one-direction pipe for plain (non-RPC) serialization: a send engine
/// feeding a receive engine directly.
pub struct ValuePipe {
    send: SendEngine,
    recv: ReceiveEngine,
    hooks: CollectingHooks,
}

impl ValuePipe {
    /// A pipe with no receive-side constraint.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root(RootUnslicer::new(RootPolicy::Plain, None))
    }

    /// A pipe with a custom root (e.g. one carrying a constraint).
    #[must_use]
    pub fn with_root(root: RootUnslicer) -> Self {
        Self {
            send: SendEngine::new(true),
            recv: ReceiveEngine::new(Arc::new(Registry::banana()), root),
            hooks: CollectingHooks::default(),
        }
    }

    /// Queue a value on the sending side.
    pub fn send(&mut self, value: Value) -> Promise<SendOutcome> {
        self.send.send(value)
    }

    /// Queue an outgoing-vocabulary switch.
    pub fn send_vocab(
        &mut self,
        table: std::collections::BTreeMap<u64, Vec<u8>>,
    ) -> Promise<SendOutcome> {
        self.send.set_outgoing_vocabulary(table)
    }

    /// Queue a custom slicer (fault-injection tests).
    pub fn send_slicer(
        &mut self,
        slicer: Box<dyn banana_core::slicer::Slicer>,
    ) -> Promise<SendOutcome> {
        self.send.queue().queue_slicer(slicer)
    }

    /// Serialize everything queued and return the wire bytes without
    /// feeding them.
    pub fn pump_bytes(&mut self) -> BytesMut {
        let mut out = BytesMut::new();
        match self.send.pump(&mut out, &mut self.hooks) {
            Ok(PumpProgress::Idle) => {}
            Ok(PumpProgress::Blocked(_)) => panic!("send suspended unexpectedly"),
            Err(e) => panic!("send side failed: {}", e),
        }
        out
    }

    /// Feed wire bytes to the receiving side.
    ///
    /// # Errors
    ///
    /// Propagates fatal receive errors for tests that expect them.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), ReceiveFatal> {
        self.recv.feed(bytes, &mut self.hooks)
    }

    /// Everything the receiver has delivered so far.
    pub fn take_received(&mut self) -> Vec<Obj> {
        std::mem::take(&mut self.hooks.received)
    }

    /// Violations absorbed at the root so far.
    pub fn take_violations(&mut self) -> Vec<banana_proto::Violation> {
        std::mem::take(&mut self.hooks.violations)
    }

    /// Send one value through the pipe and return the decoded objects
    /// (usually exactly one).
    pub fn roundtrip(&mut self, value: Value) -> Vec<Obj> {
        self.send(value);
        let bytes = self.pump_bytes();
        self.feed(&bytes).expect("round trip should not be fatal");
        self.take_received()
    }

    /// As [`ValuePipe::roundtrip`], but delivering the bytes one at a
    /// time to exercise every partial-token resume path.
    pub fn roundtrip_byte_by_byte(&mut self, value: Value) -> Vec<Obj> {
        self.send(value);
        let bytes = self.pump_bytes();
        for byte in &bytes {
            self.feed(std::slice::from_ref(byte)).expect("chunked feed should not be fatal");
        }
        self.take_received()
    }
}

impl Default for ValuePipe {
    fn default() -> Self {
        Self::new()
    }
}

/// Two brokers wired back-to-back in memory.
pub struct BrokerPair {
    /// One endpoint ("us").
    pub a: Broker,
    /// The other endpoint ("them").
    pub b: Broker,
}

impl BrokerPair {
    /// A pair with default configuration and no tubs.
    #[must_use]
    pub fn new() -> Self {
        Self {
            a: Broker::new(BrokerConfig::default(), None, None),
            b: Broker::new(BrokerConfig::default(), None, None),
        }
    }

    /// A pair whose endpoints each host a tub.
    #[must_use]
    pub fn with_tubs(tub_a: TubHandle, tub_b: TubHandle) -> Self {
        let peer_a = TubRef::Auth { tub_id: "tub-b".to_string() };
        let peer_b = TubRef::Auth { tub_id: "tub-a".to_string() };
        Self {
            a: Broker::new(BrokerConfig::default(), Some(tub_a), Some(peer_a)),
            b: Broker::new(BrokerConfig::default(), Some(tub_b), Some(peer_b)),
        }
    }

    /// Shuttle bytes both ways until neither side produces any more.
    /// Panics on fatal protocol errors; tests expecting those drive the
    /// brokers by hand.
    pub fn flush(&mut self) {
        for _ in 0..64 {
            let mut quiet = true;
            let mut out = BytesMut::new();
            self.a.pump(&mut out).expect("a pump");
            if !out.is_empty() {
                quiet = false;
                self.b.feed(&out).expect("b feed");
            }
            let mut out = BytesMut::new();
            self.b.pump(&mut out).expect("b pump");
            if !out.is_empty() {
                quiet = false;
                self.a.feed(&out).expect("a feed");
            }
            if quiet {
                return;
            }
        }
        panic!("broker pair did not quiesce");
    }
}

impl Default for BrokerPair {
    fn default() -> Self {
        Self::new()
    }
}
