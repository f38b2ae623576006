//! Suspension semantics: a pending child pauses serialization when every
//! enclosing frame allows streaming, and is a violation when one does
//! not. The receive side keeps consuming regardless.

use std::sync::Arc;

use bytes::BytesMut;

use banana_core::promise::Promise;
use banana_core::registry::Registry;
use banana_core::slicer::{PumpProgress, SendEngine};
use banana_core::unslicer::{CollectingHooks, Obj, ReceiveEngine, RootPolicy, RootUnslicer};
use banana_core::value::Value;

fn recv_engine() -> (ReceiveEngine, CollectingHooks) {
    (
        ReceiveEngine::new(Arc::new(Registry::banana()), RootUnslicer::new(RootPolicy::Plain, None)),
        CollectingHooks::default(),
    )
}

#[test]
fn pending_child_suspends_and_resumes() {
    let mut send = SendEngine::new(true);
    let mut hooks = CollectingHooks::default();
    let (mut recv, mut recv_hooks) = recv_engine();

    let promise: Promise<Value> = Promise::new();
    let value = Value::list(vec![
        Value::Int(1),
        Value::Pending(promise.clone()),
        Value::Int(3),
    ]);
    let done = send.send(value);

    let mut wire = BytesMut::new();
    let progress = send.pump(&mut wire, &mut hooks).expect("pump");
    let PumpProgress::Blocked(waiting) = progress else {
        panic!("expected the send to suspend on the pending child");
    };
    assert!(waiting.same_slot(&promise));
    assert!(done.peek().is_none(), "the send is not complete while suspended");

    // the receiver sees a clean prefix and keeps its own state
    recv.feed(&wire, &mut recv_hooks).expect("prefix decodes");
    assert!(recv_hooks.received.is_empty());

    // resolution resumes production
    promise.resolve(Value::Int(2));
    let mut rest = BytesMut::new();
    let progress = send.pump(&mut rest, &mut hooks).expect("pump resumes");
    assert!(matches!(progress, PumpProgress::Idle));
    assert!(matches!(done.peek(), Some(Ok(()))));

    recv.feed(&rest, &mut recv_hooks).expect("suffix decodes");
    let received = std::mem::take(&mut recv_hooks.received);
    assert_eq!(received.len(), 1);
    let expected = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert!(matches!(&received[0], Obj::Ready(v) if *v == expected));
}

#[test]
fn pending_child_in_a_non_streamable_connection_is_a_violation() {
    let mut send = SendEngine::new(false);
    let mut hooks = CollectingHooks::default();
    let (mut recv, mut recv_hooks) = recv_engine();

    let promise: Promise<Value> = Promise::new();
    let value = Value::list(vec![Value::Int(1), Value::Pending(promise)]);
    let done = send.send(value);
    let mut wire = BytesMut::new();
    let progress = send.pump(&mut wire, &mut hooks).expect("pump");
    assert!(matches!(progress, PumpProgress::Idle));
    match done.peek() {
        Some(Err(banana_core::slicer::SendError::Violation(v))) => {
            assert!(v.message.contains("parent not streamable"));
        }
        other => panic!("expected a streamability violation, got {:?}", other),
    }

    // the aborted stream still leaves the receiver coherent
    recv.feed(&wire, &mut recv_hooks).expect("abort stream decodes");
    assert!(recv_hooks.received.is_empty());
    assert_eq!(recv_hooks.violations.len(), 1);
}

#[test]
fn already_resolved_pending_is_sent_inline() {
    let mut send = SendEngine::new(true);
    let mut hooks = CollectingHooks::default();
    let (mut recv, mut recv_hooks) = recv_engine();

    let value = Value::list(vec![Value::Pending(Promise::resolved(Value::Int(9)))]);
    send.send(value);
    let mut wire = BytesMut::new();
    let progress = send.pump(&mut wire, &mut hooks).expect("pump");
    assert!(matches!(progress, PumpProgress::Idle));

    recv.feed(&wire, &mut recv_hooks).expect("decodes");
    let expected = Value::list(vec![Value::Int(9)]);
    assert!(matches!(&recv_hooks.received[..], [Obj::Ready(v)] if *v == expected));
}
