//! Constraint enforcement at the receiving side: oversized tokens are
//! rejected before buffering, the violation names the path to the
//! offending element, and the connection stays usable afterwards.

use std::sync::Arc;

use banana_core::schema::Constraint;
use banana_core::unslicer::{Obj, RootPolicy, RootUnslicer};
use banana_core::value::Value;
use banana_harness::ValuePipe;

fn constrained_pipe(constraint: Constraint) -> ValuePipe {
    ValuePipe::with_root(RootUnslicer::new(RootPolicy::Plain, Some(Arc::new(constraint))))
}

#[test]
fn oversized_string_in_list_is_rejected_with_its_path() {
    let constraint = Constraint::List {
        item: Arc::new(Constraint::ByteString { max_length: Some(10) }),
        max_length: Some(30),
    };
    let mut pipe = constrained_pipe(constraint);

    // eleven bytes in the third slot; the first two are fine
    let bad = Value::list(vec![
        Value::Bytes(b"ok".to_vec()),
        Value::Bytes(b"fine".to_vec()),
        Value::Bytes(b"0123456789X".to_vec()),
    ]);
    pipe.send(bad);
    let bytes = pipe.pump_bytes();
    pipe.feed(&bytes).expect("a violation is not fatal");

    assert!(pipe.take_received().is_empty(), "the contaminated list must not be delivered");
    let violations = pipe.take_violations();
    assert_eq!(violations.len(), 1);
    let violation = &violations[0];
    assert_eq!(violation.location.as_deref(), Some("<Root>.[2]"));
    assert!(violation.message.contains("token too large: 11>10"), "got: {}", violation.message);

    // the connection remains usable for a well-formed follow-up
    let good = Value::list(vec![Value::Bytes(b"short".to_vec())]);
    pipe.send(good.clone());
    let bytes = pipe.pump_bytes();
    pipe.feed(&bytes).expect("follow-up decodes");
    let received = pipe.take_received();
    assert_eq!(received.len(), 1);
    assert!(matches!(&received[0], Obj::Ready(v) if *v == good));
}

#[test]
fn wrong_token_kind_is_a_violation_not_a_crash() {
    let mut pipe = constrained_pipe(Constraint::List {
        item: Arc::new(Constraint::Integer { max_bytes: None }),
        max_length: Some(10),
    });
    pipe.send(Value::list(vec![Value::Int(1), Value::Bytes(b"nope".to_vec())]));
    let bytes = pipe.pump_bytes();
    pipe.feed(&bytes).expect("violation is recoverable");
    assert!(pipe.take_received().is_empty());
    let violations = pipe.take_violations();
    assert!(violations[0].message.contains("STRING token rejected"));
}

#[test]
fn list_length_cap_is_enforced() {
    let mut pipe = constrained_pipe(Constraint::List {
        item: Arc::new(Constraint::Integer { max_bytes: None }),
        max_length: Some(2),
    });
    pipe.send(Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
    let bytes = pipe.pump_bytes();
    pipe.feed(&bytes).expect("violation is recoverable");
    assert!(pipe.take_received().is_empty());
    assert!(pipe.take_violations()[0].message.contains("the list is full"));
}

#[test]
fn wrong_opentype_is_rejected_before_any_child_state() {
    let mut pipe = constrained_pipe(Constraint::Tuple(vec![Arc::new(Constraint::Integer {
        max_bytes: None,
    })]));
    pipe.send(Value::list(vec![Value::Int(1)]));
    let bytes = pipe.pump_bytes();
    pipe.feed(&bytes).expect("violation is recoverable");
    assert!(pipe.take_received().is_empty());
    assert!(pipe.take_violations()[0].message.contains("unacceptable OPEN type"));

    // a conforming tuple then passes
    let good = Value::tuple(vec![Value::Int(9)]);
    pipe.send(good.clone());
    let bytes = pipe.pump_bytes();
    pipe.feed(&bytes).expect("follow-up decodes");
    assert!(matches!(&pipe.take_received()[..], [Obj::Ready(v)] if *v == good));
}
