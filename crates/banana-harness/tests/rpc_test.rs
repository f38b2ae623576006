//! End-to-end RPC over an in-memory broker pair: publish, look up by
//! name, call with schema-checked arguments, and observe the three
//! failure shapes (schema rejection, remote failure, disconnection).

use std::collections::BTreeMap;
use std::sync::Arc;

use banana_core::failure::RemoteFailure;
use banana_core::reference::{Args, LocalRef, Referenceable};
use banana_core::registry::{self, RemoteInterface};
use banana_core::schema::{Constraint, MethodSchema};
use banana_core::tub::Tub;
use banana_core::value::Value;
use banana_core::{CallError, RemoteHandle};
use banana_harness::BrokerPair;

fn ensure_math_interface() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        registry::register_remote_interface(RemoteInterface::new(
            "RIMath",
            vec![MethodSchema::new(
                "add",
                vec![
                    ("a", Constraint::Integer { max_bytes: None }),
                    ("b", Constraint::Integer { max_bytes: None }),
                ],
                Some(Constraint::Integer { max_bytes: None }),
            )],
        ))
        .expect("interface registered once");
    });
}

struct MathService;

impl Referenceable for MathService {
    fn interface_name(&self) -> Option<&str> {
        Some("RIMath")
    }

    fn do_remote_call(&self, method: &str, args: Args) -> Result<Value, RemoteFailure> {
        match method {
            "add" => {
                let int = |name: &str| match args.get(name) {
                    Some(Value::Int(i)) => Ok(*i),
                    _ => Err(RemoteFailure::new("TypeError", format!("bad argument {}", name))),
                };
                Ok(Value::Int(int("a")? + int("b")?))
            }
            other => Err(RemoteFailure::new(
                "AttributeError",
                format!("method '{}' not defined", other),
            )),
        }
    }
}

/// An object with no remote interface: every call reaches dispatch
/// unconstrained.
struct Loose;

impl Referenceable for Loose {
    fn do_remote_call(&self, method: &str, args: Args) -> Result<Value, RemoteFailure> {
        match method {
            "echo" => Ok(args.into_values().next().unwrap_or(Value::None)),
            other => Err(RemoteFailure::new(
                "AttributeError",
                format!("method '{}' not defined", other),
            )),
        }
    }
}

fn pair_with_published(
    name: &str,
    obj: Arc<dyn Referenceable>,
) -> (BrokerPair, RemoteHandle) {
    ensure_math_interface();
    let tub_a = Tub::new("tub-a");
    let tub_b = Tub::new("tub-b");
    let tub_a = tub_a.handle();
    tub_a.lock().set_location(vec!["a:1".to_string()]);
    tub_a.lock().publish_named(LocalRef::new(obj), name);
    let mut pair = BrokerPair::with_tubs(tub_a, tub_b.handle());

    let mut lookup = pair.b.get_reference_by_name(name);
    pair.flush();
    let value = lookup
        .try_result()
        .expect("lookup completes")
        .expect("lookup succeeds");
    let Value::Remote(handle) = value else { panic!("expected a remote reference") };
    (pair, handle)
}

#[test]
fn add_returns_the_sum() {
    let (mut pair, math) = pair_with_published("math", Arc::new(MathService));
    assert_eq!(math.interface_name(), Some("RIMath"));

    let mut call = pair.b.call_remote(
        &math,
        "add",
        vec![],
        BTreeMap::from([
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Int(2)),
        ]),
    );
    pair.flush();
    let result = call.try_result().expect("answer arrived").expect("call succeeded");
    assert_eq!(result, Value::Int(3));
}

#[test]
fn positional_arguments_are_mapped_through_the_schema() {
    let (mut pair, math) = pair_with_published("math2", Arc::new(MathService));
    let mut call =
        pair.b
            .call_remote(&math, "add", vec![Value::Int(10), Value::Int(32)], BTreeMap::new());
    pair.flush();
    assert_eq!(call.try_result().unwrap().unwrap(), Value::Int(42));
}

#[test]
fn undefined_method_is_a_violation() {
    let (mut pair, math) = pair_with_published("math3", Arc::new(MathService));
    let mut call = pair.b.call_remote(&math, "subtract", vec![], BTreeMap::new());
    pair.flush();
    match call.try_result().expect("completed") {
        Err(CallError::Violation(v)) => {
            assert!(v.message.contains("does not offer subtract"), "got: {}", v.message)
        }
        other => panic!("expected a violation, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn bad_argument_type_is_rejected_before_transmission() {
    let (mut pair, math) = pair_with_published("math4", Arc::new(MathService));
    let mut call = pair.b.call_remote(
        &math,
        "add",
        vec![],
        BTreeMap::from([
            ("a".to_string(), Value::Bytes(b"one".to_vec())),
            ("b".to_string(), Value::Int(2)),
        ]),
    );
    // no flush needed: the outbound schema rejects locally
    match call.try_result().expect("completed") {
        Err(CallError::Violation(_)) => {}
        other => panic!("expected a violation, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn remote_exception_comes_back_as_a_failure() {
    let (mut pair, loose) = pair_with_published("loose", Arc::new(Loose));
    let mut call = pair.b.call_remote(&loose, "explode", vec![], BTreeMap::new());
    pair.flush();
    match call.try_result().expect("completed") {
        Err(CallError::Remote(failure)) => {
            assert_eq!(failure.kind, "AttributeError");
            assert!(failure.message.contains("method 'explode' not defined"));
            assert!(failure.check("AttributeError"));
        }
        other => panic!("expected a remote failure, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn unconstrained_calls_carry_arbitrary_values() {
    let (mut pair, loose) = pair_with_published("loose2", Arc::new(Loose));
    let payload = Value::list(vec![Value::Int(1), Value::Unicode("two".to_string())]);
    let mut call = pair.b.call_remote(
        &loose,
        "echo",
        vec![],
        BTreeMap::from([("x".to_string(), payload.clone())]),
    );
    pair.flush();
    assert_eq!(call.try_result().unwrap().unwrap(), payload);
}

#[test]
fn capabilities_travel_both_ways() {
    let (mut pair, loose) = pair_with_published("loose3", Arc::new(Loose));

    // send the peer's own capability back as an argument; it comes home
    // as the original object, and echoing it returns the same import
    let mut call = pair.b.call_remote(
        &loose,
        "echo",
        vec![],
        BTreeMap::from([("x".to_string(), Value::Remote(loose.clone()))]),
    );
    pair.flush();
    match call.try_result().expect("completed").expect("echo succeeded") {
        Value::Remote(handle) => {
            assert!(handle.same_reference(&loose), "round-tripped capability must be the same import");
        }
        other => panic!("expected a remote reference, got {:?}", other.kind()),
    }
}

#[test]
fn disconnection_fails_outstanding_calls_distinctly() {
    let (mut pair, math) = pair_with_published("math5", Arc::new(MathService));
    let mut call = pair.b.call_remote(
        &math,
        "add",
        vec![],
        BTreeMap::from([
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Int(2)),
        ]),
    );
    // transport drops before any answer can travel
    pair.b.connection_lost();
    match call.try_result().expect("completed") {
        Err(CallError::Disconnected) => {}
        other => panic!("expected a disconnection error, got {:?}", other.map(|_| ())),
    }

    // and a stale broker refuses new calls immediately
    let mut late = pair.b.call_remote(&math, "add", vec![], BTreeMap::new());
    match late.try_result().expect("completed") {
        Err(CallError::DeadReference) => {}
        other => panic!("expected a dead-reference error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn answers_correlate_by_request_id_not_order() {
    let (mut pair, math) = pair_with_published("math6", Arc::new(MathService));
    let mut calls: Vec<_> = (0..5)
        .map(|i| {
            pair.b.call_remote(
                &math,
                "add",
                vec![],
                BTreeMap::from([
                    ("a".to_string(), Value::Int(i)),
                    ("b".to_string(), Value::Int(100)),
                ]),
            )
        })
        .collect();
    pair.flush();
    for (i, call) in calls.iter_mut().enumerate() {
        assert_eq!(call.try_result().unwrap().unwrap(), Value::Int(i as i64 + 100));
    }
}
