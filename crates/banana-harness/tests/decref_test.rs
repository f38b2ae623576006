//! Reference-count retirement: dropping the last handle to an imported
//! capability sends a decref carrying the full receipt count, and the
//! exporting side retires its tracker only after acknowledging it.

use std::collections::BTreeMap;
use std::sync::Arc;

use banana_core::failure::RemoteFailure;
use banana_core::reference::{Args, LocalRef, Referenceable};
use banana_core::tub::Tub;
use banana_core::value::Value;
use banana_harness::BrokerPair;

struct Counter;

impl Referenceable for Counter {
    fn do_remote_call(&self, method: &str, _args: Args) -> Result<Value, RemoteFailure> {
        match method {
            "poke" => Ok(Value::Int(1)),
            other => Err(RemoteFailure::new("AttributeError", format!("no method {}", other))),
        }
    }
}

fn published_pair(name: &str) -> BrokerPair {
    let tub_a = Tub::new("tub-a").handle();
    tub_a.lock().set_location(vec!["a:1".to_string()]);
    tub_a.lock().publish_named(LocalRef::new(Arc::new(Counter)), name);
    BrokerPair::with_tubs(tub_a, Tub::new("tub-b").handle())
}

#[test]
fn two_receipts_one_decref_then_retirement() {
    let mut pair = published_pair("counter");

    // take two remote references to the same capability
    let mut first = pair.b.get_reference_by_name("counter");
    let mut second = pair.b.get_reference_by_name("counter");
    pair.flush();
    let Value::Remote(h1) = first.try_result().unwrap().unwrap() else {
        panic!("expected a remote reference");
    };
    let Value::Remote(h2) = second.try_result().unwrap().unwrap() else {
        panic!("expected a remote reference");
    };
    assert!(h1.same_reference(&h2), "same clid must share one handle slot");
    assert_eq!(h1.clid(), h2.clid());

    assert_eq!(pair.a.exported_references(), 1);
    assert_eq!(pair.b.imported_references(), 1);

    // the capability still works while a handle is alive
    let mut call = pair.b.call_remote(&h1, "poke", vec![], BTreeMap::new());
    pair.flush();
    assert_eq!(call.try_result().unwrap().unwrap(), Value::Int(1));

    // release both handles: exactly one decref totalling 2 goes out, and
    // the exporter retires only after the ack round-trip
    drop(h1);
    assert_eq!(pair.a.exported_references(), 1, "one live handle still pins the export");
    pair.flush();
    assert_eq!(pair.a.exported_references(), 1);

    drop(h2);
    pair.flush();
    assert_eq!(pair.a.exported_references(), 0, "export retired after the decref ack");
    assert_eq!(pair.b.imported_references(), 0, "import retired after the ack");
}

#[test]
fn resending_a_retired_reference_uses_a_fresh_count() {
    let mut pair = published_pair("counter2");

    let mut lookup = pair.b.get_reference_by_name("counter2");
    pair.flush();
    let Value::Remote(handle) = lookup.try_result().unwrap().unwrap() else {
        panic!("expected a remote reference");
    };
    drop(handle);
    pair.flush();
    assert_eq!(pair.a.exported_references(), 0);

    // a second lookup re-exports the object
    let mut lookup = pair.b.get_reference_by_name("counter2");
    pair.flush();
    let Value::Remote(handle) = lookup.try_result().unwrap().unwrap() else {
        panic!("expected a remote reference");
    };
    assert_eq!(pair.a.exported_references(), 1);
    let mut call = pair.b.call_remote(&handle, "poke", vec![], BTreeMap::new());
    pair.flush();
    assert!(call.try_result().unwrap().is_ok());
}

#[test]
fn late_decref_after_disconnect_is_tolerated() {
    let mut pair = published_pair("counter3");
    let mut lookup = pair.b.get_reference_by_name("counter3");
    pair.flush();
    let Value::Remote(handle) = lookup.try_result().unwrap().unwrap() else {
        panic!("expected a remote reference");
    };

    pair.b.connection_lost();
    drop(handle); // queues a decref that can never be delivered

    // pumping a dead broker must not panic or emit anything
    let mut out = bytes::BytesMut::new();
    pair.b.pump(&mut out).expect("dead broker pumps quietly");
    assert!(out.is_empty());
}
