//! Cycle correctness: self-referential graphs round-trip with identity
//! preserved, without infinite loops or stack overflow.

use std::sync::Arc;

use banana_core::unslicer::Obj;
use banana_core::value::Value;
use banana_harness::ValuePipe;

fn decode_one(pipe: &mut ValuePipe, value: Value) -> Value {
    let mut objs = pipe.roundtrip(value);
    assert_eq!(objs.len(), 1);
    match objs.remove(0) {
        Obj::Ready(v) => v,
        Obj::Pending(p) => p.peek().expect("cycle should resolve within its own stream"),
    }
}

#[test]
fn list_containing_itself() {
    // x = []; x.append(x)
    let x = Value::list(vec![]);
    if let Value::List(items) = &x {
        items.lock().push(x.clone());
    }

    let mut pipe = ValuePipe::new();
    let y = decode_one(&mut pipe, x);

    let Value::List(outer) = &y else { panic!("expected a list") };
    let first = outer.lock()[0].clone();
    let Value::List(inner) = &first else { panic!("expected the inner list") };
    assert!(Arc::ptr_eq(outer, inner), "y[0] is not y");
}

#[test]
fn tuple_mediated_cycle() {
    // t = ([],); t[0].append((t,))
    let inner_list = Value::list(vec![]);
    let t = Value::tuple(vec![inner_list.clone()]);
    if let Value::List(items) = &inner_list {
        items.lock().push(Value::tuple(vec![t.clone()]));
    }

    let mut pipe = ValuePipe::new();
    let y = decode_one(&mut pipe, t);

    // y = (list,); list[0] = (y,)
    let Value::Tuple(outer) = &y else { panic!("expected the outer tuple") };
    let Value::List(list) = &outer[0] else { panic!("expected the inner list") };
    let wrapped = list.lock()[0].clone();
    let Value::Tuple(inner) = &wrapped else { panic!("expected the wrapping tuple") };
    let Value::Tuple(back) = &inner[0] else { panic!("expected the cycle back-edge") };
    assert!(Arc::ptr_eq(outer, back), "tuple cycle identity was not preserved");
}

#[test]
fn mutual_list_cycle() {
    // a = [b]; b = [a]
    let a = Value::list(vec![]);
    let b = Value::list(vec![a.clone()]);
    if let Value::List(items) = &a {
        items.lock().push(b.clone());
    }

    let mut pipe = ValuePipe::new();
    let decoded = decode_one(&mut pipe, a);

    let Value::List(da) = &decoded else { panic!("expected list a") };
    let db_value = da.lock()[0].clone();
    let Value::List(db) = &db_value else { panic!("expected list b") };
    let back_value = db.lock()[0].clone();
    let Value::List(back) = &back_value else { panic!("expected the back-edge") };
    assert!(Arc::ptr_eq(da, back));
}

#[test]
fn dict_value_cycle() {
    use banana_core::value::Key;
    let d = Value::dict(std::iter::empty::<(Key, Value)>());
    if let Value::Dict(map) = &d {
        map.lock().insert(Key::Bytes(b"self".to_vec()), d.clone());
    }

    let mut pipe = ValuePipe::new();
    let decoded = decode_one(&mut pipe, d);
    let Value::Dict(outer) = &decoded else { panic!("expected a dict") };
    let inner_value = outer.lock().values().next().cloned().expect("one entry");
    let Value::Dict(inner) = &inner_value else { panic!("expected the inner dict") };
    assert!(Arc::ptr_eq(outer, inner));
}
