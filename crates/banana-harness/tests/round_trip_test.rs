//! Round-trip properties: `decode(encode(v)) == v`, with the runtime type
//! category preserved, for the whole primitive and container repertoire.

use banana_core::value::{BigInt, Key, Value};
use banana_harness::ValuePipe;

fn one(objs: Vec<banana_core::unslicer::Obj>) -> Value {
    assert_eq!(objs.len(), 1, "expected exactly one delivered object");
    match objs.into_iter().next().unwrap() {
        banana_core::unslicer::Obj::Ready(v) => v,
        banana_core::unslicer::Obj::Pending(p) => {
            p.peek().expect("object should have resolved by end of stream")
        }
    }
}

fn assert_roundtrip(value: Value) {
    let mut pipe = ValuePipe::new();
    let decoded = one(pipe.roundtrip(value.clone()));
    assert_eq!(decoded, value);
    assert_eq!(decoded.kind(), value.kind());
}

#[test]
fn integers_across_the_wire_split() {
    for v in [
        0,
        1,
        -1,
        127,
        128,
        (1 << 31) - 1, // largest small INT
        1 << 31,       // first LONGINT
        -(1 << 31),    // most negative small NEG
        -(1 << 31) - 1, // first LONGNEG
        i64::MAX,
        i64::MIN,
    ] {
        assert_roundtrip(Value::Int(v));
    }
}

#[test]
fn big_integers_beyond_machine_words() {
    let mut magnitude = vec![0x01];
    magnitude.extend_from_slice(&[0u8; 8]); // 2^64, 9 bytes
    assert_roundtrip(Value::BigInt(BigInt { negative: false, magnitude: magnitude.clone() }));
    assert_roundtrip(Value::BigInt(BigInt { negative: true, magnitude }));
}

#[test]
fn floats() {
    for v in [0.0, 1.5, -2.25, 1e300, f64::MIN_POSITIVE, f64::INFINITY] {
        assert_roundtrip(Value::Float(v));
    }
}

#[test]
fn strings_and_unicode() {
    assert_roundtrip(Value::Bytes(Vec::new()));
    assert_roundtrip(Value::Bytes(b"hello".to_vec()));
    // larger than the default schema cap; legal because no schema is in
    // effect on this pipe
    assert_roundtrip(Value::Bytes(vec![0xa5; 2000]));
    assert_roundtrip(Value::Unicode("grüße, 世界".to_string()));
}

#[test]
fn simple_values() {
    assert_roundtrip(Value::None);
    assert_roundtrip(Value::Bool(true));
    assert_roundtrip(Value::Bool(false));
    assert_roundtrip(Value::set([Key::Int(1), Key::Int(2)]));
    assert_roundtrip(Value::ImmutableSet(std::sync::Arc::new(
        [Key::Bytes(b"x".to_vec())].into_iter().collect(),
    )));
}

#[test]
fn nested_containers_to_depth_five() {
    let value = Value::list(vec![
        Value::Int(1),
        Value::tuple(vec![
            Value::dict([
                (
                    Key::Bytes(b"inner".to_vec()),
                    Value::list(vec![Value::tuple(vec![Value::Float(0.5), Value::None])]),
                ),
                (Key::Int(2), Value::Bool(true)),
            ]),
            Value::Bytes(b"mid".to_vec()),
        ]),
    ]);
    assert_roundtrip(value);
}

#[test]
fn byte_at_a_time_feed_is_equivalent() {
    let value = Value::list(vec![
        Value::Int(123456789),
        Value::Bytes(b"chunky".to_vec()),
        Value::tuple(vec![Value::Unicode("x".to_string()), Value::Float(2.5)]),
    ]);
    let mut pipe = ValuePipe::new();
    let decoded = one(pipe.roundtrip_byte_by_byte(value.clone()));
    assert_eq!(decoded, value);
}

#[test]
fn shared_substructure_is_sent_once_and_shared_on_receipt() {
    let shared = Value::list(vec![Value::Int(7)]);
    let value = Value::tuple(vec![shared.clone(), shared.clone()]);

    let mut pipe = ValuePipe::new();
    let decoded = one(pipe.roundtrip(value));
    let Value::Tuple(items) = decoded else { panic!("expected a tuple") };
    let (Value::List(first), Value::List(second)) = (&items[0], &items[1]) else {
        panic!("expected two lists");
    };
    assert!(std::sync::Arc::ptr_eq(first, second), "reference was not preserved");
}

#[test]
fn vocabulary_compression_is_transparent_and_smaller() {
    let word = b"repeated-token".to_vec();
    let value = Value::list(vec![
        Value::Bytes(word.clone()),
        Value::Bytes(word.clone()),
        Value::Bytes(word.clone()),
    ]);

    let mut plain = ValuePipe::new();
    plain.send(value.clone());
    let plain_bytes = plain.pump_bytes();

    let mut compressed = ValuePipe::new();
    // table entries for the container opentype and the repeated payload
    let table = std::collections::BTreeMap::from([(0u64, b"list".to_vec()), (1u64, word)]);
    compressed.send_vocab(table);
    compressed.send(value.clone());
    let wire = compressed.pump_bytes();
    assert!(wire.len() < plain_bytes.len() + 40, "vocab stream should not balloon");

    compressed.feed(&wire).expect("vocab stream decodes");
    let objs = compressed.take_received();
    // the vocab table itself is not delivered as an object
    assert_eq!(one(objs), value);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::None),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            any::<f64>().prop_filter("NaN is not equal to itself", |f| !f.is_nan())
                .prop_map(Value::Float),
            proptest::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
            ".{0,16}".prop_map(Value::Unicode),
        ]
    }

    fn tree() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::list),
                proptest::collection::vec(inner, 0..4).prop_map(Value::tuple),
            ]
        })
    }

    proptest! {
        #[test]
        fn any_tree_round_trips(value in tree()) {
            let mut pipe = ValuePipe::new();
            let decoded = one(pipe.roundtrip(value.clone()));
            prop_assert_eq!(decoded, value);
        }

        #[test]
        fn chunking_never_changes_the_result(value in tree(), chunk in 1usize..7) {
            let mut pipe = ValuePipe::new();
            pipe.send(value.clone());
            let bytes = pipe.pump_bytes();
            for piece in bytes.chunks(chunk) {
                pipe.feed(piece).expect("chunked feed");
            }
            let decoded = one(pipe.take_received());
            prop_assert_eq!(decoded, value);
        }
    }
}

#[test]
fn multiple_top_level_values_arrive_in_order() {
    let mut pipe = ValuePipe::new();
    pipe.send(Value::Int(1));
    pipe.send(Value::Bytes(b"two".to_vec()));
    pipe.send(Value::list(vec![Value::Int(3)]));
    let bytes = pipe.pump_bytes();
    pipe.feed(&bytes).expect("stream decodes");
    let received = pipe.take_received();
    assert_eq!(received.len(), 3);
}
