use proptest::prelude::*;
use std::collections::BTreeMap;
use vireo_core::codec::{patch_from_bytes, patch_to_bytes};
use vireo_core::rpc::LEGACY_INTERFACE;
use vireo_core::{apply, diff, diff_from_defaults, shared_state, ConnectorId, Invocation, RpcQueue, State, TypeTag, Value};

shared_state! {
    static POINT = "Point" {
        label: TypeTag::String,
        x: TypeTag::Int,
    }
}

shared_state! {
    static SAMPLE = "Sample" {
        flag: TypeTag::Bool,
        count: TypeTag::Int,
        ratio: TypeTag::Float,
        name: TypeTag::String => "unnamed",
        tags: TypeTag::List(&TypeTag::Int),
        attrs: TypeTag::Map(&TypeTag::String),
        origin: TypeTag::Record(&POINT),
    }
}

fn point() -> impl Strategy<Value = State> {
    ("[a-z]{0,4}", -1000i64..1000).prop_map(|(label, x)| {
        let mut point = State::new(&POINT);
        point.set("label", label).unwrap();
        point.set("x", x).unwrap();
        point
    })
}

fn sample() -> impl Strategy<Value = State> {
    (
        any::<bool>(),
        any::<i64>(),
        -1.0e12..1.0e12f64,
        "[a-z ]{0,8}",
        prop::collection::vec(-50i64..50, 0..10),
        prop::collection::btree_map("[a-c]{1,2}", "[a-z]{0,3}", 0..6),
        point(),
    )
        .prop_map(|(flag, count, ratio, name, tags, attrs, origin)| {
            let mut state = State::new(&SAMPLE);
            state.set("flag", flag).unwrap();
            state.set("count", count).unwrap();
            state.set("ratio", ratio).unwrap();
            state.set("name", name).unwrap();
            state
                .set("tags", tags.into_iter().map(Value::Int).collect::<Vec<_>>())
                .unwrap();
            let attrs: BTreeMap<String, Value> = attrs.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
            state.set("attrs", Value::Map(attrs)).unwrap();
            state.set("origin", origin).unwrap();
            state
        })
}

#[derive(Debug, Clone)]
enum Op {
    Call(u8),
    Set { connector: u8, name: u8, value: i64 },
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            any::<u8>().prop_map(Op::Call),
            (0u8..3, 0u8..3, any::<i64>()).prop_map(|(connector, name, value)| Op::Set {
                connector,
                name,
                value
            }),
        ],
        0..40,
    )
}

proptest! {
    #[test]
    fn patch_over_the_wire_reproduces_target(previous in sample(), current in sample()) {
        let patch = diff(&previous, &current);
        let bytes = patch_to_bytes(&SAMPLE, &patch).unwrap();
        let decoded = patch_from_bytes(&SAMPLE, &bytes).unwrap();

        let mut mirror = previous.clone();
        apply(&mut mirror, &decoded).unwrap();
        prop_assert_eq!(mirror, current);
    }

    #[test]
    fn initial_patch_builds_state_from_defaults(current in sample()) {
        let patch = diff_from_defaults(&current);
        let bytes = patch_to_bytes(&SAMPLE, &patch).unwrap();

        let mut mirror = State::new(&SAMPLE);
        apply(&mut mirror, &patch_from_bytes(&SAMPLE, &bytes).unwrap()).unwrap();
        prop_assert_eq!(mirror, current);
    }

    #[test]
    fn identical_states_have_empty_patch(state in sample()) {
        prop_assert!(diff(&state, &state.clone()).is_empty());
    }

    #[test]
    fn queue_keeps_calls_in_order_and_only_last_variable_value(ops in ops()) {
        let mut queue = RpcQueue::new();
        let mut calls = Vec::new();
        let mut last = BTreeMap::new();
        for op in &ops {
            match *op {
                Op::Call(n) => {
                    queue.push(Invocation::new("c0", "PingRpc", "ping", vec![n.into()]));
                    calls.push(u64::from(n));
                }
                Op::Set { connector, name, value } => {
                    let connector = ConnectorId::new(format!("c{}", connector));
                    let name = format!("v{}", name);
                    queue.set_variable(&connector, &name, &Value::Int(value));
                    last.insert((connector, name), value);
                }
            }
        }

        let drained = queue.drain();
        let sent_calls: Vec<u64> = drained
            .iter()
            .filter(|i| i.interface != LEGACY_INTERFACE)
            .map(|i| i.args[0].as_u64().unwrap())
            .collect();
        prop_assert_eq!(sent_calls, calls);

        let mut sent = BTreeMap::new();
        for invocation in drained.iter().filter(|i| i.is_variable_change()) {
            let (name, value) = invocation.variable_parts().unwrap();
            let previous = sent.insert((invocation.connector.clone(), name.to_string()), value.as_i64().unwrap());
            prop_assert!(previous.is_none(), "variable sent twice");
        }
        prop_assert_eq!(sent, last);
        prop_assert!(queue.is_empty());
    }
}
