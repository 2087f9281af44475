//! Property test: the open-addressed table agrees with a reference map
//! under arbitrary interleavings of insert, lookup, and delete

use cinder_runtime::heap::{Heap, ObjRef};
use cinder_runtime::table::{StrKey, Table};
use cinder_runtime::Value;
use proptest::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Op {
    Set(usize, i32),
    Get(usize),
    Delete(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..40, any::<i32>()).prop_map(|(k, v)| Op::Set(k, v)),
        (0usize..40).prop_map(Op::Get),
        (0usize..40).prop_map(Op::Delete),
    ]
}

proptest! {
    #[test]
    fn table_matches_reference_map(ops in proptest::collection::vec(op_strategy(), 0..300)) {
        let mut heap = Heap::new();
        let keys: Vec<StrKey> = (0..40)
            .map(|i| {
                let obj = heap.intern(&format!("key-{}", i));
                heap.key(obj)
            })
            .collect();

        let mut table = Table::new();
        let mut model: HashMap<ObjRef, Value> = HashMap::new();

        for op in ops {
            match op {
                Op::Set(k, v) => {
                    let key = keys[k];
                    let value = Value::Number(v as f64);
                    let was_new = table.set(key, value);
                    prop_assert_eq!(was_new, !model.contains_key(&key.obj));
                    model.insert(key.obj, value);
                }
                Op::Get(k) => {
                    let key = keys[k];
                    prop_assert_eq!(table.get(key), model.get(&key.obj).copied());
                }
                Op::Delete(k) => {
                    let key = keys[k];
                    let was_present = table.delete(key);
                    prop_assert_eq!(was_present, model.remove(&key.obj).is_some());
                }
            }
        }

        prop_assert_eq!(table.len(), model.len());
        for (&obj, &value) in &model {
            let key = heap.key(obj);
            prop_assert_eq!(table.get(key), Some(value));
        }
    }
}
