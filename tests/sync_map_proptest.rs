// SyncMap property tests.
//
// Property: a single-threaded sequence of operations behaves exactly like a
// std HashMap, whatever promotions, expunges and revivals happen inside.
//  - Model: HashMap<String, i32>.
//  - Operations: every public mutating and reading operation, over a small
//    key pool so keys are deleted and revived often.
//  - At each step: the operation's result matches the model; every few
//    steps the full contents (via range) match the model.
use proptest::prelude::*;
use read_mostly_map::SyncMap;
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Debug)]
enum Op {
    Store(usize, i32),
    Load(usize),
    LoadOrStore(usize, i32),
    Delete(usize),
    LoadAndDelete(usize),
    Swap(usize, i32),
    CompareAndSwap(usize, i32, i32),
    CompareAndDelete(usize, i32),
    Range,
    Clear,
}

const KEYS: usize = 6;

fn arb_op() -> impl Strategy<Value = Op> {
    let k = 0..KEYS;
    // Small values make compare operations hit often.
    let v = 0i32..4;
    prop_oneof![
        4 => (k.clone(), v.clone()).prop_map(|(k, v)| Op::Store(k, v)),
        4 => k.clone().prop_map(Op::Load),
        2 => (k.clone(), v.clone()).prop_map(|(k, v)| Op::LoadOrStore(k, v)),
        2 => k.clone().prop_map(Op::Delete),
        1 => k.clone().prop_map(Op::LoadAndDelete),
        1 => (k.clone(), v.clone()).prop_map(|(k, v)| Op::Swap(k, v)),
        1 => (k.clone(), v.clone(), v.clone()).prop_map(|(k, o, n)| Op::CompareAndSwap(k, o, n)),
        1 => (k.clone(), v.clone()).prop_map(|(k, o)| Op::CompareAndDelete(k, o)),
        1 => Just(Op::Range),
        1 => Just(Op::Clear),
    ]
}

fn key(k: usize) -> String {
    format!("k{k}")
}

fn snapshot(m: &SyncMap<i32>) -> BTreeMap<String, i32> {
    let mut out = BTreeMap::new();
    m.range(|k, v| {
        out.insert(k.to_string(), *v);
        true
    });
    out
}

proptest! {
    #[test]
    fn prop_matches_hashmap_model(ops in proptest::collection::vec(arb_op(), 1..200)) {
        let m: SyncMap<i32> = SyncMap::new();
        let mut model: HashMap<String, i32> = HashMap::new();

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::Store(k, v) => {
                    m.store(&key(k), v);
                    model.insert(key(k), v);
                }
                Op::Load(k) => {
                    prop_assert_eq!(m.load(&key(k)), model.get(&key(k)).copied());
                    prop_assert_eq!(m.contains_key(&key(k)), model.contains_key(&key(k)));
                }
                Op::LoadOrStore(k, v) => {
                    let expected = match model.get(&key(k)) {
                        Some(&cur) => (cur, true),
                        None => {
                            model.insert(key(k), v);
                            (v, false)
                        }
                    };
                    prop_assert_eq!(m.load_or_store(&key(k), v), expected);
                }
                Op::Delete(k) => {
                    m.delete(&key(k));
                    model.remove(&key(k));
                }
                Op::LoadAndDelete(k) => {
                    prop_assert_eq!(m.load_and_delete(&key(k)), model.remove(&key(k)));
                }
                Op::Swap(k, v) => {
                    prop_assert_eq!(m.swap(&key(k), v), model.insert(key(k), v));
                }
                Op::CompareAndSwap(k, old, new) => {
                    let hit = model.get(&key(k)) == Some(&old);
                    if hit {
                        model.insert(key(k), new);
                    }
                    prop_assert_eq!(m.compare_and_swap(&key(k), &old, new), hit);
                }
                Op::CompareAndDelete(k, old) => {
                    let hit = model.get(&key(k)) == Some(&old);
                    if hit {
                        model.remove(&key(k));
                    }
                    prop_assert_eq!(m.compare_and_delete(&key(k), &old), hit);
                }
                Op::Range => {
                    let expected: BTreeMap<String, i32> =
                        model.iter().map(|(k, v)| (k.clone(), *v)).collect();
                    prop_assert_eq!(snapshot(&m), expected);
                }
                Op::Clear => {
                    m.clear();
                    model.clear();
                }
            }

            if step % 16 == 0 {
                prop_assert_eq!(m.len(), model.len());
            }
        }

        let expected: BTreeMap<String, i32> = model.into_iter().collect();
        prop_assert_eq!(snapshot(&m), expected);
    }
}
