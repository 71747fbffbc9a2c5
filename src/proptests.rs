use super::*;

use proptest::prelude::*;
use std::collections::BTreeMap;

/// Recompute the whole structure from scratch and check it against the
/// stored links and counters.
fn validate_tree(t: &ScanTree) {
    assert_eq!(t.root.is_null(), t.nodes.is_empty());
    if t.root.is_null() {
        return;
    }
    assert!(
        t.nodes[t.root.idx()].parent.is_null(),
        "root must have no parent"
    );

    let mut subtree_size = vec![0u32; t.nodes.len()];
    let mut visited = 0usize;

    // Post-order with an explicit stack: children are sized before their
    // parent is checked.
    let mut stack: Vec<(NodeId, bool)> = vec![(t.root, false)];
    while let Some((id, expanded)) = stack.pop() {
        if id.is_null() {
            continue;
        }
        let node = &t.nodes[id.idx()];
        if !expanded {
            stack.push((id, true));
            stack.push((node.left, false));
            stack.push((node.right, false));
            continue;
        }

        visited += 1;

        let left_size = if node.left.is_null() {
            0
        } else {
            assert_eq!(
                t.nodes[node.left.idx()].parent, id,
                "left child must point back at its parent"
            );
            subtree_size[node.left.idx()]
        };
        let right_size = if node.right.is_null() {
            0
        } else {
            assert_eq!(
                t.nodes[node.right.idx()].parent, id,
                "right child must point back at its parent"
            );
            subtree_size[node.right.idx()]
        };

        assert_eq!(node.lefters, left_size, "lefters must be the exact count");
        assert_eq!(node.righters, right_size, "righters must be the exact count");
        subtree_size[id.idx()] = left_size + right_size + 1;

        assert_eq!(node.item.key.len(), t.key_len());
        assert_eq!(
            node.item.count as usize,
            node.item.positions.len(),
            "count must track the occurrence list"
        );
        assert!(node.item.count >= 1);
    }

    assert_eq!(visited, t.len(), "every node must be reachable exactly once");
    assert_eq!(subtree_size[t.root.idx()] as usize, t.len());

    // In-order traversal must ascend strictly.
    let keys: Vec<&[u8]> = t.iter().map(|e| e.key).collect();
    assert_eq!(keys.len(), t.len());
    for pair in keys.windows(2) {
        assert!(pair[0] < pair[1], "in-order keys must strictly ascend");
    }
}

#[derive(Clone, Debug)]
enum Op {
    Upsert(Vec<u8>),
    Find(Vec<u8>),
}

fn key_strategy(len: usize) -> impl Strategy<Value = Vec<u8>> + Clone {
    // A narrow alphabet keeps repeat keys common, exercising the
    // count-and-append path as hard as the insert path.
    prop::collection::vec(prop_oneof![Just(b'a'), Just(b'b'), Just(b'c'), any::<u8>()], len..=len)
}

fn ops_strategy(len: usize) -> impl Strategy<Value = Vec<Op>> {
    let key = key_strategy(len);
    let op = prop_oneof![
        3 => key.clone().prop_map(Op::Upsert),
        1 => key.prop_map(Op::Find),
    ];
    prop::collection::vec(op, 0..=600)
}

fn threshold_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![Just(0u32), Just(1), Just(4)]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_matches_model(ops in ops_strategy(3), threshold in threshold_strategy()) {
        let mut t = ScanTree::with_threshold(3, threshold);
        let mut m: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();

        for (pos, op) in ops.into_iter().enumerate() {
            let pos = pos as u64;
            match op {
                Op::Upsert(key) => {
                    let (count, was_new) = t.upsert(&key, pos).unwrap();
                    let positions = m.entry(key).or_default();
                    prop_assert_eq!(was_new, positions.is_empty());
                    positions.push(pos);
                    prop_assert_eq!(count as usize, positions.len());
                }
                Op::Find(key) => {
                    let got = t.find(&key).map(|e| (e.count, e.positions.to_vec()));
                    let expected = m.get(&key).map(|v| (v.len() as u64, v.clone()));
                    prop_assert_eq!(got, expected);
                }
            }
            prop_assert_eq!(t.len(), m.len());
        }

        validate_tree(&t);

        let got: Vec<(Vec<u8>, Vec<u64>)> =
            t.iter().map(|e| (e.key.to_vec(), e.positions.to_vec())).collect();
        let expected: Vec<(Vec<u8>, Vec<u64>)> =
            m.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn prop_single_byte_keys_dense(ops in ops_strategy(1), threshold in threshold_strategy()) {
        // One-byte keys saturate the key space quickly, so rotations and
        // repeat hits both fire constantly.
        let mut t = ScanTree::with_threshold(1, threshold);
        let mut m: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        for (pos, op) in ops.into_iter().enumerate() {
            match op {
                Op::Upsert(key) => {
                    t.upsert(&key, pos as u64).unwrap();
                    *m.entry(key).or_insert(0) += 1;
                }
                Op::Find(key) => {
                    let got = t.find(&key).map(|e| e.count);
                    prop_assert_eq!(got, m.get(&key).copied());
                }
            }
        }

        validate_tree(&t);
        let got: Vec<(Vec<u8>, u64)> = t.iter().map(|e| (e.key.to_vec(), e.count)).collect();
        let expected: Vec<(Vec<u8>, u64)> = m.iter().map(|(k, &c)| (k.clone(), c)).collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn prop_scan_matches_windows(data in prop::collection::vec(any::<u8>(), 0..=200), base in 0u64..1_000_000) {
        let mut t = ScanTree::new(2);
        t.scan(&data, base).unwrap();
        validate_tree(&t);

        let mut m: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();
        for (i, window) in data.windows(2).enumerate() {
            m.entry(window.to_vec()).or_default().push(base + i as u64);
        }

        prop_assert_eq!(t.len(), m.len());
        for (key, positions) in &m {
            let entry = t.find(key).unwrap();
            prop_assert_eq!(entry.count as usize, positions.len());
            prop_assert_eq!(entry.positions, positions.as_slice());
        }
    }
}

fn for_each_permutation<T: Clone>(items: &[T], mut f: impl FnMut(Vec<T>)) {
    fn rec<T: Clone>(items: &[T], used: &mut [bool], out: &mut Vec<T>, f: &mut impl FnMut(Vec<T>)) {
        if out.len() == items.len() {
            f(out.clone());
            return;
        }
        for i in 0..items.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            out.push(items[i].clone());
            rec(items, used, out, f);
            out.pop();
            used[i] = false;
        }
    }

    let mut used = vec![false; items.len()];
    let mut out = Vec::with_capacity(items.len());
    rec(items, &mut used, &mut out, &mut f);
}

#[test]
fn exhaustive_insert_order_small_set() {
    let keys: Vec<Vec<u8>> = vec![
        b"aa".to_vec(),
        b"ab".to_vec(),
        b"ba".to_vec(),
        b"bb".to_vec(),
        b"ca".to_vec(),
        b"cb".to_vec(),
    ];

    for threshold in [0u32, 1, 2] {
        for_each_permutation(&keys, |perm| {
            let mut t = ScanTree::with_threshold(2, threshold);
            for (pos, key) in perm.iter().enumerate() {
                t.upsert(key, pos as u64).unwrap();
                validate_tree(&t);
            }

            let mut sorted = keys.clone();
            sorted.sort();
            let got: Vec<Vec<u8>> = t.iter().map(|e| e.key.to_vec()).collect();
            assert_eq!(got, sorted);

            for key in &keys {
                assert_eq!(t.find(key).unwrap().count, 1);
            }
        });
    }
}

#[test]
fn exhaustive_repeat_mix_small_set() {
    // Two distinct keys plus repeats of both, in every order: the structural
    // counters must never drift, and positions must come back in insertion
    // order.
    let inserts: Vec<&[u8; 2]> = vec![b"aa", b"aa", b"bb", b"bb", b"aa"];

    for_each_permutation(&inserts, |perm| {
        let mut t = ScanTree::with_threshold(2, 1);
        let mut m: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();

        for (pos, key) in perm.iter().enumerate() {
            t.upsert(*key, pos as u64).unwrap();
            m.entry(key.to_vec()).or_default().push(pos as u64);
            validate_tree(&t);
        }

        assert_eq!(t.len(), 2);
        for (key, positions) in &m {
            let entry = t.find(key).unwrap();
            assert_eq!(entry.positions, positions.as_slice());
        }
    });
}
