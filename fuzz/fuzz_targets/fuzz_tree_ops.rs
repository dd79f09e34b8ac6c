//! Drives a tree with an arbitrary op script and cross-checks every result
//! against `BTreeMap`, validating the page invariants along the way.

#![no_main]

use std::collections::BTreeMap;

use libfuzzer_sys::fuzz_target;
use spindle::BTree;

fuzz_target!(|data: &[u8]| {
    let mut tree = BTree::new();
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    let mut input = data;
    let mut ops = 0u32;
    while input.len() >= 3 {
        let op = input[0] % 4;
        let key_len = (input[1] as usize).min(input.len() - 2).min(64);
        let key = input[2..2 + key_len].to_vec();
        input = &input[2 + key_len..];

        match op {
            0 | 1 => {
                if !model.contains_key(&key) {
                    let payload = vec![op; (key_len * 3) % 32];
                    tree.insert(&key, &payload).unwrap();
                    model.insert(key, payload);
                }
            }
            2 => {
                let removed = tree.remove(&key);
                assert_eq!(removed, model.remove(&key).is_some());
            }
            _ => {
                assert_eq!(tree.lookup(&key), model.get(&key).map(|v| v.as_slice()));
            }
        }

        ops += 1;
        if ops % 64 == 0 {
            tree.validate().unwrap();
        }
    }

    tree.validate().unwrap();
    let mut scanned = 0usize;
    tree.scan_ascending(b"", |key, payload| {
        assert_eq!(model.get(key).map(|v| v.as_slice()), Some(payload));
        scanned += 1;
        true
    });
    assert_eq!(scanned, model.len());
});
