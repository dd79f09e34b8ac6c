//! Randomized checking against `std::collections::BTreeMap` as the model,
//! with full-tree invariant validation interleaved. Seeds are fixed so
//! failures reproduce.

use std::collections::BTreeMap;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use spindle::BTree;

fn random_key(rng: &mut ChaCha8Rng, max_len: usize) -> Vec<u8> {
    let len = rng.gen_range(0..=max_len);
    (0..len).map(|_| rng.gen_range(b'a'..=b'f')).collect()
}

fn random_payload(rng: &mut ChaCha8Rng) -> Vec<u8> {
    let len = rng.gen_range(0..=48);
    (0..len).map(|_| rng.gen()).collect()
}

fn assert_scans_match(tree: &BTree, model: &BTreeMap<Vec<u8>, Vec<u8>>) {
    let mut forward = Vec::new();
    tree.scan_ascending(b"", |key, payload| {
        forward.push((key.to_vec(), payload.to_vec()));
        true
    });
    let expected: Vec<(Vec<u8>, Vec<u8>)> =
        model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(forward, expected);

    if let Some(largest) = model.keys().next_back() {
        let mut backward = Vec::new();
        tree.scan_descending(largest, |key, payload| {
            backward.push((key.to_vec(), payload.to_vec()));
            true
        });
        backward.reverse();
        assert_eq!(backward, expected);
    }
}

#[test]
fn random_ops_match_model() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed_0001);
    let mut tree = BTree::new();
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    for step in 0..20_000 {
        match rng.gen_range(0..10) {
            // Insert a key not currently present so one slot maps to one
            // model entry.
            0..=5 => {
                let key = random_key(&mut rng, 24);
                if !model.contains_key(&key) {
                    let payload = random_payload(&mut rng);
                    tree.insert(&key, &payload).unwrap();
                    model.insert(key, payload);
                }
            }
            6..=7 => {
                if let Some(key) = model.keys().choose(&mut rng).cloned() {
                    assert!(tree.remove(&key), "step {step}");
                    model.remove(&key);
                }
            }
            8 => {
                let key = random_key(&mut rng, 24);
                assert_eq!(tree.remove(&key), model.remove(&key).is_some());
            }
            _ => {
                let key = random_key(&mut rng, 24);
                assert_eq!(
                    tree.lookup(&key),
                    model.get(&key).map(|v| v.as_slice()),
                    "step {step}"
                );
            }
        }

        if step % 1000 == 999 {
            tree.validate().unwrap_or_else(|e| panic!("step {step}: {e}"));
        }
    }

    tree.validate().unwrap();
    assert_scans_match(&tree, &model);
}

#[test]
fn random_churn_with_fixed_universe() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed_0002);
    let mut tree = BTree::new();
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    let universe: Vec<Vec<u8>> = (0..12_500u32)
        .map(|i| {
            let mut key = vec![0u8; 16];
            key[..4].copy_from_slice(&i.to_be_bytes());
            rng.fill(&mut key[4..]);
            key
        })
        .collect();

    // Fill with 10,000 entries, then churn: remove a random quarter and
    // insert a disjoint quarter.
    for key in &universe[..10_000] {
        let payload = rng.gen::<u64>().to_be_bytes();
        tree.insert(key, &payload).unwrap();
        model.insert(key.clone(), payload.to_vec());
    }
    tree.validate().unwrap();

    let victims: Vec<Vec<u8>> = model.keys().cloned().choose_multiple(&mut rng, 2500);
    for key in &victims {
        assert!(tree.remove(key));
        model.remove(key);
    }
    for key in &universe[10_000..] {
        let payload = rng.gen::<u64>().to_be_bytes();
        tree.insert(key, &payload).unwrap();
        model.insert(key.clone(), payload.to_vec());
    }

    tree.validate().unwrap();
    assert_scans_match(&tree, &model);

    for i in 0..universe.len() {
        let key = &universe[i];
        assert_eq!(tree.lookup(key), model.get(key).map(|v| v.as_slice()));
    }
}
