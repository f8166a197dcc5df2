// Merkle tree construction and inclusion-proof verification.
//
// Leaves are the hash of each transaction's canonical serialization (its
// txid). Pairs of nodes are hashed together; when an odd number of nodes
// remains at any level, the last node is duplicated.
use crate::crypto::hash::{hash_hex, hash_hex_concat};
use crate::primitives::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

pub type ProofStep = (String, Side);

/// Root over raw leaf hashes. `root(&[])` is the hash of the empty string.
pub fn root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return hash_hex(b"");
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level.into_iter().next().unwrap()
}

pub fn root_of_transactions(txs: &[Transaction]) -> String {
    let leaves: Vec<String> = txs.iter().map(|tx| tx.txid.clone()).collect();
    root(&leaves)
}

fn next_level(level: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(level.len().div_ceil(2));
    for pair in level.chunks(2) {
        let combined = if pair.len() == 2 {
            hash_hex_concat(pair[0].as_bytes(), pair[1].as_bytes())
        } else {
            hash_hex_concat(pair[0].as_bytes(), pair[0].as_bytes())
        };
        out.push(combined);
    }
    out
}

/// Builds the inclusion proof for leaf `i`. Returns `None` if `i` is out of
/// range or `leaves` is empty.
pub fn proof(leaves: &[String], i: usize) -> Option<Vec<ProofStep>> {
    if leaves.is_empty() || i >= leaves.len() {
        return None;
    }
    let mut steps = Vec::new();
    let mut level = leaves.to_vec();
    let mut idx = i;

    while level.len() > 1 {
        let pair_start = idx - (idx % 2);
        let is_left = idx % 2 == 0;
        let sibling_idx = if is_left { pair_start + 1 } else { pair_start };

        let sibling = if sibling_idx < level.len() {
            level[sibling_idx].clone()
        } else {
            // odd node out: duplicated against itself
            level[idx].clone()
        };
        let side = if is_left { Side::Right } else { Side::Left };
        steps.push((sibling, side));

        level = next_level(&level);
        idx /= 2;
    }
    Some(steps)
}

pub fn proof_for_transactions(txs: &[Transaction], i: usize) -> Option<Vec<ProofStep>> {
    let leaves: Vec<String> = txs.iter().map(|tx| tx.txid.clone()).collect();
    proof(&leaves, i)
}

/// Recomputes the root from `leaf_hash` and `proof`, comparing to `expected_root`.
pub fn verify(leaf_hash: &str, proof: &[ProofStep], expected_root: &str) -> bool {
    let mut acc = leaf_hash.to_string();
    for (sibling, side) in proof {
        acc = match side {
            Side::Left => hash_hex_concat(sibling.as_bytes(), acc.as_bytes()),
            Side::Right => hash_hex_concat(acc.as_bytes(), sibling.as_bytes()),
        };
    }
    acc == expected_root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<String> {
        (0..n).map(|i| hash_hex(format!("tx{i}").as_bytes())).collect()
    }

    #[test]
    fn test_empty_root_is_hash_of_empty_string() {
        assert_eq!(root(&[]), hash_hex(b""));
    }

    #[test]
    fn test_single_leaf_root_equals_leaf() {
        let l = leaves(1);
        assert_eq!(root(&l), l[0]);
    }

    #[test]
    fn test_proof_roundtrip_even() {
        let l = leaves(4);
        let r = root(&l);
        for i in 0..4 {
            let p = proof(&l, i).unwrap();
            assert!(verify(&l[i], &p, &r));
        }
    }

    #[test]
    fn test_proof_roundtrip_odd_count() {
        let l = leaves(7);
        let r = root(&l);
        for i in 0..7 {
            let p = proof(&l, i).unwrap();
            assert!(verify(&l[i], &p, &r), "leaf {i} failed to verify");
        }
        // ceil(log2(7)) = 3
        assert_eq!(proof(&l, 3).unwrap().len(), 3);
    }

    #[test]
    fn test_perturbed_proof_fails() {
        let l = leaves(7);
        let r = root(&l);
        let mut p = proof(&l, 3).unwrap();
        p[0].0 = hash_hex(b"not-the-sibling");
        assert!(!verify(&l[3], &p, &r));
    }

    #[test]
    fn test_out_of_range_proof_is_none() {
        let l = leaves(3);
        assert!(proof(&l, 3).is_none());
        assert!(proof(&[], 0).is_none());
    }
}
