// Bounded duplicate-suppression set keyed on (message kind, payload digest).
//
// Existence short-circuits both processing and re-broadcast (spec §3/§9);
// without it, gossip loops indefinitely under any cycle in the peer graph.
// Eviction is FIFO by insertion order, which is equivalent to LRU here since
// entries are never touched again after insertion (a lookup never promotes).
use std::collections::{HashSet, VecDeque};

use crate::crypto::hash::hash_hex;

pub type SeenKey = (String, String);

pub struct SeenSet {
    capacity: usize,
    order: VecDeque<SeenKey>,
    members: HashSet<SeenKey>,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        SeenSet {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Digest of an arbitrary JSON payload, used as the dedup key's second
    /// component.
    pub fn digest(payload: &serde_json::Value) -> String {
        let bytes = serde_json::to_vec(payload).unwrap_or_default();
        hash_hex(&bytes)
    }

    /// Returns `true` if `(kind, digest)` was already present. If absent, it
    /// is inserted and `false` is returned — this is the single atomic
    /// check-then-insert the transport's inbound pipeline needs.
    pub fn check_and_insert(&mut self, kind: &str, digest: &str) -> bool {
        let key = (kind.to_string(), digest.to_string());
        if self.members.contains(&key) {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.members.insert(key);
        false
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_seen_not_duplicate() {
        let mut set = SeenSet::new(10);
        assert!(!set.check_and_insert("NEW_TX", "abc"));
    }

    #[test]
    fn test_second_seen_is_duplicate() {
        let mut set = SeenSet::new(10);
        set.check_and_insert("NEW_TX", "abc");
        assert!(set.check_and_insert("NEW_TX", "abc"));
    }

    #[test]
    fn test_same_digest_different_kind_is_distinct() {
        let mut set = SeenSet::new(10);
        set.check_and_insert("NEW_TX", "abc");
        assert!(!set.check_and_insert("NEW_BLOCK", "abc"));
    }

    #[test]
    fn test_lru_eviction_bounds_size() {
        let mut set = SeenSet::new(2);
        set.check_and_insert("NEW_TX", "a");
        set.check_and_insert("NEW_TX", "b");
        set.check_and_insert("NEW_TX", "c");
        assert_eq!(set.len(), 2);
        // "a" was evicted, so it is treated as unseen again.
        assert!(!set.check_and_insert("NEW_TX", "a"));
    }
}
