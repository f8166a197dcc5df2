// Cryptographic hashing wrappers
use sha2::{Digest, Sha256};

/// SHA-256 of arbitrary bytes, rendered as lowercase hex.
pub fn hash_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 of `a` followed by `b`, without allocating a temporary Vec.
pub fn hash_hex_concat(a: &[u8], b: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hex::encode(hasher.finalize())
}

/// Number of leading hex zero nibbles in a lowercase hex digest.
pub fn leading_zero_nibbles(hex_digest: &str) -> u32 {
    hex_digest.chars().take_while(|c| *c == '0').count() as u32
}

/// True if `hex_digest` satisfies `difficulty` leading hex zero nibbles.
pub fn meets_difficulty(hex_digest: &str, difficulty: u32) -> bool {
    leading_zero_nibbles(hex_digest) >= difficulty
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_length() {
        let h = hash_hex(b"tinychain");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_hex_deterministic() {
        assert_eq!(hash_hex(b"a"), hash_hex(b"a"));
        assert_ne!(hash_hex(b"a"), hash_hex(b"b"));
    }

    #[test]
    fn test_leading_zero_nibbles() {
        assert_eq!(leading_zero_nibbles("00ab12"), 2);
        assert_eq!(leading_zero_nibbles("ab0012"), 0);
        assert_eq!(leading_zero_nibbles("0000ff"), 4);
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(meets_difficulty("00ab", 2));
        assert!(!meets_difficulty("0abc", 2));
    }
}
