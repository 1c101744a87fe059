use sha2::{Digest, Sha256};

pub fn sha256(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let result = hasher.finalize();
    hex::encode(result)
}

/// Stable percentage bucket in `0..100` for cohort splitting: the first
/// eight digest bytes as a big-endian u64, mod 100. Must stay byte-for-byte
/// identical across releases and instances, since rollout membership is
/// derived from it.
pub fn percentage_bucket(token: &str) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}

#[cfg(test)]
mod tests {
    use super::{percentage_bucket, sha256};

    #[test]
    fn test_hash_with_sha256() {
        assert_eq!(
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
            sha256("hello world")
        );
    }

    #[test]
    fn buckets_are_stable_and_in_range() {
        for token in ["00000", "00001", "alpha", ""] {
            let a = percentage_bucket(token);
            let b = percentage_bucket(token);
            assert_eq!(a, b);
            assert!(a < 100);
        }
    }
}
