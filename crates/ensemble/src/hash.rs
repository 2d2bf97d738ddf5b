/// DJB2 hash of a byte slice. Deterministic across processes and platforms.
pub fn djb2_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// Storage partition of a persistence id, in `[0, shard_count)`.
///
/// A partitioning hint for journal rows only; it plays no part in routing.
/// A `shard_count` of zero is treated as one partition.
pub fn journal_shard(persistence_id: &str, shard_count: u32) -> u32 {
    djb2_hash(persistence_id.as_bytes()) % shard_count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(djb2_hash(b"hello"), djb2_hash(b"hello"));
        assert_ne!(djb2_hash(b"hello"), djb2_hash(b"world"));
    }

    #[test]
    fn known_value() {
        // 5381 * 33 + 'a'
        assert_eq!(djb2_hash(b"a"), 177_670);
        assert_eq!(djb2_hash(b""), 5381);
    }

    #[test]
    fn shard_in_range() {
        for i in 0..1000 {
            let shard = journal_shard(&format!("EffectTsActorsDemo(users/{i})"), 16);
            assert!(shard < 16);
        }
    }

    #[test]
    fn zero_shard_count_is_single_partition() {
        assert_eq!(journal_shard("anything", 0), 0);
    }

    #[test]
    fn distribution() {
        let shards = 16u32;
        let keys = 10_000;
        let mut counts = vec![0u32; shards as usize];
        for i in 0..keys {
            counts[journal_shard(&format!("users/{i}"), shards) as usize] += 1;
        }
        let max_allowed = (keys as f64 / shards as f64 * 2.0) as u32;
        for (i, &count) in counts.iter().enumerate() {
            assert!(count <= max_allowed, "shard {i} has {count} ids");
        }
    }
}
