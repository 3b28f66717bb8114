//! Hashing utilities for minivec
//!
//! - BLAKE3 for the point → shard mapping
//! - HRW (Highest Random Weight) for shard → peer placement

use crate::common::ShardId;

/// First 8 bytes of BLAKE3(data) as a little-endian integer.
fn blake3_u64(data: &[u8]) -> u64 {
    let hash = blake3::hash(data);
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(head)
}

/// Compute the shard for a key.
///
/// Depends only on the key bytes and the shard count, so it is stable for
/// the life of a collection.
pub fn shard_key(key: &[u8], num_shards: u32) -> ShardId {
    debug_assert!(num_shards > 0);
    (blake3_u64(key) % u64::from(num_shards.max(1))) as ShardId
}

/// HRW (Highest Random Weight) hashing for replica placement
///
/// Given a key and a set of nodes, returns nodes sorted by their weight
/// (deterministic based on key). This ensures consistent placement even
/// as the cluster changes.
pub fn hrw_hash<N>(key: &str, nodes: &[N]) -> Vec<N>
where
    N: Clone + std::fmt::Display,
{
    let mut weights: Vec<(N, u64)> = nodes
        .iter()
        .map(|node| {
            let combined = format!("{}{}", key, node);
            (node.clone(), blake3_u64(combined.as_bytes()))
        })
        .collect();

    // Sort by weight (descending)
    weights.sort_by(|a, b| b.1.cmp(&a.1));

    weights.into_iter().map(|(node, _)| node).collect()
}

/// Select N replicas using HRW hashing
pub fn select_replicas<N>(key: &str, nodes: &[N], n: usize) -> Vec<N>
where
    N: Clone + std::fmt::Display,
{
    hrw_hash(key, nodes).into_iter().take(n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_key_deterministic() {
        let key = 42u64.to_be_bytes();
        assert_eq!(shard_key(&key, 256), shard_key(&key, 256));
        assert!(shard_key(&key, 7) < 7);
    }

    #[test]
    fn test_shard_key_single_shard() {
        for n in 0..32u64 {
            assert_eq!(shard_key(&n.to_be_bytes(), 1), 0);
        }
    }

    #[test]
    fn test_hrw_hash_consistent() {
        let nodes = vec![1u64, 2, 3];

        let sorted1 = hrw_hash("shard-0", &nodes);
        let sorted2 = hrw_hash("shard-0", &nodes);

        assert_eq!(sorted1, sorted2);
        assert_eq!(sorted1.len(), 3);
    }

    #[test]
    fn test_hrw_hash_stable_when_node_added() {
        let nodes = vec![1u64, 2, 3];
        let mut grown = nodes.clone();
        grown.push(4);

        // Adding a node only ever moves keys onto the new node
        for shard in 0..32 {
            let key = format!("shard-{}", shard);
            let before = select_replicas(&key, &nodes, 1)[0];
            let after = select_replicas(&key, &grown, 1)[0];
            assert!(after == before || after == 4);
        }
    }

    #[test]
    fn test_select_replicas() {
        let nodes = vec![1u64, 2, 3, 4];
        let replicas = select_replicas("shard-1", &nodes, 2);
        assert_eq!(replicas.len(), 2);
        assert_ne!(replicas[0], replicas[1]);

        // Asking for more replicas than nodes yields every node once
        assert_eq!(select_replicas("shard-1", &nodes, 10).len(), 4);
    }
}
