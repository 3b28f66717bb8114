//! Initial shard placement using HRW hashing
//!
//! Each shard `n` of a new collection is assigned to the
//! `replication_factor` peers with the highest weight for `"shard-<n>"`.
//! Placement is decided once, by the peer proposing the collection, and is
//! replicated as part of the create operation; later changes go through
//! explicit reassignment.

use crate::common::{select_replicas, Error, PeerId, Result, ShardId};
use std::collections::BTreeMap;

pub fn shard_placement_key(shard_id: ShardId) -> String {
    format!("shard-{}", shard_id)
}

/// Pick owners for every shard of a new collection.
pub fn initial_placement(
    shard_number: u32,
    replication_factor: u32,
    peers: &[PeerId],
) -> Result<BTreeMap<ShardId, Vec<PeerId>>> {
    if peers.is_empty() {
        return Err(Error::Consensus(crate::common::ConsensusError::NotCaughtUp {
            applied: 0,
            required: 1,
        }));
    }

    // Capped at the number of peers present at creation time
    let replicas = (replication_factor as usize).min(peers.len()).max(1);

    Ok((0..shard_number)
        .map(|shard_id| {
            (
                shard_id,
                select_replicas(&shard_placement_key(shard_id), peers, replicas),
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_shard_placed() {
        let placement = initial_placement(5, 1, &[1, 2, 3]).unwrap();
        assert_eq!(placement.len(), 5);
        assert!(placement.values().all(|owners| owners.len() == 1));
    }

    #[test]
    fn test_replication_capped_by_peers() {
        let placement = initial_placement(3, 5, &[1, 2]).unwrap();
        for owners in placement.values() {
            assert_eq!(owners.len(), 2);
            assert_ne!(owners[0], owners[1]);
        }
    }

    #[test]
    fn test_placement_is_deterministic() {
        let a = initial_placement(8, 2, &[10, 20, 30, 40]).unwrap();
        let b = initial_placement(8, 2, &[40, 30, 20, 10]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_no_peers() {
        assert!(initial_placement(1, 1, &[]).is_err());
    }
}
