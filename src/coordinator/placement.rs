//! Shard replica placement
//!
//! Round-robin leaders with a rotating follower shift: shard `i` is led by
//! node `(i + start_index) % n`, and its followers sit at
//! `leader + 1 + (shift + r) % (n - 1)`. The shift grows by one every time
//! the shard counter wraps the node list, so over many shards every node
//! carries a near-equal share of leader and follower replicas, and no two
//! replicas of a shard land on the same node.

use rand::Rng;

use crate::common::{Error, Result};
use crate::models::{NodeId, ShardAssignment, ShardId};

/// Build the placement of `num_of_shard` shards starting at `start_shard_id`.
///
/// `fixed_start_index` pins both the leader start index and the initial
/// follower shift; when `None` both are random.
pub fn assign(
    database: &str,
    node_ids: &[NodeId],
    num_of_shard: i64,
    replica_factor: i64,
    fixed_start_index: Option<usize>,
    start_shard_id: ShardId,
) -> Result<ShardAssignment> {
    if num_of_shard <= 0 {
        return Err(Error::InvalidShardCount(num_of_shard));
    }
    if replica_factor <= 0 {
        return Err(Error::InvalidReplicaFactor(replica_factor));
    }
    let num_nodes = node_ids.len();
    if replica_factor as usize > num_nodes {
        return Err(Error::InsufficientNodes {
            needed: replica_factor as usize,
            available: num_nodes,
        });
    }

    let mut rng = rand::thread_rng();
    let start_index = fixed_start_index.unwrap_or_else(|| rng.gen_range(0..num_nodes)) % num_nodes;
    let mut replica_shift = fixed_start_index.unwrap_or_else(|| rng.gen_range(0..num_nodes));

    let mut assignment = ShardAssignment::new(database);
    let mut shard_id = start_shard_id;
    for _ in 0..num_of_shard {
        let current = shard_id as usize;
        if current > 0 && current % num_nodes == 0 {
            replica_shift += 1;
        }
        let leader_index = (current + start_index) % num_nodes;
        assignment.add_replica(shard_id, node_ids[leader_index]);
        for r in 0..(replica_factor as usize - 1) {
            let index = replica_index(leader_index, replica_shift, r, num_nodes);
            assignment.add_replica(shard_id, node_ids[index]);
        }
        shard_id += 1;
    }
    Ok(assignment)
}

fn replica_index(
    leader_index: usize,
    replica_shift: usize,
    replica: usize,
    num_nodes: usize,
) -> usize {
    let shift = 1 + (replica_shift + replica) % (num_nodes - 1);
    (leader_index + shift) % num_nodes
}

/// Grow an assignment to `num_of_shard` shards, continuing the existing rotation.
///
/// Shards are only ever appended; asking for fewer shards than exist fails
/// with [`Error::NotImplemented`].
pub fn modify_shard_assignment(
    assignment: &mut ShardAssignment,
    node_ids: &[NodeId],
    num_of_shard: i64,
    replica_factor: i64,
) -> Result<()> {
    let current = assignment.num_of_shard() as i64;
    if num_of_shard < current {
        return Err(Error::NotImplemented(format!(
            "shrink shards of database {} from {} to {}",
            assignment.name, current, num_of_shard
        )));
    }
    if num_of_shard == current {
        return Ok(());
    }

    // continue from where shard 0's leader sits in the node list
    let start_index = assignment
        .shards
        .get(&0)
        .and_then(|replica| replica.replicas.first())
        .and_then(|leader| node_ids.iter().position(|id| id == leader));
    let start_shard_id = assignment
        .shards
        .keys()
        .next_back()
        .map(|id| id + 1)
        .unwrap_or(0);

    let added = assign(
        &assignment.name,
        node_ids,
        num_of_shard - current,
        replica_factor,
        start_index,
        start_shard_id,
    )?;
    assignment.shards.extend(added.shards);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn nodes(n: u32) -> Vec<NodeId> {
        (1..=n).collect()
    }

    fn appearances(assignment: &ShardAssignment) -> HashMap<NodeId, usize> {
        let mut counts = HashMap::new();
        for replica in assignment.shards.values() {
            for id in &replica.replicas {
                *counts.entry(*id).or_insert(0) += 1;
            }
        }
        counts
    }

    #[test]
    fn test_even_distribution() {
        for _ in 0..20 {
            let assignment = assign("cpu", &nodes(5), 10, 3, None, 0).unwrap();
            assert_eq!(assignment.num_of_shard(), 10);
            for replica in assignment.shards.values() {
                assert_eq!(replica.len(), 3);
                let distinct: HashSet<_> = replica.replicas.iter().collect();
                assert_eq!(distinct.len(), 3);
            }
            let counts = appearances(&assignment);
            assert_eq!(counts.len(), 5);
            assert!(counts.values().all(|c| *c == 6));
        }
    }

    #[test]
    fn test_leaders_round_robin() {
        let assignment = assign("cpu", &nodes(4), 8, 2, Some(0), 0).unwrap();
        let leaders: Vec<NodeId> = assignment
            .shards
            .values()
            .map(|r| r.replicas[0])
            .collect();
        assert_eq!(leaders, vec![1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn test_fixed_start_is_deterministic() {
        let a = assign("cpu", &nodes(5), 7, 3, Some(2), 0).unwrap();
        let b = assign("cpu", &nodes(5), 7, 3, Some(2), 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.shards[&0].replicas[0], 3);
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            assign("cpu", &nodes(5), 0, 3, None, 0),
            Err(Error::InvalidShardCount(0))
        ));
        assert!(matches!(
            assign("cpu", &nodes(5), 3, 0, None, 0),
            Err(Error::InvalidReplicaFactor(0))
        ));
        assert!(matches!(
            assign("cpu", &nodes(2), 3, 3, None, 0),
            Err(Error::InsufficientNodes {
                needed: 3,
                available: 2
            })
        ));
        assert!(assign("cpu", &[], 1, 1, None, 0).is_err());
    }

    #[test]
    fn test_single_node_single_replica() {
        let assignment = assign("cpu", &[7], 3, 1, None, 0).unwrap();
        assert!(assignment.shards.values().all(|r| r.replicas == vec![7]));
    }

    #[test]
    fn test_modify_appends_shards() {
        let mut assignment = assign("cpu", &nodes(3), 3, 2, Some(1), 0).unwrap();
        let original = assignment.clone();

        modify_shard_assignment(&mut assignment, &nodes(3), 6, 2).unwrap();
        assert_eq!(assignment.num_of_shard(), 6);
        for id in 0..3 {
            assert_eq!(assignment.shards[&id], original.shards[&id]);
        }
        // leaders keep rotating from the original start index
        let leaders: Vec<NodeId> = assignment.shards.values().map(|r| r.replicas[0]).collect();
        assert_eq!(leaders, vec![2, 3, 1, 2, 3, 1]);
        for replica in assignment.shards.values() {
            let distinct: HashSet<_> = replica.replicas.iter().collect();
            assert_eq!(distinct.len(), 2);
        }
    }

    #[test]
    fn test_modify_same_count_is_noop() {
        let mut assignment = assign("cpu", &nodes(3), 3, 2, None, 0).unwrap();
        let before = assignment.clone();
        modify_shard_assignment(&mut assignment, &nodes(3), 3, 2).unwrap();
        assert_eq!(assignment, before);
    }

    #[test]
    fn test_modify_shrink_not_implemented() {
        let mut assignment = assign("cpu", &nodes(3), 4, 2, None, 0).unwrap();
        assert!(matches!(
            modify_shard_assignment(&mut assignment, &nodes(3), 2, 2),
            Err(Error::NotImplemented(_))
        ));
        assert_eq!(assignment.num_of_shard(), 4);
    }
}
