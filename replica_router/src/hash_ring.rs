use hashbrown::HashMap;

use fingerprint::hash_key;

use crate::replica::ReplicaId;

/// A sorted, keyed consistent-hashing ring with virtual nodes.
///
/// Invariants (spec.md §3): `sorted_points` is non-decreasing and is exactly
/// the key-set of `point_to_replica` modulo the lossy-collision edge case
/// documented on [`HashRing::remove_replica`]; each replica contributes
/// exactly `v` virtual nodes at `md5_hi64("{id}:{i}")` for `i in [0, v)`.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    point_to_replica: HashMap<u64, ReplicaId>,
    sorted_points: Vec<u64>,
}

impl HashRing {
    /// An empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the ring has no points.
    pub fn is_empty(&self) -> bool {
        self.sorted_points.is_empty()
    }

    /// Total virtual-node point count (including same-value duplicates).
    pub fn len(&self) -> usize {
        self.sorted_points.len()
    }

    /// Add `id` to the ring with `v` virtual nodes.
    ///
    /// On a point collision between two different replicas, the later
    /// insertion wins in `point_to_replica`; `sorted_points` keeps both
    /// entries for that value (spec.md §3: "collisions are accepted").
    pub fn add_replica(&mut self, id: &ReplicaId, v: usize) {
        for i in 0..v {
            let point = hash_key(&format!("{id}:{i}"));
            self.point_to_replica.insert(point, id.clone());
            let idx = self.sorted_points.partition_point(|&p| p < point);
            self.sorted_points.insert(idx, point);
        }
    }

    /// Remove every point owned by `id`.
    ///
    /// If `id`'s point collided with another replica's point that was
    /// inserted earlier (so `point_to_replica` no longer reflects the
    /// earlier replica), that earlier replica's duplicate `sorted_points`
    /// entry becomes unresolvable on walk and is silently skipped — this
    /// mirrors the source's accepted collision-loss behavior rather than
    /// attempting to reconstruct history the map no longer has.
    pub fn remove_replica(&mut self, id: &ReplicaId) {
        let points: Vec<u64> = self
            .point_to_replica
            .iter()
            .filter(|(_, owner)| *owner == id)
            .map(|(point, _)| *point)
            .collect();

        for point in points {
            self.point_to_replica.remove(&point);
            let idx = self.sorted_points.partition_point(|&p| p < point);
            if idx < self.sorted_points.len() && self.sorted_points[idx] == point {
                self.sorted_points.remove(idx);
            }
        }
    }

    /// Walk the ring starting at the first point `>= key_hash`, wrapping to
    /// index 0 at the end, stopping after one full cycle.
    pub fn walk_from(&self, key_hash: u64) -> RingWalk<'_> {
        let n = self.sorted_points.len();
        let start = if n == 0 {
            0
        } else {
            let idx = self.sorted_points.partition_point(|&p| p < key_hash);
            if idx >= n {
                0
            } else {
                idx
            }
        };
        RingWalk {
            ring: self,
            start,
            offset: 0,
        }
    }
}

/// Iterator over `(point, replica_id)` pairs for one full cycle of a
/// [`HashRing`], skipping points whose replica mapping has been lost to a
/// collision (see [`HashRing::remove_replica`]).
#[derive(Debug)]
pub struct RingWalk<'a> {
    ring: &'a HashRing,
    start: usize,
    offset: usize,
}

impl<'a> Iterator for RingWalk<'a> {
    type Item = (u64, &'a ReplicaId);

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.ring.sorted_points.len();
        while self.offset < n {
            let idx = (self.start + self.offset) % n;
            self.offset += 1;
            let point = self.ring.sorted_points[idx];
            if let Some(replica) = self.ring.point_to_replica.get(&point) {
                return Some((point, replica));
            }
        }
        None
    }
}
