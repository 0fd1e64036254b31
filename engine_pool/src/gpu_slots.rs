use replica_router::ReplicaId;

/// The replica(s) recorded as owning a GPU slot.
///
/// `sharing` captures the transient 1+1 overlap window (spec.md §4.6): a
/// cooldown engine keeps `primary`, and a stage1 standby allocated onto the
/// same physical memory is recorded as `sharing` without the allocation map
/// ever needing a third "ambiguous owner" state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotOwner {
    /// The replica the slot is allocated to exclusively (or, during overlap,
    /// the cooldown replica still physically resident on the slot).
    pub primary: ReplicaId,
    /// The stage1 standby sharing `primary`'s physical slot, if any.
    pub sharing: Option<ReplicaId>,
}

impl SlotOwner {
    fn exclusive(id: ReplicaId) -> Self {
        Self {
            primary: id,
            sharing: None,
        }
    }
}

/// Tracks `slot_index -> owner` across `S` physical GPU slots (spec.md §4.6).
#[derive(Debug)]
pub struct GpuSlots {
    slots: Vec<Option<SlotOwner>>,
}

impl GpuSlots {
    /// Create an allocator with `count` unassigned slots.
    pub fn new(count: usize) -> Self {
        Self {
            slots: vec![None; count],
        }
    }

    /// Total number of physical slots.
    pub fn total(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots with no owner at all (excludes shared slots).
    pub fn available(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    /// Allocate a slot for `id`.
    ///
    /// Prefers an unowned slot. If none exists and `shared` is true, accepts a
    /// slot whose owner is `cooldown_owner` (i.e. the caller has already
    /// confirmed that replica is in `Stage2Cooldown`) and records `id` as the
    /// sharing replica without disturbing the allocation map's primary owner.
    pub fn allocate(&mut self, id: ReplicaId, shared: bool, cooldown_owner: impl Fn(&ReplicaId) -> bool) -> Option<usize> {
        if let Some((idx, slot)) = self.slots.iter_mut().enumerate().find(|(_, s)| s.is_none()) {
            *slot = Some(SlotOwner::exclusive(id));
            return Some(idx);
        }
        if shared {
            if let Some((idx, slot)) = self
                .slots
                .iter_mut()
                .enumerate()
                .find(|(_, s)| matches!(s, Some(o) if o.sharing.is_none() && cooldown_owner(&o.primary)))
            {
                slot.as_mut().expect("matched Some above").sharing = Some(id);
                return Some(idx);
            }
        }
        None
    }

    /// The owner record for `slot`, if any.
    pub fn owner(&self, slot: usize) -> Option<&SlotOwner> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Release `slot` entirely, clearing both primary and sharing owners.
    pub fn release(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            *s = None;
        }
    }

    /// Recycle the primary owner of `slot`: if a sharing replica is present,
    /// it is promoted to sole primary owner (spec.md §4.6 `release`); otherwise
    /// the slot is released entirely.
    pub fn recycle_primary(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            match entry.take() {
                Some(SlotOwner {
                    sharing: Some(next), ..
                }) => *entry = Some(SlotOwner::exclusive(next)),
                _ => *entry = None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ReplicaId {
        ReplicaId::new(s)
    }

    #[test]
    fn allocates_unowned_slot_first() {
        let mut slots = GpuSlots::new(2);
        let a = slots.allocate(id("a"), false, |_| false).unwrap();
        assert_eq!(slots.owner(a).unwrap().primary, id("a"));
        assert_eq!(slots.available(), 1);
    }

    #[test]
    fn refuses_shared_allocation_without_cooldown_owner() {
        let mut slots = GpuSlots::new(1);
        slots.allocate(id("a"), false, |_| false).unwrap();
        assert!(slots.allocate(id("b"), true, |_| false).is_none());
    }

    #[test]
    fn shares_slot_with_cooldown_owner() {
        let mut slots = GpuSlots::new(1);
        let slot = slots.allocate(id("a"), false, |_| false).unwrap();
        let shared = slots.allocate(id("b"), true, |owner| owner == &id("a")).unwrap();
        assert_eq!(shared, slot);
        let owner = slots.owner(slot).unwrap();
        assert_eq!(owner.primary, id("a"));
        assert_eq!(owner.sharing, Some(id("b")));
    }

    // P8
    #[test]
    fn recycle_promotes_sharing_replica_with_no_unassigned_gap() {
        let mut slots = GpuSlots::new(1);
        let slot = slots.allocate(id("a"), false, |_| false).unwrap();
        slots.allocate(id("b"), true, |owner| owner == &id("a")).unwrap();

        slots.recycle_primary(slot);

        let owner = slots.owner(slot).unwrap();
        assert_eq!(owner.primary, id("b"));
        assert_eq!(owner.sharing, None);
    }

    #[test]
    fn recycle_without_sharing_replica_releases_slot() {
        let mut slots = GpuSlots::new(1);
        let slot = slots.allocate(id("a"), false, |_| false).unwrap();
        slots.recycle_primary(slot);
        assert!(slots.owner(slot).is_none());
        assert_eq!(slots.available(), 1);
    }
}
