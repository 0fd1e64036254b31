/// The engine lifecycle's finite-state machine (spec.md §3).
///
/// `Stage2Cooldown`'s only non-error successor is "destroyed" (recycled),
/// which is modeled as the engine being removed from
/// [`crate::pool_manager::PoolManager`]'s instance map rather than a further
/// `Stage` value — there is no `Recycled` variant to transition into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Just constructed; no resources allocated.
    Uninitialized,
    /// Tokenizer/preprocessor constructed; no model weights loaded; holds no
    /// GPU memory.
    Stage1Ready,
    /// Weights loaded, serving live traffic.
    Stage2Active,
    /// Draining: still serves requests, but is scheduled for recycling.
    Stage2Cooldown,
    /// Terminal; eligible only for forced recycle.
    Error,
}

impl Stage {
    /// Whether `self -> next` is a permitted transition (spec.md §3's
    /// transition table plus "any state on failure -> ERROR").
    pub fn can_transition_to(self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (_, Error) => true,
            (Uninitialized, Stage1Ready) => true,
            (Stage1Ready, Stage2Active) => true,
            (Stage2Active, Stage2Cooldown) => true,
            _ => false,
        }
    }

    /// Whether the engine still accepts new requests.
    pub fn accepts_new_requests(self) -> bool {
        matches!(self, Stage::Stage2Active)
    }

    /// Whether the engine is currently serving (new or in-flight) requests.
    pub fn is_serving(self) -> bool {
        matches!(self, Stage::Stage2Active | Stage::Stage2Cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // P7
    #[test]
    fn only_permitted_transitions_succeed() {
        assert!(Stage::Uninitialized.can_transition_to(Stage::Stage1Ready));
        assert!(Stage::Stage1Ready.can_transition_to(Stage::Stage2Active));
        assert!(Stage::Stage2Active.can_transition_to(Stage::Stage2Cooldown));
        assert!(!Stage::Uninitialized.can_transition_to(Stage::Stage2Active));
        assert!(!Stage::Stage2Cooldown.can_transition_to(Stage::Stage2Active));
        assert!(!Stage::Stage2Cooldown.can_transition_to(Stage::Stage1Ready));
    }

    #[test]
    fn any_state_can_fail_to_error() {
        for s in [
            Stage::Uninitialized,
            Stage::Stage1Ready,
            Stage::Stage2Active,
            Stage::Stage2Cooldown,
            Stage::Error,
        ] {
            assert!(s.can_transition_to(Stage::Error));
        }
    }
}
