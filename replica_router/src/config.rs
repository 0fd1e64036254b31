use std::time::Duration;

/// Tunables shared by every router policy (spec.md §6).
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// Virtual nodes contributed per replica to the CHWBL ring.
    pub virtual_nodes_per_replica: usize,
    /// CHWBL's load-factor multiplier on the mean load.
    pub load_factor: f64,
    /// How many leading user messages the chat cache-key extractor keeps.
    pub max_user_messages_for_cache: usize,
    /// How long a queue-length observation stays fresh before reading as unknown.
    pub queue_len_staleness: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            virtual_nodes_per_replica: 100,
            load_factor: 1.25,
            max_user_messages_for_cache: 2,
            // "default: large, effectively unbounded for long-running calls" (spec.md §4.2).
            queue_len_staleness: Duration::from_secs(3600),
        }
    }
}
