//! Runtime configuration.
//!
//! All runtime behavior flows through this explicit record; no ambient
//! state is consulted.

/// Configuration for the ontology runtime.
#[derive(Debug, Clone)]
pub struct OntologyConfig {
    /// Maximum number of delta rows per commit.
    pub max_batch_size: usize,
    /// Stable runtime identity; a random UUID when absent.
    pub runtime_id: Option<String>,
    /// Cycle guard for commit-triggered commit chains.
    pub max_commit_chain_depth: u32,
    /// Cycle guard for event chains (`root_event_id` lineage).
    pub max_event_chain_depth: u32,
    /// Write lock acquisition timeout.
    pub lock_timeout_ms: u64,
    /// Write lock lease duration; renewed at ~1/3 of this interval.
    pub lease_ttl_ms: u64,
    /// Namespace used when the caller does not pick one.
    pub default_namespace: String,
    /// Sleep between handler-loop iterations.
    pub event_poll_interval_ms: u64,
    /// Maximum events claimed per handler per iteration.
    pub event_claim_limit: usize,
    /// Upper bound on events processed in one loop iteration.
    pub max_events_per_iteration: usize,
    /// Lease granted to each claimed event.
    pub event_claim_lease_ms: u64,
    /// Events older than this are eligible for cleanup.
    pub event_retention_ms: u64,
    /// Session heartbeat cadence.
    pub session_heartbeat_interval_ms: u64,
    /// A session is dead once its heartbeat is older than this.
    pub session_ttl_ms: u64,
    /// Release attempts before an event dead-letters.
    pub event_max_attempts: u32,
    /// Base of the exponential retry backoff.
    pub event_backoff_base_ms: u64,
    /// Cap on the exponential retry backoff.
    pub event_backoff_max_ms: u64,
}

impl Default for OntologyConfig {
    fn default() -> Self {
        OntologyConfig {
            max_batch_size: 10_000,
            runtime_id: None,
            max_commit_chain_depth: 16,
            max_event_chain_depth: 20,
            lock_timeout_ms: 5_000,
            lease_ttl_ms: 30_000,
            default_namespace: "default".to_string(),
            event_poll_interval_ms: 1_000,
            event_claim_limit: 100,
            max_events_per_iteration: 1_000,
            event_claim_lease_ms: 30_000,
            event_retention_ms: 604_800_000,
            session_heartbeat_interval_ms: 5_000,
            session_ttl_ms: 60_000,
            event_max_attempts: 10,
            event_backoff_base_ms: 250,
            event_backoff_max_ms: 30_000,
        }
    }
}
