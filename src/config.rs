//! Per-invocation configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Command-line flags (`--kubectl`, `--namespace-prefix`)
//! 2. Environment variables (`KUBECTL_CMD`, `PELTON_DEPENDENCY_NAMESPACE_PREFIX`)
//! 3. Defaults
//!
//! One [`RunConfig`] is built per invocation and passed explicitly to every
//! stage; nothing here is process-global.

use std::time::Duration;

use uuid::Uuid;

/// Cluster-control command used when none is configured
pub const DEFAULT_CLUSTER_CONTROL: &str = "kubectl";

/// Prefix of namespaces holding a root's dependencies
pub const DEFAULT_NAMESPACE_PREFIX: &str = "pltn-";

/// Alphabet of run identifiers (no look-alike characters)
pub const RUN_ID_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";

/// Length of run identifiers
pub const RUN_ID_LENGTH: usize = 6;

/// Resolved configuration of one invocation
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Cluster-control command, inserted unquoted into scripts
    pub cluster_control: String,

    /// Prefix of dependency namespaces
    pub namespace_prefix: String,

    /// Identifier of this invocation, exported as `PELTON_RUN`
    pub run_id: String,

    /// Delay between pod readiness queries
    pub pod_poll_interval: Duration,

    /// Maximum characters kept from a build's output (the tail is kept)
    pub build_result_limit: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cluster_control: DEFAULT_CLUSTER_CONTROL.to_string(),
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            run_id: generate_run_id(),
            pod_poll_interval: Duration::from_secs(1),
            build_result_limit: 1000,
        }
    }
}

impl RunConfig {
    pub fn new(cluster_control: impl Into<String>, namespace_prefix: impl Into<String>) -> Self {
        Self {
            cluster_control: cluster_control.into(),
            namespace_prefix: namespace_prefix.into(),
            ..Default::default()
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_pod_poll_interval(mut self, interval: Duration) -> Self {
        self.pod_poll_interval = interval;
        self
    }
}

/// Generate a short random run identifier
pub fn generate_run_id() -> String {
    Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(RUN_ID_LENGTH)
        .map(|b| RUN_ID_ALPHABET[*b as usize % RUN_ID_ALPHABET.len()] as char)
        .collect()
}
