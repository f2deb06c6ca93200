//! Shared cluster state store
//!
//! The cluster document is versioned by a generation counter. Writers read the
//! current document, mutate a copy and compare-and-swap it back; a writer whose
//! generation went stale starts over from a fresh read.
//!
//! Two backends implement [`StateStore`]:
//! - [`ConfigMapStore`]: a Kubernetes ConfigMap, CAS enforced by `resourceVersion`
//! - [`MemoryStore`]: process-local, used by tests and single-process setups

mod configmap;
mod memory;

pub use configmap::ConfigMapStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::model::ClusterState;

/// Attempts made by [`read_modify_write`] before giving up on contention
pub const MAX_CAS_ATTEMPTS: u32 = 8;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("generation conflict: expected {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("gave up after {0} conflicting writes")]
    ContentionExhausted(u32),

    #[error("rejected write: {0}")]
    InvariantViolation(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Versioned storage for the cluster document
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the current document. A store that was never written returns the default document at generation 0.
    async fn load(&self) -> Result<ClusterState>;

    /// Replace the document if its generation still equals `expected`
    ///
    /// On success the stored document carries generation `expected + 1` and
    /// is returned.
    async fn compare_and_swap(&self, expected: u64, next: ClusterState) -> Result<ClusterState>;
}

/// Validate `next` against `current` and stamp the next generation on it
pub(crate) fn prepare_successor(
    current: &ClusterState,
    expected: u64,
    mut next: ClusterState,
) -> Result<ClusterState> {
    if current.generation != expected {
        return Err(StoreError::Conflict {
            expected,
            actual: current.generation,
        });
    }
    if let Some(violation) = current.check_successor(&next) {
        return Err(StoreError::InvariantViolation(violation));
    }
    next.generation = expected + 1;
    Ok(next)
}

/// Apply `mutate` to the current document and write it back
///
/// The closure may run several times, once per attempt, and must derive its
/// changes only from the document it is handed. When it leaves the document
/// unchanged nothing is written and the generation does not move.
pub async fn read_modify_write<T, F>(store: &dyn StateStore, mut mutate: F) -> Result<T>
where
    F: FnMut(&mut ClusterState) -> T + Send,
    T: Send,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let current = store.load().await?;
        let mut next = current.clone();
        let output = mutate(&mut next);

        if next == current {
            return Ok(output);
        }

        match store.compare_and_swap(current.generation, next).await {
            Ok(_) => return Ok(output),
            Err(StoreError::Conflict { expected, actual }) => {
                debug!(
                    attempt,
                    expected, actual, "Cluster state changed underneath write, retrying"
                );
            }
            Err(e) => return Err(e),
        }
    }

    Err(StoreError::ContentionExhausted(MAX_CAS_ATTEMPTS))
}
