use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Result, StateStore, prepare_successor};
use crate::model::ClusterState;

/// Process-local store; clones share the same document
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<ClusterState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an existing document
    pub fn with_state(state: ClusterState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<ClusterState> {
        Ok(self.inner.read().await.clone())
    }

    async fn compare_and_swap(&self, expected: u64, next: ClusterState) -> Result<ClusterState> {
        let mut guard = self.inner.write().await;
        let stored = prepare_successor(&guard, expected, next)?;
        *guard = stored.clone();
        Ok(stored)
    }
}
