//! In-process run store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::{apply_delta, PipelineRun, RunDelta, RunStateStore};
use crate::errors::StoreError;

/// Keeps run records in memory. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, PipelineRun>>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }
}

#[async_trait]
impl RunStateStore for InMemoryRunStore {
    async fn create(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        if runs.contains_key(&run.id) {
            return Err(StoreError::AlreadyExists(run.id));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        Ok(self.runs.read().get(&run_id).cloned())
    }

    async fn save(&self, delta: &RunDelta) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let record = runs.get_mut(&delta.run_id).ok_or(StoreError::NotFound(delta.run_id))?;
        apply_delta(record, delta)
    }

    async fn list_active_runs(&self) -> Result<Vec<Uuid>, StoreError> {
        let runs = self.runs.read();
        let mut active: Vec<&PipelineRun> = runs.values().filter(|r| r.is_active()).collect();
        active.sort_by_key(|r| (r.created_at, r.id));
        Ok(active.into_iter().map(|r| r.id).collect())
    }
}
