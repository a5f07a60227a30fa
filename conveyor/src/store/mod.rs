//! Durable run state.
//!
//! The scheduler keeps a working copy of each active run and persists every
//! transition as a [`RunDelta`] before acting on it. Stores check each
//! delta's base version and expected job statuses, so a run is only ever
//! advanced by one owner.

mod delta;
mod file;
mod memory;
mod records;

pub use delta::{apply_delta, JobChange, RunDelta, RunTransaction};
pub use file::FileRunStore;
pub use memory::InMemoryRunStore;
pub use records::{derive_stage_status, JobRun, PipelineRun, StageRun, Trigger, TriggerKind};

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{StoreKind, StoreSettings};
use crate::errors::{SettingsError, StoreError};

/// Persistence for pipeline runs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// Persists a new run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the id is taken.
    async fn create(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Loads a run by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    async fn load(&self, run_id: Uuid) -> Result<Option<PipelineRun>, StoreError>;

    /// Atomically applies a delta.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if a precondition no longer holds
    /// and [`StoreError::NotFound`] if the run does not exist.
    async fn save(&self, delta: &RunDelta) -> Result<(), StoreError>;

    /// Returns ids of runs that have not finished, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    async fn list_active_runs(&self) -> Result<Vec<Uuid>, StoreError>;
}

/// Opens the store described by `settings`.
///
/// # Errors
///
/// Returns an error if a file store has no path or its directory cannot be
/// created.
pub fn open(settings: &StoreSettings) -> Result<Arc<dyn RunStateStore>, SettingsError> {
    match settings.kind {
        StoreKind::Memory => Ok(Arc::new(InMemoryRunStore::new())),
        StoreKind::File => {
            let path = settings.path.as_ref().ok_or_else(|| SettingsError::Invalid {
                key: "store.path".to_string(),
                value: "<unset>".to_string(),
            })?;
            Ok(Arc::new(FileRunStore::open(path)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_open_memory_store() {
        let store = open(&StoreSettings::default()).unwrap();
        assert!(store.list_active_runs().await.unwrap().is_empty());
    }

    #[test]
    fn test_open_file_store_requires_path() {
        let settings = StoreSettings {
            kind: StoreKind::File,
            path: None,
        };
        assert!(matches!(open(&settings), Err(SettingsError::Invalid { .. })));
    }

    #[tokio::test]
    async fn test_open_file_store_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("runs");
        let settings = StoreSettings {
            kind: StoreKind::File,
            path: Some(path.clone()),
        };
        let store = open(&settings).unwrap();
        assert!(path.is_dir());
        assert!(store.list_active_runs().await.unwrap().is_empty());
    }
}
