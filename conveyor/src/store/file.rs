//! Run store keeping one JSON document per run in a directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{apply_delta, PipelineRun, RunDelta, RunStateStore};
use crate::errors::StoreError;

/// Stores each run at `<dir>/<run id>.json`.
///
/// Writes go to a temporary file that is synced and then renamed over the
/// record, so a crash leaves either the old or the new document. A single lock
/// serializes read-modify-write cycles within the process.
#[derive(Debug)]
pub struct FileRunStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileRunStore {
    /// Opens (and creates if needed) the store directory.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn record_path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    async fn read(&self, run_id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        match tokio::fs::read(self.record_path(run_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let path = self.record_path(run.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(run)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        self.sync_dir().await?;
        debug!(run_id = %run.id, version = run.version, "run record written");
        Ok(())
    }

    /// Makes a completed rename durable.
    #[cfg(unix)]
    async fn sync_dir(&self) -> std::io::Result<()> {
        tokio::fs::File::open(&self.dir).await?.sync_all().await
    }

    #[cfg(not(unix))]
    #[allow(clippy::unused_async)]
    async fn sync_dir(&self) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RunStateStore for FileRunStore {
    async fn create(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        if self.read(run.id).await?.is_some() {
            return Err(StoreError::AlreadyExists(run.id));
        }
        self.write(run).await
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        let _guard = self.lock.lock().await;
        self.read(run_id).await
    }

    async fn save(&self, delta: &RunDelta) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut record = self.read(delta.run_id).await?.ok_or(StoreError::NotFound(delta.run_id))?;
        apply_delta(&mut record, delta)?;
        self.write(&record).await
    }

    async fn list_active_runs(&self) -> Result<Vec<Uuid>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut active = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(run_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            match self.read(run_id).await {
                Ok(Some(run)) if run.is_active() => active.push((run.created_at, run.id)),
                Ok(_) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable run record"),
            }
        }

        active.sort();
        Ok(active.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobStatus;
    use crate::graph::{JobDefinition, PipelineBuilder};
    use crate::store::{RunTransaction, Trigger};
    use crate::utils::now_utc;

    fn run() -> PipelineRun {
        let graph = PipelineBuilder::new("ci")
            .stage("build")
            .job(JobDefinition::new("a", "build", "alpine"))
            .build()
            .unwrap();
        PipelineRun::new(Uuid::now_v7(), &graph, "rev", Trigger::manual("dev"), now_utc())
    }

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).unwrap();
        let mut working = run();
        store.create(&working).await.unwrap();

        let tx = RunTransaction::begin(&working);
        working.jobs.get_mut("a").unwrap().status = JobStatus::Ready;
        store.save(&tx.commit(&mut working).unwrap()).await.unwrap();

        // A fresh handle on the same directory sees the update.
        let reopened = FileRunStore::open(dir.path()).unwrap();
        let loaded = reopened.load(working.id).await.unwrap().unwrap();
        assert_eq!(loaded, working);
        assert!(!dir.path().join(format!("{}.json.tmp", working.id)).exists());
    }

    #[tokio::test]
    async fn test_write_replaces_leftover_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).unwrap();
        let working = run();
        let tmp = dir.path().join(format!("{}.json.tmp", working.id));
        std::fs::write(&tmp, "{ truncated by a crash").unwrap();

        store.create(&working).await.unwrap();

        assert_eq!(store.load(working.id).await.unwrap().unwrap(), working);
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn test_conflicting_save_leaves_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).unwrap();
        let base = run();
        store.create(&base).await.unwrap();

        let mut stale = base.clone();
        stale.version = 7;
        let tx = RunTransaction::begin(&stale);
        stale.cancel_reason = Some("x".to_string());
        let delta = tx.commit(&mut stale).unwrap();

        assert!(store.save(&delta).await.unwrap_err().is_conflict());
        assert_eq!(store.load(base.id).await.unwrap().unwrap(), base);
    }

    #[tokio::test]
    async fn test_list_active_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).unwrap();
        let active = run();
        let mut done = run();
        done.finished_at = Some(now_utc());
        store.create(&active).await.unwrap();
        store.create(&done).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(store.list_active_runs().await.unwrap(), vec![active.id]);
    }
}
