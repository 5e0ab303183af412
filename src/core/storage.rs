// src/core/storage.rs

//! Checkpoint persistence. A checkpoint is the job record together with the
//! full asset graph, always written as one unit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::error::StorageError;
use crate::core::models::{AssetGraph, Job, JobId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub job: Job,
    pub assets: AssetGraph,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Creates or atomically overwrites the checkpoint of `checkpoint.job.id`.
    async fn checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;

    async fn load(&self, id: JobId) -> Result<Option<Checkpoint>, StorageError>;

    /// Removes a job and everything it owns. Returns whether it existed.
    async fn purge(&self, id: JobId) -> Result<bool, StorageError>;

    /// Every stored job record, oldest first.
    async fn list(&self) -> Result<Vec<Job>, StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<JobId, Checkpoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.jobs.write().await.insert(checkpoint.job.id, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn purge(&self, id: JobId) -> Result<bool, StorageError> {
        Ok(self.jobs.write().await.remove(&id).is_some())
    }

    async fn list(&self) -> Result<Vec<Job>, StorageError> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().map(|c| c.job.clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

/// One pretty-printed JSON file per job under `dir`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: JobId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl JobStore for JsonFileStore {
    async fn checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(checkpoint.job.id);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(checkpoint)?;
        fs::write(&tmp, contents).await?;
        // Rename is atomic on the same filesystem, so readers never see a torn file.
        fs::rename(&tmp, &path).await?;
        debug!(job_id = %checkpoint.job.id, path = %path.display(), "Checkpoint written.");
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Option<Checkpoint>, StorageError> {
        let path = self.path_for(id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn purge(&self, id: JobId) -> Result<bool, StorageError> {
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self) -> Result<Vec<Job>, StorageError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut jobs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<Checkpoint>(&bytes) {
                Ok(checkpoint) => jobs.push(checkpoint.job),
                Err(err) => warn!(path = %path.display(), error = %err, "Skipping unreadable checkpoint."),
            }
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}
