// src/core/orchestrator.rs

//! Drives scan jobs through their phases.
//!
//! Every job runs on its own task with its own executor permits. The task owns
//! the job record, the aggregation engine and the progress publisher; callers
//! only ever see snapshots and talk to the task through its cancellation token.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::adapter::ToolAdapter;
use crate::core::aggregator::Aggregator;
use crate::core::error::OrchestratorError;
use crate::core::executor::{ExecutorConfig, PhaseExecutor, PhasePlan};
use crate::core::lifecycle::LifecycleEvent;
use crate::core::models::{Job, JobId, JobState, Phase, PhaseResult, PhaseStatus, ScanMode};
use crate::core::progress::{ProgressPublisher, ProgressSnapshot};
use crate::core::registry::AdapterRegistry;
use crate::core::retry::{RetryConfig, retry_with_backoff};
use crate::core::storage::{Checkpoint, JobStore};

#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub executor: ExecutorConfig,
    pub checkpoint_retry: RetryConfig,
}

struct JobHandle {
    cancel: CancellationToken,
    progress: watch::Receiver<ProgressSnapshot>,
    task: JoinHandle<()>,
}

impl JobHandle {
    fn is_running(&self) -> bool {
        !self.task.is_finished() && !self.progress.borrow().state.is_terminal()
    }
}

/// Ids being resumed. The entry is taken under the `jobs` lock and released
/// on drop, after the new handle is in place or the resume gave up.
struct Reservation<'a> {
    launching: &'a std::sync::Mutex<HashSet<JobId>>,
    id: JobId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.launching.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.id);
    }
}

/// Command interface of the scan engine.
pub struct ScanOrchestrator {
    store: Arc<dyn JobStore>,
    registry: Arc<RwLock<AdapterRegistry>>,
    config: OrchestratorConfig,
    jobs: Mutex<HashMap<JobId, JobHandle>>,
    launching: std::sync::Mutex<HashSet<JobId>>,
}

impl ScanOrchestrator {
    pub fn new(store: Arc<dyn JobStore>, registry: AdapterRegistry, config: OrchestratorConfig) -> Self {
        Self {
            store,
            registry: Arc::new(RwLock::new(registry)),
            config,
            jobs: Mutex::new(HashMap::new()),
            launching: std::sync::Mutex::new(HashSet::new()),
        }
    }

    fn is_launching(&self, id: JobId) -> bool {
        self.launching.lock().unwrap_or_else(PoisonError::into_inner).contains(&id)
    }

    /// Claims `id` for a resume unless it is running or already being resumed.
    async fn reserve(&self, id: JobId) -> Result<Reservation<'_>, OrchestratorError> {
        let jobs = self.jobs.lock().await;
        if jobs.get(&id).is_some_and(JobHandle::is_running) {
            return Err(OrchestratorError::AlreadyRunning(id));
        }
        if !self.launching.lock().unwrap_or_else(PoisonError::into_inner).insert(id) {
            return Err(OrchestratorError::AlreadyRunning(id));
        }
        drop(jobs);
        Ok(Reservation { launching: &self.launching, id })
    }

    /// Validates the target, writes the initial checkpoint and launches the job.
    pub async fn start(&self, domain: &str, mode: ScanMode) -> Result<JobId, OrchestratorError> {
        let job = Job::new(domain, mode)?;
        let id = job.id;
        info!(job_id = %id, target = %job.target, mode = %mode, "Starting scan job.");
        let mut aggregator = Aggregator::new(&job.target);
        aggregator.seed_target(job.created_at);
        self.launch(job, aggregator).await?;
        Ok(id)
    }

    /// Restarts a checkpointed job at its first incomplete phase.
    pub async fn resume(&self, id: JobId) -> Result<JobId, OrchestratorError> {
        let _reservation = self.reserve(id).await?;
        let Checkpoint { mut job, assets } = self.store.load(id).await?.ok_or(OrchestratorError::JobNotFound(id))?;
        if matches!(job.state, JobState::Completed | JobState::Cancelled) {
            return Err(OrchestratorError::NotResumable { id, state: job.state });
        }
        info!(
            job_id = %id,
            state = %job.state,
            next_phase = ?job.next_pending_phase(),
            "Resuming scan job."
        );
        job.reopen();
        let mut aggregator = Aggregator::from_graph(&job.target, assets);
        aggregator.seed_target(job.created_at);
        self.launch(job, aggregator).await?;
        Ok(id)
    }

    async fn launch(&self, job: Job, aggregator: Aggregator) -> Result<(), OrchestratorError> {
        let id = job.id;
        let cancel = CancellationToken::new();
        let publisher = ProgressPublisher::new(
            ProgressSnapshot::from_job(&job).with_counts(
                aggregator.host_count(),
                aggregator.service_count(),
                aggregator.finding_count(),
            ),
        );
        let progress = publisher.subscribe();
        let mut runner = JobRunner {
            job,
            aggregator,
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            executor: PhaseExecutor::new(self.config.executor.clone()),
            checkpoint_retry: self.config.checkpoint_retry.clone(),
            publisher,
            cancel: cancel.clone(),
        };
        runner.checkpoint().await?;
        LifecycleEvent::for_job(&runner.job, None).emit();

        let task = tokio::spawn(async move {
            if let Err(err) = runner.run().await {
                error!(job_id = %id, error = %err, "Scan job aborted.");
            }
        });
        self.jobs.lock().await.insert(id, JobHandle { cancel, progress, task });
        Ok(())
    }

    /// Requests cooperative cancellation. Cancelling a finished job is a no-op.
    pub async fn cancel(&self, id: JobId) -> Result<(), OrchestratorError> {
        match self.jobs.lock().await.get(&id) {
            Some(handle) => {
                if handle.is_running() {
                    info!(job_id = %id, "Cancellation requested.");
                    handle.cancel.cancel();
                }
                Ok(())
            }
            None if self.store.load(id).await?.is_some() => Ok(()),
            None => Err(OrchestratorError::JobNotFound(id)),
        }
    }

    /// Latest snapshot of a live job, or one rebuilt from its checkpoint.
    pub async fn progress(&self, id: JobId) -> Result<ProgressSnapshot, OrchestratorError> {
        if let Some(handle) = self.jobs.lock().await.get(&id) {
            return Ok(handle.progress.borrow().clone());
        }
        let checkpoint = self.load(id).await?;
        Ok(ProgressSnapshot::from_job(&checkpoint.job).with_counts(
            checkpoint.assets.hosts.len(),
            checkpoint.assets.services.len(),
            checkpoint.assets.findings.len(),
        ))
    }

    pub async fn subscribe(&self, id: JobId) -> Result<watch::Receiver<ProgressSnapshot>, OrchestratorError> {
        self.jobs
            .lock()
            .await
            .get(&id)
            .map(|h| h.progress.clone())
            .ok_or(OrchestratorError::JobNotFound(id))
    }

    /// Waits until the job reaches a terminal state and returns its final snapshot.
    pub async fn wait(&self, id: JobId) -> Result<ProgressSnapshot, OrchestratorError> {
        let mut rx = self.subscribe(id).await?;
        let snapshot = rx
            .wait_for(|s| s.state.is_terminal())
            .await
            .map_err(|_| OrchestratorError::Join(format!("job {id} stopped without reaching a terminal state")))?
            .clone();
        Ok(snapshot)
    }

    pub async fn load(&self, id: JobId) -> Result<Checkpoint, OrchestratorError> {
        self.store.load(id).await?.ok_or(OrchestratorError::JobNotFound(id))
    }

    pub async fn list(&self) -> Result<Vec<Job>, OrchestratorError> {
        Ok(self.store.list().await?)
    }

    /// Removes a job and all of its assets. Running jobs must be cancelled first.
    pub async fn purge(&self, id: JobId) -> Result<bool, OrchestratorError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.get(&id).is_some_and(JobHandle::is_running) || self.is_launching(id) {
            return Err(OrchestratorError::AlreadyRunning(id));
        }
        jobs.remove(&id);
        let removed = self.store.purge(id).await?;
        info!(job_id = %id, removed, "Job purged.");
        Ok(removed)
    }

    /// Adds or replaces an adapter. Jobs pick it up at their next phase boundary.
    pub async fn register_adapter(&self, adapter: Arc<dyn ToolAdapter>) {
        self.registry.write().await.register(adapter);
    }

    pub async fn remove_adapter(&self, id: &str) -> bool {
        self.registry.write().await.remove(id)
    }

    pub async fn adapter_ids(&self, phase: Phase) -> Vec<String> {
        self.registry.read().await.list_ids(phase)
    }
}

/// Owns one job while it runs.
struct JobRunner {
    job: Job,
    aggregator: Aggregator,
    store: Arc<dyn JobStore>,
    registry: Arc<RwLock<AdapterRegistry>>,
    executor: PhaseExecutor,
    checkpoint_retry: RetryConfig,
    publisher: ProgressPublisher,
    cancel: CancellationToken,
}

impl JobRunner {
    async fn run(&mut self) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        self.publish();

        while let Some(phase) = self.job.next_pending_phase() {
            if self.cancel.is_cancelled() {
                return self.finish(JobState::Cancelled, None).await;
            }
            self.run_phase(phase).await?;

            if self.cancel.is_cancelled() {
                return self.finish(JobState::Cancelled, Some(phase)).await;
            }
            let status = self.job.phase_result(phase).map(|r| r.status).unwrap_or(PhaseStatus::Failed);
            if status == PhaseStatus::Failed {
                self.job.error = Some(OrchestratorError::PhaseFailed(phase).to_string());
                return self.finish(JobState::Failed, Some(phase)).await;
            }
            self.checkpoint_or_fail().await?;
            LifecycleEvent::for_job(&self.job, Some(phase)).emit();
        }

        self.finish(JobState::Completed, None).await?;
        info!(
            job_id = %self.job.id,
            hosts = self.aggregator.host_count(),
            services = self.aggregator.service_count(),
            findings = self.aggregator.finding_count(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Scan job finished."
        );
        Ok(())
    }

    async fn run_phase(&mut self, phase: Phase) -> Result<(), OrchestratorError> {
        let (adapters, required) = {
            let registry = self.registry.read().await;
            (registry.adapters_for(phase), registry.required_for(phase))
        };

        self.job.transition(phase.state())?;
        let mut running = PhaseResult::not_started(phase);
        running.status = PhaseStatus::Running;
        running.started_at = Some(Utc::now());
        self.job.record_phase(running);

        let mut snapshot = self.snapshot();
        if let Some(p) = snapshot.phase_mut(phase) {
            p.adapters_total = adapters.len();
        }
        self.publisher.publish(snapshot);
        LifecycleEvent::for_job(&self.job, Some(phase)).emit();

        let plan = PhasePlan {
            job_id: self.job.id,
            target: self.job.target.clone(),
            phase,
            adapters,
            required,
            assets: Arc::new(self.aggregator.graph()),
        };

        let aggregator = &mut self.aggregator;
        let publisher = &self.publisher;
        let result = self
            .executor
            .run(plan, &self.cancel, |record, items| {
                aggregator.merge(phase, &record.adapter_id, items, Utc::now());
                let mut snapshot = publisher.current().with_counts(
                    aggregator.host_count(),
                    aggregator.service_count(),
                    aggregator.finding_count(),
                );
                if let Some(p) = snapshot.phase_mut(phase) {
                    p.adapters_done += 1;
                }
                snapshot.updated_at = Utc::now();
                publisher.publish(snapshot);
            })
            .await;

        debug!(job_id = %self.job.id, phase = %phase, status = %result.status, "Recording phase result.");
        self.job.record_phase(result);
        self.publish();
        Ok(())
    }

    /// Moves the job to a terminal state, writes the final checkpoint and publishes.
    async fn finish(&mut self, state: JobState, phase: Option<Phase>) -> Result<(), OrchestratorError> {
        if state == JobState::Cancelled {
            self.job.cancel_requested = true;
            info!(job_id = %self.job.id, "Scan job cancelled.");
        }
        if state == JobState::Failed {
            warn!(job_id = %self.job.id, error = ?self.job.error, "Scan job failed.");
        }
        self.job.transition(state)?;
        let written = self.checkpoint().await;
        self.publish();
        LifecycleEvent::for_job(&self.job, phase).emit();
        written
    }

    /// Checkpoints at a phase boundary; exhausting the retries fails the job.
    async fn checkpoint_or_fail(&mut self) -> Result<(), OrchestratorError> {
        if let Err(err) = self.checkpoint().await {
            self.job.error = Some(err.to_string());
            self.job.transition(JobState::Failed)?;
            self.publish();
            LifecycleEvent::for_job(&self.job, None).emit();
            return Err(err);
        }
        Ok(())
    }

    async fn checkpoint(&self) -> Result<(), OrchestratorError> {
        let checkpoint = &Checkpoint { job: self.job.clone(), assets: self.aggregator.graph() };
        let store = &self.store;
        let report = retry_with_backoff(&self.checkpoint_retry, "checkpoint", move || store.checkpoint(checkpoint)).await;
        report.result.map_err(|source| OrchestratorError::Checkpoint { attempts: report.attempts, source })
    }

    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot::from_job(&self.job).with_counts(
            self.aggregator.host_count(),
            self.aggregator.service_count(),
            self.aggregator.finding_count(),
        )
    }

    fn publish(&self) {
        self.publisher.publish(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::adapter::{AdapterContext, AdapterOutcome, RawItem};
    use crate::core::error::StorageError;
    use crate::core::storage::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Fixed {
        id: &'static str,
        phase: [Phase; 1],
        items: Vec<RawItem>,
        fail: bool,
    }

    #[async_trait]
    impl ToolAdapter for Fixed {
        fn id(&self) -> &str {
            self.id
        }
        fn phases(&self) -> &[Phase] {
            &self.phase
        }
        async fn execute(&self, _ctx: AdapterContext) -> AdapterOutcome {
            if self.fail {
                AdapterOutcome::failure(crate::core::error::AdapterError::Other("broken".into()))
            } else {
                AdapterOutcome::Success(self.items.clone())
            }
        }
    }

    fn discovery(id: &'static str, names: &[&str]) -> Arc<dyn ToolAdapter> {
        Arc::new(Fixed {
            id,
            phase: [Phase::Discovery],
            items: names.iter().map(|n| RawItem::Hostname(n.to_string())).collect(),
            fail: false,
        })
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            executor: ExecutorConfig {
                adapter_timeout: Duration::from_secs(5),
                grace_period: Duration::from_millis(50),
                ..ExecutorConfig::default()
            },
            checkpoint_retry: RetryConfig::default().with_max_attempts(2).with_initial_backoff(Duration::from_millis(1)),
        }
    }

    #[tokio::test]
    async fn rejects_invalid_targets() {
        let orchestrator = ScanOrchestrator::new(Arc::new(MemoryStore::new()), AdapterRegistry::new(), config());
        let err = orchestrator.start("not a domain", ScanMode::Full).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTarget(_)));
    }

    #[tokio::test]
    async fn failed_phase_fails_the_job_and_keeps_assets() {
        let registry = AdapterRegistry::new().with_adapter(Arc::new(Fixed {
            id: "broken",
            phase: [Phase::Discovery],
            items: Vec::new(),
            fail: true,
        }));
        let store = Arc::new(MemoryStore::new());
        let orchestrator = ScanOrchestrator::new(store.clone(), registry, config());
        let id = orchestrator.start("example.com", ScanMode::Full).await.unwrap();

        let done = orchestrator.wait(id).await.unwrap();
        assert_eq!(done.state, JobState::Failed);
        assert!(done.error.unwrap().contains("discovery"));

        let checkpoint = orchestrator.load(id).await.unwrap();
        assert_eq!(checkpoint.job.state, JobState::Failed);
        assert_eq!(checkpoint.assets.hosts.len(), 1);
        assert_eq!(checkpoint.job.phase_result(Phase::PortScanning).unwrap().status, PhaseStatus::NotStarted);
    }

    #[tokio::test]
    async fn phases_without_adapters_are_skipped() {
        let registry = AdapterRegistry::new().with_adapter(discovery("list", &["www.example.com"]));
        let orchestrator = ScanOrchestrator::new(Arc::new(MemoryStore::new()), registry, config());
        let id = orchestrator.start("example.com", ScanMode::Full).await.unwrap();

        let done = orchestrator.wait(id).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.hosts, 2);
        let checkpoint = orchestrator.load(id).await.unwrap();
        assert_eq!(checkpoint.job.phase_result(Phase::VulnScanning).unwrap().status, PhaseStatus::Skipped);
    }

    #[tokio::test]
    async fn completed_jobs_cannot_be_resumed_or_purged_twice() {
        let orchestrator = ScanOrchestrator::new(Arc::new(MemoryStore::new()), AdapterRegistry::new(), config());
        let id = orchestrator.start("example.com", ScanMode::DiscoveryOnly).await.unwrap();
        orchestrator.wait(id).await.unwrap();

        let err = orchestrator.resume(id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotResumable { state: JobState::Completed, .. }));
        assert!(orchestrator.purge(id).await.unwrap());
        assert!(!orchestrator.purge(id).await.unwrap());
        assert!(matches!(orchestrator.progress(id).await, Err(OrchestratorError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn runtime_registration_changes_later_jobs() {
        let orchestrator = ScanOrchestrator::new(Arc::new(MemoryStore::new()), AdapterRegistry::new(), config());
        orchestrator.register_adapter(discovery("late", &["api.example.com"])).await;
        assert_eq!(orchestrator.adapter_ids(Phase::Discovery).await, vec!["late"]);

        let id = orchestrator.start("example.com", ScanMode::DiscoveryOnly).await.unwrap();
        assert_eq!(orchestrator.wait(id).await.unwrap().hosts, 2);

        assert!(orchestrator.remove_adapter("late").await);
        assert!(orchestrator.adapter_ids(Phase::Discovery).await.is_empty());
    }

    struct Unavailable;

    #[async_trait]
    impl JobStore for Unavailable {
        async fn checkpoint(&self, _checkpoint: &Checkpoint) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
        async fn load(&self, _id: JobId) -> Result<Option<Checkpoint>, StorageError> {
            Ok(None)
        }
        async fn purge(&self, _id: JobId) -> Result<bool, StorageError> {
            Ok(false)
        }
        async fn list(&self) -> Result<Vec<Job>, StorageError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn start_fails_when_checkpoints_keep_failing() {
        let orchestrator = ScanOrchestrator::new(Arc::new(Unavailable), AdapterRegistry::new(), config());
        let err = orchestrator.start("example.com", ScanMode::Full).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Checkpoint { attempts: 2, .. }));
    }
}
