// src/core/executor.rs

//! Runs every adapter of one phase under a bounded number of permits.
//!
//! The control loop owns the `JoinSet`, the FIFO queue of adapters that have
//! not started yet, and the sink that merges completed output. It suspends on
//! the next completion, the phase deadline, and the cancellation token.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::adapter::{AdapterContext, AdapterOutcome, RawItem, ToolAdapter};
use crate::core::error::AdapterError;
use crate::core::models::{AdapterRecord, AssetGraph, JobId, Phase, PhaseResult, PhaseStatus};
use crate::core::retry::{RetryConfig, Retryable, retry_with_backoff};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_in_flight: usize,
    pub adapter_timeout: Duration,
    pub grace_period: Duration,
    pub phase_deadline: Duration,
    /// Applied to failures the adapter flagged as retryable.
    pub retry: RetryConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            adapter_timeout: Duration::from_secs(120),
            grace_period: Duration::from_secs(5),
            phase_deadline: Duration::from_secs(900),
            retry: RetryConfig::default().with_max_attempts(1),
        }
    }
}

/// Everything the executor needs to know about the phase it runs.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    pub job_id: JobId,
    pub target: String,
    pub phase: Phase,
    pub adapters: Vec<Arc<dyn ToolAdapter>>,
    pub required: Vec<String>,
    pub assets: Arc<AssetGraph>,
}

struct AttemptFailure {
    reason: AdapterError,
    retryable: bool,
}

impl Retryable for AttemptFailure {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.reason.fmt(f)
    }
}

struct TaskDone {
    index: usize,
    outcome: AdapterOutcome,
    attempts: u32,
    elapsed: Duration,
}

pub struct PhaseExecutor {
    config: ExecutorConfig,
}

impl PhaseExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs the phase to completion, deadline or cancellation.
    ///
    /// `sink` is called once per adapter, in completion order, with the
    /// adapter's record and the items it produced (empty on failure). The
    /// returned result carries exactly one record per adapter.
    pub async fn run<S>(&self, plan: PhasePlan, cancel: &CancellationToken, mut sink: S) -> PhaseResult
    where
        S: FnMut(&AdapterRecord, &[RawItem]),
    {
        let started_at = Utc::now();
        let phase = plan.phase;
        let adapter_count = plan.adapters.len();
        if adapter_count == 0 {
            info!(job_id = %plan.job_id, phase = %phase, "No adapters registered, skipping phase.");
            return PhaseResult {
                phase,
                status: PhaseStatus::Skipped,
                outcomes: Vec::new(),
                started_at: Some(started_at),
                ended_at: Some(Utc::now()),
            };
        }
        info!(job_id = %plan.job_id, phase = %phase, adapters = adapter_count, "Phase started.");

        let phase_token = cancel.child_token();
        let deadline = Instant::now() + self.config.phase_deadline;
        let semaphore = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut queue: VecDeque<usize> = (0..adapter_count).collect();
        let mut records: Vec<Option<AdapterRecord>> = vec![None; adapter_count];
        let mut launched: HashMap<usize, Instant> = HashMap::new();
        let mut running: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut set: JoinSet<TaskDone> = JoinSet::new();

        let interrupted = loop {
            while !queue.is_empty() {
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                let Some(index) = queue.pop_front() else {
                    break;
                };
                let adapter = Arc::clone(&plan.adapters[index]);
                let ctx = AdapterContext {
                    job_id: plan.job_id,
                    target: plan.target.clone(),
                    phase,
                    assets: Arc::clone(&plan.assets),
                    cancel: phase_token.child_token(),
                    deadline: deadline.min(Instant::now() + self.config.adapter_timeout),
                };
                let config = self.config.clone();
                debug!(job_id = %plan.job_id, phase = %phase, adapter = adapter.id(), "Adapter launched.");
                launched.insert(index, Instant::now());
                let handle = set.spawn(async move {
                    let started = Instant::now();
                    let (outcome, attempts) = run_adapter(adapter, ctx, &config).await;
                    drop(permit);
                    TaskDone { index, outcome, attempts, elapsed: started.elapsed() }
                });
                running.insert(handle.id(), index);
            }

            if set.is_empty() {
                break None;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Some(AdapterError::Cancelled),
                _ = sleep_until(deadline) => break Some(AdapterError::PhaseDeadlineExceeded),
                Some(joined) = set.join_next_with_id() => {
                    let (index, record, items) = match joined {
                        Ok((id, done)) => {
                            running.remove(&id);
                            let adapter_id = plan.adapters[done.index].id().to_string();
                            finish(adapter_id, done)
                        }
                        Err(err) => {
                            let index = running.remove(&err.id()).unwrap_or_default();
                            let elapsed = launched.get(&index).map(Instant::elapsed).unwrap_or_default();
                            let record = failed_record(
                                plan.adapters[index].id(),
                                &AdapterError::Panicked(err.to_string()),
                                1,
                                elapsed,
                            );
                            (index, record, Vec::new())
                        }
                    };
                    if !record.success {
                        warn!(
                            job_id = %plan.job_id,
                            phase = %phase,
                            adapter = %record.adapter_id,
                            error = record.error.as_deref().unwrap_or_default(),
                            "Adapter failed."
                        );
                    }
                    sink(&record, &items);
                    records[index] = Some(record);
                }
            }
        };

        if let Some(reason) = interrupted {
            warn!(
                job_id = %plan.job_id,
                phase = %phase,
                reason = %reason,
                unfinished = running.len(),
                queued = queue.len(),
                "Phase interrupted, reclaiming adapters."
            );
            phase_token.cancel();
            // Adapters get one grace period to wind down; their late output is discarded.
            let _ = timeout(self.config.grace_period, async {
                while set.join_next().await.is_some() {}
            })
            .await;
            set.abort_all();
            while set.join_next().await.is_some() {}

            for (index, slot) in records.iter_mut().enumerate() {
                if slot.is_none() {
                    let elapsed = launched.get(&index).map(Instant::elapsed).unwrap_or_default();
                    let record = failed_record(plan.adapters[index].id(), &reason, 0, elapsed);
                    sink(&record, &[]);
                    *slot = Some(record);
                }
            }
        }

        let outcomes: Vec<AdapterRecord> = records.into_iter().flatten().collect();
        let status = PhaseResult::evaluate(&outcomes, &plan.required);
        info!(
            job_id = %plan.job_id,
            phase = %phase,
            status = %status,
            failed = outcomes.iter().filter(|o| !o.success).count(),
            total = outcomes.len(),
            "Phase finished."
        );
        PhaseResult { phase, status, outcomes, started_at: Some(started_at), ended_at: Some(Utc::now()) }
    }
}

/// One adapter run: retries inside the timeout budget, then one grace period
/// for the adapter to notice its cancelled token before the future is dropped.
async fn run_adapter(adapter: Arc<dyn ToolAdapter>, ctx: AdapterContext, config: &ExecutorConfig) -> (AdapterOutcome, u32) {
    let attempts = AtomicU32::new(0);
    let token = ctx.cancel.clone();
    let attempt_loop = retry_with_backoff(&config.retry, adapter.id(), || {
        attempts.fetch_add(1, Ordering::Relaxed);
        let adapter = Arc::clone(&adapter);
        let ctx = ctx.clone();
        async move {
            match adapter.execute(ctx).await {
                AdapterOutcome::Success(items) => Ok(items),
                AdapterOutcome::Failure { reason, retryable } => Err(AttemptFailure { reason, retryable }),
            }
        }
    });
    let mut attempt_loop = pin!(attempt_loop);

    tokio::select! {
        report = &mut attempt_loop => {
            let outcome = match report.result {
                Ok(items) => AdapterOutcome::Success(fill_fingerprints(adapter.as_ref(), items)),
                Err(failure) => AdapterOutcome::Failure { reason: failure.reason, retryable: failure.retryable },
            };
            (outcome, report.attempts)
        }
        _ = sleep(config.adapter_timeout) => {
            token.cancel();
            if timeout(config.grace_period, &mut attempt_loop).await.is_err() {
                warn!(adapter = adapter.id(), "Adapter ignored cancellation, dropping it.");
            }
            (AdapterOutcome::failure(AdapterError::Timeout(config.adapter_timeout)), attempts.load(Ordering::Relaxed))
        }
    }
}

/// Applies the adapter's own fingerprint rule to findings that arrived without one.
fn fill_fingerprints(adapter: &dyn ToolAdapter, items: Vec<RawItem>) -> Vec<RawItem> {
    items
        .into_iter()
        .map(|item| match item {
            RawItem::Finding(mut finding) if finding.fingerprint.is_none() => {
                finding.fingerprint = adapter.fingerprint(&finding);
                RawItem::Finding(finding)
            }
            other => other,
        })
        .collect()
}

fn finish(adapter_id: String, done: TaskDone) -> (usize, AdapterRecord, Vec<RawItem>) {
    let duration_ms = done.elapsed.as_millis() as u64;
    match done.outcome {
        AdapterOutcome::Success(items) => {
            let record = AdapterRecord {
                adapter_id,
                success: true,
                error: None,
                retryable: false,
                items: items.len(),
                attempts: done.attempts,
                duration_ms,
            };
            (done.index, record, items)
        }
        AdapterOutcome::Failure { reason, retryable } => {
            let record = AdapterRecord {
                adapter_id,
                success: false,
                error: Some(reason.to_string()),
                retryable,
                items: 0,
                attempts: done.attempts,
                duration_ms,
            };
            (done.index, record, Vec::new())
        }
    }
}

fn failed_record(adapter_id: &str, reason: &AdapterError, attempts: u32, elapsed: Duration) -> AdapterRecord {
    AdapterRecord {
        adapter_id: adapter_id.to_string(),
        success: false,
        error: Some(reason.to_string()),
        retryable: reason.is_retryable(),
        items: 0,
        attempts,
        duration_ms: elapsed.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::adapter::RawFinding;
    use crate::core::models::Severity;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    /// Sleeps, then returns a fixed result. Tracks how many run at once.
    struct Scripted {
        id: String,
        delay: Duration,
        fail: Option<AdapterError>,
        items: Vec<RawItem>,
        honours_cancel: bool,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<String>>>,
    }

    impl Scripted {
        fn new(id: &str, delay_ms: u64) -> Self {
            Self {
                id: id.to_string(),
                delay: Duration::from_millis(delay_ms),
                fail: None,
                items: vec![RawItem::Hostname(format!("{id}.example.com"))],
                honours_cancel: true,
                active: Arc::default(),
                peak: Arc::default(),
                order: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl ToolAdapter for Scripted {
        fn id(&self) -> &str {
            &self.id
        }
        fn phases(&self) -> &[Phase] {
            &[Phase::Discovery]
        }
        fn fingerprint(&self, finding: &RawFinding) -> Option<String> {
            Some(format!("scripted:{}", finding.category))
        }
        async fn execute(&self, ctx: AdapterContext) -> AdapterOutcome {
            self.order.lock().unwrap().push(self.id.clone());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let outcome = if self.honours_cancel {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => AdapterOutcome::failure(AdapterError::Cancelled),
                    _ = sleep(self.delay) => self.result(),
                }
            } else {
                sleep(self.delay).await;
                self.result()
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    impl Scripted {
        fn result(&self) -> AdapterOutcome {
            match &self.fail {
                Some(err) => AdapterOutcome::failure(err.clone()),
                None => AdapterOutcome::Success(self.items.clone()),
            }
        }
    }

    fn plan(adapters: Vec<Arc<dyn ToolAdapter>>) -> PhasePlan {
        PhasePlan {
            job_id: Uuid::new_v4(),
            target: "example.com".to_string(),
            phase: Phase::Discovery,
            adapters,
            required: Vec::new(),
            assets: Arc::new(AssetGraph::default()),
        }
    }

    fn config(max_in_flight: usize, timeout_ms: u64) -> ExecutorConfig {
        ExecutorConfig {
            max_in_flight,
            adapter_timeout: Duration::from_millis(timeout_ms),
            grace_period: Duration::from_millis(50),
            phase_deadline: Duration::from_secs(10),
            retry: RetryConfig::default().with_max_attempts(1),
        }
    }

    #[tokio::test]
    async fn empty_phase_is_skipped() {
        let executor = PhaseExecutor::new(config(2, 100));
        let result = executor.run(plan(Vec::new()), &CancellationToken::new(), |_, _| {}).await;
        assert_eq!(result.status, PhaseStatus::Skipped);
        assert!(result.outcomes.is_empty());
    }

    #[tokio::test]
    async fn bounds_concurrency_and_starts_fifo() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let adapters: Vec<Arc<dyn ToolAdapter>> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|id| {
                let mut s = Scripted::new(id, 30);
                s.active = Arc::clone(&active);
                s.peak = Arc::clone(&peak);
                s.order = Arc::clone(&order);
                Arc::new(s) as Arc<dyn ToolAdapter>
            })
            .collect();

        let executor = PhaseExecutor::new(config(2, 1_000));
        let mut merged = 0;
        let result = executor.run(plan(adapters), &CancellationToken::new(), |_, items| merged += items.len()).await;

        assert_eq!(result.status, PhaseStatus::Succeeded);
        assert_eq!(result.outcomes.len(), 5);
        assert_eq!(merged, 5);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        let order = order.lock().unwrap().clone();
        let mut first = order[..2].to_vec();
        first.sort();
        assert_eq!(first, vec!["a", "b"]);
        assert_eq!(order[2..].to_vec(), vec!["c", "d", "e"]);
    }

    #[tokio::test]
    async fn timeout_marks_partial_failure() {
        let adapters: Vec<Arc<dyn ToolAdapter>> = vec![
            Arc::new(Scripted::new("fast", 5)),
            Arc::new(Scripted::new("slow", 5_000)),
            Arc::new(Scripted::new("also-fast", 5)),
        ];
        let executor = PhaseExecutor::new(config(3, 100));
        let result = executor.run(plan(adapters), &CancellationToken::new(), |_, _| {}).await;

        assert_eq!(result.status, PhaseStatus::PartiallyFailed);
        let slow = result.outcomes.iter().find(|o| o.adapter_id == "slow").unwrap();
        assert!(!slow.success);
        assert!(slow.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn uncooperative_adapter_is_dropped_after_grace() {
        let mut stubborn = Scripted::new("stubborn", 5_000);
        stubborn.honours_cancel = false;
        let executor = PhaseExecutor::new(config(1, 50));
        let started = Instant::now();
        let result = executor.run(plan(vec![Arc::new(stubborn)]), &CancellationToken::new(), |_, _| {}).await;

        assert_eq!(result.status, PhaseStatus::Failed);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn failures_do_not_abort_siblings() {
        let mut broken = Scripted::new("broken", 1);
        broken.fail = Some(AdapterError::MalformedOutput("garbage".into()));
        let adapters: Vec<Arc<dyn ToolAdapter>> = vec![Arc::new(broken), Arc::new(Scripted::new("ok", 20))];
        let executor = PhaseExecutor::new(config(2, 1_000));
        let result = executor.run(plan(adapters), &CancellationToken::new(), |_, _| {}).await;

        assert_eq!(result.status, PhaseStatus::PartiallyFailed);
        assert!(result.outcomes.iter().any(|o| o.adapter_id == "ok" && o.success && o.items == 1));
    }

    #[tokio::test]
    async fn cancellation_reclaims_running_and_queued() {
        let adapters: Vec<Arc<dyn ToolAdapter>> = vec![
            Arc::new(Scripted::new("quick", 1)),
            Arc::new(Scripted::new("long", 5_000)),
            Arc::new(Scripted::new("queued", 5_000)),
        ];
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let executor = PhaseExecutor::new(config(2, 10_000));
        let started = Instant::now();
        let mut reported = Vec::new();
        let result = executor.run(plan(adapters), &cancel, |record, _| reported.push(record.adapter_id.clone())).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.outcomes.len(), 3);
        assert_eq!(reported.len(), 3);
        let quick = result.outcomes.iter().find(|o| o.adapter_id == "quick").unwrap();
        assert!(quick.success);
        for id in ["long", "queued"] {
            let record = result.outcomes.iter().find(|o| o.adapter_id == id).unwrap();
            assert_eq!(record.error.as_deref(), Some("cancelled"));
        }
    }

    #[tokio::test]
    async fn phase_deadline_keeps_finished_results() {
        let adapters: Vec<Arc<dyn ToolAdapter>> =
            vec![Arc::new(Scripted::new("done", 1)), Arc::new(Scripted::new("late", 5_000))];
        let mut cfg = config(2, 10_000);
        cfg.phase_deadline = Duration::from_millis(100);
        let result = PhaseExecutor::new(cfg).run(plan(adapters), &CancellationToken::new(), |_, _| {}).await;

        assert_eq!(result.status, PhaseStatus::PartiallyFailed);
        let late = result.outcomes.iter().find(|o| o.adapter_id == "late").unwrap();
        assert_eq!(late.error.as_deref(), Some("phase deadline exceeded"));
    }

    #[tokio::test]
    async fn retries_retryable_failures() {
        struct Flaky(AtomicU32);

        #[async_trait]
        impl ToolAdapter for Flaky {
            fn id(&self) -> &str {
                "flaky"
            }
            fn phases(&self) -> &[Phase] {
                &[Phase::Discovery]
            }
            async fn execute(&self, _ctx: AdapterContext) -> AdapterOutcome {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    AdapterOutcome::failure(AdapterError::Network("reset".into()))
                } else {
                    AdapterOutcome::Success(Vec::new())
                }
            }
        }

        let mut cfg = config(1, 1_000);
        cfg.retry = RetryConfig::default().with_max_attempts(3).with_initial_backoff(Duration::from_millis(1));
        let result = PhaseExecutor::new(cfg).run(plan(vec![Arc::new(Flaky(AtomicU32::new(0)))]), &CancellationToken::new(), |_, _| {}).await;

        assert_eq!(result.status, PhaseStatus::Succeeded);
        assert_eq!(result.outcomes[0].attempts, 2);
    }

    #[tokio::test]
    async fn fills_in_adapter_fingerprints() {
        let mut reporter = Scripted::new("reporter", 1);
        reporter.items = vec![RawItem::Finding(RawFinding {
            host: "example.com".into(),
            port: None,
            transport: None,
            severity: Severity::Low,
            category: "dns".into(),
            title: String::new(),
            description: "x".into(),
            fingerprint: None,
        })];
        let mut seen = Vec::new();
        PhaseExecutor::new(config(1, 1_000))
            .run(plan(vec![Arc::new(reporter)]), &CancellationToken::new(), |_, items| seen.extend_from_slice(items))
            .await;

        match &seen[0] {
            RawItem::Finding(f) => assert_eq!(f.fingerprint.as_deref(), Some("scripted:dns")),
            other => panic!("unexpected item {other:?}"),
        }
    }
}
