// src/core/progress.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::trace;

use crate::core::models::{Job, JobId, JobState, JobStatus, Phase, PhaseStatus, ScanMode};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseProgress {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub adapters_done: usize,
    pub adapters_total: usize,
}

/// Read-only view of a job, as seen by the dashboard or a headless caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub target: String,
    pub mode: ScanMode,
    pub state: JobState,
    pub status: JobStatus,
    pub phases: Vec<PhaseProgress>,
    pub hosts: usize,
    pub services: usize,
    pub findings: usize,
    pub elapsed_ms: u64,
    pub error: Option<String>,
    /// Set when this run continues an earlier one, so a fresh `pending` after
    /// a failure reads as a new run rather than a step back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<JobState>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Builds a snapshot from the job record. Adapter totals for phases that
    /// have not run yet are unknown and reported as zero.
    pub fn from_job(job: &Job) -> Self {
        let phases = job
            .phases
            .iter()
            .map(|p| PhaseProgress {
                phase: p.phase,
                status: p.status,
                adapters_done: p.outcomes.len(),
                adapters_total: p.outcomes.len(),
            })
            .collect();
        let elapsed_ms = job
            .started_at
            .map(|start| (job.ended_at.unwrap_or_else(Utc::now) - start).num_milliseconds().max(0) as u64)
            .unwrap_or_default();
        Self {
            job_id: job.id,
            target: job.target.clone(),
            mode: job.mode,
            state: job.state,
            status: job.status,
            phases,
            hosts: 0,
            services: 0,
            findings: 0,
            elapsed_ms,
            error: job.error.clone(),
            resumed_from: job.resumed_from,
            updated_at: Utc::now(),
        }
    }

    pub fn with_counts(mut self, hosts: usize, services: usize, findings: usize) -> Self {
        self.hosts = hosts;
        self.services = services;
        self.findings = findings;
        self
    }

    pub fn phase_mut(&mut self, phase: Phase) -> Option<&mut PhaseProgress> {
        self.phases.iter_mut().find(|p| p.phase == phase)
    }

    /// Overall completion in percent, counting finished phases and adapters.
    pub fn percent(&self) -> u16 {
        if self.state.is_terminal() {
            return 100;
        }
        if self.phases.is_empty() {
            return 0;
        }
        let per_phase = 100.0 / self.phases.len() as f64;
        let done: f64 = self
            .phases
            .iter()
            .map(|p| {
                if p.status.is_complete() || p.status == PhaseStatus::Failed {
                    1.0
                } else if p.adapters_total > 0 {
                    p.adapters_done as f64 / p.adapters_total as f64
                } else {
                    0.0
                }
            })
            .sum();
        (done * per_phase).round().min(100.0) as u16
    }
}

/// Per-job publisher backed by a `watch` channel: publishing never blocks and
/// readers only ever see the latest value.
#[derive(Debug)]
pub struct ProgressPublisher {
    tx: watch::Sender<ProgressSnapshot>,
}

impl ProgressPublisher {
    pub fn new(initial: ProgressSnapshot) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Replaces the current snapshot unless it would move the job backwards.
    /// Returns whether the snapshot was accepted.
    pub fn publish(&self, next: ProgressSnapshot) -> bool {
        self.tx.send_if_modified(|current| {
            let regresses = next.state.rank() < current.state.rank()
                || (current.state.is_terminal() && next.state != current.state);
            if regresses {
                trace!(job_id = %current.job_id, from = %current.state, to = %next.state, "Dropped regressing snapshot.");
                return false;
            }
            *current = next;
            true
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(state: JobState) -> ProgressSnapshot {
        let mut job = Job::new("example.com", ScanMode::Full).unwrap();
        job.state = state;
        ProgressSnapshot::from_job(&job)
    }

    #[test]
    fn refuses_regressing_states() {
        let publisher = ProgressPublisher::new(snapshot(JobState::Pending));
        assert!(publisher.publish(snapshot(JobState::PortScanning)));
        assert!(!publisher.publish(snapshot(JobState::Discovering)));
        assert_eq!(publisher.current().state, JobState::PortScanning);

        assert!(publisher.publish(snapshot(JobState::Cancelled)));
        assert!(!publisher.publish(snapshot(JobState::VulnScanning)));
        assert!(!publisher.publish(snapshot(JobState::Completed)));
        assert_eq!(publisher.current().state, JobState::Cancelled);
    }

    #[test]
    fn same_state_updates_counts() {
        let publisher = ProgressPublisher::new(snapshot(JobState::Discovering));
        assert!(publisher.publish(snapshot(JobState::Discovering).with_counts(3, 0, 0)));
        assert_eq!(publisher.current().hosts, 3);
    }

    #[tokio::test]
    async fn subscribers_see_latest_value() {
        let publisher = ProgressPublisher::new(snapshot(JobState::Pending));
        let mut rx = publisher.subscribe();
        publisher.publish(snapshot(JobState::Discovering));
        publisher.publish(snapshot(JobState::PortScanning));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().state, JobState::PortScanning);
    }

    #[test]
    fn percent_counts_phases_and_adapters() {
        let mut snap = snapshot(JobState::Discovering);
        assert_eq!(snap.percent(), 0);
        snap.phases[0].status = PhaseStatus::Succeeded;
        let port = snap.phase_mut(Phase::PortScanning).unwrap();
        port.adapters_total = 2;
        port.adapters_done = 1;
        assert_eq!(snap.percent(), 50);
        snap.state = JobState::Completed;
        assert_eq!(snap.percent(), 100);
    }
}
