// src/core/lifecycle.rs

//! Structured lifecycle records for downstream log collectors.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::core::models::{AdapterRecord, Job, JobId, JobState, JobStatus, Phase};

/// Target every lifecycle record is emitted on, so collectors can filter them.
pub const LIFECYCLE_TARGET: &str = "vanguard_recon::lifecycle";

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub job_id: JobId,
    pub target: String,
    pub phase: Option<Phase>,
    pub state: JobState,
    pub status: JobStatus,
    pub at: DateTime<Utc>,
    pub outcomes: Vec<AdapterRecord>,
}

impl LifecycleEvent {
    /// Describes the job as it is now; `phase` names the phase that just
    /// started or finished, if any.
    pub fn for_job(job: &Job, phase: Option<Phase>) -> Self {
        let outcomes = phase
            .and_then(|p| job.phase_result(p))
            .map(|r| r.outcomes.clone())
            .unwrap_or_default();
        Self {
            job_id: job.id,
            target: job.target.clone(),
            phase,
            state: job.state,
            status: job.status,
            at: Utc::now(),
            outcomes,
        }
    }

    pub fn emit(&self) {
        let outcomes = serde_json::to_string(&self.outcomes).unwrap_or_else(|_| "[]".to_string());
        info!(
            target: LIFECYCLE_TARGET,
            job_id = %self.job_id,
            domain = %self.target,
            phase = self.phase.map(|p| p.to_string()).unwrap_or_default(),
            state = %self.state,
            status = %self.status,
            at = %self.at.to_rfc3339(),
            outcomes = %outcomes,
            "Job lifecycle transition."
        );
    }
}
