// src/core/models.rs

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::core::error::OrchestratorError;

pub type JobId = Uuid;

/// Provenance label used for the target domain itself.
pub const TARGET_SOURCE: &str = "target";

// --- Scan plan ---

/// Which phases a job runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScanMode {
    Full,
    #[strum(to_string = "discovery_only", serialize = "discovery")]
    DiscoveryOnly,
    #[strum(to_string = "port_only", serialize = "port")]
    PortOnly,
    #[strum(to_string = "vuln_only", serialize = "vuln")]
    VulnOnly,
}

impl ScanMode {
    pub fn phases(self) -> &'static [Phase] {
        match self {
            ScanMode::Full => &[Phase::Discovery, Phase::PortScanning, Phase::VulnScanning],
            ScanMode::DiscoveryOnly => &[Phase::Discovery],
            ScanMode::PortOnly => &[Phase::PortScanning],
            ScanMode::VulnOnly => &[Phase::VulnScanning],
        }
    }

    /// Next mode in display order, used by the dashboard's mode selector.
    pub fn next(self) -> Self {
        match self {
            ScanMode::Full => ScanMode::DiscoveryOnly,
            ScanMode::DiscoveryOnly => ScanMode::PortOnly,
            ScanMode::PortOnly => ScanMode::VulnOnly,
            ScanMode::VulnOnly => ScanMode::Full,
        }
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Discovery,
    PortScanning,
    VulnScanning,
}

impl Phase {
    /// The job state a job is in while this phase runs.
    pub fn state(self) -> JobState {
        match self {
            Phase::Discovery => JobState::Discovering,
            Phase::PortScanning => JobState::PortScanning,
            Phase::VulnScanning => JobState::VulnScanning,
        }
    }
}

// --- Job lifecycle ---

/// States of the scan state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Pending,
    Discovering,
    PortScanning,
    VulnScanning,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled | JobState::Failed)
    }

    /// Position along the pipeline. Terminal states share the highest rank so a
    /// published view never moves backwards.
    pub fn rank(self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Discovering => 1,
            JobState::PortScanning => 2,
            JobState::VulnScanning => 3,
            JobState::Completed | JobState::Cancelled | JobState::Failed => 4,
        }
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobState::Pending => false,
            JobState::Cancelled | JobState::Failed | JobState::Completed => true,
            // Phases only move forward; a resumed job may re-enter the phase it crashed in.
            _ => next.rank() >= self.rank(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    Running,
    PartiallyFailed,
    Succeeded,
    Failed,
    /// No adapter was registered for the phase.
    Skipped,
}

impl PhaseStatus {
    /// Whether a checkpointed phase with this status is done and must not be re-run.
    pub fn is_complete(self) -> bool {
        matches!(self, PhaseStatus::Succeeded | PhaseStatus::PartiallyFailed | PhaseStatus::Skipped)
    }
}

/// Outcome of one adapter within one phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterRecord {
    pub adapter_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub retryable: bool,
    pub items: usize,
    pub attempts: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseResult {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub outcomes: Vec<AdapterRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl PhaseResult {
    pub fn not_started(phase: Phase) -> Self {
        Self { phase, status: PhaseStatus::NotStarted, outcomes: Vec::new(), started_at: None, ended_at: None }
    }

    /// Derives the phase status from adapter outcomes.
    ///
    /// `required` lists the adapters that must not all fail; when empty every
    /// adapter counts as required.
    pub fn evaluate(outcomes: &[AdapterRecord], required: &[String]) -> PhaseStatus {
        if outcomes.is_empty() {
            return PhaseStatus::Skipped;
        }
        let failed = outcomes.iter().filter(|o| !o.success).count();
        if failed == outcomes.len() {
            return PhaseStatus::Failed;
        }

        let required_outcomes: Vec<&AdapterRecord> =
            outcomes.iter().filter(|o| required.iter().any(|r| r == &o.adapter_id)).collect();
        if !required_outcomes.is_empty() && required_outcomes.iter().all(|o| !o.success) {
            return PhaseStatus::Failed;
        }

        if failed > 0 { PhaseStatus::PartiallyFailed } else { PhaseStatus::Succeeded }
    }
}

/// One scan run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub target: String,
    pub mode: ScanMode,
    pub state: JobState,
    pub status: JobStatus,
    pub phases: Vec<PhaseResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub error: Option<String>,
    /// State the job was in when it was last resumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<JobState>,
}

impl Job {
    /// Creates a pending job after validating the target domain.
    pub fn new(target: &str, mode: ScanMode) -> Result<Self, OrchestratorError> {
        let target = validate_target(target)?;
        Ok(Self {
            id: Uuid::new_v4(),
            target,
            mode,
            state: JobState::Pending,
            status: JobStatus::Pending,
            phases: mode.phases().iter().map(|p| PhaseResult::not_started(*p)).collect(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            cancel_requested: false,
            error: None,
            resumed_from: None,
        })
    }

    pub fn transition(&mut self, next: JobState) -> Result<(), OrchestratorError> {
        if !self.state.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition { from: self.state, to: next });
        }
        self.state = next;
        self.status = match next {
            JobState::Pending => JobStatus::Pending,
            JobState::Completed => JobStatus::Completed,
            JobState::Cancelled => JobStatus::Cancelled,
            JobState::Failed => JobStatus::Failed,
            _ => JobStatus::Running,
        };
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        } else if self.started_at.is_none() && next != JobState::Pending {
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Reopens a failed or interrupted job so it can be driven again. The state
    /// it left is kept in `resumed_from`.
    pub fn reopen(&mut self) {
        self.resumed_from = Some(self.state);
        if self.state.is_terminal() {
            self.state = JobState::Pending;
            self.status = JobStatus::Pending;
        }
        self.ended_at = None;
        self.error = None;
        self.cancel_requested = false;
    }

    pub fn phase_result(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    pub fn record_phase(&mut self, result: PhaseResult) {
        match self.phases.iter_mut().find(|p| p.phase == result.phase) {
            Some(slot) => *slot = result,
            None => self.phases.push(result),
        }
    }

    /// First phase of the plan that has not completed yet.
    pub fn next_pending_phase(&self) -> Option<Phase> {
        self.mode
            .phases()
            .iter()
            .copied()
            .find(|p| !self.phase_result(*p).is_some_and(|r| r.status.is_complete()))
    }
}

// --- Assets ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

// Declared lowest first so the derived ordering is the severity ordering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Host {
    pub name: String,
    pub sources: BTreeSet<String>,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub name: Option<String>,
    pub version: Option<String>,
    pub sources: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finding {
    pub id: Uuid,
    pub host: String,
    pub port: Option<u16>,
    pub transport: Option<Transport>,
    pub severity: Severity,
    pub category: String,
    pub title: String,
    pub description: String,
    pub fingerprint: Option<String>,
    pub sources: BTreeSet<String>,
    pub detected_at: DateTime<Utc>,
}

/// The asset graph of one job, sorted by canonical key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AssetGraph {
    pub hosts: Vec<Host>,
    pub services: Vec<Service>,
    pub findings: Vec<Finding>,
}

impl AssetGraph {
    pub fn host_names(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(|h| h.name.as_str())
    }

    pub fn services_for<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a Service> + 'a {
        self.services.iter().filter(move |s| s.host == host)
    }
}

// --- Hostname grammar ---

static LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_]([a-z0-9_-]{0,61}[a-z0-9])?$").expect("hostname label regex"));

/// Canonicalizes a raw hostname: trims, lowercases, strips one trailing dot and a
/// leading wildcard label. Returns `None` when the result is not a valid hostname.
pub fn normalize_hostname(raw: &str) -> Option<String> {
    let mut name = raw.trim().to_ascii_lowercase();
    if let Some(stripped) = name.strip_suffix('.') {
        name = stripped.to_string();
    }
    if let Some(stripped) = name.strip_prefix("*.") {
        name = stripped.to_string();
    }
    if name.is_empty() || name.len() > 253 {
        return None;
    }
    if name.split('.').all(|label| LABEL.is_match(label)) { Some(name) } else { None }
}

/// Whether `host` is the target domain or one of its subdomains.
pub fn in_zone(host: &str, target: &str) -> bool {
    host == target || host.strip_suffix(target).is_some_and(|prefix| prefix.ends_with('.'))
}

/// Validates a user-supplied target, accepting bare domains as well as URLs.
pub fn validate_target(raw: &str) -> Result<String, OrchestratorError> {
    let trimmed = raw.trim();
    let candidate = if trimmed.contains("://") {
        url::Url::parse(trimmed)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_default()
    } else {
        trimmed.to_string()
    };
    match normalize_hostname(&candidate) {
        // A target needs at least one dot and must not be a wildcard.
        Some(name) if name.contains('.') && !candidate.trim().starts_with("*.") => Ok(name),
        _ => Err(OrchestratorError::InvalidTarget(raw.to_string())),
    }
}
