// src/core/adapter.rs

//! The contract every scanning capability implements.
//!
//! Adapters return raw data and never touch the shared asset model; the
//! aggregation engine is the only writer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::error::AdapterError;
use crate::core::models::{AssetGraph, JobId, Phase, Severity, Transport};

/// A service as reported by a tool, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawService {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub name: Option<String>,
    pub version: Option<String>,
}

/// A finding as reported by a tool, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawFinding {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub transport: Option<Transport>,
    pub severity: Severity,
    pub category: String,
    #[serde(default)]
    pub title: String,
    pub description: String,
    /// Tool-agnostic equivalence key; findings sharing it are folded together.
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawItem {
    Hostname(String),
    Service(RawService),
    Finding(RawFinding),
}

#[derive(Debug, Clone)]
pub enum AdapterOutcome {
    Success(Vec<RawItem>),
    Failure { reason: AdapterError, retryable: bool },
}

impl AdapterOutcome {
    pub fn failure(reason: AdapterError) -> Self {
        let retryable = reason.is_retryable();
        AdapterOutcome::Failure { reason, retryable }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AdapterOutcome::Success(_))
    }
}

/// Everything an adapter may read during one run.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub job_id: JobId,
    pub target: String,
    pub phase: Phase,
    pub assets: Arc<AssetGraph>,
    pub cancel: CancellationToken,
    /// Point after which the adapter should give up and return `AdapterError::Timeout`.
    pub deadline: Instant,
}

impl AdapterContext {
    /// Host names to probe: everything discovered so far, or the bare target.
    pub fn hosts(&self) -> Vec<String> {
        let hosts: Vec<String> = self.assets.host_names().map(String::from).collect();
        if hosts.is_empty() { vec![self.target.clone()] } else { hosts }
    }

    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Stable identifier, used as provenance on everything this adapter reports.
    fn id(&self) -> &str;

    fn phases(&self) -> &[Phase];

    /// A phase fails when every required adapter in it fails. With none flagged,
    /// every adapter counts as required.
    fn required(&self) -> bool {
        false
    }

    /// Adapter-declared equivalence key for a finding that did not carry one.
    fn fingerprint(&self, _finding: &RawFinding) -> Option<String> {
        None
    }

    async fn execute(&self, ctx: AdapterContext) -> AdapterOutcome;
}

impl fmt::Debug for dyn ToolAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolAdapter").field("id", &self.id()).finish()
    }
}
