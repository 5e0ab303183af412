// src/core/mod.rs

//! The scan engine: job model, adapters, phase execution, aggregation,
//! checkpoints, and the orchestrator that ties them together.

/// Job, phase, and asset data structures shared by every other module.
pub mod models;

/// The `ToolAdapter` contract and the raw items adapters return.
pub mod adapter;

/// Built-in adapters and the external-command adapter.
pub mod adapters;

pub mod aggregator;
pub mod error;
pub mod executor;

/// Static catalog of finding titles, severities, and remediation text.
pub mod knowledge_base;

pub mod lifecycle;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod retry;

/// Checkpoint persistence.
pub mod storage;
