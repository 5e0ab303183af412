// src/lib.rs

//! Scan orchestration engine: drives discovery, port scanning and
//! vulnerability scanning phases against a domain through pluggable tool
//! adapters, merging their output into one deduplicated asset graph.

pub mod config;
pub mod core;
pub mod logging;
