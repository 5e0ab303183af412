// src/ui/widgets/mod.rs

pub mod findings;
pub mod footer;
pub mod input;
pub mod phases;
pub mod summary;
