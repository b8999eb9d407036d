//! tutorloop-core: evaluation and routing core.
//!
//! This crate defines the data model, configuration, collaborator traits and
//! the decision components (guards, feature extraction, capability scoring,
//! escalation, question selection) that the [`engine::Pipeline`] drives.

pub mod analysis;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod parser;
pub mod repository;
pub mod results;
pub mod statistics;
pub mod traits;
