//! Flowgate Core — workflow execution engine for multi-step agent runs.
//!
//! This crate contains the data model, definition loader, template resolver,
//! expectation matcher, failure handler, run state store and runner. It has
//! no CLI or presentation dependency, making it suitable for use in:
//!
//! - the `flowgate` CLI
//! - services that embed the engine and provide their own `AgentBackend`
//! - tests, with scripted backends and an in-memory database

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod store;
pub mod workflow;

// Convenience re-exports
pub use config::EngineConfig;
pub use db::Database;
pub use error::{BackendError, EngineError};
