//! Workflow engine — YAML-defined multi-step agent runs with quality gates
//! and failure recovery.
//!
//! # Architecture
//!
//! ```text
//! workflow.yaml ──► WorkflowDefinition ──► WorkflowRunner ──► AgentBackend
//!                                              │
//!                      TemplateResolver ◄──────┤
//!                      ExpectationMatcher ◄────┤
//!                      FailureHandler ◄────────┤──► DecisionMaker
//!                                              │
//!                                          RunStore (SQLite)
//! ```

pub mod agent_caller;
pub mod artifacts;
pub mod backend;
pub mod decision;
pub mod expectation;
pub mod failure;
pub mod runner;
pub mod schema;
pub mod service;
pub mod template;

pub use agent_caller::{AgentCallConfig, HttpAgentBackend};
pub use artifacts::Artifact;
pub use backend::{AgentBackend, AgentRequest, DecisionMaker};
pub use expectation::ExpectationMatcher;
pub use failure::{FailureHandler, Recovery};
pub use runner::{RunOutcome, WorkflowRunner};
pub use schema::{
    AgentProfile, FailureAction, FailurePolicy, StepDefinition, WorkflowDefinition,
};
pub use service::WorkflowService;
pub use template::TemplateResolver;
