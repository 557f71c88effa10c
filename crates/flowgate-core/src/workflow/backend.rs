//! Collaborator seams: the engine talks to language models only through
//! these two traits.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::BackendError;
use crate::workflow::schema::AgentProfile;

/// Everything an execution backend gets for one step attempt.
#[derive(Debug, Clone, Copy)]
pub struct AgentRequest<'a> {
    pub run_id: &'a str,
    pub step_id: &'a str,
    pub agent: &'a AgentProfile,
    /// Fully resolved step input.
    pub input: &'a str,
    /// Step metadata from the definition, passed through untouched.
    pub metadata: &'a Map<String, Value>,
}

/// Executes one step with a role-specific agent and returns its raw output.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn execute(&self, request: AgentRequest<'_>) -> Result<String, BackendError>;
}

/// Answers a recovery prompt for `llm_decide` steps.
#[async_trait]
pub trait DecisionMaker: Send + Sync {
    async fn decide(&self, prompt: &str) -> Result<String, BackendError>;
}
