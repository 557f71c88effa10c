//! Core error types for the Flowgate engine.
//!
//! `EngineError` is what the engine surfaces to callers: definition problems,
//! template problems and store failures. Expectation failures and backend
//! failures never show up here during a run; the runner routes them through
//! the failure handler instead.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid workflow definition: {0}")]
    Definition(String),

    #[error("Template error in step '{step_id}': {reason}")]
    Template { step_id: String, reason: String },

    #[error("Loop budget exhausted for step '{step_id}' (max_loops = {max_loops})")]
    LoopBudgetExceeded { step_id: String, max_loops: u32 },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure reported by an execution or decision collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to parse backend response: {0}")]
    Parse(String),

    #[error("Backend misconfigured: {0}")]
    Config(String),

    #[error("Timed out after {0} seconds")]
    Timeout(u64),
}

impl EngineError {
    pub fn definition(msg: impl Into<String>) -> Self {
        Self::Definition(msg.into())
    }

    pub fn template(step_id: &str, reason: impl Into<String>) -> Self {
        Self::Template {
            step_id: step_id.to_string(),
            reason: reason.into(),
        }
    }
}
