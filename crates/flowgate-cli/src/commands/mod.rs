//! CLI command implementations.
//!
//! Each submodule groups related subcommands. Every command takes a
//! `WorkflowService` so tests can hand in one backed by an in-memory
//! database and a scripted agent backend.

pub mod runs;
pub mod workflow;

use std::sync::Arc;

use async_trait::async_trait;
use flowgate_core::workflow::{
    AgentBackend, AgentCallConfig, AgentRequest, DecisionMaker, HttpAgentBackend, WorkflowService,
};
use flowgate_core::{BackendError, Database, EngineConfig};

/// Open the database and wire the HTTP backend from the environment.
///
/// Commands that never call an agent pass `require_backend = false`; they
/// still work when no API key is configured.
pub fn init_service(db_path: &str, require_backend: bool) -> Result<WorkflowService, String> {
    let db = Database::open(db_path)
        .map_err(|e| format!("Failed to open database '{}': {}", db_path, e))?;

    let (backend, decider): (Arc<dyn AgentBackend>, Option<Arc<dyn DecisionMaker>>) =
        match AgentCallConfig::from_env().and_then(HttpAgentBackend::new) {
            Ok(http) => {
                let http = Arc::new(http);
                let decider: Arc<dyn DecisionMaker> = http.clone();
                (http as Arc<dyn AgentBackend>, Some(decider))
            }
            Err(e) if require_backend => return Err(e.to_string()),
            Err(e) => {
                tracing::debug!("[CLI] Agent backend unavailable: {}", e);
                (Arc::new(Unconfigured(e)), None)
            }
        };

    Ok(WorkflowService::new(
        db,
        backend,
        decider,
        EngineConfig::from_env(),
    ))
}

/// Stand-in for commands that only touch stored runs.
struct Unconfigured(BackendError);

#[async_trait]
impl AgentBackend for Unconfigured {
    async fn execute(&self, _request: AgentRequest<'_>) -> Result<String, BackendError> {
        Err(self.0.clone())
    }
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}
