//! Command-style facade over the runner and the run store.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::EngineError;
use crate::models::{RunListFilter, WorkflowRun};
use crate::store::RunStore;
use crate::workflow::backend::{AgentBackend, DecisionMaker};
use crate::workflow::runner::{RunOutcome, WorkflowRunner};
use crate::workflow::schema::WorkflowDefinition;

pub struct WorkflowService {
    store: RunStore,
    runner: WorkflowRunner,
}

impl WorkflowService {
    pub fn new(
        db: Database,
        backend: Arc<dyn AgentBackend>,
        decider: Option<Arc<dyn DecisionMaker>>,
        config: EngineConfig,
    ) -> Self {
        let store = RunStore::new(db);
        let runner = WorkflowRunner::new(store.clone(), backend, decider, config);
        Self { store, runner }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Parse and validate a definition file without running it.
    pub fn validate(path: &str) -> Result<WorkflowDefinition, EngineError> {
        WorkflowDefinition::from_file(path)
    }

    pub async fn start(
        &self,
        definition: Arc<WorkflowDefinition>,
        task: &str,
    ) -> Result<RunOutcome, EngineError> {
        self.runner.run_all(definition, task).await
    }

    pub async fn start_file(&self, path: &str, task: &str) -> Result<RunOutcome, EngineError> {
        let definition = Arc::new(WorkflowDefinition::from_file(path)?);
        self.start(definition, task).await
    }

    /// The run with its feedback history and the latest result of each step.
    pub async fn status(&self, run_id: &str) -> Result<RunOutcome, EngineError> {
        self.runner.status(run_id).await
    }

    pub async fn list(&self, filter: RunListFilter) -> Result<Vec<WorkflowRun>, EngineError> {
        self.store.list(filter).await
    }

    pub async fn resume(&self, run_id: &str) -> Result<RunOutcome, EngineError> {
        self.runner.resume(run_id).await
    }

    /// Ask a run to stop at its next step boundary.
    pub async fn stop(&self, run_id: &str) -> Result<(), EngineError> {
        let run = self.require_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "run '{}' is already {}",
                run_id, run.status
            )));
        }
        self.store.request_stop(run_id).await?;
        tracing::info!("[Service] Stop requested for run {}", run_id);
        Ok(())
    }

    pub async fn archive(&self, run_id: &str) -> Result<(), EngineError> {
        found(self.store.archive(run_id).await?, run_id)
    }

    pub async fn unarchive(&self, run_id: &str) -> Result<(), EngineError> {
        found(self.store.unarchive(run_id).await?, run_id)
    }

    /// Permanently delete a run, its step results and its feedback history.
    pub async fn delete(&self, run_id: &str) -> Result<(), EngineError> {
        // Refused while the run is being driven.
        let _lease = self.store.acquire_lease(run_id).await?;
        found(self.store.delete(run_id).await?, run_id)
    }

    async fn require_run(&self, run_id: &str) -> Result<WorkflowRun, EngineError> {
        self.store
            .get(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run '{}'", run_id)))
    }
}

fn found(changed: bool, run_id: &str) -> Result<(), EngineError> {
    if changed {
        Ok(())
    } else {
        Err(EngineError::NotFound(format!("run '{}'", run_id)))
    }
}
