//! Workflow runner: drives a run through its steps.
//!
//! For each step the runner:
//! 1. honors a pending stop request
//! 2. picks the agent (escalation override first)
//! 3. resolves the input template and appends pending feedback
//! 4. calls the backend under the step timeout
//! 5. extracts artifacts and checks the expectation
//! 6. on success stores the output and advances; on failure asks the
//!    failure handler where to go next
//!
//! Every transition is persisted, so an interrupted run can be resumed from
//! its cursor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::{BackendError, EngineError};
use crate::models::{RunStatus, StepResult, StepStatus, WorkflowRun};
use crate::store::RunStore;
use crate::workflow::artifacts::{extract_artifacts, write_artifacts};
use crate::workflow::backend::{AgentBackend, AgentRequest, DecisionMaker};
use crate::workflow::expectation::ExpectationMatcher;
use crate::workflow::failure::{FailureHandler, Recovery};
use crate::workflow::schema::{StepDefinition, WorkflowDefinition};
use crate::workflow::template::{
    feedback_key, loopback_feedback_key, placeholders, TemplateResolver, Token,
};

pub const STOPPED_BY_OPERATOR: &str = "stopped by operator";

/// Final state of a run after `run_all` or `resume` returns.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run: WorkflowRun,
    /// Latest result per step.
    pub steps: Vec<StepResult>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.run.status == RunStatus::Completed
    }
}

enum StepVerdict {
    Passed,
    Failed(String),
}

pub struct WorkflowRunner {
    store: RunStore,
    backend: Arc<dyn AgentBackend>,
    failure_handler: FailureHandler,
    matcher: ExpectationMatcher,
    resolver: TemplateResolver,
    config: EngineConfig,
}

impl WorkflowRunner {
    pub fn new(
        store: RunStore,
        backend: Arc<dyn AgentBackend>,
        decider: Option<Arc<dyn DecisionMaker>>,
        config: EngineConfig,
    ) -> Self {
        let resolver = if config.strict_templates {
            TemplateResolver::strict()
        } else {
            TemplateResolver::lenient()
        };
        Self {
            failure_handler: FailureHandler::new(store.clone(), decider, config.decision_timeout),
            store,
            backend,
            matcher: ExpectationMatcher::new(),
            resolver,
            config,
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Create a run for `task` and execute it until it completes or halts.
    pub async fn run_all(
        &self,
        definition: Arc<WorkflowDefinition>,
        task: &str,
    ) -> Result<RunOutcome, EngineError> {
        self.store.save_definition(&definition).await?;

        let mut run = WorkflowRun::new(definition.id.clone(), task.to_string());
        run.current_step = definition.steps.first().map(|step| step.id.clone());
        self.store.create_run(&run, &definition).await?;
        let _lease = self.store.acquire_lease(&run.id).await?;

        tracing::info!(
            "[Runner] Starting run {} of workflow '{}' ({} steps)",
            run.id,
            definition.display_name(),
            definition.steps.len()
        );

        self.drive(&definition, &mut run, 0, HashMap::new()).await?;
        self.outcome(&definition, run).await
    }

    /// Continue a persisted run from its cursor.
    ///
    /// Completed runs are returned unchanged. A failed run restarts at the
    /// step that failed with a fresh loop budget for that step.
    pub async fn resume(&self, run_id: &str) -> Result<RunOutcome, EngineError> {
        let _lease = self.store.acquire_lease(run_id).await?;
        let mut run = self
            .store
            .get(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run '{}'", run_id)))?;

        let definition = self.store.load_run_definition(run_id).await?;
        if run.status == RunStatus::Completed {
            tracing::info!("[Runner] Run {} already completed, nothing to resume", run_id);
            return self.outcome(&definition, run).await;
        }

        let results = self.store.step_results(run_id).await?;
        let attempts: HashMap<String, u32> = results
            .iter()
            .map(|result| (result.step_id.clone(), result.attempt))
            .collect();

        let cursor = run
            .current_step
            .as_deref()
            .and_then(|step_id| definition.step_index(step_id));
        let start_index = match cursor {
            Some(index) => index,
            None => {
                let completed: Vec<&str> = results
                    .iter()
                    .filter(|result| result.status == StepStatus::Completed)
                    .map(|result| result.step_id.as_str())
                    .collect();
                definition
                    .steps
                    .iter()
                    .position(|step| !completed.contains(&step.id.as_str()))
                    .unwrap_or(definition.steps.len())
            }
        };

        if run.status == RunStatus::Failed {
            if let Some(step) = definition.steps.get(start_index) {
                run.loop_counts.remove(&step.id);
            }
        }
        run.last_error = None;
        run.status = RunStatus::Running;
        run.current_step = definition.steps.get(start_index).map(|step| step.id.clone());
        run.touch();
        self.store.clear_stop_request(run_id).await?;
        self.store.save_run(&run).await?;

        tracing::info!(
            "[Runner] Resuming run {} at step {:?}",
            run_id,
            run.current_step
        );

        self.drive(&definition, &mut run, start_index, attempts).await?;
        self.outcome(&definition, run).await
    }

    /// Current state of a stored run, with step results in definition order.
    pub async fn status(&self, run_id: &str) -> Result<RunOutcome, EngineError> {
        let run = self
            .store
            .get(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run '{}'", run_id)))?;
        let definition = self.store.load_run_definition(run_id).await?;
        self.outcome(&definition, run).await
    }

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        run: &mut WorkflowRun,
        start_index: usize,
        mut attempts: HashMap<String, u32>,
    ) -> Result<(), EngineError> {
        let mut index = start_index;
        let mut transitions: u32 = 0;

        while index < definition.steps.len() {
            let step = &definition.steps[index];
            run.current_step = Some(step.id.clone());

            if self.store.stop_requested(&run.id).await? {
                tracing::info!("[Runner] Run {} stopped before step '{}'", run.id, step.id);
                self.fail_run(run, STOPPED_BY_OPERATOR.to_string()).await?;
                return Ok(());
            }

            if transitions >= self.config.max_transitions {
                let error = format!(
                    "exceeded {} step executions without finishing",
                    self.config.max_transitions
                );
                tracing::warn!("[Runner] Run {} {}", run.id, error);
                self.fail_run(run, error).await?;
                return Ok(());
            }
            transitions += 1;

            let attempt = attempts.entry(step.id.clone()).or_insert(0);
            *attempt += 1;
            let attempt = *attempt;

            match self.execute_step(definition, run, step, attempt).await? {
                StepVerdict::Passed => {
                    index += 1;
                    run.current_step = definition.steps.get(index).map(|next| next.id.clone());
                    run.touch();
                    self.store.save_run(run).await?;
                }
                StepVerdict::Failed(reason) => {
                    tracing::info!("[Runner] Step '{}' failed: {}", step.id, reason);
                    match self
                        .failure_handler
                        .handle(run, definition, index, &reason)
                        .await?
                    {
                        Recovery::Continue { next_index } => index = next_index,
                        Recovery::Halt { error } => {
                            tracing::warn!("[Runner] Run {} halted: {}", run.id, error);
                            return Ok(());
                        }
                    }
                }
            }
        }

        run.status = RunStatus::Completed;
        run.current_step = None;
        run.last_error = None;
        run.touch();
        self.store.save_run(run).await?;
        tracing::info!("[Runner] Run {} completed", run.id);
        Ok(())
    }

    async fn execute_step(
        &self,
        definition: &WorkflowDefinition,
        run: &mut WorkflowRun,
        step: &StepDefinition,
        attempt: u32,
    ) -> Result<StepVerdict, EngineError> {
        let agent_id = run
            .agent_overrides
            .get(&step.id)
            .cloned()
            .unwrap_or_else(|| step.agent.clone());
        let agent = definition.agent(&agent_id).ok_or_else(|| {
            EngineError::definition(format!(
                "step '{}' references unknown agent '{}'",
                step.id, agent_id
            ))
        })?;

        let input = match self.resolver.resolve(&step.id, &step.input, run) {
            Ok(input) => append_pending_feedback(step, input, run),
            Err(e) => {
                let mut result = StepResult::started(&step.id, attempt, step.input.clone());
                result.fail(String::new(), e.to_string());
                self.store.upsert_step_result(&run.id, &result).await?;
                self.fail_run(run, e.to_string()).await?;
                return Err(e);
            }
        };

        let mut result = StepResult::started(&step.id, attempt, input.clone());
        result
            .metadata
            .insert("agent".to_string(), Value::String(agent_id.clone()));
        self.store.upsert_step_result(&run.id, &result).await?;
        run.status = RunStatus::Running;
        run.touch();
        self.store.save_run(run).await?;

        tracing::info!(
            "[Runner] Run {} step '{}' (attempt {}) with agent '{}'",
            run.id,
            step.id,
            attempt,
            agent_id
        );

        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.step_timeout);
        let request = AgentRequest {
            run_id: &run.id,
            step_id: &step.id,
            agent,
            input: &input,
            metadata: &step.metadata,
        };
        let output = match tokio::time::timeout(timeout, self.backend.execute(request)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let reason = format!("backend error: {}", e);
                result.fail(String::new(), reason.clone());
                self.store.upsert_step_result(&run.id, &result).await?;
                return Ok(StepVerdict::Failed(reason));
            }
            Err(_) => {
                let reason = BackendError::Timeout(timeout.as_secs()).to_string();
                result.fail(String::new(), reason.clone());
                self.store.upsert_step_result(&run.id, &result).await?;
                return Ok(StepVerdict::Failed(reason));
            }
        };

        let artifacts = extract_artifacts(&output);
        if !artifacts.is_empty() {
            let paths = artifacts
                .iter()
                .map(|artifact| Value::String(artifact.path.clone()))
                .collect();
            result
                .metadata
                .insert("artifacts".to_string(), Value::Array(paths));

            if let Some(dir) = &self.config.artifact_dir {
                match write_artifacts(&dir.join(&run.id), &artifacts) {
                    Ok(written) => tracing::info!(
                        "[Runner] Wrote {} artifact(s) for step '{}'",
                        written.len(),
                        step.id
                    ),
                    Err(e) => tracing::warn!(
                        "[Runner] Failed to write artifacts for step '{}': {}",
                        step.id,
                        e
                    ),
                }
            }
        }

        match self
            .matcher
            .evaluate(&output, step.expects.as_deref(), &artifacts)
        {
            Some(route) => {
                result.metadata.insert(
                    "expectation".to_string(),
                    Value::String(route.as_str().to_string()),
                );
                result.complete(output.clone());
                self.store.upsert_step_result(&run.id, &result).await?;

                run.context.insert(step.id.clone(), output);
                // Feedback is consumed once the step passes.
                run.context.remove(&feedback_key(&step.id));
                run.context.remove(&loopback_feedback_key(&step.id));
                Ok(StepVerdict::Passed)
            }
            None => {
                let reason = match step.expects.as_deref() {
                    Some(expects) => format!("output did not satisfy expectation '{}'", expects),
                    None => "step produced no usable output".to_string(),
                };
                result.metadata.insert(
                    "expectation".to_string(),
                    Value::String("unmet".to_string()),
                );
                result.fail(output, reason.clone());
                self.store.upsert_step_result(&run.id, &result).await?;
                Ok(StepVerdict::Failed(reason))
            }
        }
    }

    async fn fail_run(&self, run: &mut WorkflowRun, error: String) -> Result<(), EngineError> {
        run.status = RunStatus::Failed;
        run.last_error = Some(error);
        run.touch();
        self.store.save_run(run).await
    }

    async fn outcome(
        &self,
        definition: &WorkflowDefinition,
        run: WorkflowRun,
    ) -> Result<RunOutcome, EngineError> {
        // Flags such as `archived` may have changed under the running copy.
        let run = self.store.get(&run.id).await?.unwrap_or(run);
        let mut steps = self.store.step_results(&run.id).await?;
        steps.sort_by_key(|result| {
            definition
                .step_index(&result.step_id)
                .unwrap_or(definition.steps.len())
        });
        Ok(RunOutcome { run, steps })
    }
}

/// Append retry / loop-back feedback under a `## Feedback` heading unless the
/// template already placed it.
fn append_pending_feedback(step: &StepDefinition, input: String, run: &WorkflowRun) -> String {
    let referenced: Vec<Token> = placeholders(&step.input)
        .iter()
        .map(|name| Token::parse(name))
        .collect();

    let pending: Vec<&str> = [feedback_key(&step.id), loopback_feedback_key(&step.id)]
        .into_iter()
        .filter(|key| !referenced.contains(&Token::Context(key.clone())))
        .filter_map(|key| run.context.get(&key))
        .map(|text| text.trim())
        .filter(|text| !text.is_empty())
        .collect();

    if pending.is_empty() {
        return input;
    }

    let mut input = input;
    input.push_str("\n\n## Feedback\n");
    input.push_str(&pending.join("\n\n"));
    input
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(input: &str) -> StepDefinition {
        StepDefinition {
            id: "implement".to_string(),
            agent: "coder".to_string(),
            input: input.to_string(),
            expects: None,
            on_failure: None,
            timeout_secs: None,
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_feedback_appended_when_not_referenced() {
        let mut run = WorkflowRun::new("flow".to_string(), "task".to_string());
        run.context.insert(
            "implement_loopback_feedback".to_string(),
            "Add tests".to_string(),
        );
        let input = append_pending_feedback(&step("Write code"), "Write code".to_string(), &run);
        assert_eq!(input, "Write code\n\n## Feedback\nAdd tests");
    }

    #[test]
    fn test_feedback_not_duplicated_when_referenced() {
        let mut run = WorkflowRun::new("flow".to_string(), "task".to_string());
        run.context
            .insert("implement_feedback".to_string(), "Be careful".to_string());
        let template = "Write code. {{ implement_feedback }}";
        let input = append_pending_feedback(
            &step(template),
            "Write code. Be careful".to_string(),
            &run,
        );
        assert_eq!(input, "Write code. Be careful");
    }

    #[test]
    fn test_no_feedback_leaves_input_alone() {
        let run = WorkflowRun::new("flow".to_string(), "task".to_string());
        let input = append_pending_feedback(&step("x"), "x".to_string(), &run);
        assert_eq!(input, "x");
    }
}
