//! Failure handler: turns a failed step attempt into a recovery decision.
//!
//! Every decision increments the step's loop counter (except `stop`), checks
//! it against the policy's `max_loops`, writes feedback into the run context
//! for the step that runs next, and appends exactly one `FeedbackRecord`.
//! The run update and the record are persisted in one transaction.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::EngineError;
use crate::models::{FeedbackRecord, RunStatus, WorkflowRun};
use crate::store::RunStore;
use crate::workflow::backend::DecisionMaker;
use crate::workflow::decision::{build_decision_prompt, parse_decision, DecisionAction};
use crate::workflow::schema::{FailureAction, FailurePolicy, WorkflowDefinition};
use crate::workflow::template::{feedback_key, loopback_feedback_key, render_with};

pub const DEFAULT_FEEDBACK_TEMPLATE: &str = "Step '{{step}}' failed (attempt {{loop}}): {{error}}";

/// What the runner does after a failed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// Execute the step at `next_index` (the same step, or an earlier one).
    Continue { next_index: usize },
    /// The run is over and marked failed.
    Halt { error: String },
}

/// A concrete move, after any `llm_decide` indirection is resolved.
enum Move {
    Retry,
    LoopBack { to_step: String },
    Escalate { to_agent: String, to_step: Option<String> },
    Stop,
}

pub struct FailureHandler {
    store: RunStore,
    decider: Option<Arc<dyn DecisionMaker>>,
    decision_timeout: Duration,
}

impl FailureHandler {
    pub fn new(
        store: RunStore,
        decider: Option<Arc<dyn DecisionMaker>>,
        decision_timeout: Duration,
    ) -> Self {
        Self {
            store,
            decider,
            decision_timeout,
        }
    }

    /// Decide how to recover from a failure of `definition.steps[step_index]`.
    /// Mutates `run` (counters, context, overrides, status, cursor) and
    /// persists the result.
    pub async fn handle(
        &self,
        run: &mut WorkflowRun,
        definition: &WorkflowDefinition,
        step_index: usize,
        reason: &str,
    ) -> Result<Recovery, EngineError> {
        let step = definition.steps.get(step_index).ok_or_else(|| {
            EngineError::Internal(format!("step index {} out of range", step_index))
        })?;
        let step_id = step.id.clone();
        let policy = step.on_failure.clone().unwrap_or_else(FailurePolicy::stop);

        let (recovery, record) = if policy.action == FailureAction::Stop {
            let loop_number = run.loop_count(&step_id);
            let error = format!("step '{}' failed: {}", step_id, reason);
            (
                self.halt(run, error.clone()),
                new_record(&step_id, loop_number, "stop", error),
            )
        } else {
            let loop_number = run.loop_count(&step_id) + 1;
            run.loop_counts.insert(step_id.clone(), loop_number);
            let max_loops = policy.action.max_loops();

            if loop_number > max_loops {
                let exhausted = EngineError::LoopBudgetExceeded {
                    step_id: step_id.clone(),
                    max_loops,
                };
                tracing::warn!("[FailureHandler] {}", exhausted);
                let error = format!("{}; last failure: {}", exhausted, reason);
                let label = format!("{}:exhausted", policy.action.label());
                (
                    self.halt(run, error.clone()),
                    new_record(&step_id, loop_number, &label, error),
                )
            } else {
                let (chosen, label, llm_feedback) = self
                    .choose(run, definition, step_index, &policy.action, reason)
                    .await;
                let feedback = llm_feedback.unwrap_or_else(|| {
                    render_feedback(&policy, run, &step_id, &chosen, loop_number, max_loops, reason)
                });
                tracing::info!(
                    "[FailureHandler] Step '{}' failed (loop {}/{}), action: {}",
                    step_id,
                    loop_number,
                    max_loops,
                    label
                );
                let recovery = self.apply(run, definition, step_index, chosen, &feedback, reason);
                (recovery, new_record(&step_id, loop_number, &label, feedback))
            }
        };

        run.feedback_history.push(record.clone());
        run.touch();
        self.store.record_recovery(run, &record).await?;
        Ok(recovery)
    }

    /// Resolve the configured action into a concrete move. Returns the move,
    /// the label recorded in the feedback history, and feedback supplied by
    /// the decision maker, if any.
    async fn choose(
        &self,
        run: &WorkflowRun,
        definition: &WorkflowDefinition,
        step_index: usize,
        action: &FailureAction,
        reason: &str,
    ) -> (Move, String, Option<String>) {
        match action {
            FailureAction::LlmDecide { fallback, .. } => {
                match self.consult(run, definition, step_index, reason).await {
                    Some((chosen, feedback)) => {
                        let label = format!("llm_decide:{}", move_label(&chosen));
                        (chosen, label, feedback)
                    }
                    None => {
                        let chosen = configured_move(fallback);
                        let label = format!("llm_decide:fallback:{}", move_label(&chosen));
                        (chosen, label, None)
                    }
                }
            }
            other => {
                let chosen = configured_move(other);
                let label = move_label(&chosen).to_string();
                (chosen, label, None)
            }
        }
    }

    /// Ask the decision maker. `None` means "use the fallback".
    async fn consult(
        &self,
        run: &WorkflowRun,
        definition: &WorkflowDefinition,
        step_index: usize,
        reason: &str,
    ) -> Option<(Move, Option<String>)> {
        let Some(decider) = self.decider.as_ref() else {
            tracing::warn!("[FailureHandler] llm_decide without a decision maker, using fallback");
            return None;
        };

        let prompt = build_decision_prompt(definition, step_index, reason, run);
        let reply = match tokio::time::timeout(self.decision_timeout, decider.decide(&prompt)).await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!("[FailureHandler] Decision maker failed: {}, using fallback", e);
                return None;
            }
            Err(_) => {
                tracing::warn!(
                    "[FailureHandler] Decision maker timed out after {:?}, using fallback",
                    self.decision_timeout
                );
                return None;
            }
        };

        let Some(decision) = parse_decision(&reply) else {
            tracing::warn!("[FailureHandler] Unreadable decision reply, using fallback");
            return None;
        };
        if let Some(reasoning) = &decision.reasoning {
            tracing::debug!("[FailureHandler] Decision reasoning: {}", reasoning);
        }

        let chosen = match decision.action {
            DecisionAction::Retry => Move::Retry,
            DecisionAction::Stop => Move::Stop,
            DecisionAction::LoopBack => match decision.to_step {
                Some(to_step) if definition.step_index(&to_step).is_some() => {
                    Move::LoopBack { to_step }
                }
                target => {
                    tracing::warn!(
                        "[FailureHandler] LOOP_BACK to invalid step {:?}, using fallback",
                        target
                    );
                    return None;
                }
            },
        };
        Some((chosen, decision.feedback))
    }

    fn apply(
        &self,
        run: &mut WorkflowRun,
        definition: &WorkflowDefinition,
        step_index: usize,
        chosen: Move,
        feedback: &str,
        reason: &str,
    ) -> Recovery {
        let step_id = definition.steps[step_index].id.clone();
        let next_index = match chosen {
            Move::Stop => {
                return self.halt(run, format!("step '{}' failed: {}", step_id, reason));
            }
            Move::Retry => {
                run.context.insert(feedback_key(&step_id), feedback.to_string());
                step_index
            }
            Move::LoopBack { to_step } => self.loop_back(run, definition, step_index, &to_step, feedback),
            Move::Escalate { to_agent, to_step } => {
                tracing::info!(
                    "[FailureHandler] Escalating step '{}' to agent '{}'",
                    step_id,
                    to_agent
                );
                run.agent_overrides.insert(step_id.clone(), to_agent);
                match to_step {
                    Some(to_step) => self.loop_back(run, definition, step_index, &to_step, feedback),
                    None => {
                        run.context.insert(feedback_key(&step_id), feedback.to_string());
                        step_index
                    }
                }
            }
        };

        run.status = RunStatus::Running;
        run.last_error = Some(reason.to_string());
        run.current_step = Some(definition.steps[next_index].id.clone());
        Recovery::Continue { next_index }
    }

    fn loop_back(
        &self,
        run: &mut WorkflowRun,
        definition: &WorkflowDefinition,
        step_index: usize,
        to_step: &str,
        feedback: &str,
    ) -> usize {
        run.context
            .insert(loopback_feedback_key(to_step), feedback.to_string());
        // Targets are validated at load time; stay on the failed step otherwise.
        definition.step_index(to_step).unwrap_or(step_index)
    }

    fn halt(&self, run: &mut WorkflowRun, error: String) -> Recovery {
        run.status = RunStatus::Failed;
        run.last_error = Some(error.clone());
        Recovery::Halt { error }
    }
}

fn configured_move(action: &FailureAction) -> Move {
    match action {
        FailureAction::Stop => Move::Stop,
        FailureAction::Retry { .. } => Move::Retry,
        FailureAction::LoopBack { to_step, .. } => Move::LoopBack {
            to_step: to_step.clone(),
        },
        FailureAction::Escalate {
            to_agent, to_step, ..
        } => Move::Escalate {
            to_agent: to_agent.clone(),
            to_step: to_step.clone(),
        },
        // Nested llm_decide is never produced by the loader.
        FailureAction::LlmDecide { fallback, .. } => configured_move(fallback),
    }
}

fn move_label(chosen: &Move) -> &'static str {
    match chosen {
        Move::Retry => "retry",
        Move::LoopBack { .. } => "loop_back",
        Move::Escalate { .. } => "escalate",
        Move::Stop => "stop",
    }
}

fn move_target(chosen: &Move) -> Option<&str> {
    match chosen {
        Move::LoopBack { to_step } => Some(to_step),
        Move::Escalate { to_step, .. } => to_step.as_deref(),
        Move::Retry | Move::Stop => None,
    }
}

fn new_record(step_id: &str, loop_number: u32, action: &str, feedback: String) -> FeedbackRecord {
    FeedbackRecord {
        step_id: step_id.to_string(),
        loop_number,
        action: action.to_string(),
        feedback,
        created_at: Utc::now(),
    }
}

fn render_feedback(
    policy: &FailurePolicy,
    run: &WorkflowRun,
    step_id: &str,
    chosen: &Move,
    loop_number: u32,
    max_loops: u32,
    reason: &str,
) -> String {
    let to_step = move_target(chosen).unwrap_or(step_id).to_string();
    let lookup = |name: &str| -> Option<String> {
        match name {
            "error" => Some(reason.to_string()),
            "step" => Some(step_id.to_string()),
            "loop" => Some(loop_number.to_string()),
            "max_loops" => Some(max_loops.to_string()),
            "to_step" => Some(to_step.clone()),
            "task" => Some(run.task.clone()),
            key => run.context.get(key).cloned(),
        }
    };

    let template = policy
        .feedback_template
        .as_deref()
        .unwrap_or(DEFAULT_FEEDBACK_TEMPLATE);
    match render_with(template, lookup) {
        Ok(feedback) => feedback,
        Err(missing) => {
            tracing::warn!(
                "[FailureHandler] Feedback template for '{}' references unknown '{}', using default",
                step_id,
                missing
            );
            format!(
                "Step '{}' failed (attempt {}): {}",
                step_id, loop_number, reason
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::BackendError;
    use async_trait::async_trait;

    struct FixedDecider(Result<String, BackendError>);

    #[async_trait]
    impl DecisionMaker for FixedDecider {
        async fn decide(&self, _prompt: &str) -> Result<String, BackendError> {
            self.0.clone()
        }
    }

    const FLOW: &str = r#"
id: recovery
agents:
  - id: planner
  - id: coder
  - id: senior
steps:
  - id: plan
    agent: planner
    on_failure:
      action: stop
  - id: implement
    agent: coder
    on_failure:
      action: retry
      max_loops: 2
  - id: verify
    agent: planner
    on_failure:
      action: loop_back
      to_step: implement
      max_loops: 1
      feedback_template: "Fix {{step}} -> {{to_step}} ({{loop}}/{{max_loops}}): {{error}}"
  - id: polish
    agent: coder
    on_failure:
      action: escalate
      escalate_to: senior
  - id: decide
    agent: coder
    on_failure:
      action: llm_decide
      to_step: plan
      max_loops: 2
  - id: bare
    agent: coder
"#;

    async fn setup(
        decider: Option<Arc<dyn DecisionMaker>>,
    ) -> (FailureHandler, RunStore, WorkflowDefinition, WorkflowRun) {
        let store = RunStore::new(Database::open_in_memory().unwrap());
        let definition = WorkflowDefinition::from_yaml(FLOW).unwrap();
        let mut run = WorkflowRun::new(definition.id.clone(), "Build it".to_string());
        run.status = RunStatus::Running;
        store.create_run(&run, &definition).await.unwrap();
        let handler = FailureHandler::new(store.clone(), decider, Duration::from_secs(5));
        (handler, store, definition, run)
    }

    #[tokio::test]
    async fn test_stop_halts_with_one_record() {
        let (handler, store, definition, mut run) = setup(None).await;
        let recovery = handler.handle(&mut run, &definition, 0, "bad plan").await.unwrap();
        assert!(matches!(recovery, Recovery::Halt { .. }));
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.loop_count("plan"), 0);

        let stored = store.get(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.feedback_history.len(), 1);
        assert_eq!(stored.feedback_history[0].action, "stop");
    }

    #[tokio::test]
    async fn test_missing_policy_behaves_like_stop() {
        let (handler, _store, definition, mut run) = setup(None).await;
        let recovery = handler.handle(&mut run, &definition, 5, "nope").await.unwrap();
        assert!(matches!(recovery, Recovery::Halt { .. }));
        assert_eq!(run.feedback_history[0].action, "stop");
    }

    #[tokio::test]
    async fn test_retry_until_budget_exhausted() {
        let (handler, store, definition, mut run) = setup(None).await;

        for expected_loop in 1..=2 {
            let recovery = handler.handle(&mut run, &definition, 1, "no code").await.unwrap();
            assert_eq!(recovery, Recovery::Continue { next_index: 1 });
            assert_eq!(run.loop_count("implement"), expected_loop);
        }
        assert_eq!(
            run.context["implement_feedback"],
            "Step 'implement' failed (attempt 2): no code"
        );

        let recovery = handler.handle(&mut run, &definition, 1, "no code").await.unwrap();
        match recovery {
            Recovery::Halt { error } => assert!(error.contains("Loop budget exhausted")),
            other => panic!("unexpected recovery: {other:?}"),
        }
        assert_eq!(run.loop_count("implement"), 3);
        assert_eq!(run.status, RunStatus::Failed);

        let stored = store.get(&run.id).await.unwrap().unwrap();
        let actions: Vec<&str> = stored.feedback_history.iter().map(|r| r.action.as_str()).collect();
        assert_eq!(actions, vec!["retry", "retry", "retry:exhausted"]);
        assert_eq!(stored.loop_count("implement"), 3);
    }

    #[tokio::test]
    async fn test_loop_back_moves_cursor_and_renders_template() {
        let (handler, _store, definition, mut run) = setup(None).await;
        let recovery = handler
            .handle(&mut run, &definition, 2, "not verified")
            .await
            .unwrap();
        assert_eq!(recovery, Recovery::Continue { next_index: 1 });
        assert_eq!(run.current_step.as_deref(), Some("implement"));
        assert_eq!(
            run.context["implement_loopback_feedback"],
            "Fix verify -> implement (1/1): not verified"
        );
        assert_eq!(run.feedback_history[0].action, "loop_back");
    }

    #[tokio::test]
    async fn test_escalate_sets_agent_override() {
        let (handler, _store, definition, mut run) = setup(None).await;
        let recovery = handler.handle(&mut run, &definition, 3, "too hard").await.unwrap();
        assert_eq!(recovery, Recovery::Continue { next_index: 3 });
        assert_eq!(run.agent_overrides["polish"], "senior");
        assert!(run.context.contains_key("polish_feedback"));
        assert_eq!(run.feedback_history[0].action, "escalate");
    }

    #[tokio::test]
    async fn test_llm_decide_applies_valid_reply() {
        let decider: Arc<dyn DecisionMaker> = Arc::new(FixedDecider(Ok(
            "ACTION: LOOP_BACK\nTO_STEP: implement\nFEEDBACK: add error handling".to_string(),
        )));
        let (handler, _store, definition, mut run) = setup(Some(decider)).await;
        let recovery = handler.handle(&mut run, &definition, 4, "flaky").await.unwrap();
        assert_eq!(recovery, Recovery::Continue { next_index: 1 });
        assert_eq!(run.context["implement_loopback_feedback"], "add error handling");
        assert_eq!(run.loop_count("decide"), 1);
        assert_eq!(run.feedback_history[0].action, "llm_decide:loop_back");
    }

    #[tokio::test]
    async fn test_llm_decide_stop_halts() {
        let decider: Arc<dyn DecisionMaker> =
            Arc::new(FixedDecider(Ok("ACTION: STOP\nREASONING: hopeless".to_string())));
        let (handler, _store, definition, mut run) = setup(Some(decider)).await;
        let recovery = handler.handle(&mut run, &definition, 4, "flaky").await.unwrap();
        assert!(matches!(recovery, Recovery::Halt { .. }));
        assert_eq!(run.feedback_history[0].action, "llm_decide:stop");
    }

    #[tokio::test]
    async fn test_llm_decide_falls_back_without_double_counting() {
        let replies = [
            Ok("I am not sure what to do".to_string()),
            Ok("ACTION: LOOP_BACK\nTO_STEP: nowhere".to_string()),
            Err(BackendError::Http("connection refused".to_string())),
        ];
        for reply in replies {
            let decider: Arc<dyn DecisionMaker> = Arc::new(FixedDecider(reply));
            let (handler, _store, definition, mut run) = setup(Some(decider)).await;
            let recovery = handler.handle(&mut run, &definition, 4, "flaky").await.unwrap();
            // Fallback for llm_decide with to_step is loop_back to that step.
            assert_eq!(recovery, Recovery::Continue { next_index: 0 });
            assert_eq!(run.loop_count("decide"), 1);
            assert!(run.context.contains_key("plan_loopback_feedback"));
            assert_eq!(run.feedback_history.len(), 1);
            assert_eq!(run.feedback_history[0].action, "llm_decide:fallback:loop_back");
        }
    }

    #[tokio::test]
    async fn test_llm_decide_without_decider_uses_fallback() {
        let (handler, _store, definition, mut run) = setup(None).await;
        let recovery = handler.handle(&mut run, &definition, 4, "flaky").await.unwrap();
        assert_eq!(recovery, Recovery::Continue { next_index: 0 });
    }

    #[tokio::test]
    async fn test_llm_decide_shares_loop_budget() {
        let decider: Arc<dyn DecisionMaker> =
            Arc::new(FixedDecider(Ok("ACTION: RETRY".to_string())));
        let (handler, _store, definition, mut run) = setup(Some(decider)).await;
        for _ in 0..2 {
            let recovery = handler.handle(&mut run, &definition, 4, "flaky").await.unwrap();
            assert_eq!(recovery, Recovery::Continue { next_index: 4 });
        }
        let recovery = handler.handle(&mut run, &definition, 4, "flaky").await.unwrap();
        assert!(matches!(recovery, Recovery::Halt { .. }));
        assert_eq!(run.loop_count("decide"), 3);
        assert_eq!(run.feedback_history.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_template_variable_uses_default_feedback() {
        let yaml = FLOW.replace(
            "      action: retry\n      max_loops: 2",
            "      action: retry\n      max_loops: 2\n      feedback_template: \"{{nope}}\"",
        );
        let store = RunStore::new(Database::open_in_memory().unwrap());
        let definition = WorkflowDefinition::from_yaml(&yaml).unwrap();
        let mut run = WorkflowRun::new(definition.id.clone(), "t".to_string());
        store.create_run(&run, &definition).await.unwrap();
        let handler = FailureHandler::new(store, None, Duration::from_secs(1));
        handler.handle(&mut run, &definition, 1, "boom").await.unwrap();
        assert_eq!(
            run.context["implement_feedback"],
            "Step 'implement' failed (attempt 1): boom"
        );
    }
}
