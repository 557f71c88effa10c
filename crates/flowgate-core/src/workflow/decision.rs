//! Prompt and reply grammar for `llm_decide` recovery.
//!
//! The decision collaborator is asked to answer with labelled lines:
//!
//! ```text
//! ACTION: RETRY | LOOP_BACK | STOP
//! TO_STEP: <step id, only for LOOP_BACK>
//! FEEDBACK: <guidance for the next attempt, may span lines>
//! REASONING: <why>
//! ```
//!
//! Replies come from a language model, so parsing is forgiving about case,
//! markdown emphasis and list bullets. Anything that still cannot be read
//! yields `None` and the caller falls back to the configured action.

use crate::models::WorkflowRun;
use crate::workflow::schema::WorkflowDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    Retry,
    LoopBack,
    Stop,
}

impl DecisionAction {
    /// Read the action from the start of an `ACTION:` value. Two-word
    /// spellings such as `LOOP BACK` win over a single leading word.
    fn from_value(value: &str) -> Option<Self> {
        let words: Vec<&str> = value.split_whitespace().take(2).collect();
        (1..=words.len())
            .rev()
            .find_map(|n| Self::parse(&words[..n].concat()))
    }

    fn parse(value: &str) -> Option<Self> {
        let normalized: String = value
            .trim()
            .to_ascii_uppercase()
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .collect();
        match normalized.as_str() {
            "RETRY" => Some(Self::Retry),
            "LOOPBACK" => Some(Self::LoopBack),
            "STOP" => Some(Self::Stop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: DecisionAction,
    pub to_step: Option<String>,
    pub feedback: Option<String>,
    pub reasoning: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    Action,
    ToStep,
    Feedback,
    Reasoning,
}

const FIELDS: &[(&str, Field)] = &[
    ("ACTION", Field::Action),
    ("TO_STEP", Field::ToStep),
    ("TO-STEP", Field::ToStep),
    ("TO STEP", Field::ToStep),
    ("FEEDBACK", Field::Feedback),
    ("REASONING", Field::Reasoning),
];

/// Parse a decision reply. Returns `None` when no recognizable `ACTION` is
/// present.
pub fn parse_decision(reply: &str) -> Option<Decision> {
    let mut action = None;
    let mut to_step = None;
    let mut feedback: Option<String> = None;
    let mut reasoning: Option<String> = None;
    let mut current: Option<Field> = None;

    for raw_line in reply.lines() {
        match split_label(raw_line) {
            Some((field, value)) => {
                current = Some(field);
                match field {
                    Field::Action => {
                        if action.is_none() {
                            action = DecisionAction::from_value(value);
                        }
                    }
                    Field::ToStep => {
                        let target = value
                            .trim_matches(|c: char| c == '`' || c == '"' || c == '\'')
                            .trim();
                        if !target.is_empty() {
                            to_step = Some(target.to_string());
                        }
                    }
                    Field::Feedback => feedback = Some(value.to_string()),
                    Field::Reasoning => reasoning = Some(value.to_string()),
                }
            }
            None => {
                // Continuation lines extend the free-text fields.
                let target = match current {
                    Some(Field::Feedback) => &mut feedback,
                    Some(Field::Reasoning) => &mut reasoning,
                    _ => continue,
                };
                if let Some(text) = target.as_mut() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(raw_line.trim_end());
                }
            }
        }
    }

    Some(Decision {
        action: action?,
        to_step,
        feedback: feedback.map(|f| f.trim().to_string()).filter(|f| !f.is_empty()),
        reasoning: reasoning.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()),
    })
}

/// Recognize `LABEL: value`, tolerating bullets and `**LABEL:**` emphasis.
fn split_label(line: &str) -> Option<(Field, &str)> {
    let stripped = line
        .trim()
        .trim_start_matches(['-', '*', '>', '#', ' '])
        .trim_start();
    let colon = stripped.find(':')?;
    let label = stripped[..colon].trim().trim_matches('*').trim();
    let field = FIELDS
        .iter()
        .find(|(name, _)| label.eq_ignore_ascii_case(name))
        .map(|(_, field)| *field)?;
    let value = stripped[colon + 1..]
        .trim_start_matches('*')
        .trim();
    Some((field, value))
}

/// Build the failure-context prompt for the decision collaborator.
pub fn build_decision_prompt(
    definition: &WorkflowDefinition,
    step_index: usize,
    error: &str,
    run: &WorkflowRun,
) -> String {
    let step = &definition.steps[step_index];
    let agent = run
        .agent_overrides
        .get(&step.id)
        .map(String::as_str)
        .unwrap_or(step.agent.as_str());

    let mut prompt = String::new();
    prompt.push_str(&format!(
        "A step in the workflow '{}' failed and you must choose how to recover.\n\n",
        definition.display_name()
    ));
    prompt.push_str(&format!("## Task\n{}\n\n", run.task));
    prompt.push_str(&format!(
        "## Failed step\n- id: {}\n- agent: {}\n- attempt: {}\n- error: {}\n\n",
        step.id,
        agent,
        run.loop_count(&step.id),
        error
    ));

    prompt.push_str("## Steps\n");
    for (idx, candidate) in definition.steps.iter().enumerate() {
        let marker = if idx == step_index { " <- failed" } else { "" };
        match candidate.expects.as_deref() {
            Some(expects) => prompt.push_str(&format!(
                "{}. {} (agent: {}, expects: {}){}\n",
                idx + 1,
                candidate.id,
                candidate.agent,
                expects,
                marker
            )),
            None => prompt.push_str(&format!(
                "{}. {} (agent: {}){}\n",
                idx + 1,
                candidate.id,
                candidate.agent,
                marker
            )),
        }
    }
    prompt.push('\n');

    if !run.feedback_history.is_empty() {
        prompt.push_str("## Previous recovery attempts\n");
        for record in &run.feedback_history {
            prompt.push_str(&format!(
                "- {} (loop {}, {}): {}\n",
                record.step_id, record.loop_number, record.action, record.feedback
            ));
        }
        prompt.push('\n');
    }

    prompt.push_str(
        "## Reply format\n\
         Answer with these lines and nothing else:\n\
         ACTION: RETRY | LOOP_BACK | STOP\n\
         TO_STEP: <step id to jump back to, required for LOOP_BACK>\n\
         FEEDBACK: <concrete guidance for the next attempt>\n\
         REASONING: <one or two sentences>\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_reply() {
        let reply = "ACTION: LOOP_BACK\nTO_STEP: implement\nFEEDBACK: add tests\nREASONING: the code is untested";
        let decision = parse_decision(reply).unwrap();
        assert_eq!(decision.action, DecisionAction::LoopBack);
        assert_eq!(decision.to_step.as_deref(), Some("implement"));
        assert_eq!(decision.feedback.as_deref(), Some("add tests"));
        assert_eq!(decision.reasoning.as_deref(), Some("the code is untested"));
    }

    #[test]
    fn test_parse_markdown_and_case_variants() {
        let reply = "Here is my call.\n\n- **Action:** loop-back\n- **To_Step:** `plan`\n* feedback: Rework the plan.\n  Split step 3 in two.\n";
        let decision = parse_decision(reply).unwrap();
        assert_eq!(decision.action, DecisionAction::LoopBack);
        assert_eq!(decision.to_step.as_deref(), Some("plan"));
        assert_eq!(
            decision.feedback.as_deref(),
            Some("Rework the plan.\n  Split step 3 in two.")
        );
        assert!(decision.reasoning.is_none());
    }

    #[test]
    fn test_parse_retry_and_stop() {
        assert_eq!(
            parse_decision("action: retry").unwrap().action,
            DecisionAction::Retry
        );
        assert_eq!(
            parse_decision("ACTION: STOP - nothing more to do").unwrap().action,
            DecisionAction::Stop
        );
        assert_eq!(
            parse_decision("ACTION: LoopBack\nTO_STEP: a").unwrap().action,
            DecisionAction::LoopBack
        );
    }

    #[test]
    fn test_parse_spaced_loop_back() {
        let decision =
            parse_decision("ACTION: LOOP BACK\nTO STEP: implement\nFEEDBACK: add tests").unwrap();
        assert_eq!(decision.action, DecisionAction::LoopBack);
        assert_eq!(decision.to_step.as_deref(), Some("implement"));
        assert_eq!(
            parse_decision("ACTION: Retry please, the draft is close")
                .unwrap()
                .action,
            DecisionAction::Retry
        );
    }

    #[test]
    fn test_malformed_replies_yield_none() {
        assert!(parse_decision("").is_none());
        assert!(parse_decision("I think you should retry.").is_none());
        assert!(parse_decision("ACTION: PANIC").is_none());
        assert!(parse_decision("FEEDBACK: try harder").is_none());
    }

    #[test]
    fn test_prompt_lists_steps_and_grammar() {
        let yaml = r#"
id: flow
agents:
  - id: coder
  - id: reviewer
steps:
  - id: implement
    agent: coder
  - id: verify
    agent: reviewer
    expects: "VERIFIED"
"#;
        let definition = WorkflowDefinition::from_yaml(yaml).unwrap();
        let mut run = WorkflowRun::new("flow".to_string(), "Ship it".to_string());
        run.loop_counts.insert("verify".to_string(), 1);
        let prompt = build_decision_prompt(&definition, 1, "expectation not met", &run);
        assert!(prompt.contains("Ship it"));
        assert!(prompt.contains("- id: verify"));
        assert!(prompt.contains("- attempt: 1"));
        assert!(prompt.contains("verify (agent: reviewer, expects: VERIFIED) <- failed"));
        assert!(prompt.contains("ACTION: RETRY | LOOP_BACK | STOP"));
        assert!(!prompt.contains("Previous recovery attempts"));
    }
}
