//! YAML schema types for workflow definitions.
//!
//! A workflow YAML declares the agents and the ordered steps that use them:
//!
//! ```yaml
//! id: "feature-flow"
//! name: "Feature Flow"
//!
//! agents:
//!   - id: planner
//!     role: "Planner"
//!     prompt: "Break the task into an implementation plan."
//!   - id: coder
//!     role: "Implementor"
//!     prompt: "Write the code described by the plan."
//!
//! steps:
//!   - id: plan
//!     agent: planner
//!     input: "{{task}}"
//!     expects: "PLAN"
//!
//!   - id: implement
//!     agent: coder
//!     input: |
//!       Plan:
//!       {{step_outputs.plan}}
//!     on_failure:
//!       action: retry
//!       max_loops: 2
//!       feedback_template: "Fix this: {{error}}"
//! ```
//!
//! The raw document (`WorkflowDocument`) is deserialized first and then
//! validated into a `WorkflowDefinition`, whose failure policies are a closed
//! enum. Anything invalid is rejected here, before a run starts.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;

/// Raw top-level document as it appears in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDocument {
    /// Workflow id (used to group runs)
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Role-specific agents available to the steps
    #[serde(default)]
    pub agents: Vec<AgentProfile>,

    /// Ordered list of workflow steps
    pub steps: Vec<StepDocument>,
}

/// An agent persona. Opaque to the engine; handed to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentProfile {
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub prompt: String,
}

/// A single step as it appears in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDocument {
    pub id: String,
    pub agent: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub expects: Option<String>,
    #[serde(default)]
    pub on_failure: Option<OnFailureDocument>,
    /// Per-step timeout override in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Free-form values passed through to the backend
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Failure action names accepted in YAML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureActionKind {
    Stop,
    Retry,
    LoopBack,
    Escalate,
    LlmDecide,
}

/// Raw `on_failure` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnFailureDocument {
    pub action: FailureActionKind,
    #[serde(default)]
    pub to_step: Option<String>,
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    #[serde(default)]
    pub feedback_template: Option<String>,
    #[serde(default)]
    pub escalate_to: Option<String>,
    #[serde(default)]
    pub use_llm_analysis: bool,
}

pub const DEFAULT_MAX_LOOPS: u32 = 2;

fn default_max_loops() -> u32 {
    DEFAULT_MAX_LOOPS
}

/// What the failure handler does when a step fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    Stop,
    Retry {
        max_loops: u32,
    },
    LoopBack {
        to_step: String,
        max_loops: u32,
    },
    Escalate {
        to_agent: String,
        to_step: Option<String>,
        max_loops: u32,
    },
    LlmDecide {
        max_loops: u32,
        fallback: Box<FailureAction>,
    },
}

impl FailureAction {
    pub fn max_loops(&self) -> u32 {
        match self {
            Self::Stop => 0,
            Self::Retry { max_loops }
            | Self::LoopBack { max_loops, .. }
            | Self::Escalate { max_loops, .. }
            | Self::LlmDecide { max_loops, .. } => *max_loops,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Retry { .. } => "retry",
            Self::LoopBack { .. } => "loop_back",
            Self::Escalate { .. } => "escalate",
            Self::LlmDecide { .. } => "llm_decide",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePolicy {
    pub action: FailureAction,
    pub feedback_template: Option<String>,
}

impl FailurePolicy {
    pub fn stop() -> Self {
        Self {
            action: FailureAction::Stop,
            feedback_template: None,
        }
    }
}

/// A validated step.
#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub id: String,
    pub agent: String,
    pub input: String,
    pub expects: Option<String>,
    pub on_failure: Option<FailurePolicy>,
    pub timeout_secs: Option<u64>,
    pub metadata: Map<String, Value>,
}

/// A validated, immutable workflow. Shared read-only by every run.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub agents: BTreeMap<String, AgentProfile>,
    pub steps: Vec<StepDefinition>,
    /// The YAML this definition was parsed from.
    pub source: String,
}

impl WorkflowDefinition {
    /// Parse and validate a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        let document: WorkflowDocument = serde_yaml::from_str(yaml).map_err(|e| {
            EngineError::definition(format!("Failed to parse workflow YAML: {}", e))
        })?;
        Self::from_document(document, yaml.to_string())
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::definition(format!("Failed to read workflow file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    fn from_document(document: WorkflowDocument, source: String) -> Result<Self, EngineError> {
        if document.id.trim().is_empty() {
            return Err(EngineError::definition("workflow id must not be empty"));
        }
        if document.steps.is_empty() {
            return Err(EngineError::definition(format!(
                "workflow '{}' has no steps",
                document.id
            )));
        }

        let mut agents = BTreeMap::new();
        for agent in document.agents {
            if agents.contains_key(&agent.id) {
                return Err(EngineError::definition(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }
            agents.insert(agent.id.clone(), agent);
        }

        let mut step_ids = HashSet::new();
        for step in &document.steps {
            if step.id.trim().is_empty() {
                return Err(EngineError::definition("step id must not be empty"));
            }
            if !step_ids.insert(step.id.as_str()) {
                return Err(EngineError::definition(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        let mut steps = Vec::with_capacity(document.steps.len());
        for step in &document.steps {
            if !agents.contains_key(&step.agent) {
                return Err(EngineError::definition(format!(
                    "step '{}' references unknown agent '{}'",
                    step.id, step.agent
                )));
            }
            let on_failure = step
                .on_failure
                .as_ref()
                .map(|raw| build_policy(&step.id, raw, &step_ids, &agents))
                .transpose()?;

            steps.push(StepDefinition {
                id: step.id.clone(),
                agent: step.agent.clone(),
                input: step.input.clone(),
                expects: step
                    .expects
                    .clone()
                    .filter(|expects| !expects.trim().is_empty()),
                on_failure,
                timeout_secs: step.timeout_secs,
                metadata: step.metadata.clone(),
            });
        }

        Ok(Self {
            id: document.id,
            name: document.name,
            description: document.description,
            agents,
            steps,
            source,
        })
    }

    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.id == step_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentProfile> {
        self.agents.get(agent_id)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

fn build_policy(
    step_id: &str,
    raw: &OnFailureDocument,
    step_ids: &HashSet<&str>,
    agents: &BTreeMap<String, AgentProfile>,
) -> Result<FailurePolicy, EngineError> {
    if let Some(target) = raw.to_step.as_deref() {
        if !step_ids.contains(target) {
            return Err(EngineError::definition(format!(
                "step '{}' on_failure.to_step references unknown step '{}'",
                step_id, target
            )));
        }
    }
    if let Some(agent) = raw.escalate_to.as_deref() {
        if !agents.contains_key(agent) {
            return Err(EngineError::definition(format!(
                "step '{}' on_failure.escalate_to references unknown agent '{}'",
                step_id, agent
            )));
        }
    }

    let max_loops = raw.max_loops;
    let action = match raw.action {
        FailureActionKind::Stop => FailureAction::Stop,
        FailureActionKind::Retry => FailureAction::Retry { max_loops },
        FailureActionKind::LoopBack => {
            let to_step = raw.to_step.clone().ok_or_else(|| {
                EngineError::definition(format!(
                    "step '{}' uses loop_back without to_step",
                    step_id
                ))
            })?;
            FailureAction::LoopBack { to_step, max_loops }
        }
        FailureActionKind::Escalate => {
            let to_agent = raw.escalate_to.clone().ok_or_else(|| {
                EngineError::definition(format!(
                    "step '{}' uses escalate without escalate_to",
                    step_id
                ))
            })?;
            FailureAction::Escalate {
                to_agent,
                to_step: raw.to_step.clone(),
                max_loops,
            }
        }
        FailureActionKind::LlmDecide => {
            let fallback = match raw.to_step.clone() {
                Some(to_step) => FailureAction::LoopBack { to_step, max_loops },
                None => FailureAction::Retry { max_loops },
            };
            FailureAction::LlmDecide {
                max_loops,
                fallback: Box::new(fallback),
            }
        }
    };

    let action = match action {
        FailureAction::Stop | FailureAction::LlmDecide { .. } => action,
        configured if raw.use_llm_analysis => FailureAction::LlmDecide {
            max_loops,
            fallback: Box::new(configured),
        },
        configured => configured,
    };

    Ok(FailurePolicy {
        action,
        feedback_template: raw.feedback_template.clone(),
    })
}
