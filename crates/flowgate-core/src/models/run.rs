use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recovery decision, appended once per failed step attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub step_id: String,
    pub loop_number: u32,
    pub action: String,
    pub feedback: String,
    pub created_at: DateTime<Utc>,
}

/// A single execution of a workflow definition against a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub definition_id: String,
    pub task: String,
    pub status: RunStatus,
    /// Step outputs (keyed by step id) and injected feedback.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default)]
    pub loop_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub feedback_history: Vec<FeedbackRecord>,
    /// Step id the runner executes next. `None` once the run completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// step id -> agent id, written by escalation.
    #[serde(default)]
    pub agent_overrides: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(definition_id: String, task: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            definition_id,
            task,
            status: RunStatus::Pending,
            context: BTreeMap::new(),
            loop_counts: BTreeMap::new(),
            feedback_history: Vec::new(),
            current_step: None,
            agent_overrides: BTreeMap::new(),
            last_error: None,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn loop_count(&self, step_id: &str) -> u32 {
        self.loop_counts.get(step_id).copied().unwrap_or(0)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Filter for listing runs.
#[derive(Debug, Clone, Default)]
pub struct RunListFilter {
    pub include_archived: bool,
    pub definition_id: Option<String>,
}
