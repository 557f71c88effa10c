use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
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
}

/// Latest attempt of one step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub attempt: u32,
    pub input: String,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepResult {
    /// A fresh attempt that is about to call the backend.
    pub fn started(step_id: &str, attempt: u32, input: String) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Running,
            attempt,
            input,
            output: String::new(),
            error: None,
            metadata: Map::new(),
            started_at: Some(Utc::now()),
            ended_at: None,
        }
    }

    pub fn complete(&mut self, output: String) {
        self.status = StepStatus::Completed;
        self.output = output;
        self.error = None;
        self.ended_at = Some(Utc::now());
    }

    pub fn fail(&mut self, output: String, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.output = output;
        self.error = Some(error.into());
        self.ended_at = Some(Utc::now());
    }
}
