//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flowgate_core::store::RunStore;
use flowgate_core::workflow::{
    AgentBackend, AgentRequest, DecisionMaker, WorkflowDefinition, WorkflowRunner,
};
use flowgate_core::{BackendError, Database, EngineConfig};

/// One scripted answer for a step attempt.
#[derive(Debug, Clone)]
pub enum Reply {
    Output(String),
    Error(BackendError),
    /// Sleep longer than any test timeout.
    Hang,
}

pub fn out(text: &str) -> Reply {
    Reply::Output(text.to_string())
}

#[derive(Debug, Clone)]
pub struct Call {
    pub step_id: String,
    pub agent: String,
    pub input: String,
}

/// Replies per step id, consumed in order. The last reply of a step repeats
/// once the queue is down to one entry.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, step_id: &str, replies: Vec<Reply>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert(step_id.to_string(), replies.into());
        self
    }

    /// Replace the script for a step (used between a run and its resume).
    pub fn replace(&self, step_id: &str, reply: Reply) {
        let mut replies = self.replies.lock().unwrap();
        let queue = replies.entry(step_id.to_string()).or_default();
        queue.clear();
        queue.push_back(reply);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn steps_called(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.step_id).collect()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn execute(&self, request: AgentRequest<'_>) -> Result<String, BackendError> {
        self.calls.lock().unwrap().push(Call {
            step_id: request.step_id.to_string(),
            agent: request.agent.id.clone(),
            input: request.input.to_string(),
        });

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            let queue = replies
                .get_mut(request.step_id)
                .unwrap_or_else(|| panic!("no script for step '{}'", request.step_id));
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap()
            }
        };

        match reply {
            Reply::Output(text) => Ok(text),
            Reply::Error(e) => Err(e),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok("too late".to_string())
            }
        }
    }
}

/// Decision maker that returns canned replies and records the prompts.
#[derive(Default)]
pub struct ScriptedDecider {
    replies: Mutex<VecDeque<Result<String, BackendError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedDecider {
    pub fn new(replies: Vec<Result<String, BackendError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl DecisionMaker for ScriptedDecider {
    async fn decide(&self, prompt: &str) -> Result<String, BackendError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Http("no scripted decision".to_string())))
    }
}

pub fn definition(yaml: &str) -> Arc<WorkflowDefinition> {
    Arc::new(WorkflowDefinition::from_yaml(yaml).expect("test workflow is valid"))
}

pub fn store() -> RunStore {
    RunStore::new(Database::open_in_memory().expect("in-memory database"))
}

pub fn runner(
    store: &RunStore,
    backend: Arc<dyn AgentBackend>,
    decider: Option<Arc<dyn DecisionMaker>>,
    config: EngineConfig,
) -> WorkflowRunner {
    WorkflowRunner::new(store.clone(), backend, decider, config)
}
