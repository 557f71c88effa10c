//! HTTP agent backend: calls a language-model API directly.
//!
//! Two wire formats are supported:
//! - `anthropic`: the Messages API (`POST {base}/v1/messages`), also served by
//!   several Anthropic-compatible gateways
//! - `openai`: chat completions (`POST {base}/chat/completions`)
//!
//! The agent persona (`role` + `prompt`) becomes the system prompt and the
//! resolved step input becomes the single user message.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::workflow::backend::{AgentBackend, AgentRequest, DecisionMaker};

const DECISION_SYSTEM_PROMPT: &str =
    "You supervise a multi-step workflow. Decide how to recover from a failed step.";

/// Wire format spoken by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Adapter {
    Anthropic,
    OpenAi,
}

impl Adapter {
    pub fn from_str(s: &str) -> Result<Self, BackendError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" | "claude-code-sdk" => Ok(Self::Anthropic),
            "openai" | "opencode" | "opencode-sdk" => Ok(Self::OpenAi),
            other => Err(BackendError::Config(format!(
                "Unknown adapter type: '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }
}

/// Connection settings for the HTTP backend.
#[derive(Debug, Clone)]
pub struct AgentCallConfig {
    pub adapter: Adapter,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    /// Transport-level timeout. The runner applies its own per-step timeout
    /// on top of this.
    pub request_timeout: Duration,
}

impl Default for AgentCallConfig {
    fn default() -> Self {
        Self {
            adapter: Adapter::Anthropic,
            base_url: "https://api.anthropic.com".to_string(),
            api_key: String::new(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 8192,
            temperature: None,
            request_timeout: Duration::from_secs(600),
        }
    }
}

impl AgentCallConfig {
    /// Read settings from the environment.
    ///
    /// - `FLOWGATE_ADAPTER`: `anthropic` (default) or `openai`
    /// - `ANTHROPIC_BASE_URL` / `OPENAI_BASE_URL`
    /// - `ANTHROPIC_AUTH_TOKEN`, `ANTHROPIC_API_KEY` / `OPENAI_API_KEY`
    /// - `FLOWGATE_MODEL`
    ///
    /// Values may reference other variables with `${VAR}` or `${VAR:-default}`.
    pub fn from_env() -> Result<Self, BackendError> {
        let mut config = Self::default();
        if let Some(adapter) = env_value("FLOWGATE_ADAPTER") {
            config.adapter = Adapter::from_str(&adapter)?;
        }

        match config.adapter {
            Adapter::Anthropic => {
                if let Some(url) = env_value("ANTHROPIC_BASE_URL") {
                    config.base_url = url;
                }
                config.api_key = env_value("ANTHROPIC_AUTH_TOKEN")
                    .or_else(|| env_value("ANTHROPIC_API_KEY"))
                    .unwrap_or_default();
            }
            Adapter::OpenAi => {
                config.base_url = env_value("OPENAI_BASE_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
                config.api_key = env_value("OPENAI_API_KEY").unwrap_or_default();
                config.model = "gpt-4o".to_string();
            }
        }

        if let Some(model) = env_value("FLOWGATE_MODEL") {
            config.model = model;
        }
        if config.api_key.is_empty() {
            return Err(BackendError::Config(format!(
                "no API key configured for the '{}' adapter",
                config.adapter.as_str()
            )));
        }
        Ok(config)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| resolve_env_vars(&value))
        .filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageInfo {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// Text and usage extracted from one API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub usage: Option<UsageInfo>,
}

/// Calls the configured API for both step execution and recovery decisions.
pub struct HttpAgentBackend {
    client: reqwest::Client,
    config: AgentCallConfig,
}

impl HttpAgentBackend {
    pub fn new(config: AgentCallConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &AgentCallConfig {
        &self.config
    }

    /// Send one system + user exchange and return the reply text.
    pub async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<CompletionResponse, BackendError> {
        match self.config.adapter {
            Adapter::Anthropic => self.call_anthropic(system_prompt, user_prompt).await,
            Adapter::OpenAi => self.call_openai(system_prompt, user_prompt).await,
        }
    }

    /// POST {base_url}/v1/messages
    async fn call_anthropic(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<CompletionResponse, BackendError> {
        let config = &self.config;
        let url = format!("{}/v1/messages", config.base_url.trim_end_matches('/'));

        let mut body = serde_json::json!({
            "model": config.model,
            "max_tokens": config.max_tokens,
            "messages": [
                {
                    "role": "user",
                    "content": user_prompt
                }
            ]
        });
        if !system_prompt.is_empty() {
            body["system"] = serde_json::Value::String(system_prompt.to_string());
        }
        if let Some(temp) = config.temperature {
            body["temperature"] = serde_json::json!(temp);
        }

        tracing::debug!(
            "[AgentCaller] Calling Anthropic API: {} (model: {})",
            url,
            config.model
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;
        let json = read_json(response).await?;

        let content = json
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .ok_or_else(|| BackendError::Parse("response has no content blocks".to_string()))?;

        let usage = json.get("usage").map(|u| UsageInfo {
            input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()),
            output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()),
        });

        Ok(CompletionResponse {
            content,
            model: response_model(&json, &config.model),
            usage,
        })
    }

    /// POST {base_url}/chat/completions
    async fn call_openai(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<CompletionResponse, BackendError> {
        let config = &self.config;
        let url = format!(
            "{}/chat/completions",
            config.base_url.trim_end_matches('/')
        );

        let mut messages = vec![];
        if !system_prompt.is_empty() {
            messages.push(serde_json::json!({
                "role": "system",
                "content": system_prompt
            }));
        }
        messages.push(serde_json::json!({
            "role": "user",
            "content": user_prompt
        }));

        let mut body = serde_json::json!({
            "model": config.model,
            "messages": messages
        });
        if let Some(temp) = config.temperature {
            body["temperature"] = serde_json::json!(temp);
        }

        tracing::debug!(
            "[AgentCaller] Calling OpenAI-compatible API: {} (model: {})",
            url,
            config.model
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", config.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;
        let json = read_json(response).await?;

        let content = json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| BackendError::Parse("response has no message content".to_string()))?;

        let usage = json.get("usage").map(|u| UsageInfo {
            input_tokens: u
                .get("prompt_tokens")
                .or_else(|| u.get("input_tokens"))
                .and_then(|v| v.as_u64()),
            output_tokens: u
                .get("completion_tokens")
                .or_else(|| u.get("output_tokens"))
                .and_then(|v| v.as_u64()),
        });

        Ok(CompletionResponse {
            content,
            model: response_model(&json, &config.model),
            usage,
        })
    }
}

async fn read_json(response: reqwest::Response) -> Result<serde_json::Value, BackendError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| BackendError::Http(format!("Failed to read response body: {}", e)))?;
    if !status.is_success() {
        return Err(BackendError::Status {
            status: status.as_u16(),
            body: text,
        });
    }
    serde_json::from_str(&text).map_err(|e| BackendError::Parse(e.to_string()))
}

fn response_model(json: &serde_json::Value, fallback: &str) -> String {
    json.get("model")
        .and_then(|m| m.as_str())
        .unwrap_or(fallback)
        .to_string()
}

/// System prompt for an agent persona.
pub fn persona_prompt(role: &str, prompt: &str) -> String {
    match (role.trim(), prompt.trim()) {
        ("", "") => String::new(),
        (role, "") => format!("You are the {}.", role),
        ("", prompt) => prompt.to_string(),
        (role, prompt) => format!("You are the {}.\n\n{}", role, prompt),
    }
}

#[async_trait]
impl AgentBackend for HttpAgentBackend {
    async fn execute(&self, request: AgentRequest<'_>) -> Result<String, BackendError> {
        let system = persona_prompt(&request.agent.role, &request.agent.prompt);
        let response = self.complete(&system, request.input).await?;
        if let Some(usage) = &response.usage {
            tracing::info!(
                "[AgentCaller] Step '{}' answered by {} ({} in / {} out tokens)",
                request.step_id,
                response.model,
                usage.input_tokens.unwrap_or(0),
                usage.output_tokens.unwrap_or(0)
            );
        }
        Ok(response.content)
    }
}

#[async_trait]
impl DecisionMaker for HttpAgentBackend {
    async fn decide(&self, prompt: &str) -> Result<String, BackendError> {
        Ok(self.complete(DECISION_SYSTEM_PROMPT, prompt).await?.content)
    }
}

fn env_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("env reference regex is valid"))
}

/// Resolve environment variable references in a string.
/// Supports `${ENV_VAR}` and `${ENV_VAR:-default}` syntax.
pub fn resolve_env_vars(input: &str) -> String {
    env_ref_re()
        .replace_all(input, |caps: &regex::Captures| {
            let var_expr = &caps[1];
            if let Some((var_name, default_val)) = var_expr.split_once(":-") {
                std::env::var(var_name).unwrap_or_else(|_| default_val.to_string())
            } else {
                std::env::var(var_expr).unwrap_or_else(|_| format!("${{{}}}", var_expr))
            }
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("FLOWGATE_TEST_WORKFLOW_VAR", "hello");
        assert_eq!(resolve_env_vars("${FLOWGATE_TEST_WORKFLOW_VAR}"), "hello");
        assert_eq!(
            resolve_env_vars("prefix-${FLOWGATE_TEST_WORKFLOW_VAR}-suffix"),
            "prefix-hello-suffix"
        );
        assert_eq!(
            resolve_env_vars("${FLOWGATE_NONEXISTENT_VAR:-fallback}"),
            "fallback"
        );
        assert_eq!(
            resolve_env_vars("${FLOWGATE_NONEXISTENT_VAR}"),
            "${FLOWGATE_NONEXISTENT_VAR}"
        );
        std::env::remove_var("FLOWGATE_TEST_WORKFLOW_VAR");
    }

    #[test]
    fn test_adapter_names() {
        assert_eq!(Adapter::from_str("Anthropic").unwrap(), Adapter::Anthropic);
        assert_eq!(Adapter::from_str("openai").unwrap(), Adapter::OpenAi);
        assert_eq!(Adapter::from_str("opencode-sdk").unwrap(), Adapter::OpenAi);
        assert!(matches!(
            Adapter::from_str("carrier-pigeon"),
            Err(BackendError::Config(_))
        ));
    }

    #[test]
    fn test_persona_prompt() {
        assert_eq!(persona_prompt("", ""), "");
        assert_eq!(persona_prompt("Planner", ""), "You are the Planner.");
        assert_eq!(persona_prompt("", "Plan well."), "Plan well.");
        assert_eq!(
            persona_prompt("Planner", "Plan well."),
            "You are the Planner.\n\nPlan well."
        );
    }
}
