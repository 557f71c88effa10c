//! Step input templates.
//!
//! Two placeholder spellings are accepted and normalized to one token form
//! before lookup:
//!
//! - `{name}`: single braces, identifier-like names only
//! - `{{ name }}`: double braces, whitespace allowed inside
//!
//! Both support dotted names (`{{step_outputs.plan}}`). A placeholder is
//! never passed through to agent input: it either resolves, resolves to an
//! explicit `[unresolved: ...]` marker in lenient mode, or fails.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::error::EngineError;
use crate::models::WorkflowRun;

/// Suffix of the context key that carries retry feedback for a step.
pub const FEEDBACK_SUFFIX: &str = "_feedback";
/// Suffix of the context key that carries loop-back feedback for a step.
pub const LOOPBACK_FEEDBACK_SUFFIX: &str = "_loopback_feedback";

pub fn feedback_key(step_id: &str) -> String {
    format!("{}{}", step_id, FEEDBACK_SUFFIX)
}

pub fn loopback_feedback_key(step_id: &str) -> String {
    format!("{}{}", step_id, LOOPBACK_FEEDBACK_SUFFIX)
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Double braces come first so `{{x}}` is never read as `{` + `{x}` + `}`.
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}|\{([A-Za-z0-9_.\-]+)\}")
            .expect("placeholder regex is valid")
    })
}

/// A placeholder after normalization, independent of its bracket spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// The run's task description.
    Task,
    /// A key in the run context (step outputs are stored under their step id).
    Context(String),
}

impl Token {
    pub fn parse(name: &str) -> Self {
        match name {
            "task" | "task_description" | "input" => return Self::Task,
            _ => {}
        }

        for prefix in ["step_outputs.", "steps.", "outputs.", "context."] {
            if let Some(rest) = name.strip_prefix(prefix) {
                let key = rest.strip_suffix(".output").unwrap_or(rest);
                return Self::Context(key.to_string());
            }
        }

        Self::Context(name.to_string())
    }

    fn is_optional(&self) -> bool {
        match self {
            Self::Task => false,
            Self::Context(key) => key.ends_with(FEEDBACK_SUFFIX),
        }
    }
}

/// Names of every placeholder in `template`, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    placeholder_re()
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Substitute every placeholder using `lookup`. The first placeholder that
/// `lookup` cannot resolve is returned as the error.
pub fn render_with<F>(template: &str, mut lookup: F) -> Result<String, String>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut missing: Option<String> = None;
    let rendered = placeholder_re().replace_all(template, |caps: &Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        match lookup(name) {
            Some(value) => value,
            None => {
                if missing.is_none() {
                    missing = Some(name.to_string());
                }
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(name),
        None => Ok(rendered.into_owned()),
    }
}

/// Resolves step input templates against a run.
#[derive(Debug, Clone, Copy)]
pub struct TemplateResolver {
    strict: bool,
}

impl Default for TemplateResolver {
    fn default() -> Self {
        Self::strict()
    }
}

impl TemplateResolver {
    /// Unresolved placeholders are an error.
    pub fn strict() -> Self {
        Self { strict: true }
    }

    /// Unresolved placeholders become `[unresolved: name]` markers.
    pub fn lenient() -> Self {
        Self { strict: false }
    }

    /// Resolve `template` for `step_id` using the run's task and context.
    pub fn resolve(
        &self,
        step_id: &str,
        template: &str,
        run: &WorkflowRun,
    ) -> Result<String, EngineError> {
        let mut unresolved = Vec::new();
        let rendered = placeholder_re().replace_all(template, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let token = Token::parse(name);
            match lookup(&token, run) {
                Some(value) => value,
                None if token.is_optional() => String::new(),
                None => {
                    unresolved.push(name.to_string());
                    format!("[unresolved: {}]", name)
                }
            }
        });

        if unresolved.is_empty() {
            return Ok(rendered.into_owned());
        }

        if self.strict {
            return Err(EngineError::template(
                step_id,
                format!("unresolved placeholder(s): {}", unresolved.join(", ")),
            ));
        }

        tracing::warn!(
            "[Template] Step '{}' has unresolved placeholder(s): {}",
            step_id,
            unresolved.join(", ")
        );
        Ok(rendered.into_owned())
    }
}

fn lookup(token: &Token, run: &WorkflowRun) -> Option<String> {
    match token {
        Token::Task => Some(run.task.clone()),
        Token::Context(key) => run.context.get(key).cloned(),
    }
}
