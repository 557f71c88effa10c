use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings for the workflow runner.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default limit for one backend call. Steps may override it with
    /// `timeout_secs`.
    pub step_timeout: Duration,
    /// Upper bound on step executions per `run_all`/`resume` call.
    pub max_transitions: u32,
    /// Unresolved template placeholders fail the run instead of becoming
    /// `[unresolved: ...]` markers.
    pub strict_templates: bool,
    /// When set, extracted artifacts are written below `<dir>/<run id>/`.
    pub artifact_dir: Option<PathBuf>,
    /// Limit for one decision-maker call during `llm_decide` recovery.
    pub decision_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(300),
            max_transitions: 100,
            strict_templates: true,
            artifact_dir: None,
            decision_timeout: Duration::from_secs(120),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `FLOWGATE_STEP_TIMEOUT_SECS`,
    /// `FLOWGATE_MAX_TRANSITIONS`, `FLOWGATE_STRICT_TEMPLATES` and
    /// `FLOWGATE_ARTIFACT_DIR`. Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = parse_env::<u64>("FLOWGATE_STEP_TIMEOUT_SECS") {
            config.step_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = parse_env::<u32>("FLOWGATE_MAX_TRANSITIONS") {
            config.max_transitions = max;
        }
        if let Ok(raw) = std::env::var("FLOWGATE_STRICT_TEMPLATES") {
            match parse_bool(&raw) {
                Some(strict) => config.strict_templates = strict,
                None => tracing::warn!(
                    "[Config] Ignoring FLOWGATE_STRICT_TEMPLATES='{}' (expected true/false)",
                    raw
                ),
            }
        }
        if let Ok(dir) = std::env::var("FLOWGATE_ARTIFACT_DIR") {
            if !dir.trim().is_empty() {
                config.artifact_dir = Some(PathBuf::from(dir));
            }
        }

        config
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("[Config] Ignoring {}='{}' (not a number)", name, raw);
            None
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
