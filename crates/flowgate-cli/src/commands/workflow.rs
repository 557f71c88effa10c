//! `flowgate run` / `flowgate validate` — load and execute workflow files.

use std::sync::Arc;

use flowgate_core::workflow::{FailureAction, WorkflowDefinition, WorkflowService};

use super::{print_json, runs};

/// Run a workflow file against a task and report the outcome.
pub async fn run(
    service: &WorkflowService,
    workflow_file: &str,
    task: &str,
    json: bool,
) -> Result<(), String> {
    let definition = WorkflowService::validate(workflow_file).map_err(|e| e.to_string())?;

    if !json {
        println!(
            "📄 Loaded workflow: {} ({})",
            definition.display_name(),
            workflow_file
        );
        println!("   {} step(s)", definition.steps.len());
        println!();
    }

    let outcome = service
        .start(Arc::new(definition), task)
        .await
        .map_err(|e| e.to_string())?;

    if json {
        print_json(&serde_json::to_value(&outcome).map_err(|e| e.to_string())?);
    } else {
        runs::print_outcome(&outcome);
    }

    if outcome.succeeded() {
        if !json {
            println!("\n🎉 Workflow completed successfully!");
        }
        Ok(())
    } else {
        Err(format!(
            "Run {} failed: {}",
            outcome.run.id,
            outcome.run.last_error.as_deref().unwrap_or("unknown error")
        ))
    }
}

/// Validate a workflow YAML file without executing it.
pub fn validate(workflow_file: &str) -> Result<(), String> {
    let workflow = WorkflowService::validate(workflow_file).map_err(|e| e.to_string())?;

    println!("✅ Workflow '{}' is valid", workflow.display_name());
    println!("   Id: {}", workflow.id);
    println!("   Agents: {}", workflow.agents.len());
    println!("   Steps: {}", workflow.steps.len());

    for (i, step) in workflow.steps.iter().enumerate() {
        println!(
            "   {}. {} (agent: {}, expects: {}, on failure: {})",
            i + 1,
            step.id,
            step.agent,
            step.expects.as_deref().unwrap_or("-"),
            describe_policy(&workflow, i)
        );
    }

    Ok(())
}

fn describe_policy(workflow: &WorkflowDefinition, index: usize) -> String {
    let Some(policy) = workflow.steps[index].on_failure.as_ref() else {
        return "stop".to_string();
    };
    match &policy.action {
        FailureAction::Stop => "stop".to_string(),
        FailureAction::Retry { max_loops } => format!("retry x{}", max_loops),
        FailureAction::LoopBack { to_step, max_loops } => {
            format!("loop back to {} x{}", to_step, max_loops)
        }
        FailureAction::Escalate {
            to_agent,
            max_loops,
            ..
        } => format!("escalate to {} x{}", to_agent, max_loops),
        FailureAction::LlmDecide { max_loops, .. } => format!("llm decide x{}", max_loops),
    }
}

/// Load .env and .env.local files for environment variables.
pub fn load_dotenv() {
    // .env.local first so its values win; existing env vars win over both.
    for filename in &[".env.local", ".env"] {
        let path = std::path::Path::new(filename);
        if !path.exists() {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        for (key, value) in parse_dotenv(&content) {
            if std::env::var(&key).is_err() {
                std::env::set_var(&key, &value);
            }
        }
        tracing::info!("[Workflow] Loaded environment from '{}'", filename);
    }
}

/// `KEY=VALUE` pairs from a dotenv file. Comments, blank lines and lines
/// without `=` are skipped; surrounding quotes are stripped.
pub fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some(eq_idx) = line.find('=') else {
            continue;
        };
        let key = line[..eq_idx].trim();
        if key.is_empty() {
            continue;
        }
        let mut value = line[eq_idx + 1..].trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        pairs.push((key.to_string(), value.to_string()));
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotenv() {
        let pairs = parse_dotenv(
            "# comment\n\nANTHROPIC_API_KEY=\"sk-test\"\nexport FLOWGATE_MODEL='m1'\nBROKEN\n",
        );
        assert_eq!(
            pairs,
            vec![
                ("ANTHROPIC_API_KEY".to_string(), "sk-test".to_string()),
                ("FLOWGATE_MODEL".to_string(), "m1".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_dotenv_keeps_inner_equals() {
        let pairs = parse_dotenv("URL=http://x?a=b");
        assert_eq!(pairs[0].1, "http://x?a=b");
    }
}
