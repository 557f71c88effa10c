//! `flowgate status|list|resume|stop|archive|unarchive|delete` — manage
//! stored runs.

use flowgate_core::models::{RunListFilter, StepStatus};
use flowgate_core::workflow::{RunOutcome, WorkflowService};
use serde::Serialize;

use super::{print_json, truncate};

/// One line of `flowgate list --json`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: String,
    pub definition_id: String,
    pub status: String,
    pub current_step: Option<String>,
    pub archived: bool,
    pub updated_at: String,
}

pub async fn status(service: &WorkflowService, run_id: &str, json: bool) -> Result<(), String> {
    let outcome = service.status(run_id).await.map_err(|e| e.to_string())?;
    if json {
        print_json(&serde_json::to_value(&outcome).map_err(|e| e.to_string())?);
    } else {
        print_outcome(&outcome);
    }
    Ok(())
}

pub async fn list(
    service: &WorkflowService,
    include_archived: bool,
    definition_id: Option<String>,
    json: bool,
) -> Result<(), String> {
    let summaries = summaries(service, include_archived, definition_id).await?;

    if json {
        print_json(&serde_json::to_value(&summaries).map_err(|e| e.to_string())?);
        return Ok(());
    }
    if summaries.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<10}  {:<16}  UPDATED",
        "ID", "WORKFLOW", "STATUS", "CURSOR"
    );
    for run in &summaries {
        println!(
            "{:<36}  {:<20}  {:<10}  {:<16}  {}{}",
            run.id,
            truncate(&run.definition_id, 20),
            run.status,
            truncate(run.current_step.as_deref().unwrap_or("-"), 16),
            run.updated_at,
            if run.archived { "  (archived)" } else { "" }
        );
    }
    Ok(())
}

/// Runs matching the filter, newest first.
pub async fn summaries(
    service: &WorkflowService,
    include_archived: bool,
    definition_id: Option<String>,
) -> Result<Vec<RunSummary>, String> {
    let runs = service
        .list(RunListFilter {
            include_archived,
            definition_id,
        })
        .await
        .map_err(|e| e.to_string())?;

    Ok(runs
        .into_iter()
        .map(|run| RunSummary {
            id: run.id,
            definition_id: run.definition_id,
            status: run.status.to_string(),
            current_step: run.current_step,
            archived: run.archived,
            updated_at: run.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        })
        .collect())
}

pub async fn resume(service: &WorkflowService, run_id: &str, json: bool) -> Result<(), String> {
    let outcome = service.resume(run_id).await.map_err(|e| e.to_string())?;
    if json {
        print_json(&serde_json::to_value(&outcome).map_err(|e| e.to_string())?);
    } else {
        print_outcome(&outcome);
    }

    if outcome.succeeded() {
        Ok(())
    } else {
        Err(format!(
            "Run {} failed: {}",
            outcome.run.id,
            outcome.run.last_error.as_deref().unwrap_or("unknown error")
        ))
    }
}

pub async fn stop(service: &WorkflowService, run_id: &str) -> Result<(), String> {
    service.stop(run_id).await.map_err(|e| e.to_string())?;
    println!("⏹  Stop requested for run {}", run_id);
    Ok(())
}

pub async fn archive(service: &WorkflowService, run_id: &str) -> Result<(), String> {
    service.archive(run_id).await.map_err(|e| e.to_string())?;
    println!("Archived run {}", run_id);
    Ok(())
}

pub async fn unarchive(service: &WorkflowService, run_id: &str) -> Result<(), String> {
    service.unarchive(run_id).await.map_err(|e| e.to_string())?;
    println!("Unarchived run {}", run_id);
    Ok(())
}

pub async fn delete(service: &WorkflowService, run_id: &str) -> Result<(), String> {
    service.delete(run_id).await.map_err(|e| e.to_string())?;
    println!("🗑  Deleted run {}", run_id);
    Ok(())
}

/// Human-readable run report shared by `run`, `resume` and `status`.
pub fn print_outcome(outcome: &RunOutcome) {
    let run = &outcome.run;
    println!("Run {} ({})", run.id, run.definition_id);
    println!("   Status: {}", run.status);
    if let Some(step) = &run.current_step {
        println!("   Cursor: {}", step);
    }
    if let Some(error) = &run.last_error {
        println!("   Last error: {}", error);
    }

    if !outcome.steps.is_empty() {
        println!();
        println!("   Steps:");
        for step in &outcome.steps {
            let icon = match step.status {
                StepStatus::Completed => "✅",
                StepStatus::Failed => "❌",
                StepStatus::Running => "⏳",
                StepStatus::Pending => "·",
            };
            println!(
                "   {} {} (attempt {}){}",
                icon,
                step.step_id,
                step.attempt,
                step.error
                    .as_deref()
                    .map(|e| format!(": {}", truncate(e, 80)))
                    .unwrap_or_default()
            );
        }
    }

    if !run.feedback_history.is_empty() {
        println!();
        println!("   Recovery history:");
        for record in &run.feedback_history {
            println!(
                "   - {} loop {}: {}",
                record.step_id, record.loop_number, record.action
            );
        }
    }
}
