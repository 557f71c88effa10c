use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::OptionalExtension;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::{
    FeedbackRecord, RunListFilter, RunStatus, StepResult, StepStatus, WorkflowRun,
};
use crate::workflow::schema::WorkflowDefinition;

const RUN_COLUMNS: &str = "id, definition_id, task, status, context, loop_counts, agent_overrides, \
     current_step, last_error, archived, created_at, updated_at";

const STEP_COLUMNS: &str =
    "step_id, status, attempt, input, output, error, metadata, started_at, ended_at";

/// How long a lease survives without a heartbeat. Holders renew it every
/// third of this window, so only a crashed holder lets it lapse.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Persistence for definitions, runs, step results and feedback history.
#[derive(Clone)]
pub struct RunStore {
    db: Database,
    lease_ttl: Duration,
}

/// Exclusive right to drive one run, recorded on the run row so every
/// process sharing the database file sees it. Renewed in the background
/// while alive and released on drop.
pub struct RunLease {
    run_id: String,
    owner: String,
    db: Database,
    heartbeat: tokio::task::JoinHandle<()>,
}

impl Drop for RunLease {
    fn drop(&mut self) {
        self.heartbeat.abort();
        let run_id = self.run_id.clone();
        let owner = self.owner.clone();
        let released = self.db.with_conn(move |conn| {
            conn.execute(
                "UPDATE workflow_runs SET lease_owner = NULL, lease_expires_at = NULL \
                 WHERE id = ?1 AND lease_owner = ?2",
                rusqlite::params![run_id, owner],
            )
        });
        if let Err(e) = released {
            tracing::warn!("[RunStore] Failed to release lease on run {}: {}", self.run_id, e);
        }
    }
}

enum LeaseClaim {
    Acquired,
    Held,
    Missing,
}

impl RunStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Claim a run for execution. Fails with `Conflict` while a live lease
    /// from this or any other process holds the run, and with `NotFound`
    /// when the run does not exist. Leases whose heartbeat stopped longer
    /// than the TTL ago are taken over.
    pub async fn acquire_lease(&self, run_id: &str) -> Result<RunLease, EngineError> {
        let owner = Uuid::new_v4().to_string();
        let ttl_ms = self.lease_ttl.as_millis() as i64;
        let (id, claimant) = (run_id.to_string(), owner.clone());
        let claim = self
            .db
            .with_conn_async(move |conn| {
                let now = Utc::now().timestamp_millis();
                let n = conn.execute(
                    "UPDATE workflow_runs SET lease_owner = ?2, lease_expires_at = ?3 \
                     WHERE id = ?1 AND (lease_owner IS NULL OR lease_expires_at IS NULL \
                     OR lease_expires_at < ?4)",
                    rusqlite::params![id, claimant, now + ttl_ms, now],
                )?;
                if n > 0 {
                    return Ok(LeaseClaim::Acquired);
                }
                let exists = conn
                    .query_row(
                        "SELECT 1 FROM workflow_runs WHERE id = ?1",
                        rusqlite::params![id],
                        |_| Ok(()),
                    )
                    .optional()?;
                Ok(match exists {
                    Some(()) => LeaseClaim::Held,
                    None => LeaseClaim::Missing,
                })
            })
            .await?;

        match claim {
            LeaseClaim::Acquired => {}
            LeaseClaim::Held => {
                return Err(EngineError::Conflict(format!(
                    "run '{}' is already being executed",
                    run_id
                )))
            }
            LeaseClaim::Missing => {
                return Err(EngineError::NotFound(format!("run '{}'", run_id)))
            }
        }

        let heartbeat = tokio::spawn(renew_lease(
            self.db.clone(),
            run_id.to_string(),
            owner.clone(),
            self.lease_ttl,
        ));
        Ok(RunLease {
            run_id: run_id.to_string(),
            owner,
            db: self.db.clone(),
            heartbeat,
        })
    }

    // ── Definitions ────────────────────────────────────────────────────

    pub async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), EngineError> {
        let id = definition.id.clone();
        let source = definition.source.clone();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_definitions (id, source, updated_at) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(id) DO UPDATE SET source = excluded.source, updated_at = excluded.updated_at",
                    rusqlite::params![id, source, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn load_definition(&self, id: &str) -> Result<WorkflowDefinition, EngineError> {
        let key = id.to_string();
        let source: Option<String> = self
            .db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT source FROM workflow_definitions WHERE id = ?1",
                    rusqlite::params![key],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        let source =
            source.ok_or_else(|| EngineError::NotFound(format!("workflow definition '{}'", id)))?;
        WorkflowDefinition::from_yaml(&source)
    }

    /// The definition snapshot a run was started with. Later edits saved
    /// under the same definition id do not affect it.
    pub async fn load_run_definition(&self, run_id: &str) -> Result<WorkflowDefinition, EngineError> {
        let key = run_id.to_string();
        let row: Option<(String, String)> = self
            .db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT definition_id, definition_source FROM workflow_runs WHERE id = ?1",
                    rusqlite::params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
            })
            .await?;
        let (definition_id, source) =
            row.ok_or_else(|| EngineError::NotFound(format!("run '{}'", run_id)))?;
        if source.is_empty() {
            // Runs recorded before snapshots existed.
            tracing::warn!(
                "[RunStore] Run {} has no definition snapshot, using latest '{}'",
                run_id,
                definition_id
            );
            return self.load_definition(&definition_id).await;
        }
        WorkflowDefinition::from_yaml(&source)
    }

    // ── Runs ───────────────────────────────────────────────────────────

    /// Insert a new run together with a snapshot of its definition.
    pub async fn create_run(
        &self,
        run: &WorkflowRun,
        definition: &WorkflowDefinition,
    ) -> Result<(), EngineError> {
        let row = RunRow::from_run(run)?;
        let source = definition.source.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_runs (id, definition_id, definition_source, task, status, \
                     context, loop_counts, agent_overrides, current_step, last_error, archived, \
                     created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    rusqlite::params![
                        row.id,
                        row.definition_id,
                        source,
                        row.task,
                        row.status,
                        row.context,
                        row.loop_counts,
                        row.agent_overrides,
                        row.current_step,
                        row.last_error,
                        row.archived,
                        row.created_at,
                        row.updated_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Load a run together with its feedback history.
    pub async fn get(&self, id: &str) -> Result<Option<WorkflowRun>, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let run = conn
                    .query_row(
                        &format!("SELECT {} FROM workflow_runs WHERE id = ?1", RUN_COLUMNS),
                        rusqlite::params![id],
                        row_to_run,
                    )
                    .optional()?;
                let Some(mut run) = run else { return Ok(None) };

                let mut stmt = conn.prepare(
                    "SELECT step_id, loop_number, action, feedback, created_at \
                     FROM feedback_history WHERE run_id = ?1 ORDER BY id ASC",
                )?;
                run.feedback_history = stmt
                    .query_map(rusqlite::params![id], row_to_feedback)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(run))
            })
            .await
    }

    /// Persist the fields the runner owns. Feedback history is append-only
    /// and written through `record_recovery`; `archived`, the stop flag and
    /// the lease have their own writers and are never overwritten here.
    pub async fn save_run(&self, run: &WorkflowRun) -> Result<(), EngineError> {
        let row = RunRow::from_run(run)?;
        self.db
            .with_conn_async(move |conn| row.update(conn))
            .await
    }

    /// Persist a recovery decision: the run update and the new feedback
    /// record commit together or not at all.
    pub async fn record_recovery(
        &self,
        run: &WorkflowRun,
        record: &FeedbackRecord,
    ) -> Result<(), EngineError> {
        let row = RunRow::from_run(run)?;
        let record = record.clone();
        self.db
            .with_tx_async(move |tx| {
                row.update(tx)?;
                tx.execute(
                    "INSERT INTO feedback_history (run_id, step_id, loop_number, action, feedback, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        row.id,
                        record.step_id,
                        record.loop_number as i64,
                        record.action,
                        record.feedback,
                        record.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Runs newest first. Feedback history is not loaded; use `get` for that.
    pub async fn list(&self, filter: RunListFilter) -> Result<Vec<WorkflowRun>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut sql = format!("SELECT {} FROM workflow_runs WHERE 1 = 1", RUN_COLUMNS);
                let mut params: Vec<String> = Vec::new();
                if !filter.include_archived {
                    sql.push_str(" AND archived = 0");
                }
                if let Some(definition_id) = filter.definition_id {
                    params.push(definition_id);
                    sql.push_str(&format!(" AND definition_id = ?{}", params.len()));
                }
                sql.push_str(" ORDER BY created_at DESC, id ASC");

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), row_to_run)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn archive(&self, id: &str) -> Result<bool, EngineError> {
        self.set_archived(id, true).await
    }

    pub async fn unarchive(&self, id: &str) -> Result<bool, EngineError> {
        self.set_archived(id, false).await
    }

    async fn set_archived(&self, id: &str, archived: bool) -> Result<bool, EngineError> {
        let id = id.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE workflow_runs SET archived = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, archived as i64, now],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Permanently remove a run with its step results and feedback history.
    pub async fn delete(&self, id: &str) -> Result<bool, EngineError> {
        let id = id.to_string();
        self.db
            .with_tx_async(move |tx| {
                tx.execute(
                    "DELETE FROM step_results WHERE run_id = ?1",
                    rusqlite::params![id],
                )?;
                tx.execute(
                    "DELETE FROM feedback_history WHERE run_id = ?1",
                    rusqlite::params![id],
                )?;
                let n = tx.execute("DELETE FROM workflow_runs WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }

    // ── Cooperative stop ───────────────────────────────────────────────

    pub async fn request_stop(&self, id: &str) -> Result<bool, EngineError> {
        self.set_stop_requested(id, true).await
    }

    pub async fn clear_stop_request(&self, id: &str) -> Result<bool, EngineError> {
        self.set_stop_requested(id, false).await
    }

    async fn set_stop_requested(&self, id: &str, requested: bool) -> Result<bool, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE workflow_runs SET stop_requested = ?2 WHERE id = ?1",
                    rusqlite::params![id, requested as i64],
                )?;
                Ok(n > 0)
            })
            .await
    }

    pub async fn stop_requested(&self, id: &str) -> Result<bool, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let flag: Option<i64> = conn
                    .query_row(
                        "SELECT stop_requested FROM workflow_runs WHERE id = ?1",
                        rusqlite::params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(flag.unwrap_or(0) != 0)
            })
            .await
    }

    // ── Step results ───────────────────────────────────────────────────

    /// Insert or replace the latest result for `(run_id, step_id)`.
    pub async fn upsert_step_result(
        &self,
        run_id: &str,
        result: &StepResult,
    ) -> Result<(), EngineError> {
        let run_id = run_id.to_string();
        let r = result.clone();
        let metadata = to_json(&r.metadata)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO step_results (run_id, step_id, status, attempt, input, output, error, \
                     metadata, started_at, ended_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                     ON CONFLICT(run_id, step_id) DO UPDATE SET \
                     status = excluded.status, attempt = excluded.attempt, input = excluded.input, \
                     output = excluded.output, error = excluded.error, metadata = excluded.metadata, \
                     started_at = excluded.started_at, ended_at = excluded.ended_at",
                    rusqlite::params![
                        run_id,
                        r.step_id,
                        r.status.as_str(),
                        r.attempt as i64,
                        r.input,
                        r.output,
                        r.error,
                        metadata,
                        r.started_at.map(|t| t.timestamp_millis()),
                        r.ended_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn step_results(&self, run_id: &str) -> Result<Vec<StepResult>, EngineError> {
        let run_id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM step_results WHERE run_id = ?1 ORDER BY started_at ASC, step_id ASC",
                    STEP_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![run_id], row_to_step_result)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

/// Column values of one `workflow_runs` row, encoded outside the blocking
/// closure so JSON errors surface as engine errors.
struct RunRow {
    id: String,
    definition_id: String,
    task: String,
    status: &'static str,
    context: String,
    loop_counts: String,
    agent_overrides: String,
    current_step: Option<String>,
    last_error: Option<String>,
    archived: i64,
    created_at: i64,
    updated_at: i64,
}

impl RunRow {
    fn from_run(run: &WorkflowRun) -> Result<Self, EngineError> {
        Ok(Self {
            id: run.id.clone(),
            definition_id: run.definition_id.clone(),
            task: run.task.clone(),
            status: run.status.as_str(),
            context: to_json(&run.context)?,
            loop_counts: to_json(&run.loop_counts)?,
            agent_overrides: to_json(&run.agent_overrides)?,
            current_step: run.current_step.clone(),
            last_error: run.last_error.clone(),
            archived: run.archived as i64,
            created_at: run.created_at.timestamp_millis(),
            updated_at: run.updated_at.timestamp_millis(),
        })
    }

    fn update(&self, conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
        let n = conn.execute(
            "UPDATE workflow_runs SET status = ?2, context = ?3, loop_counts = ?4, agent_overrides = ?5, \
             current_step = ?6, last_error = ?7, updated_at = ?8 WHERE id = ?1",
            rusqlite::params![
                self.id,
                self.status,
                self.context,
                self.loop_counts,
                self.agent_overrides,
                self.current_step,
                self.last_error,
                self.updated_at,
            ],
        )?;
        if n == 0 {
            return Err(rusqlite::Error::QueryReturnedNoRows);
        }
        Ok(())
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, EngineError> {
    serde_json::to_string(value)
        .map_err(|e| EngineError::Internal(format!("Failed to encode JSON column: {}", e)))
}

/// Keep renewing a lease until the task is aborted or the lease is lost.
async fn renew_lease(db: Database, run_id: String, owner: String, ttl: Duration) {
    let ttl_ms = ttl.as_millis() as i64;
    let mut ticker = tokio::time::interval((ttl / 3).max(Duration::from_millis(10)));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let (id, holder) = (run_id.clone(), owner.clone());
        let renewed = db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workflow_runs SET lease_expires_at = ?3 WHERE id = ?1 AND lease_owner = ?2",
                    rusqlite::params![id, holder, Utc::now().timestamp_millis() + ttl_ms],
                )
            })
            .await;
        match renewed {
            Ok(0) => {
                tracing::warn!("[RunStore] Lease on run {} was lost", run_id);
                return;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("[RunStore] Failed to renew lease on run {}: {}", run_id, e),
        }
    }
}

fn conversion_error(idx: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, message.into())
}

fn json_column<T: DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

fn timestamp(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| conversion_error(idx, Type::Integer, format!("invalid timestamp {}", ms)))
}

fn timestamp_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    timestamp(idx, row.get(idx)?)
}

fn optional_timestamp_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|ms| timestamp(idx, ms))
        .transpose()
}

fn count_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let value: i64 = row.get(idx)?;
    u32::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowRun> {
    let status: String = row.get(3)?;
    let parsed = RunStatus::from_str(&status);
    if parsed.as_str() != status {
        return Err(conversion_error(
            3,
            Type::Text,
            format!("unknown run status '{}'", status),
        ));
    }

    Ok(WorkflowRun {
        id: row.get(0)?,
        definition_id: row.get(1)?,
        task: row.get(2)?,
        status: parsed,
        context: json_column::<BTreeMap<String, String>>(row, 4)?,
        loop_counts: json_column::<BTreeMap<String, u32>>(row, 5)?,
        feedback_history: Vec::new(),
        current_step: row.get(7)?,
        agent_overrides: json_column::<BTreeMap<String, String>>(row, 6)?,
        last_error: row.get(8)?,
        archived: row.get::<_, i64>(9)? != 0,
        created_at: timestamp_column(row, 10)?,
        updated_at: timestamp_column(row, 11)?,
    })
}

fn row_to_feedback(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeedbackRecord> {
    Ok(FeedbackRecord {
        step_id: row.get(0)?,
        loop_number: count_column(row, 1)?,
        action: row.get(2)?,
        feedback: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
    })
}

fn row_to_step_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepResult> {
    let status: String = row.get(1)?;
    let parsed = StepStatus::from_str(&status);
    if parsed.as_str() != status {
        return Err(conversion_error(
            1,
            Type::Text,
            format!("unknown step status '{}'", status),
        ));
    }

    Ok(StepResult {
        step_id: row.get(0)?,
        status: parsed,
        attempt: count_column(row, 2)?,
        input: row.get(3)?,
        output: row.get(4)?,
        error: row.get(5)?,
        metadata: json_column(row, 6)?,
        started_at: optional_timestamp_column(row, 7)?,
        ended_at: optional_timestamp_column(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOW: &str = r#"
id: store-flow
agents:
  - id: dev
steps:
  - id: build
    agent: dev
    input: "{{task}}"
"#;

    fn store() -> RunStore {
        RunStore::new(Database::open_in_memory().unwrap())
    }

    fn flow() -> WorkflowDefinition {
        WorkflowDefinition::from_yaml(FLOW).unwrap()
    }

    fn record(step_id: &str, loop_number: u32, action: &str) -> FeedbackRecord {
        FeedbackRecord {
            step_id: step_id.to_string(),
            loop_number,
            action: action.to_string(),
            feedback: format!("{} #{}", action, loop_number),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_definition_round_trip() {
        let store = store();
        let definition = WorkflowDefinition::from_yaml(FLOW).unwrap();
        store.save_definition(&definition).await.unwrap();
        store.save_definition(&definition).await.unwrap();

        let loaded = store.load_definition("store-flow").await.unwrap();
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.source, FLOW);
        assert!(matches!(
            store.load_definition("missing").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_fields_survive_save_and_reload() {
        let store = store();
        let mut run = WorkflowRun::new("store-flow".to_string(), "do it".to_string());
        store.create_run(&run, &flow()).await.unwrap();

        run.status = RunStatus::Running;
        run.context.insert("build".to_string(), "out".to_string());
        run.loop_counts.insert("build".to_string(), 2);
        run.agent_overrides.insert("build".to_string(), "senior".to_string());
        run.current_step = Some("build".to_string());
        run.last_error = Some("boom".to_string());
        store.save_run(&run).await.unwrap();

        let loaded = store.get(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.context["build"], "out");
        assert_eq!(loaded.loop_count("build"), 2);
        assert_eq!(loaded.agent_overrides["build"], "senior");
        assert_eq!(loaded.current_step.as_deref(), Some("build"));
        assert_eq!(loaded.last_error.as_deref(), Some("boom"));
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_run_for_unknown_id_fails() {
        let store = store();
        let run = WorkflowRun::new("store-flow".to_string(), "ghost".to_string());
        assert!(matches!(
            store.save_run(&run).await,
            Err(EngineError::Database(_))
        ));
    }

    #[tokio::test]
    async fn test_feedback_history_is_append_only_and_ordered() {
        let store = store();
        let mut run = WorkflowRun::new("store-flow".to_string(), "t".to_string());
        store.create_run(&run, &flow()).await.unwrap();

        for n in 1..=3 {
            run.loop_counts.insert("build".to_string(), n);
            let r = record("build", n, "retry");
            run.feedback_history.push(r.clone());
            store.record_recovery(&run, &r).await.unwrap();
        }

        let loaded = store.get(&run.id).await.unwrap().unwrap();
        let loops: Vec<u32> = loaded.feedback_history.iter().map(|r| r.loop_number).collect();
        assert_eq!(loops, vec![1, 2, 3]);
        assert_eq!(loaded.loop_count("build"), 3);
    }

    #[tokio::test]
    async fn test_step_results_latest_wins() {
        let store = store();
        let run = WorkflowRun::new("store-flow".to_string(), "t".to_string());
        store.create_run(&run, &flow()).await.unwrap();

        for attempt in 1..=4 {
            let mut result = StepResult::started("build", attempt, format!("input {}", attempt));
            if attempt < 4 {
                result.fail(format!("output {}", attempt), "not good enough");
            } else {
                result.complete("final".to_string());
            }
            store.upsert_step_result(&run.id, &result).await.unwrap();
        }

        let results = store.step_results(&run.id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].attempt, 4);
        assert_eq!(results[0].status, StepStatus::Completed);
        assert_eq!(results[0].output, "final");
        assert!(results[0].error.is_none());
    }

    #[tokio::test]
    async fn test_archive_unarchive_delete() {
        let store = store();
        let a = WorkflowRun::new("store-flow".to_string(), "a".to_string());
        let b = WorkflowRun::new("other-flow".to_string(), "b".to_string());
        store.create_run(&a, &flow()).await.unwrap();
        store.create_run(&b, &flow()).await.unwrap();
        store
            .upsert_step_result(&a.id, &StepResult::started("build", 1, String::new()))
            .await
            .unwrap();
        store.record_recovery(&a, &record("build", 1, "stop")).await.unwrap();

        assert!(store.archive(&a.id).await.unwrap());
        let visible = store.list(RunListFilter::default()).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, b.id);

        let all = store
            .list(RunListFilter {
                include_archived: true,
                definition_id: None,
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let by_definition = store
            .list(RunListFilter {
                include_archived: true,
                definition_id: Some("store-flow".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(by_definition.len(), 1);
        assert!(by_definition[0].archived);

        assert!(store.unarchive(&a.id).await.unwrap());
        assert_eq!(store.list(RunListFilter::default()).await.unwrap().len(), 2);

        assert!(store.delete(&a.id).await.unwrap());
        assert!(store.get(&a.id).await.unwrap().is_none());
        assert!(store.step_results(&a.id).await.unwrap().is_empty());
        assert!(!store.delete(&a.id).await.unwrap());
        assert!(!store.archive("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_flag() {
        let store = store();
        let run = WorkflowRun::new("store-flow".to_string(), "t".to_string());
        store.create_run(&run, &flow()).await.unwrap();

        assert!(!store.stop_requested(&run.id).await.unwrap());
        assert!(store.request_stop(&run.id).await.unwrap());
        assert!(store.stop_requested(&run.id).await.unwrap());

        // save_run never touches the flag
        store.save_run(&run).await.unwrap();
        assert!(store.stop_requested(&run.id).await.unwrap());

        assert!(store.clear_stop_request(&run.id).await.unwrap());
        assert!(!store.stop_requested(&run.id).await.unwrap());
        assert!(!store.request_stop("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_conflict_until_dropped() {
        let store = store();
        let run = WorkflowRun::new("store-flow".to_string(), "t".to_string());
        let other = WorkflowRun::new("store-flow".to_string(), "u".to_string());
        store.create_run(&run, &flow()).await.unwrap();
        store.create_run(&other, &flow()).await.unwrap();

        let lease = store.acquire_lease(&run.id).await.unwrap();
        assert!(matches!(
            store.clone().acquire_lease(&run.id).await,
            Err(EngineError::Conflict(_))
        ));
        assert!(store.acquire_lease(&other.id).await.is_ok());
        drop(lease);
        assert!(store.acquire_lease(&run.id).await.is_ok());
        assert!(matches!(
            store.acquire_lease("missing").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lease_is_shared_across_handles_on_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let path = path.to_str().unwrap();
        let first = RunStore::new(Database::open(path).unwrap());
        let second = RunStore::new(Database::open(path).unwrap());

        let run = WorkflowRun::new("store-flow".to_string(), "t".to_string());
        first.create_run(&run, &flow()).await.unwrap();

        let lease = first.acquire_lease(&run.id).await.unwrap();
        assert!(matches!(
            second.acquire_lease(&run.id).await,
            Err(EngineError::Conflict(_))
        ));
        drop(lease);
        assert!(second.acquire_lease(&run.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_live_lease_is_renewed_and_stale_lease_taken_over() {
        let store = store().with_lease_ttl(Duration::from_millis(90));
        let run = WorkflowRun::new("store-flow".to_string(), "t".to_string());
        store.create_run(&run, &flow()).await.unwrap();

        let lease = store.acquire_lease(&run.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(
            store.acquire_lease(&run.id).await,
            Err(EngineError::Conflict(_))
        ));
        drop(lease);

        // A holder that died without releasing.
        let id = run.id.clone();
        let expired = Utc::now().timestamp_millis() - 1_000;
        store
            .db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE workflow_runs SET lease_owner = 'crashed', lease_expires_at = ?2 WHERE id = ?1",
                    rusqlite::params![id, expired],
                )
            })
            .unwrap();
        assert!(store.acquire_lease(&run.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_keeps_its_definition_snapshot() {
        let store = store();
        let original = flow();
        store.save_definition(&original).await.unwrap();
        let run = WorkflowRun::new("store-flow".to_string(), "t".to_string());
        store.create_run(&run, &original).await.unwrap();

        let edited = WorkflowDefinition::from_yaml(&FLOW.replace("id: build", "id: package")).unwrap();
        store.save_definition(&edited).await.unwrap();

        assert_eq!(store.load_definition("store-flow").await.unwrap().steps[0].id, "package");
        let snapshot = store.load_run_definition(&run.id).await.unwrap();
        assert_eq!(snapshot.steps[0].id, "build");
        assert_eq!(snapshot.source, FLOW);
        assert!(matches!(
            store.load_run_definition("missing").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_save_run_keeps_archive_flag() {
        let store = store();
        let mut run = WorkflowRun::new("store-flow".to_string(), "t".to_string());
        store.create_run(&run, &flow()).await.unwrap();
        assert!(store.archive(&run.id).await.unwrap());

        // The in-memory copy still says "not archived".
        run.status = RunStatus::Running;
        store.save_run(&run).await.unwrap();
        store
            .record_recovery(&run, &record("build", 1, "retry"))
            .await
            .unwrap();

        let loaded = store.get(&run.id).await.unwrap().unwrap();
        assert!(loaded.archived);
        assert_eq!(loaded.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_corrupt_columns_surface_as_errors() {
        let store = store();
        let run = WorkflowRun::new("store-flow".to_string(), "t".to_string());
        store.create_run(&run, &flow()).await.unwrap();
        store
            .upsert_step_result(&run.id, &StepResult::started("build", 1, String::new()))
            .await
            .unwrap();

        let id = run.id.clone();
        store
            .db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE workflow_runs SET loop_counts = 'not json' WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                conn.execute(
                    "UPDATE step_results SET metadata = '[' WHERE run_id = ?1",
                    rusqlite::params![id],
                )
            })
            .unwrap();

        assert!(matches!(store.get(&run.id).await, Err(EngineError::Database(_))));
        assert!(matches!(
            store.list(RunListFilter::default()).await,
            Err(EngineError::Database(_))
        ));
        assert!(matches!(
            store.step_results(&run.id).await,
            Err(EngineError::Database(_))
        ));
    }
}
