//! Task status store
//!
//! Every state change is a compare-and-set keyed by task id and the expected
//! current state(s), and is appended to `task_transitions` in the same
//! transaction.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqliteConnection, SqliteExecutor};
use standctl_core::{Error, ErrorDescriptor, Result, TaskState};
use tracing::{debug, instrument};

use crate::models::{CreateTask, Task, TaskFilter, TaskStatus, TaskTransition, TaskTransitionUpdate};

const TASK_COLUMNS: &str = r#"
    id, unit_id, transport, operation, job, state, attempts, max_retries,
    result, last_error, elapsed_secs, created_at, updated_at, finished_at
"#;

fn describe(error: &ErrorDescriptor) -> String {
    format!("{}: {}", error.category, error.message)
}

async fn append_transition(
    conn: &mut SqliteConnection,
    task_id: &str,
    state: TaskState,
    attempt: i64,
    error: Option<String>,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO task_transitions (task_id, state, attempt, error, at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(task_id)
    .bind(state.as_str())
    .bind(attempt)
    .bind(error)
    .bind(at)
    .execute(&mut *conn)
    .await
    .map_err(|e| Error::DatabaseError(format!("Failed to record task transition: {}", e)))?;

    Ok(())
}

/// Record a submitted task as PENDING
#[instrument(skip(pool, task), fields(task_id = %task.id))]
pub async fn create_task(pool: &Pool<Sqlite>, task: &CreateTask) -> Result<()> {
    let now = Utc::now();

    // Begin transaction
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO tasks (id, unit_id, transport, operation, job, state, attempts, max_retries,
                           created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'PENDING', 0, ?, ?, ?)
        "#,
    )
    .bind(&task.id)
    .bind(&task.unit_id)
    .bind(task.transport.as_str())
    .bind(&task.operation)
    .bind(&task.job)
    .bind(i64::from(task.max_retries))
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(|e| Error::DatabaseError(format!("Failed to create task: {}", e)))?;

    append_transition(&mut *tx, &task.id, TaskState::Pending, 0, None, now).await?;

    tx.commit()
        .await
        .map_err(|e| Error::DatabaseError(format!("Failed to commit transaction: {}", e)))?;

    Ok(())
}

/// Get task by ID
#[instrument(skip(executor))]
pub async fn get_task<'e, E: SqliteExecutor<'e>>(executor: E, id: &str) -> Result<Task> {
    sqlx::query_as::<_, Task>(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
        .bind(id)
        .fetch_optional(executor)
        .await
        .context("Failed to get task")
        .map_err(|e| Error::DatabaseError(e.to_string()))?
        .ok_or_else(|| Error::TaskNotFound(format!("task '{}'", id)))
}

/// Transition log of a task, oldest first
#[instrument(skip(executor))]
pub async fn list_transitions<'e, E: SqliteExecutor<'e>>(
    executor: E,
    task_id: &str,
) -> Result<Vec<TaskTransition>> {
    sqlx::query_as::<_, TaskTransition>(
        r#"
        SELECT id, task_id, state, attempt, error, at
        FROM task_transitions
        WHERE task_id = ?
        ORDER BY id
        "#,
    )
    .bind(task_id)
    .fetch_all(executor)
    .await
    .context("Failed to list task transitions")
    .map_err(|e| Error::DatabaseError(e.to_string()))
}

/// Polled status of a task including its history
#[instrument(skip(pool))]
pub async fn get_task_status(pool: &Pool<Sqlite>, id: &str) -> Result<TaskStatus> {
    let task = get_task(pool, id).await?;
    let history = list_transitions(pool, id).await?;
    let state = task.state_str.clone();

    TaskStatus::from_task(task, history)
        .ok_or_else(|| Error::DatabaseError(format!("task '{}' has unknown state '{}'", id, state)))
}

/// List tasks, newest first
#[instrument(skip(pool))]
pub async fn list_tasks(pool: &Pool<Sqlite>, filter: &TaskFilter) -> Result<Vec<Task>> {
    let mut conditions = Vec::new();
    if filter.state.is_some() {
        conditions.push("state = ?");
    }
    if filter.unit.is_some() {
        conditions.push("unit_id = ?");
    }
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let sql = format!(
        "SELECT {} FROM tasks {} ORDER BY created_at DESC, id LIMIT ?",
        TASK_COLUMNS, where_clause
    );
    let mut query = sqlx::query_as::<_, Task>(&sql);
    if let Some(state) = filter.state {
        query = query.bind(state.as_str());
    }
    if let Some(unit) = &filter.unit {
        query = query.bind(unit);
    }

    query
        .bind(filter.limit.unwrap_or(1000))
        .fetch_all(pool)
        .await
        .context("Failed to list tasks")
        .map_err(|e| Error::DatabaseError(e.to_string()))
}

/// Compare-and-set the state of a task.
///
/// Applies `update` only if the task is currently in one of `expected`.
/// Returns whether the transition happened.
#[instrument(skip(pool, update), fields(to = %update.to))]
pub async fn transition_task(
    pool: &Pool<Sqlite>,
    id: &str,
    expected: &[TaskState],
    update: TaskTransitionUpdate,
) -> Result<bool> {
    if expected.is_empty() {
        return Ok(false);
    }

    let now = Utc::now();
    let finished_at = update.to.is_terminal().then_some(now);
    let error_json = update.error.as_ref().map(serde_json::to_string).transpose()?;
    let result_json = update.result.as_ref().map(serde_json::to_string).transpose()?;
    let elapsed = update.result.as_ref().map(|r| r.elapsed_secs);

    let placeholders = vec!["?"; expected.len()].join(", ");
    let sql = format!(
        r#"
        UPDATE tasks
        SET state = ?,
            attempts = COALESCE(?, attempts),
            last_error = COALESCE(?, last_error),
            result = COALESCE(?, result),
            elapsed_secs = COALESCE(?, elapsed_secs),
            updated_at = ?,
            finished_at = COALESCE(?, finished_at)
        WHERE id = ? AND state IN ({})
        "#,
        placeholders
    );

    // Begin transaction
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

    let mut query = sqlx::query(&sql)
        .bind(update.to.as_str())
        .bind(update.attempts.map(i64::from))
        .bind(error_json)
        .bind(result_json)
        .bind(elapsed)
        .bind(now)
        .bind(finished_at)
        .bind(id);
    for state in expected {
        query = query.bind(state.as_str());
    }

    let result = query
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::DatabaseError(format!("Failed to update task state: {}", e)))?;

    if result.rows_affected() != 1 {
        debug!(task_id = %id, "Task not in expected state, transition skipped");
        return Ok(false);
    }

    let attempts: i64 = sqlx::query_scalar("SELECT attempts FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::DatabaseError(format!("Failed to read task attempts: {}", e)))?;

    append_transition(
        &mut *tx,
        id,
        update.to,
        attempts,
        update.error.as_ref().map(describe),
        now,
    )
    .await?;

    tx.commit()
        .await
        .map_err(|e| Error::DatabaseError(format!("Failed to commit transaction: {}", e)))?;

    Ok(true)
}

/// Claim a queued task for execution: PENDING|RETRY -> STARTED
pub async fn claim_task(pool: &Pool<Sqlite>, id: &str, attempt: u32) -> Result<bool> {
    transition_task(
        pool,
        id,
        &[TaskState::Pending, TaskState::Retry],
        TaskTransitionUpdate::to(TaskState::Started).with_attempts(attempt),
    )
    .await
}

/// Tasks that have not reached a terminal state, oldest first
#[instrument(skip(pool))]
pub async fn list_unfinished_tasks(pool: &Pool<Sqlite>) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>(&format!(
        r#"
        SELECT {} FROM tasks
        WHERE state IN ('PENDING', 'STARTED', 'RETRY')
        ORDER BY created_at, id
        "#,
        TASK_COLUMNS
    ))
    .fetch_all(pool)
    .await
    .context("Failed to list unfinished tasks")
    .map_err(|e| Error::DatabaseError(e.to_string()))
}

/// Delete terminal tasks that finished before `older_than`. Returns how many were removed.
#[instrument(skip(pool))]
pub async fn purge_finished(pool: &Pool<Sqlite>, older_than: DateTime<Utc>) -> Result<u64> {
    let finished: Vec<(String, Option<DateTime<Utc>>)> = sqlx::query_as(
        r#"
        SELECT id, finished_at FROM tasks
        WHERE state IN ('SUCCESS', 'FAILURE', 'CANCELLED')
        "#,
    )
    .fetch_all(pool)
    .await
    .context("Failed to list finished tasks")
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    let expired: Vec<String> = finished
        .into_iter()
        .filter(|(_, at)| at.is_some_and(|at| at < older_than))
        .map(|(id, _)| id)
        .collect();

    if expired.is_empty() {
        return Ok(0);
    }

    // Begin transaction
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

    let mut removed = 0;
    for id in &expired {
        sqlx::query("DELETE FROM task_transitions WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::DatabaseError(format!("Failed to purge transitions: {}", e)))?;

        removed += sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::DatabaseError(format!("Failed to purge task: {}", e)))?
            .rows_affected();
    }

    tx.commit()
        .await
        .map_err(|e| Error::DatabaseError(format!("Failed to commit transaction: {}", e)))?;

    Ok(removed)
}
