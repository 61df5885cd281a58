use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use crate::models::{
    CoreError, CoreErrorKind, Payload, ProjectId, ProjectStats, StatsDelta, TaskId, TaskMetadata,
    TaskRecord, TaskStatus, TaskType, TaskUpdate, WorkerKind,
};
use crate::persistence::{MigrationStore, PersistenceResult, TaskStore};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MIGRATIONS_TABLE: &str = "taskflow_schema_migrations";

const TASK_COLUMNS: &str = "task_id, project_id, task_type, worker_kind, status, parent_id, \
     input_json, output_json, priority, retry_count, estimated_duration_ms, actual_duration_ms, \
     tokens_used, cost_estimate, created_at_unix_ms, started_at_unix_ms, completed_at_unix_ms, \
     error_message";

pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    /// Store-managed optimistic version of a task row; starts at 1 and is
    /// bumped by every update.
    pub fn row_version(&self, task_id: TaskId) -> PersistenceResult<Option<i64>> {
        self.with_connection("row_version", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    "SELECT row_version FROM task_records WHERE task_id = ?1",
                    params![task_id_to_i64(task_id)?],
                    |row| row.get(0),
                )
                .optional()
        })
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // Recorded versions can outlive dropped tables; all DDL is
                // IF NOT EXISTS so replaying it is harmless.
                for version in 1..=target_version {
                    connection.execute_batch(defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl TaskStore for SqliteStore {
    fn insert_task(&self, task: &TaskRecord) -> PersistenceResult<TaskRecord> {
        self.with_connection("insert_task", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                &format!(
                    "INSERT INTO task_records ({TASK_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    task_id_to_i64(task.id)?,
                    task.project_id.as_str(),
                    task.task_type.as_str(),
                    task.worker_kind.as_str(),
                    task.status.as_str(),
                    task.parent_id.map(task_id_to_i64).transpose()?,
                    payload_to_json(&task.input)?,
                    task.output.as_ref().map(payload_to_json).transpose()?,
                    task.metadata.priority,
                    task.metadata.retry_count,
                    task.metadata.estimated_duration_ms.map(u64_to_i64).transpose()?,
                    task.metadata.actual_duration_ms.map(u64_to_i64).transpose()?,
                    task.metadata.tokens_used.map(u64_to_i64).transpose()?,
                    task.metadata.cost_estimate,
                    to_unix_millis(task.created_at)?,
                    task.started_at.map(to_unix_millis).transpose()?,
                    task.completed_at.map(to_unix_millis).transpose()?,
                    task.error_message.as_deref(),
                ],
            )?;
            Ok(task.clone())
        })
    }

    fn update_task(&self, task_id: TaskId, update: &TaskUpdate) -> PersistenceResult<()> {
        self.with_connection("update_task", |connection| {
            ensure_schema_ready(connection)?;
            let updated = connection.execute(
                "
UPDATE task_records
SET status = COALESCE(?2, status),
    output_json = COALESCE(?3, output_json),
    started_at_unix_ms = COALESCE(?4, started_at_unix_ms),
    completed_at_unix_ms = COALESCE(?5, completed_at_unix_ms),
    error_message = COALESCE(?6, error_message),
    actual_duration_ms = COALESCE(?7, actual_duration_ms),
    tokens_used = COALESCE(?8, tokens_used),
    cost_estimate = COALESCE(?9, cost_estimate),
    row_version = row_version + 1
WHERE task_id = ?1
",
                params![
                    task_id_to_i64(task_id)?,
                    update.status.map(TaskStatus::as_str),
                    update.output.as_ref().map(payload_to_json).transpose()?,
                    update.started_at.map(to_unix_millis).transpose()?,
                    update.completed_at.map(to_unix_millis).transpose()?,
                    update.error_message.as_deref(),
                    update.actual_duration_ms.map(u64_to_i64).transpose()?,
                    update.tokens_used.map(u64_to_i64).transpose()?,
                    update.cost_estimate,
                ],
            )?;

            if updated == 0 {
                return Err(storage_error_sqlite("task id was not found for update"));
            }
            Ok(())
        })
    }

    fn get_task(&self, task_id: TaskId) -> PersistenceResult<Option<TaskRecord>> {
        self.with_connection("get_task", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM task_records WHERE task_id = ?1"),
                    params![task_id_to_i64(task_id)?],
                    task_from_row,
                )
                .optional()
        })
    }

    fn list_tasks_by_project(
        &self,
        project_id: &ProjectId,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> PersistenceResult<Vec<TaskRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.with_connection("list_tasks_by_project", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "
SELECT {TASK_COLUMNS}
FROM task_records
WHERE project_id = ?1 AND (?2 IS NULL OR status = ?2)
ORDER BY created_at_unix_ms DESC, task_id DESC
LIMIT ?3
"
            ))?;
            let rows = statement.query_map(
                params![
                    project_id.as_str(),
                    status.map(TaskStatus::as_str),
                    to_i64(limit)?
                ],
                task_from_row,
            )?;

            rows.collect()
        })
    }

    fn list_tasks_by_parent(&self, parent_id: TaskId) -> PersistenceResult<Vec<TaskRecord>> {
        self.with_connection("list_tasks_by_parent", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "
SELECT {TASK_COLUMNS}
FROM task_records
WHERE parent_id = ?1
ORDER BY created_at_unix_ms ASC, task_id ASC
"
            ))?;
            let rows = statement.query_map(params![task_id_to_i64(parent_id)?], task_from_row)?;

            rows.collect()
        })
    }

    fn increment_project_stats(
        &self,
        project_id: &ProjectId,
        delta: &StatsDelta,
    ) -> PersistenceResult<()> {
        self.with_connection("increment_project_stats", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut stats = read_project_stats(&transaction, project_id)?;
            stats.apply(delta);
            transaction.execute(
                "
INSERT INTO project_stats (
    project_id, total_tasks, successful_tasks, total_tokens_used, total_cost,
    avg_completion_time_ms, updated_at_unix_ms
)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(project_id) DO UPDATE SET
    total_tasks = excluded.total_tasks,
    successful_tasks = excluded.successful_tasks,
    total_tokens_used = excluded.total_tokens_used,
    total_cost = excluded.total_cost,
    avg_completion_time_ms = excluded.avg_completion_time_ms,
    updated_at_unix_ms = excluded.updated_at_unix_ms
",
                params![
                    project_id.as_str(),
                    u64_to_i64(stats.total_tasks)?,
                    u64_to_i64(stats.successful_tasks)?,
                    u64_to_i64(stats.total_tokens_used)?,
                    stats.total_cost,
                    stats.avg_completion_time_ms,
                    to_unix_millis(SystemTime::now())?,
                ],
            )?;
            transaction.commit()
        })
    }

    fn project_stats(&self, project_id: &ProjectId) -> PersistenceResult<ProjectStats> {
        self.with_connection("project_stats", |connection| {
            ensure_schema_ready(connection)?;
            read_project_stats(connection, project_id)
        })
    }

    fn next_task_id(&self) -> PersistenceResult<u64> {
        self.with_connection("next_task_id", |connection| {
            ensure_schema_ready(connection)?;
            let max_id: Option<i64> =
                connection.query_row("SELECT MAX(task_id) FROM task_records", [], |row| {
                    row.get(0)
                })?;
            match max_id {
                Some(id) => Ok(i64_to_u64(id)?.saturating_add(1)),
                None => Ok(0),
            }
        })
    }
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let task_id_raw: i64 = row.get(0)?;
    let project_raw: String = row.get(1)?;
    let task_type_raw: String = row.get(2)?;
    let worker_raw: String = row.get(3)?;
    let status_raw: String = row.get(4)?;
    let parent_raw: Option<i64> = row.get(5)?;
    let input_raw: String = row.get(6)?;
    let output_raw: Option<String> = row.get(7)?;

    Ok(TaskRecord {
        id: TaskId(i64_to_u64(task_id_raw)?),
        project_id: ProjectId::new(project_raw),
        task_type: parse_task_type(&task_type_raw)?,
        worker_kind: parse_worker_kind(&worker_raw)?,
        status: parse_task_status(&status_raw)?,
        parent_id: parent_raw.map(i64_to_u64).transpose()?.map(TaskId),
        input: payload_from_json(&input_raw)?,
        output: output_raw.as_deref().map(payload_from_json).transpose()?,
        metadata: TaskMetadata {
            priority: row.get(8)?,
            retry_count: row.get(9)?,
            estimated_duration_ms: row.get::<_, Option<i64>>(10)?.map(i64_to_u64).transpose()?,
            actual_duration_ms: row.get::<_, Option<i64>>(11)?.map(i64_to_u64).transpose()?,
            tokens_used: row.get::<_, Option<i64>>(12)?.map(i64_to_u64).transpose()?,
            cost_estimate: row.get(13)?,
        },
        created_at: from_unix_millis(row.get(14)?)?,
        started_at: row
            .get::<_, Option<i64>>(15)?
            .map(from_unix_millis)
            .transpose()?,
        completed_at: row
            .get::<_, Option<i64>>(16)?
            .map(from_unix_millis)
            .transpose()?,
        error_message: row.get(17)?,
    })
}

fn read_project_stats(
    connection: &Connection,
    project_id: &ProjectId,
) -> rusqlite::Result<ProjectStats> {
    let stats = connection
        .query_row(
            "
SELECT total_tasks, successful_tasks, total_tokens_used, total_cost, avg_completion_time_ms
FROM project_stats
WHERE project_id = ?1
",
            params![project_id.as_str()],
            |row| {
                Ok(ProjectStats {
                    project_id: project_id.clone(),
                    total_tasks: i64_to_u64(row.get(0)?)?,
                    successful_tasks: i64_to_u64(row.get(1)?)?,
                    total_tokens_used: i64_to_u64(row.get(2)?)?,
                    total_cost: row.get(3)?,
                    avg_completion_time_ms: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(stats.unwrap_or_else(|| ProjectStats::empty(project_id.clone())))
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(
        "
CREATE TABLE IF NOT EXISTS taskflow_schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
",
    )?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before task operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn parse_task_type(raw: &str) -> rusqlite::Result<TaskType> {
    raw.parse::<TaskType>().map_err(|_| {
        storage_error_sqlite(&format!("unknown task type '{raw}' in sqlite record"))
    })
}

fn parse_worker_kind(raw: &str) -> rusqlite::Result<WorkerKind> {
    raw.parse::<WorkerKind>().map_err(|_| {
        storage_error_sqlite(&format!("unknown worker kind '{raw}' in sqlite record"))
    })
}

fn parse_task_status(raw: &str) -> rusqlite::Result<TaskStatus> {
    raw.parse::<TaskStatus>().map_err(|_| {
        storage_error_sqlite(&format!("unknown task status '{raw}' in sqlite record"))
    })
}

fn payload_to_json(payload: &Payload) -> rusqlite::Result<String> {
    payload
        .to_json()
        .map_err(|error| storage_error_sqlite(&format!("failed to encode payload: {error}")))
}

fn payload_from_json(raw: &str) -> rusqlite::Result<Payload> {
    Payload::from_json(raw)
        .map_err(|error| storage_error_sqlite(&format!("failed to decode payload: {error}")))
}

fn to_unix_millis(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_millis())
        .map_err(|_| storage_error_sqlite("unix timestamp millis exceed i64 range"))
}

fn from_unix_millis(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

fn task_id_to_i64(value: TaskId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("task id exceeds i64 range"))
}

fn u64_to_i64(value: u64) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative value in sqlite record"))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::Persistence,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
