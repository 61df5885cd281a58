#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_task_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS task_records (
    task_id INTEGER PRIMARY KEY,
    project_id TEXT NOT NULL,
    task_type TEXT NOT NULL,
    worker_kind TEXT NOT NULL,
    status TEXT NOT NULL,
    parent_id INTEGER,
    input_json TEXT NOT NULL,
    output_json TEXT,
    priority INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    estimated_duration_ms INTEGER,
    actual_duration_ms INTEGER,
    tokens_used INTEGER,
    cost_estimate REAL,
    created_at_unix_ms INTEGER NOT NULL,
    started_at_unix_ms INTEGER,
    completed_at_unix_ms INTEGER,
    error_message TEXT,
    row_version INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_task_records_project_time
    ON task_records (project_id, created_at_unix_ms DESC);

CREATE INDEX IF NOT EXISTS idx_task_records_parent
    ON task_records (parent_id);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_task_records_parent;
DROP INDEX IF EXISTS idx_task_records_project_time;
DROP TABLE IF EXISTS task_records;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_project_stats",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS project_stats (
    project_id TEXT PRIMARY KEY,
    total_tasks INTEGER NOT NULL DEFAULT 0,
    successful_tasks INTEGER NOT NULL DEFAULT 0,
    total_tokens_used INTEGER NOT NULL DEFAULT 0,
    total_cost REAL NOT NULL DEFAULT 0,
    avg_completion_time_ms REAL NOT NULL DEFAULT 0,
    updated_at_unix_ms INTEGER NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS project_stats;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
