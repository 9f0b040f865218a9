//! SQL migration definitions for the deployment journal.
//!
//! Migrations are applied in order on open. Each migration has a version
//! number and a batch of SQL statements.

/// A journal migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: deployments, deployment_steps, stack_templates",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per orchestrator run
CREATE TABLE IF NOT EXISTS deployments (
    id          TEXT PRIMARY KEY,
    stack_name  TEXT NOT NULL,
    region      TEXT NOT NULL,
    from_step   TEXT NOT NULL,
    to_step     TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    outcome     TEXT NOT NULL DEFAULT 'running',
    error       TEXT
);

CREATE INDEX IF NOT EXISTS idx_deployments_stack ON deployments(stack_name, started_at);

-- Per-step results within a run
CREATE TABLE IF NOT EXISTS deployment_steps (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    deployment_id TEXT NOT NULL REFERENCES deployments(id) ON DELETE CASCADE,
    step          TEXT NOT NULL,
    outcome       TEXT NOT NULL,
    detail        TEXT,
    recorded_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_steps_deployment ON deployment_steps(deployment_id);

-- Digest of the last template applied to each stack
CREATE TABLE IF NOT EXISTS stack_templates (
    stack_name TEXT PRIMARY KEY,
    step       TEXT NOT NULL,
    digest     TEXT NOT NULL,
    applied_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Ingestion job history",
            sql: r#"
CREATE TABLE IF NOT EXISTS ingestion_jobs (
    job_id            TEXT PRIMARY KEY,
    knowledge_base_id TEXT NOT NULL,
    data_source_id    TEXT NOT NULL,
    status            TEXT NOT NULL,
    failure_reasons   TEXT,
    started_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ingestion_kb ON ingestion_jobs(knowledge_base_id, started_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
