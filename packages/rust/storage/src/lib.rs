//! Local deployment journal on embedded libSQL.
//!
//! The [`Journal`] records every orchestrator run and its per-step outcomes,
//! the digest of the last template applied to each stack (so an unchanged
//! template is not re-sent), and the history of ingestion jobs.
//!
//! The journal is advisory. Remote state is always re-read before acting;
//! losing the file only costs a redundant stack update.

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use claimstack_declarations::DeployStep;
use claimstack_shared::{ClaimStackError, Result, RunId};
use libsql::{Connection, Database, params};
use serde::Serialize;

fn storage_err(e: impl std::fmt::Display) -> ClaimStackError {
    ClaimStackError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Final state of a deployment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Running,
    Succeeded,
    Failed,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            _ => Self::Running,
        }
    }
}

/// What a single step did within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Applied,
    /// Remote state already matched; nothing was sent.
    Unchanged,
    Failed,
}

impl StepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "applied" => Self::Applied,
            "unchanged" => Self::Unchanged,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub stack_name: String,
    pub region: String,
    pub from_step: String,
    pub to_step: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: String,
    pub outcome: StepOutcome,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedTemplate {
    pub step: String,
    pub digest: String,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionRecord {
    pub job_id: String,
    pub knowledge_base_id: String,
    pub data_source_id: String,
    pub status: String,
    pub failure_reasons: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ClaimStackError::Storage(format!("invalid date '{raw}': {e}")))
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Handle on the journal database.
pub struct Journal {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Journal {
    /// Open or create the journal at `path`, applying pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ClaimStackError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let journal = Self { db, conn };
        journal.run_migrations().await?;
        Ok(journal)
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        ClaimStackError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, 0 before the first migration.
    async fn schema_version(&self) -> u32 {
        match self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await
        {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Deployment runs
    // -----------------------------------------------------------------------

    pub async fn begin_deployment(
        &self,
        run: &RunId,
        stack_name: &str,
        region: &str,
        from: DeployStep,
        to: DeployStep,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO deployments (id, stack_name, region, from_step, to_step, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.to_string(),
                    stack_name,
                    region,
                    from.as_str(),
                    to.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn record_step(
        &self,
        run: &RunId,
        step: DeployStep,
        outcome: StepOutcome,
        detail: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO deployment_steps (deployment_id, step, outcome, detail, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run.to_string(),
                    step.as_str(),
                    outcome.as_str(),
                    detail,
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn finish_deployment(
        &self,
        run: &RunId,
        outcome: RunOutcome,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE deployments SET finished_at = ?1, outcome = ?2, error = ?3 WHERE id = ?4",
                params![now.as_str(), outcome.as_str(), error, run.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Most recent runs for a stack, newest first.
    pub async fn recent_deployments(
        &self,
        stack_name: &str,
        limit: usize,
    ) -> Result<Vec<DeploymentRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, stack_name, region, from_step, to_step, started_at, finished_at, outcome, error
                 FROM deployments WHERE stack_name = ?1
                 ORDER BY started_at DESC LIMIT ?2",
                params![stack_name, limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let finished: Option<String> = row.get(6).ok();
            let outcome: String = row.get(7).map_err(storage_err)?;
            results.push(DeploymentRecord {
                id: row.get(0).map_err(storage_err)?,
                stack_name: row.get(1).map_err(storage_err)?,
                region: row.get(2).map_err(storage_err)?,
                from_step: row.get(3).map_err(storage_err)?,
                to_step: row.get(4).map_err(storage_err)?,
                started_at: parse_time(&row.get::<String>(5).map_err(storage_err)?)?,
                finished_at: finished.as_deref().map(parse_time).transpose()?,
                outcome: RunOutcome::parse(&outcome),
                error: row.get(8).ok(),
            });
        }
        Ok(results)
    }

    /// Step outcomes of one run, in the order they were recorded.
    pub async fn steps_for(&self, run_id: &str) -> Result<Vec<StepRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT step, outcome, detail, recorded_at FROM deployment_steps
                 WHERE deployment_id = ?1 ORDER BY id",
                params![run_id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let outcome: String = row.get(1).map_err(storage_err)?;
            results.push(StepRecord {
                step: row.get(0).map_err(storage_err)?,
                outcome: StepOutcome::parse(&outcome),
                detail: row.get(2).ok(),
                recorded_at: parse_time(&row.get::<String>(3).map_err(storage_err)?)?,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Applied templates
    // -----------------------------------------------------------------------

    /// Digest of the last template applied to `stack_name`.
    pub async fn applied_template(&self, stack_name: &str) -> Result<Option<AppliedTemplate>> {
        let mut rows = self
            .conn
            .query(
                "SELECT step, digest, applied_at FROM stack_templates WHERE stack_name = ?1",
                params![stack_name],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(AppliedTemplate {
                step: row.get(0).map_err(storage_err)?,
                digest: row.get(1).map_err(storage_err)?,
                applied_at: parse_time(&row.get::<String>(2).map_err(storage_err)?)?,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    pub async fn record_template(
        &self,
        stack_name: &str,
        step: DeployStep,
        digest: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO stack_templates (stack_name, step, digest, applied_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(stack_name) DO UPDATE SET
                   step = excluded.step,
                   digest = excluded.digest,
                   applied_at = excluded.applied_at",
                params![stack_name, step.as_str(), digest, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Forget every applied template of a stack, e.g. after it is deleted.
    pub async fn forget_stack(&self, stack_name: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM stack_templates WHERE stack_name = ?1",
                params![stack_name],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Ingestion jobs
    // -----------------------------------------------------------------------

    /// Insert or refresh an ingestion job by id.
    pub async fn record_ingestion(&self, job: &IngestionRecord) -> Result<()> {
        let reasons = serde_json::to_string(&job.failure_reasons)?;
        self.conn
            .execute(
                "INSERT INTO ingestion_jobs
                   (job_id, knowledge_base_id, data_source_id, status, failure_reasons, started_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(job_id) DO UPDATE SET
                   status = excluded.status,
                   failure_reasons = excluded.failure_reasons,
                   updated_at = excluded.updated_at",
                params![
                    job.job_id.as_str(),
                    job.knowledge_base_id.as_str(),
                    job.data_source_id.as_str(),
                    job.status.as_str(),
                    reasons,
                    job.started_at.to_rfc3339(),
                    job.updated_at.to_rfc3339()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn recent_ingestions(
        &self,
        knowledge_base_id: &str,
        limit: usize,
    ) -> Result<Vec<IngestionRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT job_id, knowledge_base_id, data_source_id, status, failure_reasons, started_at, updated_at
                 FROM ingestion_jobs WHERE knowledge_base_id = ?1
                 ORDER BY started_at DESC LIMIT ?2",
                params![knowledge_base_id, limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let reasons: Option<String> = row.get(4).ok();
            results.push(IngestionRecord {
                job_id: row.get(0).map_err(storage_err)?,
                knowledge_base_id: row.get(1).map_err(storage_err)?,
                data_source_id: row.get(2).map_err(storage_err)?,
                status: row.get(3).map_err(storage_err)?,
                failure_reasons: match reasons {
                    Some(raw) => serde_json::from_str(&raw)?,
                    None => Vec::new(),
                },
                started_at: parse_time(&row.get::<String>(5).map_err(storage_err)?)?,
                updated_at: parse_time(&row.get::<String>(6).map_err(storage_err)?)?,
            });
        }
        Ok(results)
    }
}
