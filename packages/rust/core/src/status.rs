//! Read-only status and diagnostics.
//!
//! Collects the observable state of every deployed resource without
//! changing anything, and turns mismatches into [`Diagnostic`]s that name
//! the command that resolves them.

use std::fmt::Write as _;

use serde::Serialize;
use tracing::{debug, instrument};

use claimstack_cloud::{
    CollectionInfo, IngestionJob, KnowledgeBaseInfo, StackDescription, StackPhase,
};
use claimstack_shared::{
    AppConfig, CollectionState, DeploymentContext, IndexShape, IngestionStatus, Result,
};
use claimstack_declarations::DeployStep;
use claimstack_storage::{DeploymentRecord, Journal};

use crate::Services;
use crate::orchestrator::deployed_through;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub stack_name: String,
    pub stack: Option<StackDescription>,
    pub deployed_through: Option<DeployStep>,
    pub context: DeploymentContext,
    pub collection: Option<CollectionInfo>,
    pub index: Option<IndexShape>,
    pub knowledge_base: Option<KnowledgeBaseInfo>,
    pub latest_ingestion: Option<IngestionJob>,
    pub last_run: Option<DeploymentRecord>,
    pub diagnostics: Vec<Diagnostic>,
}

impl StatusReport {
    /// No diagnostic of [`Severity::Error`].
    pub fn healthy(&self) -> bool {
        self.diagnostics
            .iter()
            .all(|d| d.severity < Severity::Error)
    }

    fn push(&mut self, severity: Severity, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            message: message.into(),
        });
    }
}

/// Query every resource the deployment owns.
///
/// Only a failure to describe the stack itself is an error; anything
/// downstream that cannot be read becomes a diagnostic.
#[instrument(skip_all, fields(stack = %config.stack.name))]
pub async fn collect_status(
    config: &AppConfig,
    services: &Services,
    journal: Option<&Journal>,
) -> Result<StatusReport> {
    let stack = services.provisioner.describe_stack(&config.stack.name).await?;
    let mut context = DeploymentContext::new(&config.aws.region, &config.stack.name);
    if let Some(stack) = &stack {
        context.absorb(&stack.outputs);
    }

    let mut report = StatusReport {
        stack_name: config.stack.name.clone(),
        deployed_through: stack.as_ref().and_then(|s| deployed_through(&s.outputs)),
        stack,
        context,
        collection: None,
        index: None,
        knowledge_base: None,
        latest_ingestion: None,
        last_run: None,
        diagnostics: Vec::new(),
    };

    if let Some(journal) = journal {
        report.last_run = journal
            .recent_deployments(&config.stack.name, 1)
            .await?
            .into_iter()
            .next();
    }

    check_stack(&mut report);
    if report.stack.is_none() {
        return Ok(report);
    }

    check_collection(config, services, &mut report).await;
    check_knowledge_base(config, services, &mut report).await;
    check_ingestion(services, &mut report).await;

    if report.context.function_name.is_none() {
        report.push(
            Severity::Info,
            "processing function not deployed (set function.code_bucket/code_key, then `claimstack deploy --from processing-function`)",
        );
    }
    debug!(diagnostics = report.diagnostics.len(), "status collected");
    Ok(report)
}

fn check_stack(report: &mut StatusReport) {
    let name = report.stack_name.clone();
    let Some(stack) = &report.stack else {
        report.push(
            Severity::Error,
            format!("stack {name} not found; run `claimstack deploy`"),
        );
        return;
    };
    let (status, reason) = (stack.status.clone(), stack.reason.clone());
    match stack.phase() {
        StackPhase::Complete => {}
        StackPhase::InProgress => {
            report.push(Severity::Info, format!("stack {name} is {status}"));
        }
        StackPhase::Failed => {
            let reason = reason.unwrap_or_else(|| "no reason reported".into());
            report.push(
                Severity::Error,
                format!("stack {name} is {status}: {reason}"),
            );
        }
    }
}

async fn check_collection(config: &AppConfig, services: &Services, report: &mut StatusReport) {
    let name = &config.stack.collection_name;
    let collection = match services.collections.collection(name).await {
        Ok(collection) => collection,
        Err(e) => {
            report.push(Severity::Error, format!("could not read collection {name}: {e}"));
            return;
        }
    };

    let Some(collection) = collection else {
        if report.deployed_through >= Some(DeployStep::Collection) {
            report.push(Severity::Error, format!("collection {name} is missing"));
        }
        return;
    };

    match &collection.state {
        CollectionState::Active => check_index(config, services, &collection, report).await,
        CollectionState::Creating | CollectionState::Updating => report.push(
            Severity::Warning,
            format!(
                "collection {name} is {}; run `claimstack deploy --from await-collection` once it settles",
                collection.state
            ),
        ),
        state => report.push(Severity::Error, format!("collection {name} is {state}")),
    }
    report.collection = Some(collection);
}

async fn check_index(
    config: &AppConfig,
    services: &Services,
    collection: &CollectionInfo,
    report: &mut StatusReport,
) {
    let Some(endpoint) = collection.endpoint.as_deref() else {
        return;
    };
    let spec = match config.index_spec() {
        Ok(spec) => spec,
        Err(e) => {
            report.push(Severity::Error, e.to_string());
            return;
        }
    };
    let shape = match services.index_connector.connect(endpoint) {
        Ok(index) => index.index_shape(&spec.name, &spec.vector_field).await,
        Err(e) => Err(e),
    };

    match shape {
        Ok(Some(shape)) => {
            let differences = spec.differences(&shape);
            if !differences.is_empty() {
                report.push(
                    Severity::Error,
                    format!(
                        "index {} does not match the declared configuration ({}); run `claimstack index recreate --yes`",
                        spec.name,
                        differences.join(", ")
                    ),
                );
            }
            if let (Some(actual), Ok(model)) = (shape.dimension, config.embedding_model()) {
                if actual != model.dimension {
                    report.push(
                        Severity::Error,
                        format!(
                            "index dimension {actual} differs from {} output dimension {}; ingestion will fail",
                            model.id, model.dimension
                        ),
                    );
                }
            }
            report.index = Some(shape);
        }
        Ok(None) => report.push(
            Severity::Warning,
            format!("index {} does not exist; run `claimstack index create`", spec.name),
        ),
        Err(e) => report.push(
            Severity::Error,
            format!("could not read index {}: {e}", spec.name),
        ),
    }
}

async fn check_knowledge_base(config: &AppConfig, services: &Services, report: &mut StatusReport) {
    let lookup = match report.context.knowledge_base_id.as_deref() {
        Some(id) => services.knowledge_bases.knowledge_base(id).await,
        None => {
            services
                .knowledge_bases
                .find_knowledge_base(&config.stack.knowledge_base_name)
                .await
        }
    };
    match lookup {
        Ok(Some(kb)) => {
            if kb.status != "ACTIVE" {
                report.push(
                    Severity::Warning,
                    format!("knowledge base {} is {}", kb.id, kb.status),
                );
            }
            report.knowledge_base = Some(kb);
        }
        Ok(None) if report.context.knowledge_base_id.is_some() => report.push(
            Severity::Error,
            "stack reports a knowledge base that no longer exists",
        ),
        Ok(None) => report.push(
            Severity::Info,
            "knowledge base not deployed yet; run `claimstack deploy --from knowledge-base`",
        ),
        Err(e) => report.push(Severity::Error, format!("could not read knowledge base: {e}")),
    }
}

async fn check_ingestion(services: &Services, report: &mut StatusReport) {
    let (Some(kb_id), Some(ds_id)) = (
        report.context.knowledge_base_id.clone(),
        report.context.data_source_id.clone(),
    ) else {
        return;
    };
    let jobs = match services.ingestion.list_ingestion_jobs(&kb_id, &ds_id, 1).await {
        Ok(jobs) => jobs,
        Err(e) => {
            report.push(Severity::Error, format!("could not list ingestion jobs: {e}"));
            return;
        }
    };
    let Some(job) = jobs.into_iter().next() else {
        report.push(
            Severity::Warning,
            "no ingestion job has run; run `claimstack ingest`",
        );
        return;
    };
    match job.status {
        IngestionStatus::Failed | IngestionStatus::Stopped => report.push(
            Severity::Error,
            format!(
                "latest ingestion job {} is {}; re-run `claimstack ingest` after fixing the cause",
                job.job_id, job.status
            ),
        ),
        IngestionStatus::Complete => {}
        ref status => report.push(
            Severity::Info,
            format!("ingestion job {} is {status}", job.job_id),
        ),
    }
    report.latest_ingestion = Some(job);
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn or_dash(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

/// Human-readable status summary.
pub fn render_status(report: &StatusReport) -> String {
    let mut out = String::new();
    let ctx = &report.context;

    let _ = writeln!(out, "Stack            {}", report.stack_name);
    let _ = writeln!(
        out,
        "  status         {}",
        or_dash(report.stack.as_ref().map(|s| s.status.as_str()))
    );
    let _ = writeln!(
        out,
        "  deployed to    {}",
        report
            .deployed_through
            .map_or("-".to_string(), |s| format!("{} ({s})", s.number()))
    );
    let _ = writeln!(out, "  region         {}", ctx.region);

    let _ = writeln!(out, "\nBuckets");
    let _ = writeln!(out, "  input          {}", or_dash(ctx.input_bucket.as_deref()));
    let _ = writeln!(out, "  output         {}", or_dash(ctx.output_bucket.as_deref()));
    let _ = writeln!(out, "  feedback       {}", or_dash(ctx.feedback_bucket.as_deref()));
    let _ = writeln!(out, "  kb data        {}", or_dash(ctx.kb_data_bucket.as_deref()));

    let _ = writeln!(out, "\nVector search");
    match &report.collection {
        Some(c) => {
            let _ = writeln!(out, "  collection     {} ({})", c.name, c.state);
            let _ = writeln!(out, "  endpoint       {}", or_dash(c.endpoint.as_deref()));
        }
        None => {
            let _ = writeln!(out, "  collection     -");
        }
    }
    match report.index.as_ref().and_then(|i| i.dimension) {
        Some(dimension) => {
            let _ = writeln!(out, "  index          present, {dimension} dimensions");
        }
        None => {
            let _ = writeln!(out, "  index          -");
        }
    }

    let _ = writeln!(out, "\nKnowledge base");
    match &report.knowledge_base {
        Some(kb) => {
            let _ = writeln!(out, "  id             {} ({})", kb.id, kb.status);
        }
        None => {
            let _ = writeln!(out, "  id             -");
        }
    }
    let _ = writeln!(out, "  data source    {}", or_dash(ctx.data_source_id.as_deref()));
    match &report.latest_ingestion {
        Some(job) => {
            let when = job
                .updated_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_default();
            let _ = writeln!(out, "  last ingestion {} {} {when}", job.job_id, job.status);
        }
        None => {
            let _ = writeln!(out, "  last ingestion -");
        }
    }
    let _ = writeln!(out, "  function       {}", or_dash(ctx.function_name.as_deref()));

    if let Some(run) = &report.last_run {
        let _ = writeln!(out, "\nLast deployment");
        let _ = writeln!(
            out,
            "  {} {}..{} {} at {}",
            run.id,
            run.from_step,
            run.to_step,
            run.outcome.as_str(),
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if let Some(error) = &run.error {
            let _ = writeln!(out, "  error: {error}");
        }
    }

    if !report.diagnostics.is_empty() {
        let _ = writeln!(out, "\nDiagnostics");
        for d in &report.diagnostics {
            let tag = match d.severity {
                Severity::Info => "info ",
                Severity::Warning => "warn ",
                Severity::Error => "error",
            };
            let _ = writeln!(out, "  [{tag}] {}", d.message);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeCollections, FakeIngestion, Fakes, test_config};
    use crate::orchestrator::Orchestrator;
    use crate::progress::SilentProgress;
    use std::sync::Arc;

    async fn deployed(fakes: &Fakes) {
        let config = test_config();
        Orchestrator::new(&config, &fakes.services(), &SilentProgress)
            .run(DeployStep::Foundation, DeployStep::KnowledgeBase)
            .await
            .expect("deploy");
    }

    fn has(report: &StatusReport, severity: Severity, needle: &str) -> bool {
        report
            .diagnostics
            .iter()
            .any(|d| d.severity == severity && d.message.contains(needle))
    }

    #[tokio::test]
    async fn missing_stack_is_unhealthy() {
        let fakes = Fakes::new(FakeCollections::missing());
        let report = collect_status(&test_config(), &fakes.services(), None)
            .await
            .unwrap();
        assert!(!report.healthy());
        assert!(has(&report, Severity::Error, "not found"));
        assert!(render_status(&report).contains("ClaimStack"));
    }

    #[tokio::test]
    async fn deployed_stack_reports_every_resource() {
        let fakes = Fakes::new(FakeCollections::active());
        deployed(&fakes).await;
        fakes
            .knowledge_bases
            .existing
            .lock()
            .unwrap()
            .push(KnowledgeBaseInfo {
                id: "fake-KnowledgeBaseId".into(),
                name: "insurance-policy-kb".into(),
                status: "ACTIVE".into(),
            });

        let report = collect_status(&test_config(), &fakes.services(), None)
            .await
            .unwrap();
        assert!(report.healthy(), "{:?}", report.diagnostics);
        assert_eq!(report.deployed_through, Some(DeployStep::KnowledgeBase));
        assert_eq!(report.index.as_ref().and_then(|i| i.dimension), Some(1024));
        assert!(report.latest_ingestion.is_some());

        let text = render_status(&report);
        assert!(text.contains("fake-InputBucketName"));
        assert!(text.contains("1024 dimensions"));
    }

    #[tokio::test]
    async fn stale_index_dimension_is_diagnosed() {
        let fakes = Fakes::new(FakeCollections::active());
        deployed(&fakes).await;
        let mut shape = test_config().index_spec().unwrap().shape();
        shape.dimension = Some(1536);
        *fakes.index.shape.lock().unwrap() = Some(shape);

        let report = collect_status(&test_config(), &fakes.services(), None)
            .await
            .unwrap();
        assert!(has(&report, Severity::Error, "index recreate"));
        assert!(has(&report, Severity::Error, "ingestion will fail"));
    }

    #[tokio::test]
    async fn failed_ingestion_is_an_error() {
        let mut fakes = Fakes::new(FakeCollections::active());
        fakes.ingestion = Arc::new(FakeIngestion::scripted(&[IngestionStatus::Failed]));
        deployed(&fakes).await;

        let report = collect_status(&test_config(), &fakes.services(), None)
            .await
            .unwrap();
        assert!(has(&report, Severity::Error, "JOB123"));
    }

    #[tokio::test]
    async fn creating_collection_is_a_warning() {
        let fakes = Fakes::new(FakeCollections::active());
        deployed(&fakes).await;
        *fakes.collections.states.lock().unwrap() =
            std::collections::VecDeque::from([Some(CollectionState::Creating)]);

        let report = collect_status(&test_config(), &fakes.services(), None)
            .await
            .unwrap();
        assert!(has(&report, Severity::Warning, "CREATING"));
        assert!(report.index.is_none());
    }
}
