//! Deployment orchestrator.
//!
//! Runs the six deployment steps strictly in order against one provisioning
//! stack. Provisioning steps apply a cumulative template (an update of the
//! same stack); the collection wait and the index bootstrap are direct
//! service calls. The first failing step halts the run; nothing is rolled
//! back automatically.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use claimstack_cloud::{StackDescription, StackPhase, StackProvisioner};
use claimstack_declarations::{
    DeployStep, ResourceGraph, function_package_key, render_template, standard_graph,
    template_digest,
};
use claimstack_shared::{
    AppConfig, ClaimStackError, CollectionState, DeploymentContext, EmbeddingModel, Result,
    RunId, VectorIndexSpec,
};
use claimstack_storage::{Journal, RunOutcome, StepOutcome};

use crate::Services;
use crate::bootstrap::{self, IndexOutcome, KnowledgeBaseRef, RecreateReport};
use crate::progress::ProgressReporter;
use crate::wait::{PollState, WaitPolicy, poll_until};

const BUILD_FUNCTION_HINT: &str = "build it with `cargo lambda build --release --output-format zip -p claimstack-function`, or set [function] code_bucket and code_key";

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: DeployStep,
    pub outcome: StepOutcome,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub run_id: String,
    pub steps: Vec<StepReport>,
    pub context: DeploymentContext,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestroyReport {
    pub stack_found: bool,
    pub emptied_objects: usize,
}

#[derive(Debug, Clone)]
pub struct RecreateOutcome {
    pub report: RecreateReport,
    /// Last step re-applied after the index came back, if the knowledge base
    /// was managed by the stack.
    pub reprovisioned_through: Option<DeployStep>,
    pub context: DeploymentContext,
}

/// The furthest provisioning step a stack's outputs show evidence of.
pub fn deployed_through(outputs: &BTreeMap<String, String>) -> Option<DeployStep> {
    [
        ("LambdaFunctionName", DeployStep::ProcessingFunction),
        ("KnowledgeBaseId", DeployStep::KnowledgeBase),
        ("OpenSearchCollectionEndpoint", DeployStep::Collection),
        ("InputBucketName", DeployStep::Foundation),
    ]
    .into_iter()
    .find(|(key, _)| outputs.contains_key(*key))
    .map(|(_, step)| step)
}

/// The first failure recorded in a stack's recent events.
async fn first_failure(provisioner: &dyn StackProvisioner, stack: &str) -> Option<String> {
    let events = provisioner.stack_events(stack, 50).await.ok()?;
    events
        .iter()
        .rev()
        .find(|e| e.status.ends_with("_FAILED") && e.reason.is_some())
        .map(|e| {
            format!(
                "{} ({}): {}",
                e.logical_id,
                e.resource_type,
                e.reason.as_deref().unwrap_or_default()
            )
        })
}

pub struct Orchestrator<'a> {
    config: &'a AppConfig,
    services: &'a Services,
    progress: &'a dyn ProgressReporter,
    journal: Option<&'a Journal>,
    collection_wait: WaitPolicy,
    stack_wait: WaitPolicy,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a AppConfig,
        services: &'a Services,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            config,
            services,
            progress,
            journal: None,
            collection_wait: WaitPolicy::from_section(&config.wait.collection),
            stack_wait: WaitPolicy::from_section(&config.wait.stack),
        }
    }

    pub fn with_journal(mut self, journal: &'a Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Wait for collection activation without a bound.
    pub fn without_collection_timeout(mut self) -> Self {
        self.collection_wait = self.collection_wait.unbounded();
        self
    }

    fn stack_name(&self) -> &str {
        &self.config.stack.name
    }

    pub async fn describe_stack(&self) -> Result<Option<StackDescription>> {
        self.services
            .provisioner
            .describe_stack(self.stack_name())
            .await
    }

    /// Identifiers published by the stack as it stands.
    pub async fn current_context(&self) -> Result<DeploymentContext> {
        let mut context = DeploymentContext::new(&self.config.aws.region, self.stack_name());
        if let Some(stack) = self.describe_stack().await? {
            context.absorb(&stack.outputs);
        }
        Ok(context)
    }

    /// Everything checkable without touching the cloud.
    fn declarations(&self) -> Result<(ResourceGraph, VectorIndexSpec, EmbeddingModel)> {
        self.config.validate()?;
        let graph = standard_graph(self.config)?;
        let spec = self.config.index_spec()?;
        let model = self.config.embedding_model()?;
        model.check_dimension(spec.dimension)?;
        Ok((graph, spec, model))
    }

    // -----------------------------------------------------------------------
    // Deploy
    // -----------------------------------------------------------------------

    /// Run steps `from..=to`, halting at the first failure.
    #[instrument(skip_all, fields(stack = %self.config.stack.name, from = %from, to = %to))]
    pub async fn run(&self, from: DeployStep, to: DeployStep) -> Result<DeployReport> {
        if from > to {
            return Err(ClaimStackError::validation(format!(
                "step range is empty: {from} comes after {to}"
            )));
        }
        let (graph, spec, model) = self.declarations()?;

        let run_id = RunId::new();
        let mut context = self.current_context().await?;
        if let Some(journal) = self.journal {
            journal
                .begin_deployment(
                    &run_id,
                    self.stack_name(),
                    &self.config.aws.region,
                    from,
                    to,
                )
                .await?;
        }

        let mut steps = Vec::new();
        for step in DeployStep::range(from, to) {
            self.progress.step_started(step);
            info!(step = %step, number = step.number(), "running step");

            match self
                .run_step(step, &graph, &spec, &model, &mut context)
                .await
            {
                Ok((outcome, detail)) => {
                    if let Some(journal) = self.journal {
                        journal
                            .record_step(&run_id, step, outcome, Some(&detail))
                            .await?;
                    }
                    self.progress.step_finished(step, outcome, &detail);
                    steps.push(StepReport {
                        step,
                        outcome,
                        detail,
                    });
                }
                Err(err) => {
                    error!(step = %step, error = %err, "step failed, halting");
                    self.journal_failure(&run_id, step, &err).await;
                    return Err(err);
                }
            }
        }

        if let Some(journal) = self.journal {
            journal
                .finish_deployment(&run_id, RunOutcome::Succeeded, None)
                .await?;
        }
        Ok(DeployReport {
            run_id: run_id.to_string(),
            steps,
            context,
        })
    }

    /// Journal a failed step without masking the step's own error.
    async fn journal_failure(&self, run_id: &RunId, step: DeployStep, err: &ClaimStackError) {
        let Some(journal) = self.journal else {
            return;
        };
        let message = err.to_string();
        let recorded = journal
            .record_step(run_id, step, StepOutcome::Failed, Some(&message))
            .await;
        let finished = journal
            .finish_deployment(run_id, RunOutcome::Failed, Some(&message))
            .await;
        if let Err(e) = recorded.and(finished) {
            warn!(error = %e, "could not journal failed step");
        }
    }

    async fn run_step(
        &self,
        step: DeployStep,
        graph: &ResourceGraph,
        spec: &VectorIndexSpec,
        model: &EmbeddingModel,
        context: &mut DeploymentContext,
    ) -> Result<(StepOutcome, String)> {
        match step {
            DeployStep::Foundation
            | DeployStep::Collection
            | DeployStep::KnowledgeBase
            | DeployStep::ProcessingFunction => self.provision(step, graph, context).await,
            DeployStep::AwaitCollection => self.await_collection(context).await,
            DeployStep::VectorIndex => {
                let outcome = bootstrap::ensure_index(
                    self.services.collections.as_ref(),
                    self.services.index_connector.as_ref(),
                    &self.config.stack.collection_name,
                    spec,
                    model,
                )
                .await?;
                Ok(match outcome {
                    IndexOutcome::Created => (
                        StepOutcome::Applied,
                        format!("index {} created ({} dimensions)", spec.name, spec.dimension),
                    ),
                    IndexOutcome::AlreadyPresent => (
                        StepOutcome::Unchanged,
                        format!("index {} already present", spec.name),
                    ),
                })
            }
        }
    }

    /// Apply the cumulative template for `step`. A stack that already holds
    /// later steps keeps them: the template covers whichever is further.
    async fn provision(
        &self,
        step: DeployStep,
        graph: &ResourceGraph,
        context: &mut DeploymentContext,
    ) -> Result<(StepOutcome, String)> {
        let existing = self.describe_stack().await?;
        let deployed = existing
            .as_ref()
            .and_then(|stack| deployed_through(&stack.outputs));
        let through = deployed.map_or(step, |d| d.max(step));
        self.apply_through(step, graph, through, existing, context)
            .await
    }

    /// Apply the template through `through`, resolving the function package
    /// first when the template declares the function.
    async fn apply_through(
        &self,
        step: DeployStep,
        graph: &ResourceGraph,
        through: DeployStep,
        existing: Option<StackDescription>,
        context: &mut DeploymentContext,
    ) -> Result<(StepOutcome, String)> {
        if through < DeployStep::ProcessingFunction {
            return self
                .apply_template(step, self.config, graph, through, existing, context)
                .await;
        }
        let config = self.with_function_artifact(context).await?;
        let graph = standard_graph(&config)?;
        self.apply_template(step, &config, &graph, through, existing, context)
            .await
    }

    /// The configuration with the function's code location filled in. A
    /// local package is uploaded to the knowledge-base data bucket.
    async fn with_function_artifact(&self, context: &DeploymentContext) -> Result<AppConfig> {
        let mut config = self.config.clone();
        if config.function.artifact().is_some() {
            return Ok(config);
        }
        let Some(package) = config.function.package.clone() else {
            return Err(ClaimStackError::operator(format!(
                "no processing function package configured; {BUILD_FUNCTION_HINT}"
            )));
        };
        let bytes = match tokio::fs::read(&package).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ClaimStackError::operator(format!(
                    "function package {} not found; {BUILD_FUNCTION_HINT}",
                    package.display()
                )));
            }
            Err(e) => return Err(ClaimStackError::io(package, e)),
        };

        let bucket = context.require_kb_data_bucket()?.to_string();
        let key = function_package_key(&bytes);
        info!(bucket = %bucket, key = %key, size = bytes.len(), "uploading function package");
        self.services
            .objects
            .put_object(&bucket, &key, bytes, "application/zip")
            .await?;

        config.function.code_bucket = Some(bucket);
        config.function.code_key = Some(key);
        Ok(config)
    }

    #[instrument(skip_all, fields(stack = %self.config.stack.name, step = %step, through = %through))]
    async fn apply_template(
        &self,
        step: DeployStep,
        config: &AppConfig,
        graph: &ResourceGraph,
        through: DeployStep,
        existing: Option<StackDescription>,
        context: &mut DeploymentContext,
    ) -> Result<(StepOutcome, String)> {
        let name = self.stack_name();
        let template = render_template(graph, through, config)?;
        let digest = template_digest(&template);
        let body = serde_json::to_string(&template)?;
        let provisioner = self.services.provisioner.as_ref();

        let changed = match &existing {
            None => {
                info!("creating stack");
                provisioner.create_stack(name, &body).await?;
                true
            }
            Some(stack) if stack.phase() == StackPhase::InProgress => {
                return Err(ClaimStackError::not_ready(
                    format!("stack {name}"),
                    &stack.status,
                ));
            }
            Some(stack) if stack.status == "ROLLBACK_COMPLETE" => {
                return Err(ClaimStackError::Provisioning {
                    stack: name.to_string(),
                    status: stack.status.clone(),
                    reason: "the stack never finished creating; run `claimstack destroy --yes` and deploy again".into(),
                });
            }
            Some(stack) => {
                if self.already_applied(stack, &digest).await? {
                    false
                } else {
                    info!("updating stack");
                    provisioner.update_stack(name, &body).await?
                }
            }
        };

        let (outcome, stack) = match (changed, existing) {
            (false, Some(stack)) => (StepOutcome::Unchanged, stack),
            _ => (StepOutcome::Applied, self.await_stack().await?),
        };
        context.absorb(&stack.outputs);
        if let Some(journal) = self.journal {
            journal.record_template(name, step, &digest).await?;
        }

        let detail = match outcome {
            StepOutcome::Unchanged => format!("stack {name} already up to date"),
            _ => format!("stack {name} {}", stack.status),
        };
        Ok((outcome, detail))
    }

    async fn already_applied(&self, stack: &StackDescription, digest: &str) -> Result<bool> {
        let Some(journal) = self.journal else {
            return Ok(false);
        };
        let applied = journal.applied_template(self.stack_name()).await?;
        Ok(stack.phase() == StackPhase::Complete && applied.is_some_and(|a| a.digest == digest))
    }

    async fn await_stack(&self) -> Result<StackDescription> {
        let name = self.stack_name();
        poll_until(
            &self.stack_wait,
            &format!("stack {name}"),
            self.progress,
            || {
                let provisioner = self.services.provisioner.clone();
                let name = name.to_string();
                async move {
                    let Some(stack) = provisioner.describe_stack(&name).await? else {
                        return Err(ClaimStackError::Provisioning {
                            stack: name,
                            status: "MISSING".into(),
                            reason: "stack disappeared while waiting".into(),
                        });
                    };
                    match stack.phase() {
                        StackPhase::InProgress => Ok(PollState::Pending(stack.status)),
                        StackPhase::Complete => Ok(PollState::Ready(stack)),
                        StackPhase::Failed => {
                            let reason = first_failure(provisioner.as_ref(), &name)
                                .await
                                .or(stack.reason)
                                .unwrap_or_else(|| "no failure reason reported".into());
                            Err(ClaimStackError::Provisioning {
                                stack: name,
                                status: stack.status,
                                reason,
                            })
                        }
                    }
                }
            },
        )
        .await
    }

    #[instrument(skip_all, fields(collection = %self.config.stack.collection_name))]
    async fn await_collection(
        &self,
        context: &mut DeploymentContext,
    ) -> Result<(StepOutcome, String)> {
        let name = &self.config.stack.collection_name;
        let what = format!("collection {name}");
        let collection = poll_until(&self.collection_wait, &what, self.progress, || {
            let collections = self.services.collections.clone();
            let name = name.clone();
            async move {
                let resource = format!("collection {name}");
                let Some(collection) = collections.collection(&name).await? else {
                    return Err(ClaimStackError::not_ready(resource, "MISSING"));
                };
                match collection.state {
                    CollectionState::Active => Ok(PollState::Ready(collection)),
                    ref state if state.is_terminal() => {
                        Err(ClaimStackError::not_ready(resource, state))
                    }
                    ref state => Ok(PollState::Pending(state.to_string())),
                }
            }
        })
        .await?;

        if context.collection_endpoint.is_none() {
            context.collection_endpoint = collection.endpoint.clone();
        }
        if context.collection_arn.is_none() {
            context.collection_arn = collection.arn.clone();
        }
        Ok((StepOutcome::Applied, format!("{what} is ACTIVE")))
    }

    // -----------------------------------------------------------------------
    // Index recreation
    // -----------------------------------------------------------------------

    /// Replace a stale vector index. A knowledge base managed by the stack is
    /// removed through the stack first and re-provisioned afterwards; one
    /// created outside the stack is deleted directly.
    #[instrument(skip_all, fields(stack = %self.config.stack.name, index = %self.config.stack.index_name))]
    pub async fn recreate_index(&self) -> Result<RecreateOutcome> {
        let (graph, spec, model) = self.declarations()?;
        let mut context = self.current_context().await?;

        let existing = self.describe_stack().await?;
        let deployed = existing
            .as_ref()
            .and_then(|stack| deployed_through(&stack.outputs));
        let managed = deployed.filter(|d| *d >= DeployStep::KnowledgeBase);

        if managed.is_some() {
            self.progress.phase("Removing knowledge base from stack");
            self.apply_template(
                DeployStep::VectorIndex,
                self.config,
                &graph,
                DeployStep::VectorIndex,
                existing,
                &mut context,
            )
            .await?;
            context.knowledge_base_id = None;
            context.data_source_id = None;
            context.function_name = None;
        }

        let report = bootstrap::recreate_index(
            self.services.knowledge_bases.as_ref(),
            self.services.collections.as_ref(),
            self.services.index_connector.as_ref(),
            &self.config.stack.collection_name,
            &spec,
            &model,
            KnowledgeBaseRef {
                id: None,
                name: &self.config.stack.knowledge_base_name,
            },
            &self.stack_wait,
            self.progress,
        )
        .await?;

        if let Some(through) = managed {
            self.progress.phase("Re-provisioning knowledge base");
            let existing = self.describe_stack().await?;
            self.apply_through(through, &graph, through, existing, &mut context)
                .await?;
        }

        Ok(RecreateOutcome {
            report,
            reprovisioned_through: managed,
            context,
        })
    }

    // -----------------------------------------------------------------------
    // Destroy
    // -----------------------------------------------------------------------

    /// Empty the stack's buckets, then delete the stack and wait for it to go.
    #[instrument(skip_all, fields(stack = %self.config.stack.name))]
    pub async fn destroy(&self) -> Result<DestroyReport> {
        let name = self.stack_name();
        let Some(stack) = self.describe_stack().await? else {
            info!("stack does not exist");
            return Ok(DestroyReport {
                stack_found: false,
                emptied_objects: 0,
            });
        };
        if stack.phase() == StackPhase::InProgress {
            return Err(ClaimStackError::not_ready(
                format!("stack {name}"),
                &stack.status,
            ));
        }

        let context = DeploymentContext::from_outputs(&self.config.aws.region, name, &stack.outputs);
        let buckets = [
            context.input_bucket.as_deref(),
            context.output_bucket.as_deref(),
            context.feedback_bucket.as_deref(),
            context.kb_data_bucket.as_deref(),
        ];

        let mut emptied = 0;
        for bucket in buckets.into_iter().flatten() {
            self.progress.phase(&format!("Emptying bucket {bucket}"));
            let objects = self.services.objects.list_objects(bucket, "").await?;
            let total = objects.len();
            for (i, object) in objects.iter().enumerate() {
                self.services
                    .objects
                    .delete_object(bucket, &object.key)
                    .await?;
                self.progress.item(&object.key, i + 1, total);
                emptied += 1;
            }
        }

        self.progress.phase("Deleting stack");
        self.services.provisioner.delete_stack(name).await?;
        poll_until(
            &self.stack_wait,
            &format!("stack {name} deletion"),
            self.progress,
            || {
                let provisioner = self.services.provisioner.clone();
                let name = name.to_string();
                async move {
                    match provisioner.describe_stack(&name).await? {
                        None => Ok(PollState::Ready(())),
                        Some(stack) if stack.status == "DELETE_COMPLETE" => {
                            Ok(PollState::Ready(()))
                        }
                        Some(stack) if stack.status == "DELETE_FAILED" => {
                            let reason = first_failure(provisioner.as_ref(), &name)
                                .await
                                .or(stack.reason)
                                .unwrap_or_else(|| "no failure reason reported".into());
                            Err(ClaimStackError::Provisioning {
                                stack: name,
                                status: stack.status,
                                reason,
                            })
                        }
                        Some(stack) => Ok(PollState::Pending(stack.status)),
                    }
                }
            },
        )
        .await?;

        if let Some(journal) = self.journal {
            journal.forget_stack(name).await?;
        }
        info!(emptied_objects = emptied, "stack deleted");
        Ok(DestroyReport {
            stack_found: true,
            emptied_objects: emptied,
        })
    }
}
