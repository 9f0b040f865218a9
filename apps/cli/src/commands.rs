//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use tracing::info;

use claimstack_cloud::AwsServices;
use claimstack_core::ingestion::{IngestionMonitor, latest_jobs, upload_documents};
use claimstack_core::processing::{ClaimAnalyzer, ProcessOptions, process_object};
use claimstack_core::status::{collect_status, render_status};
use claimstack_core::{Orchestrator, ProgressReporter, Services};
use claimstack_declarations::{DeployStep, dependency_report, render_template, standard_graph};
use claimstack_shared::{
    AppConfig, DeploymentContext, LogFormat, init_config, journal_path, load_config,
    load_config_from,
};
use claimstack_storage::Journal;

use crate::progress::CliProgress;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// claimstack: deploy and operate the insurance claim RAG pipeline.
#[derive(Parser)]
#[command(
    name = "claimstack",
    version,
    about = "Deploy and operate the insurance claim knowledge base and processing pipeline.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.claimstack/claimstack.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// AWS region, overriding the config file.
    #[arg(long, env = "AWS_REGION", global = true)]
    pub region: Option<String>,

    /// AWS credentials profile, overriding the config file.
    #[arg(long, env = "AWS_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Stack name, overriding the config file.
    #[arg(long, env = "CLAIMSTACK_STACK", global = true)]
    pub stack: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run deployment steps in order, halting at the first failure.
    Deploy {
        /// First step to run (name or number).
        #[arg(long, default_value = "foundation")]
        from: DeployStep,

        /// Last step to run (name or number).
        #[arg(long, default_value = "processing-function")]
        to: DeployStep,

        /// Wait for the collection to become ACTIVE without a time limit.
        #[arg(long)]
        no_timeout: bool,
    },

    /// Empty the buckets and delete the stack.
    Destroy {
        /// Confirm deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Report the state of every deployed resource.
    Status {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the resource creation plan.
    Deps {
        /// Print the dependency graph as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the provisioning template for the steps up to `--through`.
    Template {
        #[arg(long, default_value = "processing-function")]
        through: DeployStep,
    },

    /// Vector index operations.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Upload policy documents and run an ingestion job to completion.
    Ingest {
        /// Directory of documents (defaults to `ingestion.documents_dir`).
        #[arg(long)]
        docs: Option<PathBuf>,

        /// Ingest what is already in the bucket.
        #[arg(long)]
        skip_upload: bool,
    },

    /// Show the most recent ingestion jobs.
    IngestStatus {
        #[arg(long, default_value = "5")]
        limit: usize,
    },

    /// Print deployed identifiers as shell `export` lines.
    Env,

    /// Run the processing function on one stored document.
    Process {
        /// Input bucket (defaults to the stack's input bucket).
        #[arg(long)]
        bucket: Option<String>,

        /// Object key of the document.
        #[arg(long)]
        key: String,

        /// Output bucket (defaults to the stack's output bucket).
        #[arg(long)]
        output_bucket: Option<String>,

        /// Leave sensitive values unmasked.
        #[arg(long)]
        no_filter: bool,
    },

    /// Analyse a local claim document.
    Analyze {
        file: PathBuf,

        /// Leave sensitive values unmasked.
        #[arg(long)]
        no_filter: bool,

        /// Generation model (defaults to `models.default_model`).
        #[arg(long)]
        model: Option<String>,
    },

    /// Run several models over a local claim document.
    Compare {
        file: PathBuf,

        /// Comma-separated model ids (defaults to `models.compare`).
        #[arg(long, value_delimiter = ',')]
        models: Vec<String>,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Index subcommands.
#[derive(Subcommand)]
pub(crate) enum IndexAction {
    /// Create the declared index if it does not exist.
    Create,
    /// Delete the index (and the knowledge base using it) and create it again.
    Recreate {
        /// Confirm deletion.
        #[arg(long)]
        yes: bool,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "claimstack=info",
        1 => "claimstack=debug",
        _ => "claimstack=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

/// Config file values with command-line overrides applied.
fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    apply_overrides(&mut config, cli);
    config.validate()?;
    Ok(config)
}

/// Global flags win over the config file.
fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(region) = &cli.region {
        config.aws.region = region.clone();
    }
    if let Some(profile) = &cli.profile {
        config.aws.profile = Some(profile.clone());
    }
    if let Some(stack) = &cli.stack {
        config.stack.name = stack.clone();
    }
}

async fn connect(config: &AppConfig) -> Result<AwsServices> {
    Ok(AwsServices::load(&config.aws.region, config.aws.profile.as_deref()).await?)
}

async fn open_journal() -> Result<Journal> {
    Ok(Journal::open(&journal_path()?).await?)
}

/// Stack outputs, with process environment filling any gaps.
async fn deployed_context(config: &AppConfig, services: &Services) -> Result<DeploymentContext> {
    let mut context = DeploymentContext::from_env(&config.aws.region, &config.stack.name);
    if let Some(stack) = services
        .provisioner
        .describe_stack(&config.stack.name)
        .await?
    {
        context.absorb(&stack.outputs);
    }
    Ok(context)
}

fn analyzer(aws: &AwsServices, model_id: &str, context: &DeploymentContext) -> ClaimAnalyzer {
    let analyzer = ClaimAnalyzer::new(aws.models(), model_id);
    match &context.knowledge_base_id {
        Some(kb_id) => analyzer.with_knowledge_base(aws.retriever(), kb_id.clone()),
        None => analyzer,
    }
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| eyre!("cannot read '{}': {e}", path.display()))
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&resolve_config(&cli)?),
        };
    }

    let config = resolve_config(&cli)?;
    match cli.command {
        Command::Deploy {
            from,
            to,
            no_timeout,
        } => cmd_deploy(&config, from, to, no_timeout).await,
        Command::Destroy { yes } => cmd_destroy(&config, yes).await,
        Command::Status { json } => cmd_status(&config, json).await,
        Command::Deps { json } => cmd_deps(&config, json),
        Command::Template { through } => cmd_template(&config, through),
        Command::Index { action } => match action {
            IndexAction::Create => cmd_index_create(&config).await,
            IndexAction::Recreate { yes } => cmd_index_recreate(&config, yes).await,
        },
        Command::Ingest { docs, skip_upload } => {
            cmd_ingest(&config, docs.as_deref(), skip_upload).await
        }
        Command::IngestStatus { limit } => cmd_ingest_status(&config, limit).await,
        Command::Env => cmd_env(&config).await,
        Command::Process {
            bucket,
            key,
            output_bucket,
            no_filter,
        } => cmd_process(&config, bucket, &key, output_bucket, !no_filter).await,
        Command::Analyze {
            file,
            no_filter,
            model,
        } => cmd_analyze(&config, &file, !no_filter, model).await,
        Command::Compare { file, models } => cmd_compare(&config, &file, models).await,
        Command::Config { .. } => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Deployment
// ---------------------------------------------------------------------------

async fn cmd_deploy(config: &AppConfig, from: DeployStep, to: DeployStep, no_timeout: bool) -> Result<()> {
    let aws = connect(config).await?;
    let services = Services::from_aws(&aws)?;
    let journal = open_journal().await?;
    let progress = CliProgress::new();

    info!(stack = %config.stack.name, from = %from, to = %to, "deploying");
    let mut orchestrator = Orchestrator::new(config, &services, &progress).with_journal(&journal);
    if no_timeout {
        orchestrator = orchestrator.without_collection_timeout();
    }
    let report = orchestrator.run(from, to).await;
    progress.finish();
    let report = report?;

    println!();
    println!("  Deployment finished ({} steps)", report.steps.len());
    println!("  Run:   {}", report.run_id);
    println!("  Stack: {}", report.context.stack_name);
    if let Some(kb) = &report.context.knowledge_base_id {
        println!("  Knowledge base: {kb}");
    }
    println!();
    println!("  Run `claimstack ingest` to load policy documents.");
    println!();
    Ok(())
}

async fn cmd_destroy(config: &AppConfig, yes: bool) -> Result<()> {
    if !yes {
        return Err(eyre!(
            "destroy deletes stack '{}' and every object in its buckets; pass --yes to confirm",
            config.stack.name
        ));
    }
    let aws = connect(config).await?;
    let services = Services::from_aws(&aws)?;
    let journal = open_journal().await?;
    let progress = CliProgress::new();

    let report = Orchestrator::new(config, &services, &progress)
        .with_journal(&journal)
        .destroy()
        .await;
    progress.finish();
    let report = report?;

    if report.stack_found {
        println!(
            "Stack {} deleted ({} objects removed from its buckets).",
            config.stack.name, report.emptied_objects
        );
    } else {
        println!("Stack {} does not exist.", config.stack.name);
    }
    Ok(())
}

async fn cmd_status(config: &AppConfig, json: bool) -> Result<()> {
    let aws = connect(config).await?;
    let services = Services::from_aws(&aws)?;
    let journal = open_journal().await?;

    let report = collect_status(config, &services, Some(&journal)).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_status(&report));
    }
    if !report.healthy() {
        return Err(eyre!("deployment of {} has errors", config.stack.name));
    }
    Ok(())
}

fn cmd_deps(config: &AppConfig, json: bool) -> Result<()> {
    let graph = standard_graph(config)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&graph)?);
    } else {
        print!("{}", dependency_report(&graph)?);
    }
    Ok(())
}

fn cmd_template(config: &AppConfig, through: DeployStep) -> Result<()> {
    let graph = standard_graph(config)?;
    let template = render_template(&graph, through, config)?;
    println!("{}", serde_json::to_string_pretty(&template)?);
    Ok(())
}

async fn cmd_index_create(config: &AppConfig) -> Result<()> {
    let aws = connect(config).await?;
    let services = Services::from_aws(&aws)?;
    let journal = open_journal().await?;
    let progress = CliProgress::new();

    let report = Orchestrator::new(config, &services, &progress)
        .with_journal(&journal)
        .run(DeployStep::VectorIndex, DeployStep::VectorIndex)
        .await;
    progress.finish();
    for step in report?.steps {
        println!("{}", step.detail);
    }
    Ok(())
}

async fn cmd_index_recreate(config: &AppConfig, yes: bool) -> Result<()> {
    if !yes {
        return Err(eyre!(
            "recreating index '{}' deletes it and any knowledge base using it; pass --yes to confirm",
            config.stack.index_name
        ));
    }
    let aws = connect(config).await?;
    let services = Services::from_aws(&aws)?;
    let journal = open_journal().await?;
    let progress = CliProgress::new();

    let outcome = Orchestrator::new(config, &services, &progress)
        .with_journal(&journal)
        .recreate_index()
        .await;
    progress.finish();
    let outcome = outcome?;

    if let Some(kb) = &outcome.report.deleted_knowledge_base {
        println!("Deleted knowledge base {kb}");
    }
    if outcome.report.deleted_index {
        println!("Deleted index {}", config.stack.index_name);
    }
    println!("Created index {}", config.stack.index_name);
    if let Some(step) = outcome.reprovisioned_through {
        println!("Re-applied stack through step {} [{step}]", step.number());
    }
    if outcome.context.knowledge_base_id.is_some() {
        println!("Run `claimstack ingest --skip-upload` to re-index the documents.");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

async fn cmd_ingest(config: &AppConfig, docs: Option<&Path>, skip_upload: bool) -> Result<()> {
    let aws = connect(config).await?;
    let services = Services::from_aws(&aws)?;
    let journal = open_journal().await?;
    let context = deployed_context(config, &services).await?;
    let kb_id = context.require_knowledge_base_id()?;
    let data_source_id = context.require_data_source_id()?;
    let progress = CliProgress::new();

    if !skip_upload {
        let dir = docs
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(&config.ingestion.documents_dir));
        let bucket = context.require_kb_data_bucket()?;
        let upload = upload_documents(
            services.objects.as_ref(),
            bucket,
            &config.stack.source_prefix,
            &dir,
            &progress,
        )
        .await?;
        progress.phase(&format!(
            "Uploaded {} documents ({} bytes) to s3://{}/{}",
            upload.keys.len(),
            upload.bytes,
            upload.bucket,
            config.stack.source_prefix
        ));
    }

    progress.phase("Starting ingestion job");
    let job = IngestionMonitor::new(services.ingestion.as_ref(), &config.ingestion, &progress)
        .with_journal(&journal)
        .start_and_wait(kb_id, data_source_id)
        .await;
    progress.finish();
    let job = job?;

    println!("Ingestion job {} {}", job.job_id, job.status);
    Ok(())
}

async fn cmd_ingest_status(config: &AppConfig, limit: usize) -> Result<()> {
    let aws = connect(config).await?;
    let services = Services::from_aws(&aws)?;
    let context = deployed_context(config, &services).await?;
    let kb_id = context.require_knowledge_base_id()?;
    let data_source_id = context.require_data_source_id()?;

    let jobs = latest_jobs(services.ingestion.as_ref(), kb_id, data_source_id, limit).await?;
    if jobs.is_empty() {
        println!("No ingestion jobs for knowledge base {kb_id}.");
        return Ok(());
    }
    for job in jobs {
        let started = job
            .started_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into());
        println!("{:<12} {:<12} {started}", job.job_id, job.status.to_string());
        for reason in &job.failure_reasons {
            println!("    {reason}");
        }
    }
    Ok(())
}

async fn cmd_env(config: &AppConfig) -> Result<()> {
    let aws = connect(config).await?;
    let services = Services::from_aws(&aws)?;
    let context = deployed_context(config, &services).await?;
    print!("{}", context.to_env_exports());
    Ok(())
}

// ---------------------------------------------------------------------------
// Claim processing
// ---------------------------------------------------------------------------

async fn cmd_process(
    config: &AppConfig,
    bucket: Option<String>,
    key: &str,
    output_bucket: Option<String>,
    apply_filtering: bool,
) -> Result<()> {
    let aws = connect(config).await?;
    let services = Services::from_aws(&aws)?;
    let context = deployed_context(config, &services).await?;
    let input_bucket = match bucket {
        Some(b) => b,
        None => context.require_input_bucket()?.to_string(),
    };
    let output_bucket = match output_bucket {
        Some(b) => b,
        None => context.require_output_bucket()?.to_string(),
    };

    let options = ProcessOptions {
        apply_filtering,
        compare_models: Vec::new(),
    };
    let outcome = process_object(
        &analyzer(&aws, &config.models.default_model, &context),
        services.objects.as_ref(),
        &input_bucket,
        key,
        &output_bucket,
        &options,
    )
    .await?;

    println!("s3://{}/{}", outcome.output_bucket, outcome.output_key);
    if !outcome.succeeded {
        return Err(eyre!("processing {key} failed; the error is recorded in the summary"));
    }
    Ok(())
}

async fn cmd_analyze(
    config: &AppConfig,
    file: &Path,
    apply_filtering: bool,
    model: Option<String>,
) -> Result<()> {
    let text = read_text(file)?;
    let aws = connect(config).await?;
    let services = Services::from_aws(&aws)?;
    let context = deployed_context(config, &services).await?;

    let model_id = model.unwrap_or_else(|| config.models.default_model.clone());
    let analyzer = analyzer(&aws, &model_id, &context);

    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let analysis = analyzer.analyze(&text, &filename, apply_filtering).await?;
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

async fn cmd_compare(config: &AppConfig, file: &Path, models: Vec<String>) -> Result<()> {
    let text = read_text(file)?;
    let models = if models.is_empty() {
        config.models.compare.clone()
    } else {
        models
    };
    if models.is_empty() {
        return Err(eyre!("no models to compare; pass --models or set models.compare"));
    }
    let aws = connect(config).await?;
    let analyzer = ClaimAnalyzer::new(aws.models(), config.models.default_model.clone());

    let progress = CliProgress::new();
    progress.phase(&format!("Running {} models: {}", models.len(), models.join(", ")));
    let comparison = analyzer.compare(&text, &models, true).await;
    progress.finish();

    print!("{}", comparison.report());
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_arguments_accept_names_and_numbers() {
        let cli = Cli::parse_from(["claimstack", "deploy", "--from", "3", "--to", "knowledge-base"]);
        match cli.command {
            Command::Deploy { from, to, no_timeout } => {
                assert_eq!(from, DeployStep::AwaitCollection);
                assert_eq!(to, DeployStep::KnowledgeBase);
                assert!(!no_timeout);
            }
            _ => panic!("expected deploy"),
        }
    }

    #[test]
    fn compare_models_are_comma_separated() {
        let cli = Cli::parse_from(["claimstack", "compare", "claim.txt", "--models", "a,b"]);
        match cli.command {
            Command::Compare { models, .. } => assert_eq!(models, vec!["a", "b"]),
            _ => panic!("expected compare"),
        }
    }

    #[test]
    fn stack_flag_overrides_config() {
        let cli = Cli::parse_from(["claimstack", "--stack", "ClaimStackTest", "deps"]);
        let mut config = AppConfig::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.stack.name, "ClaimStackTest");
    }

    #[test]
    fn region_and_profile_flags_override_config() {
        let cli = Cli::parse_from([
            "claimstack",
            "--region",
            "eu-central-1",
            "--profile",
            "claims",
            "deps",
        ]);
        let mut config = AppConfig::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.aws.region, "eu-central-1");
        assert_eq!(config.aws.profile.as_deref(), Some("claims"));
    }

    #[test]
    fn log_format_defaults_to_text() {
        let cli = Cli::parse_from(["claimstack", "deps"]);
        assert_eq!(cli.log_format, LogFormat::Text);
        let cli = Cli::parse_from(["claimstack", "--log-format", "json", "deps"]);
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
