//! claimstack-web: demo web application for claim analysis.
//!
//! Serves uploads, claim analysis with policy context and masking, model
//! comparisons, and feedback collection over the deployed stack's buckets,
//! models, and knowledge base.

mod error;
mod routes;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing::{info, warn};

use claimstack_cloud::AwsServices;
use claimstack_core::feedback::FeedbackStore;
use claimstack_core::processing::ClaimAnalyzer;
use claimstack_shared::{AppConfig, DeploymentContext, LogFormat, load_config, load_config_from};

use crate::state::AppState;

/// Serve the claim analysis demo application.
#[derive(Parser)]
#[command(name = "claimstack-web", version, long_about = None)]
struct Args {
    /// Address to listen on (defaults to `web.bind`).
    #[arg(long, env = "CLAIMSTACK_BIND")]
    bind: Option<String>,

    /// Config file (defaults to ~/.claimstack/claimstack.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    #[arg(long, env = "CLAIMSTACK_STACK")]
    stack: Option<String>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text")]
    log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(args: &Args) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match args.verbose {
        0 => "claimstack=info,tower_http=info",
        1 => "claimstack=debug,tower_http=debug",
        _ => "claimstack=trace,tower_http=trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match args.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

fn resolve_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(region) = &args.region {
        config.aws.region = region.clone();
    }
    if let Some(stack) = &args.stack {
        config.stack.name = stack.clone();
    }
    if let Some(bind) = &args.bind {
        config.web.bind = bind.clone();
    }
    Ok(config)
}

/// Environment first, then stack outputs where the stack can be read.
async fn discover_context(config: &AppConfig, aws: &AwsServices) -> DeploymentContext {
    let mut context = DeploymentContext::from_env(&config.aws.region, &config.stack.name);
    match aws.provisioner().describe_stack(&config.stack.name).await {
        Ok(Some(stack)) => context.absorb(&stack.outputs),
        Ok(None) => warn!(stack = %config.stack.name, "stack not found, using environment only"),
        Err(e) => warn!(error = %e, "could not read stack outputs, using environment only"),
    }
    context
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    init_tracing(&args);

    let config = resolve_config(&args)?;
    let aws = AwsServices::load(&config.aws.region, config.aws.profile.as_deref()).await?;
    let context = discover_context(&config, &aws).await;

    let mut analyzer = ClaimAnalyzer::new(aws.models(), config.models.default_model.clone());
    if let Some(kb_id) = &context.knowledge_base_id {
        analyzer = analyzer.with_knowledge_base(aws.retriever(), kb_id.clone());
    }
    let objects = aws.objects();
    let feedback = context
        .feedback_bucket
        .clone()
        .map(|bucket| FeedbackStore::new(objects.clone(), bucket));

    info!(
        input_bucket = context.input_bucket.as_deref().unwrap_or("-"),
        output_bucket = context.output_bucket.as_deref().unwrap_or("-"),
        knowledge_base = context.knowledge_base_id.as_deref().unwrap_or("-"),
        "resources resolved"
    );

    let bind = config.web.bind.clone();
    let state = AppState {
        analyzer,
        objects,
        input_bucket: context.input_bucket,
        output_bucket: context.output_bucket,
        feedback,
        models: config.models,
        web: config.web,
    };
    let app = routes::router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .wrap_err_with(|| format!("cannot listen on {bind}"))?;
    info!(address = %bind, "claimstack-web listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_flag_matches_the_cli() {
        let args = Args::parse_from(["claimstack-web"]);
        assert_eq!(args.log_format, LogFormat::Text);
        let args = Args::parse_from(["claimstack-web", "--log-format", "json"]);
        assert_eq!(args.log_format, LogFormat::Json);
        assert!(Args::try_parse_from(["claimstack-web", "--json-logs"]).is_err());
    }
}
