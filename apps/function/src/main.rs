//! claimstack-function: the processing function behind the input bucket.
//!
//! Runs on the `provided.al2023` Lambda runtime. Each S3 `ObjectCreated`
//! event is analysed and summarised into the output bucket.

mod handler;

use aws_lambda_events::event::s3::S3Event;
use lambda_runtime::{Error, LambdaEvent, service_fn};
use tracing::info;

use claimstack_cloud::AwsServices;
use claimstack_core::processing::ClaimAnalyzer;

use crate::handler::{FunctionSettings, Processor};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("claimstack=info"));
    // CloudWatch stamps each line itself.
    fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(false)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();

    let settings = FunctionSettings::from_env()?;
    let aws = AwsServices::load(&settings.region, None).await?;

    let mut analyzer = ClaimAnalyzer::new(aws.models(), settings.model_id.clone());
    if let Some(kb_id) = &settings.knowledge_base_id {
        analyzer = analyzer.with_knowledge_base(aws.retriever(), kb_id.clone());
    }
    info!(
        model = %settings.model_id,
        output_bucket = %settings.output_bucket,
        knowledge_base = settings.knowledge_base_id.as_deref().unwrap_or("-"),
        apply_filtering = settings.options.apply_filtering,
        "processing function ready"
    );

    let processor = Processor::new(analyzer, aws.objects(), settings);
    let processor = &processor;
    lambda_runtime::run(service_fn(move |event: LambdaEvent<S3Event>| async move {
        let report = processor.handle(&event.payload).await?;
        Ok::<_, Error>(report)
    }))
    .await
}
