//! S3 event handling.
//!
//! Every record of an event names one uploaded document. Each is analysed
//! and summarised independently; a document that cannot be read or analysed
//! still gets an error record in the output bucket.

use std::sync::Arc;

use aws_lambda_events::event::s3::S3Event;
use serde::Serialize;
use tracing::{info, instrument, warn};

use claimstack_cloud::ObjectStore;
use claimstack_core::processing::{ClaimAnalyzer, ProcessOptions, ProcessOutcome, process_object};
use claimstack_shared::{AwsConfig, ClaimStackError, ModelsConfig, Result};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Settings taken from the environment the stack gives the function.
#[derive(Debug, Clone)]
pub(crate) struct FunctionSettings {
    pub region: String,
    pub output_bucket: String,
    pub knowledge_base_id: Option<String>,
    pub model_id: String,
    pub options: ProcessOptions,
}

impl FunctionSettings {
    pub(crate) fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let value = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let output_bucket = value("OUTPUT_BUCKET")
            .ok_or_else(|| ClaimStackError::operator("OUTPUT_BUCKET is not set"))?;
        let apply_filtering = match value("APPLY_FILTERING") {
            None => true,
            Some(raw) => parse_flag(&raw).ok_or_else(|| {
                ClaimStackError::config(format!("APPLY_FILTERING must be true or false, got {raw:?}"))
            })?,
        };
        let compare_models = value("COMPARE_MODELS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            region: value("AWS_REGION").unwrap_or_else(|| AwsConfig::default().region),
            output_bucket,
            knowledge_base_id: value("KNOWLEDGE_BASE_ID"),
            model_id: value("DEFAULT_MODEL_ID")
                .unwrap_or_else(|| ModelsConfig::default().default_model),
            options: ProcessOptions {
                apply_filtering,
                compare_models,
            },
        })
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Event records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

/// The objects an event names. Records without a bucket or key are skipped.
pub(crate) fn object_refs(event: &S3Event) -> Vec<ObjectRef> {
    event
        .records
        .iter()
        .filter_map(|record| {
            let bucket = record.s3.bucket.name.clone().filter(|b| !b.is_empty());
            let key = record
                .s3
                .object
                .key
                .as_deref()
                .map(decode_key)
                .filter(|k| !k.is_empty());
            match (bucket, key) {
                (Some(bucket), Some(key)) => Some(ObjectRef { bucket, key }),
                _ => {
                    warn!("event record without bucket or object key, skipping");
                    None
                }
            }
        })
        .collect()
}

/// Keys arrive form-encoded (`+` for spaces, `%XX` escapes).
fn decode_key(raw: &str) -> String {
    url::form_urlencoded::parse(raw.as_bytes())
        .next()
        .map(|(key, _)| key.into_owned())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

/// What one invocation did, returned to the runtime.
#[derive(Debug, Default, Serialize)]
pub(crate) struct BatchReport {
    pub processed: usize,
    pub failed: usize,
    pub outputs: Vec<ProcessOutcome>,
}

pub(crate) struct Processor {
    analyzer: ClaimAnalyzer,
    objects: Arc<dyn ObjectStore>,
    settings: FunctionSettings,
}

impl Processor {
    pub(crate) fn new(
        analyzer: ClaimAnalyzer,
        objects: Arc<dyn ObjectStore>,
        settings: FunctionSettings,
    ) -> Self {
        Self {
            analyzer,
            objects,
            settings,
        }
    }

    /// Summarise every object in the event. Only a failure to write a
    /// summary record fails the invocation.
    #[instrument(skip_all, fields(records = event.records.len()))]
    pub(crate) async fn handle(&self, event: &S3Event) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for object in object_refs(event) {
            info!(bucket = %object.bucket, key = %object.key, "processing document");
            let outcome = process_object(
                &self.analyzer,
                self.objects.as_ref(),
                &object.bucket,
                &object.key,
                &self.settings.output_bucket,
                &self.settings.options,
            )
            .await?;

            if outcome.succeeded {
                report.processed += 1;
            } else {
                report.failed += 1;
            }
            info!(
                output = %format!("s3://{}/{}", outcome.output_bucket, outcome.output_key),
                succeeded = outcome.succeeded,
                "summary written"
            );
            report.outputs.push(outcome);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use aws_lambda_events::event::s3::S3EventRecord;
    use serde_json::{Value, json};

    use claimstack_cloud::{MemoryObjectStore, ModelRuntime};

    use super::*;

    const MODEL: &str = "anthropic.claude-3-haiku-20240307-v1:0";

    struct CannedRuntime;

    #[async_trait]
    impl ModelRuntime for CannedRuntime {
        async fn invoke(&self, _model_id: &str, body: &Value) -> Result<Value> {
            let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();
            let text = if prompt.contains("Extract the following") {
                r#"{"claimant_name": "Jane Doe", "claim_amount": "$4,250"}"#
            } else {
                "Rear-end collision, claim of $4,250."
            };
            Ok(json!({ "content": [{ "type": "text", "text": text }] }))
        }
    }

    fn record(bucket: Option<&str>, key: Option<&str>) -> S3EventRecord {
        let mut record = S3EventRecord::default();
        record.s3.bucket.name = bucket.map(String::from);
        record.s3.object.key = key.map(String::from);
        record
    }

    fn event(records: Vec<S3EventRecord>) -> S3Event {
        let mut event = S3Event::default();
        event.records = records;
        event
    }

    fn settings() -> FunctionSettings {
        let env: HashMap<&str, &str> = HashMap::from([
            ("OUTPUT_BUCKET", "output"),
            ("DEFAULT_MODEL_ID", MODEL),
        ]);
        FunctionSettings::from_lookup(|name| env.get(name).map(|v| v.to_string()))
            .expect("settings")
    }

    #[test]
    fn settings_follow_the_function_environment() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("AWS_REGION", "eu-west-1"),
            ("OUTPUT_BUCKET", "claims-output"),
            ("KNOWLEDGE_BASE_ID", "KB123"),
            ("APPLY_FILTERING", "false"),
            ("COMPARE_MODELS", "a, b,,"),
        ]);
        let settings =
            FunctionSettings::from_lookup(|name| env.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(settings.region, "eu-west-1");
        assert_eq!(settings.output_bucket, "claims-output");
        assert_eq!(settings.knowledge_base_id.as_deref(), Some("KB123"));
        assert_eq!(settings.model_id, ModelsConfig::default().default_model);
        assert!(!settings.options.apply_filtering);
        assert_eq!(settings.options.compare_models, vec!["a", "b"]);
    }

    #[test]
    fn missing_output_bucket_is_an_operator_error() {
        let err = FunctionSettings::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, ClaimStackError::Operator { .. }), "{err}");

        let err = FunctionSettings::from_lookup(|name| match name {
            "OUTPUT_BUCKET" => Some("out".into()),
            "APPLY_FILTERING" => Some("maybe".into()),
            _ => None,
        })
        .unwrap_err();
        assert!(err.to_string().contains("APPLY_FILTERING"));
    }

    #[test]
    fn event_keys_are_decoded_and_incomplete_records_skipped() {
        let refs = object_refs(&event(vec![
            record(Some("input"), Some("documents/auto+claim%282%29.txt")),
            record(Some("input"), None),
            record(None, Some("documents/other.txt")),
        ]));
        assert_eq!(
            refs,
            vec![ObjectRef {
                bucket: "input".into(),
                key: "documents/auto claim(2).txt".into(),
            }]
        );
    }

    #[tokio::test]
    async fn every_record_gets_a_summary() {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put_object(
                "input",
                "documents/auto claim.txt",
                b"Auto accident claim. The vehicle was rear-ended on 2024-03-14.".to_vec(),
                "text/plain",
            )
            .await
            .unwrap();

        let processor = Processor::new(
            ClaimAnalyzer::new(Arc::new(CannedRuntime), MODEL),
            store.clone(),
            settings(),
        );
        let report = processor
            .handle(&event(vec![
                record(Some("input"), Some("documents/auto+claim.txt")),
                record(Some("input"), Some("documents/missing.txt")),
            ]))
            .await
            .expect("handled");

        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);

        let body = store
            .get_object("output", "summaries/auto claim.txt.json")
            .await
            .unwrap()
            .expect("summary");
        let summary: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(summary["status"], "processed");

        let body = store
            .get_object("output", "summaries/missing.txt.json")
            .await
            .unwrap()
            .expect("error record");
        let summary: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(summary["status"], "error");
    }
}
