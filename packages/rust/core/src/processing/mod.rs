//! Claim document analysis.
//!
//! Everything here runs against the [`ModelRuntime`] and [`Retriever`]
//! seams: the web application calls [`ClaimAnalyzer::analyze`] directly and
//! the processing function runs [`process_object`] for each new document in
//! the input bucket.

pub mod claims;
pub mod compare;
pub mod invoke;
pub mod prompts;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, instrument};

use claimstack_cloud::{ModelRuntime, ObjectStore, Retriever};
use claimstack_filter::{ContentFilter, Detection};
use claimstack_shared::{ClaimStackError, Result};

use self::claims::{ClaimType, PolicyContext, Validation, retrieve_policy_context, validate_completeness};
use self::invoke::{EXTRACT_TEMPERATURE, SUMMARY_TEMPERATURE, generate};
use self::prompts::PromptTemplates;

pub use self::compare::{Comparison, ModelRun};

/// Passages requested from the knowledge base per claim.
pub const DEFAULT_MAX_RESULTS: u32 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedDocument {
    pub extracted_info: String,
    pub summary: String,
}

/// A detection without the matched text.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionSummary {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub start: usize,
    pub end: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
}

impl From<&Detection> for DetectionSummary {
    fn from(d: &Detection) -> Self {
        Self {
            kind: d.kind.clone(),
            description: d.description.clone(),
            start: d.start,
            end: d.end,
            replacement: d.replacement.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FilteringOutcome {
    pub applied: bool,
    pub detections: usize,
    pub by_type: BTreeMap<String, usize>,
    pub details: Vec<DetectionSummary>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EnrichmentStats {
    pub base_length: usize,
    pub enriched_length: usize,
    pub context_added: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimAnalysis {
    pub filename: String,
    pub model_id: String,
    pub claim_type: ClaimType,
    pub policy_context: PolicyContext,
    pub content_filtering: FilteringOutcome,
    pub extracted_info: String,
    pub summary: String,
    pub validation: Validation,
    pub prompt_enrichment: EnrichmentStats,
}

pub struct ClaimAnalyzer {
    runtime: Arc<dyn ModelRuntime>,
    knowledge_base: Option<(Arc<dyn Retriever>, String)>,
    prompts: PromptTemplates,
    filter: ContentFilter,
    model_id: String,
    max_results: u32,
}

impl ClaimAnalyzer {
    pub fn new(runtime: Arc<dyn ModelRuntime>, model_id: impl Into<String>) -> Self {
        Self {
            runtime,
            knowledge_base: None,
            prompts: PromptTemplates::default(),
            filter: ContentFilter::new(),
            model_id: model_id.into(),
            max_results: DEFAULT_MAX_RESULTS,
        }
    }

    /// Retrieve policy context from a knowledge base instead of the
    /// built-in guidance.
    pub fn with_knowledge_base(mut self, retriever: Arc<dyn Retriever>, kb_id: impl Into<String>) -> Self {
        self.knowledge_base = Some((retriever, kb_id.into()));
        self
    }

    pub fn with_prompts(mut self, prompts: PromptTemplates) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_filter(mut self, filter: ContentFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn filter(&self) -> &ContentFilter {
        &self.filter
    }

    pub fn has_knowledge_base(&self) -> bool {
        self.knowledge_base.is_some()
    }

    /// Extract the claim fields, then summarise them.
    pub async fn process_document(&self, text: &str, model_id: &str) -> Result<ProcessedDocument> {
        let prompt = self.prompts.extract_info(text)?;
        self.extract_and_summarise(&prompt, model_id).await
    }

    async fn extract_and_summarise(&self, extract_prompt: &str, model_id: &str) -> Result<ProcessedDocument> {
        let extracted_info =
            generate(self.runtime.as_ref(), model_id, extract_prompt, EXTRACT_TEMPERATURE).await?;
        let summary_prompt = self.prompts.generate_summary(&extracted_info)?;
        let summary =
            generate(self.runtime.as_ref(), model_id, &summary_prompt, SUMMARY_TEMPERATURE).await?;
        Ok(ProcessedDocument {
            extracted_info,
            summary,
        })
    }

    /// Full analysis of one claim: mask, classify, retrieve policy context,
    /// extract and summarise with the enriched prompt, check completeness,
    /// and mask the model outputs.
    #[instrument(skip_all, fields(filename = %filename, apply_filtering = apply_filtering))]
    pub async fn analyze(&self, text: &str, filename: &str, apply_filtering: bool) -> Result<ClaimAnalysis> {
        let (process_text, content_filtering) = if apply_filtering {
            let result = self.filter.filter(text, None);
            let outcome = FilteringOutcome {
                applied: true,
                detections: result.summary.total_detections,
                by_type: result.summary.by_type.clone(),
                details: result.detections.iter().map(DetectionSummary::from).collect(),
            };
            (result.filtered_text, outcome)
        } else {
            let outcome = FilteringOutcome {
                applied: false,
                detections: 0,
                by_type: BTreeMap::new(),
                details: Vec::new(),
            };
            (text.to_string(), outcome)
        };

        let claim_type = ClaimType::classify(&process_text);
        let knowledge_base = self
            .knowledge_base
            .as_ref()
            .map(|(retriever, kb_id)| (retriever.as_ref(), kb_id.as_str()));
        let policy_context =
            retrieve_policy_context(knowledge_base, &process_text, self.max_results).await;

        let base_prompt = self.prompts.extract_info(&process_text)?;
        let enriched_prompt = format!("{}{base_prompt}", policy_context.context_block());
        let base_length = base_prompt.chars().count();
        let enriched_length = enriched_prompt.chars().count();

        let doc = self
            .extract_and_summarise(&enriched_prompt, &self.model_id)
            .await?;
        let validation = validate_completeness(&doc.extracted_info, claim_type, &policy_context);

        let (extracted_info, summary) = if apply_filtering {
            (self.filter.mask(&doc.extracted_info), self.filter.mask(&doc.summary))
        } else {
            (doc.extracted_info, doc.summary)
        };

        info!(
            claim_type = %claim_type,
            source = policy_context.source(),
            detections = content_filtering.detections,
            complete = validation.is_complete,
            "claim analysed"
        );
        Ok(ClaimAnalysis {
            filename: filename.to_string(),
            model_id: self.model_id.clone(),
            claim_type,
            policy_context,
            content_filtering,
            extracted_info,
            summary,
            validation,
            prompt_enrichment: EnrichmentStats {
                base_length,
                enriched_length,
                context_added: enriched_length - base_length,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Processing function
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub apply_filtering: bool,
    /// Extra models to run side by side; empty skips the comparison.
    pub compare_models: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub output_bucket: String,
    pub output_key: String,
    pub succeeded: bool,
}

/// `summaries/<file name>.json` for an input key.
pub fn summary_key(input_key: &str) -> String {
    let name = input_key.rsplit('/').next().unwrap_or(input_key);
    format!("summaries/{name}.json")
}

async fn read_document(objects: &dyn ObjectStore, bucket: &str, key: &str) -> Result<String> {
    let bytes = objects
        .get_object(bucket, key)
        .await?
        .ok_or_else(|| ClaimStackError::external("s3", format!("s3://{bucket}/{key} does not exist")))?;
    String::from_utf8(bytes)
        .map_err(|_| ClaimStackError::validation(format!("s3://{bucket}/{key} is not UTF-8 text")))
}

/// Analyse one input object and write its summary record. Failures of the
/// read or of any model call still produce a record (with `status: error`);
/// only a failure to write the record itself is returned.
#[instrument(skip_all, fields(input = %format!("s3://{input_bucket}/{key}")))]
pub async fn process_object(
    analyzer: &ClaimAnalyzer,
    objects: &dyn ObjectStore,
    input_bucket: &str,
    key: &str,
    output_bucket: &str,
    options: &ProcessOptions,
) -> Result<ProcessOutcome> {
    let processed_at = Utc::now().to_rfc3339();
    let analysed = match read_document(objects, input_bucket, key).await {
        Ok(text) => {
            let filename = key.rsplit('/').next().unwrap_or(key);
            match analyzer.analyze(&text, filename, options.apply_filtering).await {
                Ok(analysis) => {
                    let comparison = if options.compare_models.is_empty() {
                        None
                    } else {
                        let source = if options.apply_filtering {
                            analyzer.filter().mask(&text)
                        } else {
                            text
                        };
                        Some(analyzer.compare(&source, &options.compare_models, false).await)
                    };
                    Ok((analysis, comparison))
                }
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    };

    let (record, succeeded) = match analysed {
        Ok((analysis, comparison)) => (
            json!({
                "input_file": key,
                "processed_at": processed_at,
                "model_used": analyzer.model_id(),
                "status": "processed",
                "claim_type": analysis.claim_type,
                "extracted_info": analysis.extracted_info,
                "summary": analysis.summary,
                "validation": analysis.validation,
                "policy_source": analysis.policy_context.source(),
                "content_filtering": analysis.content_filtering,
                "comparison": comparison,
            }),
            true,
        ),
        Err(e) => {
            error!(error = %e, "processing failed, writing error record");
            (
                json!({
                    "input_file": key,
                    "processed_at": processed_at,
                    "model_used": analyzer.model_id(),
                    "status": "error",
                    "error": e.to_string(),
                }),
                false,
            )
        }
    };

    let output_key = summary_key(key);
    let body = serde_json::to_vec_pretty(&record)?;
    objects
        .put_object(output_bucket, &output_key, body, "application/json")
        .await?;
    info!(output = %format!("s3://{output_bucket}/{output_key}"), succeeded, "summary written");

    Ok(ProcessOutcome {
        output_bucket: output_bucket.to_string(),
        output_key,
        succeeded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeRetriever, FakeRuntime};
    use claimstack_cloud::{MemoryObjectStore, RetrievedPassage};

    const MODEL: &str = "anthropic.claude-3-sonnet-20240229-v1:0";

    const AUTO_CLAIM: &str = "Claimant: Jane Doe
Policy Number: AUTO-2024-778899
SSN: 123-45-6789
Date of incident: 2024-03-14
My car was rear-ended at a stop light. The other driver admitted fault.
Police report number 24-1187. Estimated repair: $4,250.";

    #[tokio::test]
    async fn filtered_auto_claim_leaks_no_sensitive_values() {
        let runtime = Arc::new(FakeRuntime::default());
        let analyzer = ClaimAnalyzer::new(runtime.clone(), MODEL);

        let analysis = analyzer
            .analyze(AUTO_CLAIM, "auto_claim.txt", true)
            .await
            .expect("analysis");
        assert_eq!(analysis.claim_type, ClaimType::Auto);
        assert!(analysis.content_filtering.detections >= 2);

        let body = serde_json::to_string(&analysis).unwrap();
        assert!(!body.contains("123-45-6789"));
        assert!(!body.contains("AUTO-2024-778899"));
        assert!(body.contains(r#""claim_type":"auto""#));
        assert!(
            analysis
                .extracted_info
                .contains(r#""policy_number": "POL-XXXXXXXX""#),
            "{}",
            analysis.extracted_info
        );

        let (_, extract_prompt) = runtime.prompts()[0].clone();
        assert!(extract_prompt.starts_with("\nPOLICY CONTEXT:"));
        assert!(!extract_prompt.contains("123-45-6789"));
        assert!(analysis.prompt_enrichment.context_added > 0);
    }

    #[tokio::test]
    async fn unfiltered_analysis_keeps_model_output() {
        let analyzer = ClaimAnalyzer::new(Arc::new(FakeRuntime::default()), MODEL);
        let analysis = analyzer.analyze(AUTO_CLAIM, "c.txt", false).await.unwrap();
        assert!(!analysis.content_filtering.applied);
        assert!(analysis.extracted_info.contains("123-45-6789"));
        assert_eq!(analysis.validation.source, "fallback");
    }

    #[tokio::test]
    async fn knowledge_base_passages_enrich_the_prompt() {
        let runtime = Arc::new(FakeRuntime::default());
        let retriever = Arc::new(FakeRetriever {
            passages: vec![RetrievedPassage {
                text: "Collision claims require the police report number.".into(),
                score: Some(0.82),
                source: Some("s3://kb-data/policies/auto.txt".into()),
            }],
            fail: false,
        });
        let analyzer =
            ClaimAnalyzer::new(runtime.clone(), MODEL).with_knowledge_base(retriever, "KB1");

        let analysis = analyzer.analyze(AUTO_CLAIM, "c.txt", true).await.unwrap();
        assert_eq!(analysis.policy_context.source(), "bedrock_kb");
        assert_eq!(analysis.validation.source, "bedrock_kb");
        let (_, prompt) = runtime.prompts()[0].clone();
        assert!(prompt.contains("1. Collision claims require the police report number."));
    }

    #[tokio::test]
    async fn process_object_writes_summary_record() {
        let store = MemoryObjectStore::new();
        store
            .put_object("input", "documents/20240314_claim.txt", AUTO_CLAIM.into(), "text/plain")
            .await
            .unwrap();
        let analyzer = ClaimAnalyzer::new(Arc::new(FakeRuntime::default()), MODEL);
        let options = ProcessOptions {
            apply_filtering: true,
            compare_models: vec![],
        };

        let outcome = process_object(
            &analyzer,
            &store,
            "input",
            "documents/20240314_claim.txt",
            "output",
            &options,
        )
        .await
        .unwrap();
        assert!(outcome.succeeded);
        assert_eq!(outcome.output_key, "summaries/20240314_claim.txt.json");

        let body = store.get_object("output", &outcome.output_key).await.unwrap().unwrap();
        let record: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(record["status"], "processed");
        assert_eq!(record["claim_type"], "auto");
        assert_eq!(record["model_used"], MODEL);
        assert!(!String::from_utf8(body).unwrap().contains("123-45-6789"));
    }

    #[tokio::test]
    async fn model_failure_still_writes_error_record() {
        let store = MemoryObjectStore::new();
        store
            .put_object("input", "documents/claim.txt", AUTO_CLAIM.into(), "text/plain")
            .await
            .unwrap();
        let analyzer = ClaimAnalyzer::new(Arc::new(FakeRuntime::failing(MODEL)), MODEL);

        let outcome = process_object(
            &analyzer,
            &store,
            "input",
            "documents/claim.txt",
            "output",
            &ProcessOptions::default(),
        )
        .await
        .unwrap();
        assert!(!outcome.succeeded);

        let body = store.get_object("output", "summaries/claim.txt.json").await.unwrap().unwrap();
        let record: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(record["status"], "error");
        assert!(record["error"].as_str().unwrap().contains("ThrottlingException"));
    }

    #[tokio::test]
    async fn missing_input_still_writes_error_record() {
        let store = MemoryObjectStore::new();
        let analyzer = ClaimAnalyzer::new(Arc::new(FakeRuntime::default()), MODEL);
        let outcome = process_object(
            &analyzer,
            &store,
            "input",
            "documents/gone.txt",
            "output",
            &ProcessOptions::default(),
        )
        .await
        .unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn summary_keys_use_the_file_name() {
        assert_eq!(summary_key("documents/a/b.txt"), "summaries/b.txt.json");
        assert_eq!(summary_key("plain.txt"), "summaries/plain.txt.json");
    }
}
