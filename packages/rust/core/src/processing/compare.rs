//! Side-by-side runs of several models over one document.

use std::time::Instant;

use serde::Serialize;
use tracing::{info, instrument, warn};

use super::ClaimAnalyzer;
use super::invoke::{SUMMARY_TEMPERATURE, generate};

#[derive(Debug, Clone, Serialize)]
pub struct ModelRun {
    pub model_id: String,
    pub success: bool,
    pub time_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub results: Vec<ModelRun>,
    pub models_compared: usize,
    /// Model-written comparison of the first two successful summaries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
}

const PREVIEW_CHARS: usize = 200;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl Comparison {
    /// Plain-text report of every run.
    pub fn report(&self) -> String {
        let rule = "-".repeat(50);
        let mut out = format!("Model Comparison Report\n{}\n\n", "=".repeat(50));
        for run in &self.results {
            out.push_str(&format!("Model: {}\n", run.model_id));
            out.push_str(&format!(
                "Status: {}\n",
                if run.success { "Success" } else { "Failed" }
            ));
            out.push_str(&format!("Processing Time: {}s\n", run.time_seconds));
            match (&run.summary, &run.error) {
                (Some(summary), _) => {
                    let preview: String = summary.chars().take(PREVIEW_CHARS).collect();
                    out.push_str(&format!("Summary Length: {} chars\n", summary.chars().count()));
                    out.push_str(&format!("Summary: {preview}...\n"));
                }
                (None, Some(error)) => out.push_str(&format!("Error: {error}\n")),
                (None, None) => {}
            }
            out.push_str(&format!("\n{rule}\n\n"));
        }
        if let Some(analysis) = &self.analysis {
            out.push_str(&format!("Comparison:\n{analysis}\n"));
        }
        out
    }
}

impl ClaimAnalyzer {
    /// Process `text` with each model in turn. A failing model is recorded
    /// and the remaining models still run.
    #[instrument(skip_all, fields(models = models.len()))]
    pub async fn compare(&self, text: &str, models: &[String], with_analysis: bool) -> Comparison {
        let mut results = Vec::with_capacity(models.len());
        for model_id in models {
            let started = Instant::now();
            let run = match self.process_document(text, model_id).await {
                Ok(doc) => ModelRun {
                    model_id: model_id.clone(),
                    success: true,
                    time_seconds: round2(started.elapsed().as_secs_f64()),
                    summary_length: Some(doc.summary.chars().count()),
                    extracted_info: Some(doc.extracted_info),
                    summary: Some(doc.summary),
                    error: None,
                },
                Err(e) => {
                    warn!(model_id = %model_id, error = %e, "model run failed");
                    ModelRun {
                        model_id: model_id.clone(),
                        success: false,
                        time_seconds: round2(started.elapsed().as_secs_f64()),
                        extracted_info: None,
                        summary: None,
                        summary_length: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            info!(model_id = %run.model_id, success = run.success, secs = run.time_seconds, "model run finished");
            results.push(run);
        }

        let analysis = if with_analysis {
            self.analyse_differences(&results).await
        } else {
            None
        };
        Comparison {
            models_compared: results.len(),
            results,
            analysis,
        }
    }

    async fn analyse_differences(&self, results: &[ModelRun]) -> Option<String> {
        let mut successful = results
            .iter()
            .filter_map(|r| r.summary.as_deref().map(|s| (r.model_id.as_str(), s)));
        let (model1, summary1) = successful.next()?;
        let (model2, summary2) = successful.next()?;

        let prompt = match self
            .prompts
            .compare_summary(model1, summary1, model2, summary2)
        {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(error = %e, "could not build comparison prompt");
                return None;
            }
        };
        match generate(
            self.runtime.as_ref(),
            &self.model_id,
            &prompt,
            SUMMARY_TEMPERATURE,
        )
        .await
        {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(error = %e, "comparison analysis failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::fakes::FakeRuntime;

    const HAIKU: &str = "anthropic.claude-3-haiku-20240307-v1:0";
    const SONNET: &str = "anthropic.claude-3-sonnet-20240229-v1:0";
    const OSS: &str = "openai.gpt-oss-120b-1:0";

    #[tokio::test]
    async fn failing_model_does_not_stop_the_others() {
        let runtime = Arc::new(FakeRuntime::failing(OSS));
        let analyzer = ClaimAnalyzer::new(runtime, SONNET);
        let models = vec![HAIKU.to_string(), OSS.to_string(), SONNET.to_string()];

        let comparison = analyzer.compare("A car accident.", &models, false).await;
        assert_eq!(comparison.models_compared, 3);
        let outcomes: Vec<bool> = comparison.results.iter().map(|r| r.success).collect();
        assert_eq!(outcomes, vec![true, false, true]);
        assert!(comparison.results[1].error.as_deref().unwrap().contains("Throttling"));

        let report = comparison.report();
        assert!(report.starts_with("Model Comparison Report"));
        assert!(report.contains("Status: Failed"));
        assert!(report.contains(&format!("Model: {SONNET}")));
    }

    #[tokio::test]
    async fn analysis_compares_first_two_summaries() {
        let runtime = Arc::new(FakeRuntime::default());
        let analyzer = ClaimAnalyzer::new(runtime.clone(), SONNET);
        let models = vec![HAIKU.to_string(), SONNET.to_string()];

        let comparison = analyzer.compare("A car accident.", &models, true).await;
        assert!(comparison.analysis.as_deref().unwrap().contains("Both summaries"));
        let last_prompt = runtime.prompts().last().cloned().unwrap().1;
        assert!(last_prompt.contains(&format!("Summary 1 (Model: {HAIKU})")));
    }

    #[test]
    fn report_truncates_long_summaries() {
        let comparison = Comparison {
            results: vec![ModelRun {
                model_id: HAIKU.into(),
                success: true,
                time_seconds: 1.25,
                extracted_info: Some("{}".into()),
                summary: Some("x".repeat(500)),
                summary_length: Some(500),
                error: None,
            }],
            models_compared: 1,
            analysis: None,
        };
        let report = comparison.report();
        assert!(report.contains("Summary Length: 500 chars"));
        assert!(report.contains(&format!("Summary: {}...", "x".repeat(200))));
        assert!(!report.contains(&"x".repeat(201)));
    }
}
