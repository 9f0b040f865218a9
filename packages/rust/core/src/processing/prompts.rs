//! Named prompt templates with `{placeholder}` substitution.

use std::collections::BTreeMap;

use claimstack_shared::{ClaimStackError, Result};

pub const EXTRACT_INFO: &str = "extract_info";
pub const GENERATE_SUMMARY: &str = "generate_summary";
pub const COMPARE_SUMMARY: &str = "compare_summary";

const EXTRACT_INFO_TEMPLATE: &str = "Extract the following information from this document:
- Claimant Name
- Policy Number
- Incident Date
- Claim Amount
- Incident Description

Document:
{document_text}

Return the information in JSON format.";

const GENERATE_SUMMARY_TEMPLATE: &str = "Based on this extracted information:
{extracted_info}

Generate a concise summary of the claim in 2-3 sentences.";

const COMPARE_SUMMARY_TEMPLATE: &str = "Compare these two summaries and identify key differences:

Summary 1 (Model: {model1}):
{summary1}

Summary 2 (Model: {model2}):
{summary2}

Provide a brief comparison.";

#[derive(Debug, Clone)]
pub struct PromptTemplates {
    templates: BTreeMap<String, String>,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        let templates = [
            (EXTRACT_INFO, EXTRACT_INFO_TEMPLATE),
            (GENERATE_SUMMARY, GENERATE_SUMMARY_TEMPLATE),
            (COMPARE_SUMMARY, COMPARE_SUMMARY_TEMPLATE),
        ]
        .into_iter()
        .map(|(name, body)| (name.to_string(), body.to_string()))
        .collect();
        Self { templates }
    }
}

impl PromptTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a template.
    pub fn insert(&mut self, name: impl Into<String>, template: impl Into<String>) {
        self.templates.insert(name.into(), template.into());
    }

    pub fn names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }

    /// Fill a template in one pass: substituted values are never re-scanned,
    /// so document text containing `{...}` is inserted verbatim.
    pub fn render(&self, name: &str, values: &[(&str, &str)]) -> Result<String> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| ClaimStackError::validation(format!("template {name} not found")))?;

        let mut out = String::with_capacity(template.len());
        let mut rest = template.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let placeholder = after.find('}').map(|close| &after[..close]);
            match placeholder {
                Some(key) if is_placeholder(key) => {
                    let value = values
                        .iter()
                        .find(|(k, _)| *k == key)
                        .map(|(_, v)| *v)
                        .ok_or_else(|| {
                            ClaimStackError::validation(format!(
                                "template {name} needs a value for {{{key}}}"
                            ))
                        })?;
                    out.push_str(value);
                    rest = &after[key.len() + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    pub fn extract_info(&self, document_text: &str) -> Result<String> {
        self.render(EXTRACT_INFO, &[("document_text", document_text)])
    }

    pub fn generate_summary(&self, extracted_info: &str) -> Result<String> {
        self.render(GENERATE_SUMMARY, &[("extracted_info", extracted_info)])
    }

    pub fn compare_summary(
        &self,
        model1: &str,
        summary1: &str,
        model2: &str,
        summary2: &str,
    ) -> Result<String> {
        self.render(
            COMPARE_SUMMARY,
            &[
                ("model1", model1),
                ("summary1", summary1),
                ("model2", model2),
                ("summary2", summary2),
            ],
        )
    }
}

fn is_placeholder(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
