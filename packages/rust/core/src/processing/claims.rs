//! Claim classification, policy guidance, and completeness checks.

use serde::Serialize;
use tracing::{debug, warn};

use claimstack_cloud::{RetrievedPassage, Retriever};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimType {
    Auto,
    Property,
    Medical,
    General,
}

const AUTO_WORDS: &[&str] = &["vehicle", "car", "accident", "collision", "driver"];
const PROPERTY_WORDS: &[&str] = &["property", "home", "house", "building", "fire", "water"];
const MEDICAL_WORDS: &[&str] = &["medical", "injury", "hospital", "treatment", "doctor"];

impl ClaimType {
    /// Keyword classification; the first family with a matching word wins.
    pub fn classify(text: &str) -> Self {
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| {
                let w = w.to_lowercase();
                match w.strip_suffix('s') {
                    Some(singular) if singular.len() > 2 => singular.to_string(),
                    _ => w,
                }
            })
            .collect();
        let mentions = |keywords: &[&str]| words.iter().any(|w| keywords.contains(&w.as_str()));

        if mentions(AUTO_WORDS) {
            Self::Auto
        } else if mentions(PROPERTY_WORDS) {
            Self::Property
        } else if mentions(MEDICAL_WORDS) {
            Self::Medical
        } else {
            Self::General
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Property => "property",
            Self::Medical => "medical",
            Self::General => "general",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Auto => "Auto Accident",
            Self::Property => "Property Damage",
            Self::Medical => "Medical",
            Self::General => "General",
        }
    }

    /// Built-in policy guidance. General claims use the auto guidance.
    pub fn guidance(self) -> &'static PolicyGuidance {
        match self {
            Self::Auto | Self::General => &AUTO_GUIDANCE,
            Self::Property => &PROPERTY_GUIDANCE,
            Self::Medical => &MEDICAL_GUIDANCE,
        }
    }
}

impl std::fmt::Display for ClaimType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize)]
pub struct PolicyGuidance {
    pub coverage_types: &'static [&'static str],
    pub required_info: &'static [&'static str],
    pub typical_deductible: &'static str,
    pub processing_time: &'static str,
    pub documentation: &'static str,
}

static AUTO_GUIDANCE: PolicyGuidance = PolicyGuidance {
    coverage_types: &["Collision", "Comprehensive", "Liability"],
    required_info: &[
        "Police report number",
        "Other driver information",
        "Witness statements",
    ],
    typical_deductible: "$500-$1000",
    processing_time: "7-14 business days",
    documentation: "Photos of damage, repair estimates, police report",
};

static PROPERTY_GUIDANCE: PolicyGuidance = PolicyGuidance {
    coverage_types: &["Homeowners", "Renters", "Property"],
    required_info: &["Date of incident", "Cause of damage", "Extent of damage"],
    typical_deductible: "$1000-$2500",
    processing_time: "10-21 business days",
    documentation: "Photos, repair estimates, receipts for damaged items",
};

static MEDICAL_GUIDANCE: PolicyGuidance = PolicyGuidance {
    coverage_types: &["Medical Payments", "Personal Injury Protection"],
    required_info: &[
        "Medical provider information",
        "Treatment dates",
        "Diagnosis",
    ],
    typical_deductible: "$0-$500",
    processing_time: "14-30 business days",
    documentation: "Medical bills, treatment records, prescription receipts",
};

// ---------------------------------------------------------------------------
// Policy context
// ---------------------------------------------------------------------------

/// Policy knowledge attached to one claim.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PolicyContext {
    BedrockKb {
        results: Vec<RetrievedPassage>,
    },
    Fallback {
        claim_type: ClaimType,
        policy_info: &'static PolicyGuidance,
    },
}

/// Passages included in an enriched prompt.
const PROMPT_PASSAGES: usize = 3;

impl PolicyContext {
    pub fn fallback(claim_type: ClaimType) -> Self {
        Self::Fallback {
            claim_type,
            policy_info: claim_type.guidance(),
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            Self::BedrockKb { .. } => "bedrock_kb",
            Self::Fallback { .. } => "fallback",
        }
    }

    /// Text block prepended to the extraction prompt.
    pub fn context_block(&self) -> String {
        match self {
            Self::BedrockKb { results } => {
                let mut block = String::from("\nPOLICY CONTEXT FROM KNOWLEDGE BASE:\n");
                for (i, passage) in results.iter().take(PROMPT_PASSAGES).enumerate() {
                    block.push_str(&format!("\n{}. {}\n", i + 1, passage.text));
                }
                block
            }
            Self::Fallback {
                claim_type,
                policy_info,
            } => format!(
                "\nPOLICY CONTEXT:\n\
                 - Claim Type: {}\n\
                 - Coverage Types: {}\n\
                 - Required Information: {}\n\
                 - Typical Deductible: {}\n\
                 - Expected Processing Time: {}\n\
                 - Required Documentation: {}\n\n",
                claim_type.label(),
                policy_info.coverage_types.join(", "),
                policy_info.required_info.join(", "),
                policy_info.typical_deductible,
                policy_info.processing_time,
                policy_info.documentation,
            ),
        }
    }
}

/// Retrieve policy passages for `query`, falling back to the built-in
/// guidance when no knowledge base is configured, the call fails, or it
/// returns nothing.
pub async fn retrieve_policy_context(
    knowledge_base: Option<(&dyn Retriever, &str)>,
    query: &str,
    max_results: u32,
) -> PolicyContext {
    let claim_type = ClaimType::classify(query);
    let Some((retriever, kb_id)) = knowledge_base else {
        return PolicyContext::fallback(claim_type);
    };
    match retriever.retrieve(kb_id, query, max_results).await {
        Ok(results) if !results.is_empty() => {
            debug!(passages = results.len(), "retrieved policy context");
            PolicyContext::BedrockKb { results }
        }
        Ok(_) => {
            debug!("knowledge base returned no passages");
            PolicyContext::fallback(claim_type)
        }
        Err(e) => {
            warn!(error = %e, kb_id, "knowledge base query failed, using built-in guidance");
            PolicyContext::fallback(claim_type)
        }
    }
}

// ---------------------------------------------------------------------------
// Completeness
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Validation {
    pub is_complete: bool,
    pub present_fields: Vec<String>,
    pub missing_fields: Vec<String>,
    pub completeness_score: f64,
    pub source: &'static str,
}

/// A required field counts as present when any of its significant words
/// (longer than two characters) appears in the extracted information.
pub fn validate_completeness(
    extracted_info: &str,
    claim_type: ClaimType,
    context: &PolicyContext,
) -> Validation {
    let haystack = extracted_info.to_lowercase();
    let required = claim_type.guidance().required_info;

    let (present, missing): (Vec<&str>, Vec<&str>) = required.iter().copied().partition(|field| {
        field
            .to_lowercase()
            .split_whitespace()
            .filter(|word| word.len() > 2)
            .any(|word| haystack.contains(word))
    });

    let score = if required.is_empty() {
        1.0
    } else {
        (present.len() as f64 / required.len() as f64 * 100.0).round() / 100.0
    };
    Validation {
        is_complete: missing.is_empty(),
        present_fields: present.into_iter().map(String::from).collect(),
        missing_fields: missing.into_iter().map(String::from).collect(),
        completeness_score: score,
        source: context.source(),
    }
}
