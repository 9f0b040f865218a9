//! Sensitive-data detection and masking for claim documents.
//!
//! [`ContentFilter`] applies an ordered set of regex patterns (policy
//! numbers, SSNs, card numbers, contact details, licence and account numbers,
//! VINs) and either masks matches or only reports them.

mod patterns;

use std::collections::BTreeMap;

use regex::Regex;
use serde::Serialize;

use claimstack_shared::{ClaimStackError, Result};

pub use patterns::{SensitivePattern, builtin_patterns};

/// Characters of surrounding text captured with each detection.
const CONTEXT_CHARS: usize = 30;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// One match of a sensitive pattern.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    /// The matched text.
    pub found: String,
    /// Byte offsets in the text the pattern ran over.
    pub start: usize,
    pub end: usize,
    /// Mask written in place of the match (filtering only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    /// Surrounding text (detection only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterSummary {
    pub total_detections: usize,
    pub by_type: BTreeMap<String, usize>,
    pub has_sensitive_data: bool,
}

impl FilterSummary {
    fn from_detections(detections: &[Detection]) -> Self {
        let mut by_type = BTreeMap::new();
        for d in detections {
            *by_type.entry(d.kind.clone()).or_insert(0) += 1;
        }
        Self {
            total_detections: detections.len(),
            by_type,
            has_sensitive_data: !detections.is_empty(),
        }
    }
}

/// Output of [`ContentFilter::filter`].
#[derive(Debug, Clone, Serialize)]
pub struct FilterResult {
    pub filtered_text: String,
    pub detections: Vec<Detection>,
    pub summary: FilterSummary,
    pub original_length: usize,
    pub filtered_length: usize,
}

/// Output of [`ContentFilter::detect`].
#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub detections: Vec<Detection>,
    pub summary: FilterSummary,
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Ordered collection of sensitive-data patterns.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    patterns: Vec<SensitivePattern>,
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentFilter {
    /// A filter with every built-in pattern.
    pub fn new() -> Self {
        Self {
            patterns: builtin_patterns(),
        }
    }

    /// Pattern kinds in application order.
    pub fn kinds(&self) -> Vec<&str> {
        self.patterns.iter().map(|p| p.kind.as_str()).collect()
    }

    /// Register a custom pattern, replacing any existing pattern of that kind.
    pub fn add_pattern(
        &mut self,
        kind: &str,
        pattern: &str,
        replacement: &str,
        description: &str,
    ) -> Result<()> {
        let regex = Regex::new(pattern).map_err(|e| {
            ClaimStackError::validation(format!("invalid pattern for {kind}: {e}"))
        })?;
        let entry = SensitivePattern {
            kind: kind.to_string(),
            description: description.to_string(),
            regex,
            replacement: replacement.to_string(),
        };
        match self.patterns.iter_mut().find(|p| p.kind == kind) {
            Some(existing) => *existing = entry,
            None => self.patterns.push(entry),
        }
        Ok(())
    }

    fn selected<'a>(
        &'a self,
        kinds: Option<&'a [&'a str]>,
    ) -> impl Iterator<Item = &'a SensitivePattern> + 'a {
        self.patterns
            .iter()
            .filter(move |p| kinds.is_none_or(|k| k.contains(&p.kind.as_str())))
    }

    /// Mask every match of the selected patterns (`None` = all).
    pub fn filter(&self, text: &str, kinds: Option<&[&str]>) -> FilterResult {
        let mut filtered = text.to_string();
        let mut detections = Vec::new();

        for pattern in self.selected(kinds) {
            for caps in pattern.regex.captures_iter(&filtered) {
                let Some(m) = caps.get(0) else { continue };
                let mut replacement = String::new();
                caps.expand(&pattern.replacement, &mut replacement);
                detections.push(Detection {
                    kind: pattern.kind.clone(),
                    description: pattern.description.clone(),
                    found: m.as_str().to_string(),
                    start: m.start(),
                    end: m.end(),
                    replacement: Some(replacement),
                    context: None,
                });
            }
            filtered = pattern
                .regex
                .replace_all(&filtered, pattern.replacement.as_str())
                .into_owned();
        }

        if !detections.is_empty() {
            tracing::debug!(detections = detections.len(), "masked sensitive content");
        }

        let summary = FilterSummary::from_detections(&detections);
        FilterResult {
            original_length: text.chars().count(),
            filtered_length: filtered.chars().count(),
            filtered_text: filtered,
            detections,
            summary,
        }
    }

    /// Mask with every pattern and return only the text.
    pub fn mask(&self, text: &str) -> String {
        self.filter(text, None).filtered_text
    }

    /// Report matches without altering the text.
    pub fn detect(&self, text: &str, kinds: Option<&[&str]>) -> DetectionReport {
        let mut detections = Vec::new();
        for pattern in self.selected(kinds) {
            for m in pattern.regex.find_iter(text) {
                detections.push(Detection {
                    kind: pattern.kind.clone(),
                    description: pattern.description.clone(),
                    found: m.as_str().to_string(),
                    start: m.start(),
                    end: m.end(),
                    replacement: None,
                    context: Some(context(text, m.start(), m.end())),
                });
            }
        }
        let summary = FilterSummary::from_detections(&detections);
        DetectionReport {
            detections,
            summary,
        }
    }

    /// Human-readable summary of a filtering pass.
    pub fn report(result: &FilterResult) -> String {
        let mut lines = vec![
            "Content Filtering Report".to_string(),
            "=".repeat(50),
            String::new(),
            format!("Total Detections: {}", result.summary.total_detections),
        ];
        if result.summary.total_detections > 0 {
            lines.push(String::new());
            lines.push("Detections by Type:".into());
            for (kind, count) in &result.summary.by_type {
                lines.push(format!("  - {kind}: {count}"));
            }
            lines.push(String::new());
            lines.push(format!("Original Length: {} chars", result.original_length));
            lines.push(format!("Filtered Length: {} chars", result.filtered_length));
        } else {
            lines.push(String::new());
            lines.push("No sensitive information detected.".into());
        }
        lines.join("\n")
    }
}

/// Up to [`CONTEXT_CHARS`] bytes either side of a match, snapped to char
/// boundaries, with ellipses where the text was cut.
fn context(text: &str, start: usize, end: usize) -> String {
    let mut from = start.saturating_sub(CONTEXT_CHARS);
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (end + CONTEXT_CHARS).min(text.len());
    while !text.is_char_boundary(to) {
        to += 1;
    }

    let mut out = String::new();
    if from > 0 {
        out.push_str("...");
    }
    out.push_str(&text[from..to]);
    if to < text.len() {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLAIM: &str = "Claimant: Jane Doe\n\
        Policy Number: AUTO-2024-001234\n\
        SSN: 123-45-6789\n\
        Email: jane.doe@example.com\n\
        Phone: (555) 123-4567\n\
        DOB: 04/12/1985\n\
        Card: 4111 1111 1111 1111\n\
        Vehicle VIN 1HGCM82633A004352 was hit at the intersection.";

    #[test]
    fn filter_masks_all_builtin_kinds() {
        let filter = ContentFilter::new();
        let result = filter.filter(CLAIM, None);
        let text = &result.filtered_text;

        for secret in [
            "AUTO-2024-001234",
            "123-45-6789",
            "jane.doe@example.com",
            "123-4567",
            "04/12/1985",
            "4111 1111 1111 1111",
            "1HGCM82633A004352",
        ] {
            assert!(!text.contains(secret), "{secret} leaked: {text}");
        }
        assert!(text.contains("Policy Number: POL-XXXXXXXX"));
        assert!(text.contains("XXX-XX-XXXX"));
        assert!(text.contains("[EMAIL_REDACTED]"));
        assert!(text.contains("Claimant: Jane Doe"));

        assert!(result.summary.has_sensitive_data);
        assert_eq!(result.summary.by_type.get("ssn"), Some(&1));
        assert_eq!(result.summary.total_detections, result.detections.len());
        assert_eq!(result.original_length, CLAIM.chars().count());
    }

    #[test]
    fn filter_only_selected_kinds() {
        let filter = ContentFilter::new();
        let result = filter.filter(CLAIM, Some(&["email"]));
        assert!(result.filtered_text.contains("123-45-6789"));
        assert!(!result.filtered_text.contains("jane.doe@example.com"));
        assert_eq!(result.summary.total_detections, 1);
        assert_eq!(
            result.detections[0].replacement.as_deref(),
            Some("[EMAIL_REDACTED]")
        );
    }

    #[test]
    fn detect_leaves_text_and_adds_context() {
        let filter = ContentFilter::new();
        let report = filter.detect("Customer SSN is 123-45-6789, verified.", Some(&["ssn"]));
        assert_eq!(report.detections.len(), 1);
        let d = &report.detections[0];
        assert_eq!(d.found, "123-45-6789");
        assert_eq!(d.context.as_deref(), Some("Customer SSN is 123-45-6789, verified."));
        assert!(report.summary.has_sensitive_data);
    }

    #[test]
    fn context_is_truncated_with_ellipsis() {
        let text = format!("{}123-45-6789{}", "a".repeat(40), "b".repeat(40));
        let ctx = context(&text, 40, 51);
        assert!(ctx.starts_with("..."));
        assert!(ctx.ends_with("..."));
        assert_eq!(ctx.len(), 3 + 30 + 11 + 30 + 3);
    }

    #[test]
    fn context_respects_char_boundaries() {
        let text = "é".repeat(20) + "123-45-6789";
        let start = text.find('1').expect("digit");
        let ctx = context(&text, start, start + 11);
        assert!(ctx.ends_with("6789"));
    }

    #[test]
    fn custom_pattern_is_applied() {
        let mut filter = ContentFilter::new();
        filter
            .add_pattern("claim_ref", r"CLM-\d{6}", "CLM-XXXXXX", "Claim Reference")
            .expect("valid");
        assert!(filter.kinds().contains(&"claim_ref"));
        assert_eq!(filter.mask("ref CLM-123456"), "ref CLM-XXXXXX");
        assert!(filter.add_pattern("bad", "(", "", "").is_err());
    }

    #[test]
    fn report_lists_types() {
        let filter = ContentFilter::new();
        let report = ContentFilter::report(&filter.filter(CLAIM, None));
        assert!(report.starts_with("Content Filtering Report"));
        assert!(report.contains("  - ssn: 1"));

        let clean = ContentFilter::report(&filter.filter("nothing here", None));
        assert!(clean.contains("No sensitive information detected."));
    }

    #[test]
    fn detections_serialize_with_type_key() {
        let filter = ContentFilter::new();
        let result = filter.filter("SSN 123-45-6789", Some(&["ssn"]));
        let json = serde_json::to_value(&result.detections[0]).expect("json");
        assert_eq!(json["type"], "ssn");
        assert!(json.get("context").is_none());
    }
}
