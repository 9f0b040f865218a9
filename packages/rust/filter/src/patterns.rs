//! Built-in sensitive-data patterns.
//!
//! Patterns run in declaration order over the progressively masked text, so
//! broader patterns (phone, VIN) only see what the narrower ones left behind.

use std::sync::LazyLock;

use regex::Regex;

/// A named detection pattern and its masking template.
#[derive(Debug, Clone)]
pub struct SensitivePattern {
    pub kind: String,
    pub description: String,
    pub regex: Regex,
    /// Replacement template; `$name` refers to named capture groups.
    pub replacement: String,
}

struct Builtin {
    kind: &'static str,
    description: &'static str,
    pattern: &'static str,
    replacement: &'static str,
}

const BUILTINS: &[Builtin] = &[
    Builtin {
        kind: "policy_number",
        description: "Policy Number",
        pattern: r#"(?i)\b(?P<label>policy[\s_]*(?:number|no\.?|#)?"?\s*[:#=]?\s*"?)[A-Z]{0,6}-?\d[A-Z0-9-]{4,}"#,
        replacement: "${label}POL-XXXXXXXX",
    },
    Builtin {
        kind: "ssn",
        description: "Social Security Number",
        pattern: r"\b\d{3}-\d{2}-\d{4}\b",
        replacement: "XXX-XX-XXXX",
    },
    Builtin {
        kind: "credit_card",
        description: "Credit Card Number",
        pattern: r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b",
        replacement: "XXXX-XXXX-XXXX-XXXX",
    },
    Builtin {
        kind: "email",
        description: "Email Address",
        pattern: r"(?i)\b[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}\b",
        replacement: "[EMAIL_REDACTED]",
    },
    Builtin {
        kind: "phone",
        description: "Phone Number",
        pattern: r"\(?\b\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}\b",
        replacement: "(XXX) XXX-XXXX",
    },
    Builtin {
        kind: "date_of_birth",
        description: "Date of Birth",
        pattern: r"(?i)\b(?:DOB|Date of Birth|Birth Date):\s*\d{1,2}/\d{1,2}/\d{4}\b",
        replacement: "DOB: XX/XX/XXXX",
    },
    Builtin {
        kind: "drivers_license",
        description: "Driver's License",
        pattern: r"(?i)\b(?:DL|Driver'?s? License|License)[\s#:]+[A-Z0-9]{5,15}\b",
        replacement: "DL: XXXXXXXXX",
    },
    Builtin {
        kind: "bank_account",
        description: "Bank Account Number",
        pattern: r"(?i)\b(?:Account|Acct)[\s#:]+\d{8,17}\b",
        replacement: "Account: XXXXXXXXXX",
    },
    Builtin {
        kind: "vin",
        description: "Vehicle Identification Number",
        pattern: r"(?i)\b[A-HJ-NPR-Z0-9]{17}\b",
        replacement: "VIN: XXXXXXXXXXXXX",
    },
];

static BUILTIN_PATTERNS: LazyLock<Vec<SensitivePattern>> = LazyLock::new(|| {
    BUILTINS
        .iter()
        .map(|b| SensitivePattern {
            kind: b.kind.to_string(),
            description: b.description.to_string(),
            regex: Regex::new(b.pattern).expect("valid regex"),
            replacement: b.replacement.to_string(),
        })
        .collect()
});

/// Fresh copies of the built-in patterns, in application order.
pub fn builtin_patterns() -> Vec<SensitivePattern> {
    BUILTIN_PATTERNS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(kind: &str) -> SensitivePattern {
        builtin_patterns()
            .into_iter()
            .find(|p| p.kind == kind)
            .expect(kind)
    }

    #[test]
    fn all_builtins_compile() {
        assert_eq!(builtin_patterns().len(), BUILTINS.len());
    }

    #[test]
    fn policy_number_keeps_label() {
        let p = pattern("policy_number");
        let masked = p
            .regex
            .replace_all("Policy Number: AUTO-2024-001234 applies", p.replacement.as_str());
        assert_eq!(masked, "Policy Number: POL-XXXXXXXX applies");
        assert!(!p.regex.is_match("the policy covers two vehicles"));
    }

    #[test]
    fn policy_number_json_key_counts_as_label() {
        let p = pattern("policy_number");
        let masked = p.regex.replace_all(
            r#"{"claimant_name": "Jane Doe", "policy_number": "AUTO-2024-778899"}"#,
            p.replacement.as_str(),
        );
        assert_eq!(
            masked,
            r#"{"claimant_name": "Jane Doe", "policy_number": "POL-XXXXXXXX"}"#
        );
        let masked = p
            .regex
            .replace_all("policy_no=HOME-55120987", p.replacement.as_str());
        assert_eq!(masked, "policy_no=POL-XXXXXXXX");
    }

    #[test]
    fn vin_excludes_ambiguous_letters() {
        let p = pattern("vin");
        assert!(p.regex.is_match("VIN 1HGCM82633A004352"));
        assert!(!p.regex.is_match("1HGCM82633A00435O"));
    }
}
