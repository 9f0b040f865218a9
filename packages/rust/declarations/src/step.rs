//! The ordered deployment steps.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use claimstack_shared::ClaimStackError;

/// One step of the deployment sequence. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeployStep {
    /// Role, buckets, and collection security policies.
    Foundation,
    /// The search collection itself (enters `CREATING`).
    Collection,
    /// Poll the collection until it reports `ACTIVE`.
    AwaitCollection,
    /// Create the vector index on the active collection.
    VectorIndex,
    /// Knowledge base and data source referencing the index.
    KnowledgeBase,
    /// Processing function wired to the input bucket.
    ProcessingFunction,
}

impl DeployStep {
    pub const ALL: [DeployStep; 6] = [
        Self::Foundation,
        Self::Collection,
        Self::AwaitCollection,
        Self::VectorIndex,
        Self::KnowledgeBase,
        Self::ProcessingFunction,
    ];

    /// 1-based position in the sequence.
    pub fn number(self) -> usize {
        self as usize + 1
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Foundation => "foundation",
            Self::Collection => "collection",
            Self::AwaitCollection => "await-collection",
            Self::VectorIndex => "vector-index",
            Self::KnowledgeBase => "knowledge-base",
            Self::ProcessingFunction => "processing-function",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Foundation => "create role, buckets and policies",
            Self::Collection => "create search collection",
            Self::AwaitCollection => "wait for collection to become ACTIVE",
            Self::VectorIndex => "create vector index",
            Self::KnowledgeBase => "create knowledge base and data source",
            Self::ProcessingFunction => "create processing function and trigger",
        }
    }

    /// Whether this step is carried out by the provisioning engine (a stack
    /// update) rather than by a direct service call.
    pub fn is_provisioning(self) -> bool {
        matches!(
            self,
            Self::Foundation | Self::Collection | Self::KnowledgeBase | Self::ProcessingFunction
        )
    }

    /// Steps from `from` to `to`, inclusive.
    pub fn range(from: Self, to: Self) -> impl Iterator<Item = Self> {
        Self::ALL
            .into_iter()
            .filter(move |step| *step >= from && *step <= to)
    }
}

impl fmt::Display for DeployStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeployStep {
    type Err = ClaimStackError;

    /// Accepts the step name or its 1-based number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<usize>() {
            return Self::ALL
                .into_iter()
                .find(|step| step.number() == n)
                .ok_or_else(|| ClaimStackError::validation(format!("no deployment step {n}")));
        }
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|s| s.as_str()).collect();
                ClaimStackError::validation(format!(
                    "unknown deployment step '{s}' (expected one of: {})",
                    names.join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_numbered_in_order() {
        let numbers: Vec<usize> = DeployStep::ALL.iter().map(|s| s.number()).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);
        assert!(DeployStep::AwaitCollection < DeployStep::VectorIndex);
    }

    #[test]
    fn parse_by_name_or_number() {
        assert_eq!("4".parse::<DeployStep>().expect("n"), DeployStep::VectorIndex);
        assert_eq!(
            "knowledge-base".parse::<DeployStep>().expect("name"),
            DeployStep::KnowledgeBase
        );
        assert!("7".parse::<DeployStep>().is_err());
        assert!("index".parse::<DeployStep>().is_err());
    }

    #[test]
    fn range_is_inclusive() {
        let steps: Vec<DeployStep> =
            DeployStep::range(DeployStep::AwaitCollection, DeployStep::KnowledgeBase).collect();
        assert_eq!(
            steps,
            vec![
                DeployStep::AwaitCollection,
                DeployStep::VectorIndex,
                DeployStep::KnowledgeBase
            ]
        );
    }
}
