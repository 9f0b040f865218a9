//! Resource identifiers produced by provisioning, passed explicitly between
//! deployment steps, the ingestion monitor, and the web application.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ClaimStackError, Result};

/// Stack output keys and the environment variables they are exported as.
pub const OUTPUT_ENV_KEYS: &[(&str, &str)] = &[
    ("InputBucketName", "INPUT_BUCKET"),
    ("OutputBucketName", "OUTPUT_BUCKET"),
    ("FeedbackBucketName", "FEEDBACK_BUCKET"),
    ("KBDataBucketName", "KB_DATA_BUCKET"),
    ("KnowledgeBaseId", "KNOWLEDGE_BASE_ID"),
    ("DataSourceId", "DATA_SOURCE_ID"),
    ("KnowledgeBaseRoleArn", "KB_ROLE_ARN"),
    ("OpenSearchCollectionEndpoint", "COLLECTION_ENDPOINT"),
    ("OpenSearchCollectionArn", "COLLECTION_ARN"),
    ("LambdaFunctionName", "FUNCTION_NAME"),
];

/// Everything a step downstream of provisioning needs to know about the
/// deployed resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentContext {
    pub region: String,
    pub stack_name: String,
    pub input_bucket: Option<String>,
    pub output_bucket: Option<String>,
    pub feedback_bucket: Option<String>,
    pub kb_data_bucket: Option<String>,
    pub knowledge_base_id: Option<String>,
    pub data_source_id: Option<String>,
    pub kb_role_arn: Option<String>,
    pub collection_endpoint: Option<String>,
    pub collection_arn: Option<String>,
    pub function_name: Option<String>,
}

impl DeploymentContext {
    pub fn new(region: impl Into<String>, stack_name: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            stack_name: stack_name.into(),
            ..Default::default()
        }
    }

    /// Build a context from provisioning-engine stack outputs.
    pub fn from_outputs(
        region: impl Into<String>,
        stack_name: impl Into<String>,
        outputs: &BTreeMap<String, String>,
    ) -> Self {
        let mut ctx = Self::new(region, stack_name);
        for (key, value) in outputs {
            ctx.set_output(key, value.clone());
        }
        ctx
    }

    /// Build a context from exported environment variables.
    pub fn from_env(region: impl Into<String>, stack_name: impl Into<String>) -> Self {
        Self::from_lookup(region, stack_name, |name| std::env::var(name).ok())
    }

    /// Build a context from any `ENV_NAME -> value` lookup.
    pub fn from_lookup(
        region: impl Into<String>,
        stack_name: impl Into<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let mut ctx = Self::new(region, stack_name);
        for (output_key, env_key) in OUTPUT_ENV_KEYS {
            if let Some(value) = lookup(env_key).filter(|v| !v.is_empty()) {
                ctx.set_output(output_key, value);
            }
        }
        ctx
    }

    /// Merge newer stack outputs into this context (later steps add fields).
    pub fn absorb(&mut self, outputs: &BTreeMap<String, String>) {
        for (key, value) in outputs {
            self.set_output(key, value.clone());
        }
    }

    fn set_output(&mut self, key: &str, value: String) {
        let slot = match key {
            "InputBucketName" => &mut self.input_bucket,
            "OutputBucketName" => &mut self.output_bucket,
            "FeedbackBucketName" => &mut self.feedback_bucket,
            "KBDataBucketName" => &mut self.kb_data_bucket,
            "KnowledgeBaseId" => &mut self.knowledge_base_id,
            "DataSourceId" => &mut self.data_source_id,
            "KnowledgeBaseRoleArn" => &mut self.kb_role_arn,
            "OpenSearchCollectionEndpoint" => &mut self.collection_endpoint,
            "OpenSearchCollectionArn" => &mut self.collection_arn,
            "LambdaFunctionName" => &mut self.function_name,
            other => {
                tracing::debug!(key = other, "ignoring unrecognised stack output");
                return;
            }
        };
        *slot = Some(value);
    }

    fn get_output(&self, key: &str) -> Option<&str> {
        match key {
            "InputBucketName" => self.input_bucket.as_deref(),
            "OutputBucketName" => self.output_bucket.as_deref(),
            "FeedbackBucketName" => self.feedback_bucket.as_deref(),
            "KBDataBucketName" => self.kb_data_bucket.as_deref(),
            "KnowledgeBaseId" => self.knowledge_base_id.as_deref(),
            "DataSourceId" => self.data_source_id.as_deref(),
            "KnowledgeBaseRoleArn" => self.kb_role_arn.as_deref(),
            "OpenSearchCollectionEndpoint" => self.collection_endpoint.as_deref(),
            "OpenSearchCollectionArn" => self.collection_arn.as_deref(),
            "LambdaFunctionName" => self.function_name.as_deref(),
            _ => None,
        }
    }

    /// Render `export NAME=value` lines for every known identifier.
    pub fn to_env_exports(&self) -> String {
        let mut out = format!(
            "export AWS_REGION={}\nexport CLAIMSTACK_STACK={}\n",
            self.region, self.stack_name
        );
        for (output_key, env_key) in OUTPUT_ENV_KEYS {
            if let Some(value) = self.get_output(output_key) {
                out.push_str(&format!("export {env_key}={value}\n"));
            }
        }
        out
    }

    pub fn require_input_bucket(&self) -> Result<&str> {
        require(&self.input_bucket, "input bucket", "INPUT_BUCKET")
    }

    pub fn require_output_bucket(&self) -> Result<&str> {
        require(&self.output_bucket, "output bucket", "OUTPUT_BUCKET")
    }

    pub fn require_feedback_bucket(&self) -> Result<&str> {
        require(&self.feedback_bucket, "feedback bucket", "FEEDBACK_BUCKET")
    }

    pub fn require_kb_data_bucket(&self) -> Result<&str> {
        require(&self.kb_data_bucket, "knowledge base data bucket", "KB_DATA_BUCKET")
    }

    pub fn require_knowledge_base_id(&self) -> Result<&str> {
        require(&self.knowledge_base_id, "knowledge base id", "KNOWLEDGE_BASE_ID")
    }

    pub fn require_data_source_id(&self) -> Result<&str> {
        require(&self.data_source_id, "data source id", "DATA_SOURCE_ID")
    }

    pub fn require_collection_endpoint(&self) -> Result<&str> {
        require(
            &self.collection_endpoint,
            "collection endpoint",
            "COLLECTION_ENDPOINT",
        )
    }
}

fn require<'a>(value: &'a Option<String>, what: &str, env_key: &str) -> Result<&'a str> {
    value.as_deref().ok_or_else(|| {
        ClaimStackError::operator(format!(
            "{what} is unknown: deploy the stack first or set {env_key}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("InputBucketName".to_string(), "in-bucket".to_string()),
            ("KnowledgeBaseId".to_string(), "KB123".to_string()),
            ("SomethingElse".to_string(), "ignored".to_string()),
        ])
    }

    #[test]
    fn context_from_outputs() {
        let ctx = DeploymentContext::from_outputs("us-east-1", "ClaimStack", &outputs());
        assert_eq!(ctx.require_input_bucket().expect("bucket"), "in-bucket");
        assert_eq!(ctx.require_knowledge_base_id().expect("kb"), "KB123");
        let err = ctx.require_data_source_id().unwrap_err();
        assert!(err.to_string().contains("DATA_SOURCE_ID"));
    }

    #[test]
    fn exports_roundtrip_through_lookup() {
        let ctx = DeploymentContext::from_outputs("us-east-1", "ClaimStack", &outputs());
        let exports = ctx.to_env_exports();
        assert!(exports.contains("export INPUT_BUCKET=in-bucket\n"));
        assert!(exports.contains("export KNOWLEDGE_BASE_ID=KB123\n"));

        let vars: BTreeMap<String, String> = exports
            .lines()
            .filter_map(|l| l.strip_prefix("export "))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let back =
            DeploymentContext::from_lookup("us-east-1", "ClaimStack", |k| vars.get(k).cloned());
        assert_eq!(back, ctx);
    }

    #[test]
    fn absorb_adds_later_outputs() {
        let mut ctx = DeploymentContext::from_outputs("us-east-1", "ClaimStack", &outputs());
        ctx.absorb(&BTreeMap::from([(
            "DataSourceId".to_string(),
            "DS9".to_string(),
        )]));
        assert_eq!(ctx.require_data_source_id().expect("ds"), "DS9");
        assert_eq!(ctx.input_bucket.as_deref(), Some("in-bucket"));
    }
}
