//! The claim pipeline's resource declarations.

use serde::Serialize;

use claimstack_shared::{AppConfig, Result};

use crate::graph::{Resource, ResourceGraph};
use crate::step::DeployStep;

// Logical ids, shared by the template renderer and the status reporter.
pub const INPUT_BUCKET: &str = "InputDocumentBucket";
pub const OUTPUT_BUCKET: &str = "OutputSummaryBucket";
pub const FEEDBACK_BUCKET: &str = "FeedbackBucket";
pub const KB_DATA_BUCKET: &str = "KnowledgeBaseDataBucket";
pub const KB_ROLE: &str = "BedrockKBRole";
pub const KB_ROLE_POLICY: &str = "BedrockKBRolePolicy";
pub const ENCRYPTION_POLICY: &str = "CollectionEncryptionPolicy";
pub const NETWORK_POLICY: &str = "CollectionNetworkPolicy";
pub const DATA_ACCESS_POLICY: &str = "CollectionDataAccessPolicy";
pub const COLLECTION: &str = "KnowledgeBaseCollection";
pub const VECTOR_INDEX: &str = "PolicyVectorIndex";
pub const KNOWLEDGE_BASE: &str = "PolicyKnowledgeBase";
pub const DATA_SOURCE: &str = "PolicyDataSource";
pub const FUNCTION_ROLE: &str = "ProcessingFunctionRole";
pub const FUNCTION: &str = "ProcessingFunction";
pub const INVOKE_PERMISSION: &str = "ProcessingFunctionInvokePermission";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BucketPurpose {
    Input,
    Output,
    Feedback,
    KbData,
}

impl BucketPurpose {
    /// Infix used in the deterministic bucket name.
    pub fn infix(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Feedback => "feedback",
            Self::KbData => "kb-data",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "purpose", rename_all = "kebab-case")]
pub enum ResourceKind {
    Bucket(BucketPurpose),
    KnowledgeBaseRole,
    KnowledgeBaseRolePolicy,
    EncryptionPolicy,
    NetworkPolicy,
    DataAccessPolicy,
    Collection,
    VectorIndex,
    KnowledgeBase,
    DataSource,
    FunctionRole,
    Function,
    InvokePermission,
}

impl ResourceKind {
    /// Provisioning-engine resource type, `None` for bootstrapped resources.
    pub fn template_type(self) -> Option<&'static str> {
        Some(match self {
            Self::Bucket(_) => "AWS::S3::Bucket",
            Self::KnowledgeBaseRole | Self::FunctionRole => "AWS::IAM::Role",
            Self::KnowledgeBaseRolePolicy => "AWS::IAM::Policy",
            Self::EncryptionPolicy | Self::NetworkPolicy => {
                "AWS::OpenSearchServerless::SecurityPolicy"
            }
            Self::DataAccessPolicy => "AWS::OpenSearchServerless::AccessPolicy",
            Self::Collection => "AWS::OpenSearchServerless::Collection",
            Self::KnowledgeBase => "AWS::Bedrock::KnowledgeBase",
            Self::DataSource => "AWS::Bedrock::DataSource",
            Self::Function => "AWS::Lambda::Function",
            Self::InvokePermission => "AWS::Lambda::Permission",
            Self::VectorIndex => return None,
        })
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Bucket(BucketPurpose::Input) => "input document bucket",
            Self::Bucket(BucketPurpose::Output) => "output summary bucket",
            Self::Bucket(BucketPurpose::Feedback) => "feedback bucket",
            Self::Bucket(BucketPurpose::KbData) => "knowledge base source bucket",
            Self::KnowledgeBaseRole => "knowledge base role",
            Self::KnowledgeBaseRolePolicy => "knowledge base role policy",
            Self::EncryptionPolicy => "collection encryption policy",
            Self::NetworkPolicy => "collection network policy",
            Self::DataAccessPolicy => "collection data access policy",
            Self::Collection => "search collection",
            Self::VectorIndex => "vector index",
            Self::KnowledgeBase => "knowledge base",
            Self::DataSource => "data source",
            Self::FunctionRole => "processing function role",
            Self::Function => "processing function",
            Self::InvokePermission => "bucket invoke permission",
        }
    }
}

/// Build the full resource graph for one deployment.
///
/// The knowledge-base role reaches the collection through a wildcard ARN
/// pattern, so it has no edge to the collection. The input bucket's event
/// notification is a deferred edge onto the function: the bucket exists from
/// step 1 and is patched in step 6.
pub fn standard_graph(config: &AppConfig) -> Result<ResourceGraph> {
    use DeployStep::*;
    use ResourceKind as K;

    let mut graph = ResourceGraph::new();

    let with_function = config.function.is_declared();

    let mut input = Resource::new(INPUT_BUCKET, K::Bucket(BucketPurpose::Input), Foundation);
    if with_function {
        input = input
            .patched_after(FUNCTION)
            .patched_after(INVOKE_PERMISSION);
    }
    graph.add(input)?;
    graph.add(Resource::new(
        OUTPUT_BUCKET,
        K::Bucket(BucketPurpose::Output),
        Foundation,
    ))?;
    graph.add(Resource::new(
        FEEDBACK_BUCKET,
        K::Bucket(BucketPurpose::Feedback),
        Foundation,
    ))?;
    graph.add(Resource::new(
        KB_DATA_BUCKET,
        K::Bucket(BucketPurpose::KbData),
        Foundation,
    ))?;

    graph.add(Resource::new(KB_ROLE, K::KnowledgeBaseRole, Foundation))?;
    graph.add(
        Resource::new(KB_ROLE_POLICY, K::KnowledgeBaseRolePolicy, Foundation)
            .after(KB_ROLE)
            .after(KB_DATA_BUCKET),
    )?;
    graph.add(Resource::new(
        ENCRYPTION_POLICY,
        K::EncryptionPolicy,
        Foundation,
    ))?;
    graph.add(Resource::new(NETWORK_POLICY, K::NetworkPolicy, Foundation))?;
    graph.add(Resource::new(DATA_ACCESS_POLICY, K::DataAccessPolicy, Foundation).after(KB_ROLE))?;

    graph.add(
        Resource::new(COLLECTION, K::Collection, Collection)
            .after(ENCRYPTION_POLICY)
            .after(NETWORK_POLICY)
            .after(DATA_ACCESS_POLICY),
    )?;

    graph.add(
        Resource::new(VECTOR_INDEX, K::VectorIndex, VectorIndex)
            .after(COLLECTION)
            .bootstrapped(),
    )?;

    graph.add(
        Resource::new(KNOWLEDGE_BASE, K::KnowledgeBase, KnowledgeBase)
            .after(KB_ROLE)
            .after(KB_ROLE_POLICY)
            .after(COLLECTION)
            .after(VECTOR_INDEX),
    )?;
    graph.add(
        Resource::new(DATA_SOURCE, K::DataSource, KnowledgeBase)
            .after(KNOWLEDGE_BASE)
            .after(KB_DATA_BUCKET),
    )?;

    if with_function {
        graph.add(
            Resource::new(FUNCTION_ROLE, K::FunctionRole, ProcessingFunction)
                .after(OUTPUT_BUCKET)
                .after(FEEDBACK_BUCKET)
                .after(KB_DATA_BUCKET)
                .after(KNOWLEDGE_BASE),
        )?;
        graph.add(
            Resource::new(FUNCTION, K::Function, ProcessingFunction)
                .after(FUNCTION_ROLE)
                .after(OUTPUT_BUCKET)
                .after(FEEDBACK_BUCKET)
                .after(KB_DATA_BUCKET)
                .after(KNOWLEDGE_BASE),
        )?;
        graph.add(
            Resource::new(INVOKE_PERMISSION, K::InvokePermission, ProcessingFunction)
                .after(FUNCTION),
        )?;
    } else {
        tracing::debug!("no function package configured, processing function not declared");
    }

    graph.validate()?;
    Ok(graph)
}

/// Human-readable creation plan, grouped by step.
pub fn dependency_report(graph: &ResourceGraph) -> Result<String> {
    let order = graph.topological_order()?;
    let mut out = String::new();

    for step in DeployStep::ALL {
        out.push_str(&format!(
            "Step {} [{}]: {}\n",
            step.number(),
            step,
            step.description()
        ));
        let in_step: Vec<_> = order.iter().filter(|r| r.step == step).collect();
        if in_step.is_empty() && step == DeployStep::AwaitCollection {
            out.push_str(&format!("  (poll {COLLECTION} until ACTIVE)\n"));
        }
        for resource in in_step {
            let deps: Vec<&str> = resource.hard_dependencies().collect();
            let deps = if deps.is_empty() {
                String::from("-")
            } else {
                deps.join(", ")
            };
            out.push_str(&format!(
                "  {:<36} {:<30} after: {deps}\n",
                resource.id,
                resource.kind.label()
            ));
        }
    }

    let patches = graph.deferred_patches();
    if !patches.is_empty() {
        out.push_str("Deferred patches:\n");
        for (resource, target) in patches {
            out.push_str(&format!("  {} patched once {target} exists\n", resource.id));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_function() -> AppConfig {
        let mut config = AppConfig::default();
        config.function.code_bucket = Some("artifacts".into());
        config.function.code_key = Some("function.zip".into());
        config
    }

    fn position(order: &[&Resource], id: &str) -> usize {
        order.iter().position(|r| r.id == id).expect(id)
    }

    #[test]
    fn standard_graph_orders_pipeline() {
        let graph = standard_graph(&with_function()).expect("graph");
        let order = graph.topological_order().expect("order");

        assert!(position(&order, DATA_ACCESS_POLICY) < position(&order, COLLECTION));
        assert!(position(&order, COLLECTION) < position(&order, VECTOR_INDEX));
        assert!(position(&order, VECTOR_INDEX) < position(&order, KNOWLEDGE_BASE));
        assert!(position(&order, KNOWLEDGE_BASE) < position(&order, DATA_SOURCE));
        assert!(position(&order, FUNCTION) < position(&order, INVOKE_PERMISSION));
    }

    #[test]
    fn role_has_no_edge_to_collection() {
        let graph = standard_graph(&with_function()).expect("graph");
        for id in [KB_ROLE, KB_ROLE_POLICY] {
            let resource = graph.get(id).expect(id);
            assert!(!resource.depends_on(COLLECTION), "{id} must not reference the collection");
        }
    }

    #[test]
    fn function_is_optional() {
        let mut config = AppConfig::default();
        config.function.package = None;
        let graph = standard_graph(&config).expect("graph");
        assert!(graph.get(FUNCTION).is_none());
        assert!(graph.deferred_patches().is_empty());

        let graph = standard_graph(&with_function()).expect("graph");
        assert!(graph.get(FUNCTION).is_some());
        assert_eq!(graph.deferred_patches().len(), 2);
    }

    #[test]
    fn every_step_is_reported() {
        let graph = standard_graph(&with_function()).expect("graph");
        let report = dependency_report(&graph).expect("report");
        for step in DeployStep::ALL {
            assert!(report.contains(step.as_str()), "{report}");
        }
        assert!(report.contains("Deferred patches"));
        assert!(report.contains(VECTOR_INDEX));
    }
}
