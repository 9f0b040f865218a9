//! Resource declarations for the claim pipeline.
//!
//! Resources are declared as a typed dependency graph ([`ResourceGraph`]),
//! validated for cycles, ordered topologically, and rendered into cumulative
//! provisioning templates, one per [`DeployStep`].

pub mod graph;
pub mod resources;
pub mod step;
pub mod template;

pub use graph::{Dependency, EdgeKind, Provisioning, Resource, ResourceGraph};
pub use resources::{BucketPurpose, ResourceKind, dependency_report, standard_graph};
pub use step::DeployStep;
pub use template::{
    FUNCTION_PACKAGE_PREFIX, bucket_name_pattern, collection_wildcard_arn, function_package_key,
    policy_base_name, render_template, template_digest,
};
