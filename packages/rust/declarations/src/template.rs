//! CloudFormation template rendering.
//!
//! Templates are cumulative: the template for step N declares every
//! template-provisioned resource of steps 1..=N, so each provisioning step is
//! an update of the same stack.

use std::collections::HashSet;

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use claimstack_shared::{AppConfig, Result};

use crate::graph::{Provisioning, Resource, ResourceGraph};
use crate::resources::*;
use crate::step::DeployStep;

/// Stack outputs: `(output key, resource id, value expression)`.
fn outputs_table() -> Vec<(&'static str, &'static str, Value)> {
    vec![
        ("InputBucketName", INPUT_BUCKET, json!({ "Ref": INPUT_BUCKET })),
        ("OutputBucketName", OUTPUT_BUCKET, json!({ "Ref": OUTPUT_BUCKET })),
        ("FeedbackBucketName", FEEDBACK_BUCKET, json!({ "Ref": FEEDBACK_BUCKET })),
        ("KBDataBucketName", KB_DATA_BUCKET, json!({ "Ref": KB_DATA_BUCKET })),
        ("KnowledgeBaseRoleArn", KB_ROLE, get_att(KB_ROLE, "Arn")),
        (
            "OpenSearchCollectionEndpoint",
            COLLECTION,
            get_att(COLLECTION, "CollectionEndpoint"),
        ),
        ("OpenSearchCollectionArn", COLLECTION, get_att(COLLECTION, "Arn")),
        (
            "KnowledgeBaseId",
            KNOWLEDGE_BASE,
            get_att(KNOWLEDGE_BASE, "KnowledgeBaseId"),
        ),
        ("DataSourceId", DATA_SOURCE, get_att(DATA_SOURCE, "DataSourceId")),
        ("LambdaFunctionName", FUNCTION, json!({ "Ref": FUNCTION })),
    ]
}

// ---------------------------------------------------------------------------
// Naming helpers
// ---------------------------------------------------------------------------

/// Deterministic bucket name, as an `Fn::Sub` pattern.
pub fn bucket_name_pattern(prefix: &str, purpose: BucketPurpose) -> String {
    format!(
        "{prefix}-{}-${{AWS::AccountId}}-${{AWS::Region}}",
        purpose.infix()
    )
}

/// Concrete wildcard pattern covering every collection in an account.
pub fn collection_wildcard_arn(region: &str, account: &str) -> String {
    format!("arn:aws:aoss:{region}:{account}:collection/*")
}

/// The same wildcard, resolved by the provisioning engine at deploy time.
fn collection_wildcard_sub() -> Value {
    json!({ "Fn::Sub": collection_wildcard_arn("${AWS::Region}", "${AWS::AccountId}") })
}

/// Base name shared by the collection's security policies
/// (`insurance-kb-collection` -> `insurance-kb`).
pub fn policy_base_name(collection: &str) -> &str {
    collection.strip_suffix("-collection").unwrap_or(collection)
}

fn get_att(resource: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [resource, attribute] })
}

fn sub(pattern: impl Into<String>) -> Value {
    json!({ "Fn::Sub": pattern.into() })
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render the template for every step up to and including `through`.
pub fn render_template(
    graph: &ResourceGraph,
    through: DeployStep,
    config: &AppConfig,
) -> Result<Value> {
    let order = graph.topological_order()?;
    let included: Vec<&Resource> = order
        .into_iter()
        .filter(|r| r.step <= through && r.provisioning == Provisioning::Template)
        .collect();
    let present: HashSet<&str> = included.iter().map(|r| r.id.as_str()).collect();

    let mut resources = Map::new();
    for resource in &included {
        let mut body = resource_body(resource, config, &present);

        let depends_on: Vec<&str> = resource
            .depends_on
            .iter()
            .map(|d| d.target.as_str())
            .filter(|t| present.contains(t))
            .collect();
        if !depends_on.is_empty() {
            body["DependsOn"] = json!(depends_on);
        }
        resources.insert(resource.id.clone(), body);
    }

    let mut outputs = Map::new();
    for (key, resource, value) in outputs_table() {
        if present.contains(resource) {
            outputs.insert(key.to_string(), json!({ "Value": value }));
        }
    }

    Ok(json!({
        "AWSTemplateFormatVersion": "2010-09-09",
        "Description": format!(
            "claimstack insurance claim pipeline (through step {}: {through})",
            through.number()
        ),
        "Resources": Value::Object(resources),
        "Outputs": Value::Object(outputs),
    }))
}

/// Key prefix for function packages uploaded to the knowledge-base data
/// bucket, outside the data source's inclusion prefix.
pub const FUNCTION_PACKAGE_PREFIX: &str = "artifacts/";

/// Object key for a function package. The key changes with the content, so
/// a rebuilt package always updates the function's code.
pub fn function_package_key(package: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(package));
    format!("{FUNCTION_PACKAGE_PREFIX}claimstack-function-{}.zip", &digest[..16])
}

/// SHA-256 of the template's canonical JSON.
pub fn template_digest(template: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn resource_body(resource: &Resource, config: &AppConfig, present: &HashSet<&str>) -> Value {
    let kind_type = resource.kind.template_type().unwrap_or_default();
    let properties = match resource.kind {
        ResourceKind::Bucket(purpose) => bucket_properties(purpose, config, present),
        ResourceKind::KnowledgeBaseRole => kb_role_properties(),
        ResourceKind::KnowledgeBaseRolePolicy => kb_role_policy_properties(config),
        ResourceKind::EncryptionPolicy => encryption_policy_properties(config),
        ResourceKind::NetworkPolicy => network_policy_properties(config),
        ResourceKind::DataAccessPolicy => data_access_policy_properties(config),
        ResourceKind::Collection => json!({
            "Name": config.stack.collection_name,
            "Type": "VECTORSEARCH",
            "Description": "Vector store for insurance policy documents",
        }),
        ResourceKind::KnowledgeBase => knowledge_base_properties(config),
        ResourceKind::DataSource => data_source_properties(config),
        ResourceKind::FunctionRole => function_role_properties(config),
        ResourceKind::Function => function_properties(config),
        ResourceKind::InvokePermission => json!({
            "Action": "lambda:InvokeFunction",
            "FunctionName": get_att(FUNCTION, "Arn"),
            "Principal": "s3.amazonaws.com",
            "SourceAccount": { "Ref": "AWS::AccountId" },
            "SourceArn": sub(format!(
                "arn:aws:s3:::{}",
                bucket_name_pattern(&config.stack.resource_prefix, BucketPurpose::Input)
            )),
        }),
        ResourceKind::VectorIndex => Value::Null,
    };

    let mut body = json!({ "Type": kind_type, "Properties": properties });
    if matches!(resource.kind, ResourceKind::Bucket(_)) {
        body["DeletionPolicy"] = json!("Delete");
    }
    body
}

fn bucket_properties(purpose: BucketPurpose, config: &AppConfig, present: &HashSet<&str>) -> Value {
    let mut properties = json!({
        "BucketName": sub(bucket_name_pattern(&config.stack.resource_prefix, purpose)),
        "BucketEncryption": {
            "ServerSideEncryptionConfiguration": [
                { "ServerSideEncryptionByDefault": { "SSEAlgorithm": "AES256" } }
            ]
        },
        "PublicAccessBlockConfiguration": {
            "BlockPublicAcls": true,
            "BlockPublicPolicy": true,
            "IgnorePublicAcls": true,
            "RestrictPublicBuckets": true,
        },
    });

    // Patch applied once the function and its invoke permission exist.
    if purpose == BucketPurpose::Input
        && present.contains(FUNCTION)
        && present.contains(INVOKE_PERMISSION)
    {
        properties["NotificationConfiguration"] = json!({
            "LambdaConfigurations": [
                { "Event": "s3:ObjectCreated:*", "Function": get_att(FUNCTION, "Arn") }
            ]
        });
    }
    properties
}

fn kb_role_properties() -> Value {
    json!({
        "AssumeRolePolicyDocument": {
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": "bedrock.amazonaws.com" },
                "Action": "sts:AssumeRole",
            }]
        },
        "Description": "Role assumed by the knowledge base",
    })
}

fn kb_role_policy_properties(config: &AppConfig) -> Value {
    let embedding_arn = format!(
        "arn:aws:bedrock:${{AWS::Region}}::foundation-model/{}",
        config.embedding.model
    );
    json!({
        "PolicyName": "knowledge-base-access",
        "Roles": [{ "Ref": KB_ROLE }],
        "PolicyDocument": {
            "Version": "2012-10-17",
            "Statement": [
                {
                    "Effect": "Allow",
                    "Action": ["aoss:APIAccessAll"],
                    "Resource": [collection_wildcard_sub()],
                },
                {
                    "Effect": "Allow",
                    "Action": ["bedrock:InvokeModel"],
                    "Resource": [sub(embedding_arn)],
                },
                {
                    "Effect": "Allow",
                    "Action": ["s3:GetObject", "s3:ListBucket"],
                    "Resource": [
                        get_att(KB_DATA_BUCKET, "Arn"),
                        { "Fn::Join": ["", [get_att(KB_DATA_BUCKET, "Arn"), "/*"]] },
                    ],
                },
            ]
        }
    })
}

fn encryption_policy_properties(config: &AppConfig) -> Value {
    let collection = &config.stack.collection_name;
    let policy = json!({
        "Rules": [{ "ResourceType": "collection", "Resource": [format!("collection/{collection}")] }],
        "AWSOwnedKey": true,
    });
    json!({
        "Name": format!("{}-encryption", policy_base_name(collection)),
        "Type": "encryption",
        "Policy": policy.to_string(),
    })
}

fn network_policy_properties(config: &AppConfig) -> Value {
    let collection = &config.stack.collection_name;
    let resource = format!("collection/{collection}");
    let policy = json!([{
        "Rules": [
            { "ResourceType": "collection", "Resource": [resource] },
            { "ResourceType": "dashboard", "Resource": [resource] },
        ],
        "AllowFromPublic": true,
    }]);
    json!({
        "Name": format!("{}-network", policy_base_name(collection)),
        "Type": "network",
        "Policy": policy.to_string(),
    })
}

fn data_access_policy_properties(config: &AppConfig) -> Value {
    let collection = &config.stack.collection_name;
    let index = &config.stack.index_name;
    let policy = json!([{
        "Rules": [
            {
                "ResourceType": "collection",
                "Resource": [format!("collection/{collection}")],
                "Permission": [
                    "aoss:CreateCollectionItems",
                    "aoss:DeleteCollectionItems",
                    "aoss:UpdateCollectionItems",
                    "aoss:DescribeCollectionItems",
                ],
            },
            {
                "ResourceType": "index",
                "Resource": [format!("index/{collection}/*"), format!("index/{collection}/{index}")],
                "Permission": [
                    "aoss:CreateIndex",
                    "aoss:DeleteIndex",
                    "aoss:UpdateIndex",
                    "aoss:DescribeIndex",
                    "aoss:ReadDocument",
                    "aoss:WriteDocument",
                ],
            },
        ],
        "Principal": ["${RoleArn}", "arn:aws:iam::${AWS::AccountId}:root"],
    }]);
    json!({
        "Name": format!("{}-access", policy_base_name(collection)),
        "Type": "data",
        "Policy": { "Fn::Sub": [policy.to_string(), { "RoleArn": get_att(KB_ROLE, "Arn") }] },
    })
}

fn knowledge_base_properties(config: &AppConfig) -> Value {
    json!({
        "Name": config.stack.knowledge_base_name,
        "Description": "Insurance policy knowledge base for claim processing",
        "RoleArn": get_att(KB_ROLE, "Arn"),
        "KnowledgeBaseConfiguration": {
            "Type": "VECTOR",
            "VectorKnowledgeBaseConfiguration": {
                "EmbeddingModelArn": sub(format!(
                    "arn:aws:bedrock:${{AWS::Region}}::foundation-model/{}",
                    config.embedding.model
                )),
            }
        },
        "StorageConfiguration": {
            "Type": "OPENSEARCH_SERVERLESS",
            "OpensearchServerlessConfiguration": {
                "CollectionArn": get_att(COLLECTION, "Arn"),
                "VectorIndexName": config.stack.index_name,
                "FieldMapping": {
                    "VectorField": config.index.vector_field,
                    "TextField": config.index.text_field,
                    "MetadataField": config.index.metadata_field,
                }
            }
        },
    })
}

fn data_source_properties(config: &AppConfig) -> Value {
    json!({
        "Name": config.stack.data_source_name,
        "KnowledgeBaseId": get_att(KNOWLEDGE_BASE, "KnowledgeBaseId"),
        "DataSourceConfiguration": {
            "Type": "S3",
            "S3Configuration": {
                "BucketArn": get_att(KB_DATA_BUCKET, "Arn"),
                "InclusionPrefixes": [config.stack.source_prefix],
            }
        },
        "VectorIngestionConfiguration": {
            "ChunkingConfiguration": {
                "ChunkingStrategy": "FIXED_SIZE",
                "FixedSizeChunkingConfiguration": {
                    "MaxTokens": config.chunking.max_tokens,
                    "OverlapPercentage": config.chunking.overlap_percentage,
                }
            }
        },
    })
}

fn function_role_properties(config: &AppConfig) -> Value {
    let input_objects = sub(format!(
        "arn:aws:s3:::{}/*",
        bucket_name_pattern(&config.stack.resource_prefix, BucketPurpose::Input)
    ));
    let objects = |bucket: &str| json!({ "Fn::Join": ["", [get_att(bucket, "Arn"), "/*"]] });
    json!({
        "AssumeRolePolicyDocument": {
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": "lambda.amazonaws.com" },
                "Action": "sts:AssumeRole",
            }]
        },
        "ManagedPolicyArns": [
            "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole"
        ],
        "Policies": [{
            "PolicyName": "claim-processing",
            "PolicyDocument": {
                "Version": "2012-10-17",
                "Statement": [
                    {
                        "Effect": "Allow",
                        "Action": ["bedrock:InvokeModel", "bedrock:Retrieve", "bedrock:RetrieveAndGenerate"],
                        "Resource": "*",
                    },
                    {
                        "Effect": "Allow",
                        "Action": ["s3:GetObject"],
                        "Resource": [input_objects, objects(KB_DATA_BUCKET)],
                    },
                    {
                        "Effect": "Allow",
                        "Action": ["s3:PutObject", "s3:GetObject", "s3:ListBucket"],
                        "Resource": [
                            get_att(OUTPUT_BUCKET, "Arn"),
                            objects(OUTPUT_BUCKET),
                            get_att(FEEDBACK_BUCKET, "Arn"),
                            objects(FEEDBACK_BUCKET),
                        ],
                    },
                ]
            }
        }],
    })
}

fn function_properties(config: &AppConfig) -> Value {
    // Until the deploy uploads the package, point at where it will land.
    let code = match config.function.artifact() {
        Some((bucket, key)) => json!({ "S3Bucket": bucket, "S3Key": key }),
        None => json!({
            "S3Bucket": { "Ref": KB_DATA_BUCKET },
            "S3Key": format!("{FUNCTION_PACKAGE_PREFIX}claimstack-function.zip"),
        }),
    };
    json!({
        "Description": "Summarises insurance claim documents dropped into the input bucket",
        "Runtime": config.function.runtime,
        "Handler": config.function.handler,
        "Code": code,
        "Role": get_att(FUNCTION_ROLE, "Arn"),
        "Timeout": config.function.timeout_secs,
        "MemorySize": config.function.memory_mb,
        "Environment": {
            "Variables": {
                "OUTPUT_BUCKET": { "Ref": OUTPUT_BUCKET },
                "FEEDBACK_BUCKET": { "Ref": FEEDBACK_BUCKET },
                "KB_DATA_BUCKET": { "Ref": KB_DATA_BUCKET },
                "KNOWLEDGE_BASE_ID": get_att(KNOWLEDGE_BASE, "KnowledgeBaseId"),
                "DEFAULT_MODEL_ID": config.models.default_model,
            }
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::standard_graph;

    fn config_with_function() -> AppConfig {
        let mut config = AppConfig::default();
        config.function.code_bucket = Some("artifacts".into());
        config.function.code_key = Some("function.zip".into());
        config
    }

    fn render(config: &AppConfig, through: DeployStep) -> Value {
        let graph = standard_graph(config).expect("graph");
        render_template(&graph, through, config).expect("template")
    }

    fn resource_ids(template: &Value) -> Vec<String> {
        template["Resources"]
            .as_object()
            .expect("resources")
            .keys()
            .cloned()
            .collect()
    }

    #[test]
    fn wildcard_arn_pattern() {
        assert_eq!(
            collection_wildcard_arn("us-east-1", "123456789012"),
            "arn:aws:aoss:us-east-1:123456789012:collection/*"
        );
    }

    #[test]
    fn role_policy_uses_wildcard_collection_pattern() {
        let template = render(&config_with_function(), DeployStep::ProcessingFunction);
        let policy = &template["Resources"][KB_ROLE_POLICY];
        let statements = policy["Properties"]["PolicyDocument"]["Statement"]
            .as_array()
            .expect("statements");
        let aoss = statements
            .iter()
            .find(|s| s["Action"][0] == "aoss:APIAccessAll")
            .expect("aoss statement");
        assert_eq!(
            aoss["Resource"][0]["Fn::Sub"],
            "arn:aws:aoss:${AWS::Region}:${AWS::AccountId}:collection/*"
        );

        // No concrete collection reference anywhere in the role or its policy.
        for id in [KB_ROLE, KB_ROLE_POLICY] {
            let text = template["Resources"][id].to_string();
            assert!(!text.contains(COLLECTION), "{id}: {text}");
        }
    }

    #[test]
    fn foundation_template_excludes_collection() {
        let template = render(&AppConfig::default(), DeployStep::Foundation);
        let ids = resource_ids(&template);
        assert!(ids.contains(&KB_ROLE.to_string()));
        assert!(ids.contains(&DATA_ACCESS_POLICY.to_string()));
        assert!(!ids.contains(&COLLECTION.to_string()));
        assert!(template["Outputs"]["InputBucketName"].is_object());
        assert!(template["Outputs"]["OpenSearchCollectionEndpoint"].is_null());
    }

    #[test]
    fn collection_waits_for_its_policies() {
        let template = render(&AppConfig::default(), DeployStep::Collection);
        let collection = &template["Resources"][COLLECTION];
        assert_eq!(collection["Properties"]["Type"], "VECTORSEARCH");
        let depends: Vec<&str> = collection["DependsOn"]
            .as_array()
            .expect("depends")
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(depends, vec![ENCRYPTION_POLICY, NETWORK_POLICY, DATA_ACCESS_POLICY]);
        assert!(template["Outputs"]["OpenSearchCollectionEndpoint"].is_object());
    }

    #[test]
    fn knowledge_base_step_references_index_by_name() {
        let template = render(&AppConfig::default(), DeployStep::KnowledgeBase);
        let ids = resource_ids(&template);
        assert!(!ids.contains(&VECTOR_INDEX.to_string()));

        let kb = &template["Resources"][KNOWLEDGE_BASE];
        let storage = &kb["Properties"]["StorageConfiguration"]["OpensearchServerlessConfiguration"];
        assert_eq!(storage["VectorIndexName"], "insurance-policy-index");
        assert_eq!(storage["FieldMapping"]["VectorField"], "vector");

        let ds = &template["Resources"][DATA_SOURCE]["Properties"];
        let chunking = &ds["VectorIngestionConfiguration"]["ChunkingConfiguration"];
        assert_eq!(chunking["ChunkingStrategy"], "FIXED_SIZE");
        assert_eq!(chunking["FixedSizeChunkingConfiguration"]["MaxTokens"], 300);
        assert_eq!(chunking["FixedSizeChunkingConfiguration"]["OverlapPercentage"], 20);
        assert_eq!(
            ds["DataSourceConfiguration"]["S3Configuration"]["InclusionPrefixes"][0],
            "policies/"
        );
    }

    #[test]
    fn input_bucket_is_patched_with_trigger_in_last_step() {
        let config = config_with_function();
        let before = render(&config, DeployStep::KnowledgeBase);
        assert!(before["Resources"][INPUT_BUCKET]["Properties"]["NotificationConfiguration"].is_null());

        let after = render(&config, DeployStep::ProcessingFunction);
        let bucket = &after["Resources"][INPUT_BUCKET];
        assert!(bucket["Properties"]["NotificationConfiguration"]["LambdaConfigurations"].is_array());
        let depends = bucket["DependsOn"].to_string();
        assert!(depends.contains(INVOKE_PERMISSION));
        assert_eq!(after["Outputs"]["LambdaFunctionName"]["Value"]["Ref"], FUNCTION);
    }

    #[test]
    fn without_package_function_step_adds_nothing() {
        let mut config = AppConfig::default();
        config.function.package = None;
        let kb = render(&config, DeployStep::KnowledgeBase);
        let full = render(&config, DeployStep::ProcessingFunction);
        assert_eq!(resource_ids(&kb), resource_ids(&full));
    }

    #[test]
    fn function_code_points_at_uploaded_package() {
        let template = render(&AppConfig::default(), DeployStep::ProcessingFunction);
        let code = &template["Resources"][FUNCTION]["Properties"]["Code"];
        assert_eq!(code["S3Bucket"]["Ref"], KB_DATA_BUCKET);

        let template = render(&config_with_function(), DeployStep::ProcessingFunction);
        let function = &template["Resources"][FUNCTION]["Properties"];
        assert_eq!(function["Code"]["S3Bucket"], "artifacts");
        assert_eq!(function["Code"]["S3Key"], "function.zip");
        assert_eq!(function["Runtime"], "provided.al2023");
        assert_eq!(function["Handler"], "bootstrap");
    }

    #[test]
    fn package_key_follows_content() {
        let a = function_package_key(b"zip one");
        assert!(a.starts_with("artifacts/claimstack-function-"));
        assert!(a.ends_with(".zip"));
        assert_eq!(a, function_package_key(b"zip one"));
        assert_ne!(a, function_package_key(b"zip two"));
    }

    #[test]
    fn digest_is_stable_and_step_sensitive() {
        let config = AppConfig::default();
        let a = render(&config, DeployStep::Foundation);
        let b = render(&config, DeployStep::Foundation);
        let c = render(&config, DeployStep::Collection);
        assert_eq!(template_digest(&a), template_digest(&b));
        assert_ne!(template_digest(&a), template_digest(&c));
        assert_eq!(template_digest(&a).len(), 64);
    }

    #[test]
    fn security_policy_names_derive_from_collection() {
        assert_eq!(policy_base_name("insurance-kb-collection"), "insurance-kb");
        let template = render(&AppConfig::default(), DeployStep::Foundation);
        assert_eq!(
            template["Resources"][ENCRYPTION_POLICY]["Properties"]["Name"],
            "insurance-kb-encryption"
        );
        let access = template["Resources"][DATA_ACCESS_POLICY]["Properties"]["Policy"]["Fn::Sub"][0]
            .as_str()
            .expect("policy string")
            .to_string();
        assert!(access.contains("${RoleArn}"));
        assert!(access.contains("index/insurance-kb-collection/*"));
    }
}
