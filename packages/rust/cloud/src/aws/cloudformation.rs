use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_cloudformation::Client;
use aws_sdk_cloudformation::error::ProvideErrorMetadata;
use aws_sdk_cloudformation::primitives::DateTime as SmithyDateTime;
use aws_sdk_cloudformation::types::{Capability, Stack, StackStatus};
use aws_smithy_runtime_api::client::result::SdkError;
use tracing::{debug, instrument};

use claimstack_shared::Result;

use super::{sdk_error, timestamp};
use crate::api::{StackDescription, StackEvent, StackProvisioner};

const SERVICE: &str = "cloudformation";

/// Stack operations through the provisioning engine.
#[derive(Debug, Clone)]
pub struct CloudFormationProvisioner {
    client: Client,
}

impl CloudFormationProvisioner {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }
}

/// Validation errors carry the interesting detail only in their message.
fn message_contains<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>, needle: &str) -> bool {
    err.as_service_error()
        .and_then(|e| e.message())
        .is_some_and(|m| m.contains(needle))
}

fn describe(stack: &Stack) -> StackDescription {
    // Required members come back as plain references, optional ones as
    // `Option`; normalise both.
    let name: Option<&str> = stack.stack_name().into();
    let status: Option<&StackStatus> = stack.stack_status().into();

    let outputs: BTreeMap<String, String> = stack
        .outputs()
        .iter()
        .filter_map(|o| Some((o.output_key()?.to_string(), o.output_value()?.to_string())))
        .collect();

    StackDescription {
        name: name.unwrap_or_default().to_string(),
        status: status.map(|s| s.as_str().to_string()).unwrap_or_default(),
        reason: stack.stack_status_reason().map(str::to_string),
        outputs,
    }
}

#[async_trait]
impl StackProvisioner for CloudFormationProvisioner {
    #[instrument(skip_all, fields(stack = %name))]
    async fn describe_stack(&self, name: &str) -> Result<Option<StackDescription>> {
        match self.client.describe_stacks().stack_name(name).send().await {
            Ok(resp) => Ok(resp.stacks().first().map(describe)),
            Err(err) if message_contains(&err, "does not exist") => Ok(None),
            Err(err) => Err(sdk_error(SERVICE, err)),
        }
    }

    #[instrument(skip_all, fields(stack = %name))]
    async fn create_stack(&self, name: &str, template_body: &str) -> Result<()> {
        let resp = self
            .client
            .create_stack()
            .stack_name(name)
            .template_body(template_body)
            .capabilities(Capability::CapabilityIam)
            .capabilities(Capability::CapabilityNamedIam)
            .send()
            .await
            .map_err(|e| sdk_error(SERVICE, e))?;
        debug!(stack_id = resp.stack_id().unwrap_or_default(), "stack create started");
        Ok(())
    }

    #[instrument(skip_all, fields(stack = %name))]
    async fn update_stack(&self, name: &str, template_body: &str) -> Result<bool> {
        match self
            .client
            .update_stack()
            .stack_name(name)
            .template_body(template_body)
            .capabilities(Capability::CapabilityIam)
            .capabilities(Capability::CapabilityNamedIam)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if message_contains(&err, "No updates are to be performed") => Ok(false),
            Err(err) => Err(sdk_error(SERVICE, err)),
        }
    }

    #[instrument(skip_all, fields(stack = %name))]
    async fn delete_stack(&self, name: &str) -> Result<()> {
        self.client
            .delete_stack()
            .stack_name(name)
            .send()
            .await
            .map_err(|e| sdk_error(SERVICE, e))?;
        Ok(())
    }

    async fn stack_events(&self, name: &str, limit: usize) -> Result<Vec<StackEvent>> {
        let resp = self
            .client
            .describe_stack_events()
            .stack_name(name)
            .send()
            .await
            .map_err(|e| sdk_error(SERVICE, e))?;

        Ok(resp
            .stack_events()
            .iter()
            .take(limit)
            .map(|e| {
                let at: Option<&SmithyDateTime> = e.timestamp().into();
                StackEvent {
                    timestamp: at.and_then(timestamp),
                    logical_id: e.logical_resource_id().unwrap_or_default().to_string(),
                    resource_type: e.resource_type().unwrap_or_default().to_string(),
                    status: e
                        .resource_status()
                        .map(|s| s.as_str().to_string())
                        .unwrap_or_default(),
                    reason: e.resource_status_reason().map(str::to_string),
                }
            })
            .collect())
    }
}
