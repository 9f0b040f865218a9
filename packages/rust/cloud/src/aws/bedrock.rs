use async_trait::async_trait;
use aws_sdk_bedrockagent::primitives::DateTime as SmithyDateTime;
use aws_sdk_bedrockagent::types::{IngestionJobStatus, KnowledgeBaseStatus};
use aws_sdk_bedrockagentruntime::types::{
    KnowledgeBaseQuery, KnowledgeBaseRetrievalConfiguration, KnowledgeBaseVectorSearchConfiguration,
};
use aws_sdk_bedrockruntime::primitives::Blob;
use serde_json::Value;
use tracing::{debug, instrument};

use claimstack_shared::{ClaimStackError, IngestionStatus, Result};

use super::{sdk_error, timestamp};
use crate::api::{
    IngestionApi, IngestionJob, KnowledgeBaseAdmin, KnowledgeBaseInfo, ModelRuntime,
    RetrievedPassage, Retriever,
};

// Required members come back as plain references and optional ones as
// `Option`; the `.into()` conversions below normalise both to `Option`.

// ---------------------------------------------------------------------------
// Knowledge base administration and ingestion
// ---------------------------------------------------------------------------

const AGENT: &str = "bedrock-agent";

#[derive(Debug, Clone)]
pub struct BedrockAgent {
    client: aws_sdk_bedrockagent::Client,
}

impl BedrockAgent {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_bedrockagent::Client::new(sdk_config),
        }
    }
}

fn ingestion_job(job: &aws_sdk_bedrockagent::types::IngestionJob) -> IngestionJob {
    let id: Option<&str> = job.ingestion_job_id().into();
    let status: Option<&IngestionJobStatus> = job.status().into();
    let started: Option<&SmithyDateTime> = job.started_at().into();
    let updated: Option<&SmithyDateTime> = job.updated_at().into();
    IngestionJob {
        job_id: id.unwrap_or_default().to_string(),
        status: status
            .map(|s| IngestionStatus::parse(s.as_str()))
            .unwrap_or_else(|| IngestionStatus::Unknown("UNKNOWN".into())),
        failure_reasons: job.failure_reasons().to_vec(),
        started_at: started.and_then(timestamp),
        updated_at: updated.and_then(timestamp),
    }
}

fn missing_job(job_id: &str) -> ClaimStackError {
    ClaimStackError::external(AGENT, format!("response for ingestion job {job_id} had no job"))
}

#[async_trait]
impl KnowledgeBaseAdmin for BedrockAgent {
    #[instrument(skip_all, fields(kb_id = %id))]
    async fn knowledge_base(&self, id: &str) -> Result<Option<KnowledgeBaseInfo>> {
        let resp = match self
            .client
            .get_knowledge_base()
            .knowledge_base_id(id)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_resource_not_found_exception()) =>
            {
                return Ok(None);
            }
            Err(err) => return Err(sdk_error(AGENT, err)),
        };

        Ok(resp.knowledge_base().map(|kb| {
            let kb_id: Option<&str> = kb.knowledge_base_id().into();
            let name: Option<&str> = kb.name().into();
            let status: Option<&KnowledgeBaseStatus> = kb.status().into();
            KnowledgeBaseInfo {
                id: kb_id.unwrap_or(id).to_string(),
                name: name.unwrap_or_default().to_string(),
                status: status.map(|s| s.as_str().to_string()).unwrap_or_default(),
            }
        }))
    }

    #[instrument(skip_all, fields(name = %name))]
    async fn find_knowledge_base(&self, name: &str) -> Result<Option<KnowledgeBaseInfo>> {
        let mut pages = self
            .client
            .list_knowledge_bases()
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| sdk_error(AGENT, e))?;
            for summary in page.knowledge_base_summaries() {
                let summary_name: Option<&str> = summary.name().into();
                if summary_name != Some(name) {
                    continue;
                }
                let kb_id: Option<&str> = summary.knowledge_base_id().into();
                let status: Option<&KnowledgeBaseStatus> = summary.status().into();
                return Ok(Some(KnowledgeBaseInfo {
                    id: kb_id.unwrap_or_default().to_string(),
                    name: name.to_string(),
                    status: status.map(|s| s.as_str().to_string()).unwrap_or_default(),
                }));
            }
        }
        Ok(None)
    }

    #[instrument(skip_all, fields(kb_id = %id))]
    async fn delete_knowledge_base(&self, id: &str) -> Result<()> {
        self.client
            .delete_knowledge_base()
            .knowledge_base_id(id)
            .send()
            .await
            .map_err(|e| sdk_error(AGENT, e))?;
        Ok(())
    }
}

#[async_trait]
impl IngestionApi for BedrockAgent {
    #[instrument(skip_all, fields(kb_id = %kb_id, data_source_id = %data_source_id))]
    async fn start_ingestion(&self, kb_id: &str, data_source_id: &str) -> Result<IngestionJob> {
        let resp = self
            .client
            .start_ingestion_job()
            .knowledge_base_id(kb_id)
            .data_source_id(data_source_id)
            .send()
            .await
            .map_err(|e| sdk_error(AGENT, e))?;
        let job = resp.ingestion_job().map(ingestion_job).ok_or_else(|| {
            ClaimStackError::external(AGENT, "start_ingestion_job returned no job")
        })?;
        debug!(job_id = %job.job_id, "ingestion job started");
        Ok(job)
    }

    async fn ingestion_job(
        &self,
        kb_id: &str,
        data_source_id: &str,
        job_id: &str,
    ) -> Result<IngestionJob> {
        let resp = self
            .client
            .get_ingestion_job()
            .knowledge_base_id(kb_id)
            .data_source_id(data_source_id)
            .ingestion_job_id(job_id)
            .send()
            .await
            .map_err(|e| sdk_error(AGENT, e))?;
        resp.ingestion_job()
            .map(ingestion_job)
            .ok_or_else(|| missing_job(job_id))
    }

    async fn list_ingestion_jobs(
        &self,
        kb_id: &str,
        data_source_id: &str,
        limit: usize,
    ) -> Result<Vec<IngestionJob>> {
        let resp = self
            .client
            .list_ingestion_jobs()
            .knowledge_base_id(kb_id)
            .data_source_id(data_source_id)
            .send()
            .await
            .map_err(|e| sdk_error(AGENT, e))?;

        let mut jobs: Vec<IngestionJob> = resp
            .ingestion_job_summaries()
            .iter()
            .map(|s| {
                let id: Option<&str> = s.ingestion_job_id().into();
                let status: Option<&IngestionJobStatus> = s.status().into();
                let started: Option<&SmithyDateTime> = s.started_at().into();
                let updated: Option<&SmithyDateTime> = s.updated_at().into();
                IngestionJob {
                    job_id: id.unwrap_or_default().to_string(),
                    status: status
                        .map(|st| IngestionStatus::parse(st.as_str()))
                        .unwrap_or_else(|| IngestionStatus::Unknown("UNKNOWN".into())),
                    failure_reasons: Vec::new(),
                    started_at: started.and_then(timestamp),
                    updated_at: updated.and_then(timestamp),
                }
            })
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

// ---------------------------------------------------------------------------
// Model invocation
// ---------------------------------------------------------------------------

const RUNTIME: &str = "bedrock-runtime";

#[derive(Debug, Clone)]
pub struct BedrockRuntime {
    client: aws_sdk_bedrockruntime::Client,
}

impl BedrockRuntime {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_bedrockruntime::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl ModelRuntime for BedrockRuntime {
    #[instrument(skip_all, fields(model_id = %model_id))]
    async fn invoke(&self, model_id: &str, body: &Value) -> Result<Value> {
        let payload = serde_json::to_vec(body)?;
        let resp = self
            .client
            .invoke_model()
            .model_id(model_id)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(payload))
            .send()
            .await
            .map_err(|e| sdk_error(RUNTIME, e))?;

        let blob: Option<&Blob> = resp.body().into();
        let bytes = blob.map(|b| b.as_ref()).unwrap_or_default();
        serde_json::from_slice(bytes).map_err(|e| {
            ClaimStackError::external(RUNTIME, format!("{model_id} returned invalid JSON: {e}"))
        })
    }
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

const AGENT_RUNTIME: &str = "bedrock-agent-runtime";

#[derive(Debug, Clone)]
pub struct BedrockRetriever {
    client: aws_sdk_bedrockagentruntime::Client,
}

impl BedrockRetriever {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_bedrockagentruntime::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl Retriever for BedrockRetriever {
    #[instrument(skip_all, fields(kb_id = %kb_id, max_results))]
    async fn retrieve(
        &self,
        kb_id: &str,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<RetrievedPassage>> {
        let build_err = |e: aws_sdk_bedrockagentruntime::error::BuildError| {
            ClaimStackError::external(AGENT_RUNTIME, format!("building retrieve request: {e}"))
        };
        let query = KnowledgeBaseQuery::builder().text(query).build().map_err(build_err)?;
        let config = KnowledgeBaseRetrievalConfiguration::builder()
            .vector_search_configuration(
                KnowledgeBaseVectorSearchConfiguration::builder()
                    .number_of_results(i32::try_from(max_results).unwrap_or(i32::MAX))
                    .build(),
            )
            .build();

        let resp = self
            .client
            .retrieve()
            .knowledge_base_id(kb_id)
            .retrieval_query(query)
            .retrieval_configuration(config)
            .send()
            .await
            .map_err(|e| sdk_error(AGENT_RUNTIME, e))?;

        Ok(resp
            .retrieval_results()
            .iter()
            .filter_map(|r| {
                let content: Option<&aws_sdk_bedrockagentruntime::types::RetrievalResultContent> =
                    r.content().into();
                let text: Option<&str> = content?.text().into();
                let score: Option<f64> = r.score().into();
                let source = r
                    .location()
                    .and_then(|l| l.s3_location())
                    .and_then(|s3| s3.uri())
                    .map(str::to_string);
                Some(RetrievedPassage {
                    text: text?.to_string(),
                    score,
                    source,
                })
            })
            .collect())
    }
}
