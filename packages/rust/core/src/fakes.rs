//! Scripted in-memory implementations of the service seams.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use claimstack_cloud::{
    CollectionApi, CollectionInfo, IndexApi, IndexConnector, IndexCreation, IngestionApi,
    IngestionJob, KnowledgeBaseAdmin, KnowledgeBaseInfo, MemoryObjectStore, ModelRuntime,
    RetrievedPassage, Retriever, StackDescription, StackEvent, StackProvisioner,
};
use claimstack_shared::{
    AppConfig, ClaimStackError, CollectionState, IndexShape, IngestionStatus, Result,
    VectorIndexSpec,
};

use crate::Services;

/// Calls observed across several fakes, in order.
pub type EventLog = Arc<Mutex<Vec<String>>>;

fn log(events: &EventLog, event: &str) {
    events.lock().unwrap().push(event.to_string());
}

/// Pops scripted values; the last one repeats forever.
fn next_scripted<T: Clone>(script: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut script = script.lock().unwrap();
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

// ---------------------------------------------------------------------------
// Provisioning engine
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeProvisioner {
    pub stack: Mutex<Option<StackDescription>>,
    pub templates: Mutex<Vec<Value>>,
    pub calls: Mutex<Vec<String>>,
    /// When set, the next create/update ends in this status.
    pub fail_with: Mutex<Option<String>>,
}

impl FakeProvisioner {
    fn outputs_of(template: &Value) -> BTreeMap<String, String> {
        template["Outputs"]
            .as_object()
            .map(|outputs| {
                outputs
                    .keys()
                    .map(|key| {
                        let value = if key == "OpenSearchCollectionEndpoint" {
                            "https://fake.us-east-1.aoss.amazonaws.com".to_string()
                        } else {
                            format!("fake-{key}")
                        };
                        (key.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn apply(&self, name: &str, body: &str, status: &str) -> Result<()> {
        let template: Value = serde_json::from_str(body)?;
        let failure = self.fail_with.lock().unwrap().take();
        let (status, reason) = match failure {
            Some(failed) => (failed, Some("Resource handler returned message".to_string())),
            None => (status.to_string(), None),
        };
        *self.stack.lock().unwrap() = Some(StackDescription {
            name: name.to_string(),
            status,
            reason,
            outputs: Self::outputs_of(&template),
        });
        self.templates.lock().unwrap().push(template);
        Ok(())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last_template(&self) -> Option<Value> {
        self.templates.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl StackProvisioner for FakeProvisioner {
    async fn describe_stack(&self, _name: &str) -> Result<Option<StackDescription>> {
        Ok(self.stack.lock().unwrap().clone())
    }

    async fn create_stack(&self, name: &str, template_body: &str) -> Result<()> {
        self.calls.lock().unwrap().push("create".into());
        self.apply(name, template_body, "CREATE_COMPLETE")
    }

    async fn update_stack(&self, name: &str, template_body: &str) -> Result<bool> {
        let unchanged = self
            .templates
            .lock()
            .unwrap()
            .last()
            .is_some_and(|t| t.to_string() == template_body);
        if unchanged {
            self.calls.lock().unwrap().push("noop".into());
            return Ok(false);
        }
        self.calls.lock().unwrap().push("update".into());
        self.apply(name, template_body, "UPDATE_COMPLETE")?;
        Ok(true)
    }

    async fn delete_stack(&self, _name: &str) -> Result<()> {
        self.calls.lock().unwrap().push("delete".into());
        *self.stack.lock().unwrap() = None;
        Ok(())
    }

    async fn stack_events(&self, _name: &str, _limit: usize) -> Result<Vec<StackEvent>> {
        Ok(vec![StackEvent {
            timestamp: Some(Utc::now()),
            logical_id: "KnowledgeBaseCollection".into(),
            resource_type: "AWS::OpenSearchServerless::Collection".into(),
            status: "CREATE_FAILED".into(),
            reason: Some("policy name already exists".into()),
        }])
    }
}

// ---------------------------------------------------------------------------
// Vector search
// ---------------------------------------------------------------------------

pub struct FakeCollections {
    pub states: Mutex<VecDeque<Option<CollectionState>>>,
    pub calls: AtomicUsize,
}

impl FakeCollections {
    pub fn scripted(states: &[CollectionState]) -> Self {
        Self {
            states: Mutex::new(states.iter().cloned().map(Some).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn active() -> Self {
        Self::scripted(&[CollectionState::Active])
    }

    pub fn missing() -> Self {
        Self {
            states: Mutex::new(VecDeque::from([None])),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CollectionApi for FakeCollections {
    async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(next_scripted(&self.states).flatten().map(|state| CollectionInfo {
            id: "col123".into(),
            name: name.to_string(),
            arn: Some("arn:aws:aoss:us-east-1:123456789012:collection/col123".into()),
            endpoint: Some("https://fake.us-east-1.aoss.amazonaws.com".into()),
            state,
        }))
    }
}

#[derive(Default)]
pub struct FakeIndex {
    pub shape: Mutex<Option<IndexShape>>,
    pub creates: AtomicUsize,
    pub deletes: AtomicUsize,
    pub calls: AtomicUsize,
    pub events: EventLog,
}

impl FakeIndex {
    pub fn with_shape(shape: IndexShape) -> Self {
        Self {
            shape: Mutex::new(Some(shape)),
            ..Self::default()
        }
    }
}

#[async_trait]
impl IndexApi for FakeIndex {
    async fn index_shape(&self, _index: &str, _vector_field: &str) -> Result<Option<IndexShape>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.shape.lock().unwrap().clone())
    }

    async fn create_index(&self, spec: &VectorIndexSpec) -> Result<IndexCreation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut shape = self.shape.lock().unwrap();
        if shape.is_some() {
            return Ok(IndexCreation::AlreadyExists);
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        log(&self.events, "create_index");
        *shape = Some(spec.shape());
        Ok(IndexCreation::Created)
    }

    async fn delete_index(&self, _index: &str) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        log(&self.events, "delete_index");
        Ok(self.shape.lock().unwrap().take().is_some())
    }
}

pub struct FakeConnector(pub Arc<FakeIndex>);

impl IndexConnector for FakeConnector {
    fn connect(&self, _endpoint: &str) -> Result<Arc<dyn IndexApi>> {
        Ok(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// Knowledge base and ingestion
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeKnowledgeBases {
    pub existing: Mutex<Vec<KnowledgeBaseInfo>>,
    pub deleted: Mutex<Vec<String>>,
    pub events: EventLog,
}

impl FakeKnowledgeBases {
    pub fn with(id: &str, name: &str) -> Self {
        Self {
            existing: Mutex::new(vec![KnowledgeBaseInfo {
                id: id.into(),
                name: name.into(),
                status: "ACTIVE".into(),
            }]),
            deleted: Mutex::default(),
            events: EventLog::default(),
        }
    }
}

#[async_trait]
impl KnowledgeBaseAdmin for FakeKnowledgeBases {
    async fn knowledge_base(&self, id: &str) -> Result<Option<KnowledgeBaseInfo>> {
        let found = self
            .existing
            .lock()
            .unwrap()
            .iter()
            .find(|kb| kb.id == id)
            .cloned();
        if found.is_none() && self.deleted.lock().unwrap().iter().any(|d| d == id) {
            log(&self.events, "kb_gone");
        }
        Ok(found)
    }

    async fn find_knowledge_base(&self, name: &str) -> Result<Option<KnowledgeBaseInfo>> {
        Ok(self
            .existing
            .lock()
            .unwrap()
            .iter()
            .find(|kb| kb.name == name)
            .cloned())
    }

    async fn delete_knowledge_base(&self, id: &str) -> Result<()> {
        self.existing.lock().unwrap().retain(|kb| kb.id != id);
        log(&self.events, "delete_kb");
        self.deleted.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

pub struct FakeIngestion {
    pub statuses: Mutex<VecDeque<IngestionStatus>>,
    pub failure_reasons: Vec<String>,
    pub starts: AtomicUsize,
    pub polls: AtomicUsize,
}

impl FakeIngestion {
    pub fn scripted(statuses: &[IngestionStatus]) -> Self {
        Self {
            statuses: Mutex::new(statuses.iter().cloned().collect()),
            failure_reasons: Vec::new(),
            starts: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        }
    }

    fn job(&self, status: IngestionStatus) -> IngestionJob {
        let failure_reasons = if status == IngestionStatus::Failed {
            self.failure_reasons.clone()
        } else {
            Vec::new()
        };
        IngestionJob {
            job_id: "JOB123".into(),
            status,
            failure_reasons,
            started_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
        }
    }
}

#[async_trait]
impl IngestionApi for FakeIngestion {
    async fn start_ingestion(&self, _kb_id: &str, _data_source_id: &str) -> Result<IngestionJob> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(self.job(IngestionStatus::Starting))
    }

    async fn ingestion_job(
        &self,
        _kb_id: &str,
        _data_source_id: &str,
        _job_id: &str,
    ) -> Result<IngestionJob> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let status = next_scripted(&self.statuses)
            .ok_or_else(|| ClaimStackError::external("bedrock-agent", "script exhausted"))?;
        Ok(self.job(status))
    }

    async fn list_ingestion_jobs(
        &self,
        _kb_id: &str,
        _data_source_id: &str,
        limit: usize,
    ) -> Result<Vec<IngestionJob>> {
        let status = self
            .statuses
            .lock()
            .unwrap()
            .back()
            .cloned()
            .unwrap_or(IngestionStatus::Complete);
        Ok(std::iter::repeat_with(|| self.job(status.clone()))
            .take(limit.min(1))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// Answers in the messages response shape. Extraction prompts get a JSON
/// document that repeats the claimant's policy number and SSN, so tests can
/// check that outputs are masked.
#[derive(Default)]
pub struct FakeRuntime {
    pub prompts: Mutex<Vec<(String, String)>>,
    pub failing_models: Vec<String>,
}

impl FakeRuntime {
    pub fn failing(model: &str) -> Self {
        Self {
            failing_models: vec![model.to_string()],
            ..Self::default()
        }
    }

    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelRuntime for FakeRuntime {
    async fn invoke(&self, model_id: &str, body: &Value) -> Result<Value> {
        if self.failing_models.iter().any(|m| m == model_id) {
            return Err(ClaimStackError::external(
                "bedrock-runtime",
                format!("{model_id}: ThrottlingException"),
            ));
        }
        let prompt = body["messages"][0]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.prompts
            .lock()
            .unwrap()
            .push((model_id.to_string(), prompt.clone()));

        let text = if prompt.contains("Extract the following") {
            r#"{"claimant_name": "Jane Doe", "policy_number": "AUTO-2024-778899", "ssn": "123-45-6789", "incident_date": "2024-03-14", "claim_amount": "$4,250", "incident_description": "Rear-end collision; police report number 24-1187; other driver information exchanged"}"#.to_string()
        } else if prompt.contains("Compare these two summaries") {
            "Both summaries agree on the collision; the second is shorter.".to_string()
        } else {
            format!("{model_id} summary: rear-end collision, claim of $4,250, policy number AUTO-2024-778899.")
        };
        Ok(json!({ "content": [{ "type": "text", "text": text }] }))
    }
}

pub struct FakeRetriever {
    pub passages: Vec<RetrievedPassage>,
    pub fail: bool,
}

#[async_trait]
impl Retriever for FakeRetriever {
    async fn retrieve(
        &self,
        _kb_id: &str,
        _query: &str,
        max_results: u32,
    ) -> Result<Vec<RetrievedPassage>> {
        if self.fail {
            return Err(ClaimStackError::external("bedrock-agent-runtime", "AccessDenied"));
        }
        Ok(self
            .passages
            .iter()
            .take(max_results as usize)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Bundles
// ---------------------------------------------------------------------------

pub struct Fakes {
    pub provisioner: Arc<FakeProvisioner>,
    pub collections: Arc<FakeCollections>,
    pub index: Arc<FakeIndex>,
    pub knowledge_bases: Arc<FakeKnowledgeBases>,
    pub ingestion: Arc<FakeIngestion>,
    pub objects: Arc<MemoryObjectStore>,
}

impl Fakes {
    pub fn new(collections: FakeCollections) -> Self {
        Self {
            provisioner: Arc::new(FakeProvisioner::default()),
            collections: Arc::new(collections),
            index: Arc::new(FakeIndex::default()),
            knowledge_bases: Arc::new(FakeKnowledgeBases::default()),
            ingestion: Arc::new(FakeIngestion::scripted(&[IngestionStatus::Complete])),
            objects: Arc::new(MemoryObjectStore::new()),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            provisioner: self.provisioner.clone(),
            collections: self.collections.clone(),
            index_connector: Arc::new(FakeConnector(self.index.clone())),
            knowledge_bases: self.knowledge_bases.clone(),
            ingestion: self.ingestion.clone(),
            objects: self.objects.clone(),
        }
    }
}

/// Default configuration with instant waits.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    for section in [&mut config.wait.collection, &mut config.wait.stack] {
        section.initial_interval_secs = 0;
        section.max_interval_secs = 0;
    }
    config.ingestion.poll_interval_secs = 0;
    config
}
