//! Knowledge base ingestion: document upload, job start, and monitoring.
//!
//! Jobs are polled at a fixed interval until they reach a terminal state.
//! A `FAILED` or `STOPPED` job is surfaced with its failure reasons and is
//! never retried here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use claimstack_cloud::{IngestionApi, IngestionJob, ObjectStore};
use claimstack_shared::{ClaimStackError, IngestionConfig, IngestionStatus, Result};
use claimstack_storage::{IngestionRecord, Journal};

use crate::progress::ProgressReporter;
use crate::wait::{PollState, WaitPolicy, poll_until};

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub bucket: String,
    pub keys: Vec<String>,
    pub bytes: u64,
}

/// Content type recorded on uploaded source documents.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("html" | "htm") => "text/html",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("doc") => "application/msword",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        _ => "application/octet-stream",
    }
}

/// Object key for `file_name` under `prefix`, with exactly one separator.
fn object_key(prefix: &str, file_name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        file_name.to_string()
    } else {
        format!("{prefix}/{file_name}")
    }
}

async fn list_documents(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| ClaimStackError::io(dir, e))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ClaimStackError::io(dir, e))?
    {
        let path = entry.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_none_or(|n| n.starts_with('.'));
        let is_file = entry
            .file_type()
            .await
            .map_err(|e| ClaimStackError::io(&path, e))?
            .is_file();
        if is_file && !hidden {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Upload every regular, non-hidden file in `dir` to `bucket` under `prefix`.
#[instrument(skip_all, fields(bucket = %bucket, prefix = %prefix, dir = %dir.display()))]
pub async fn upload_documents(
    objects: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    dir: &Path,
    progress: &dyn ProgressReporter,
) -> Result<UploadReport> {
    let files = list_documents(dir).await?;
    if files.is_empty() {
        return Err(ClaimStackError::operator(format!(
            "no documents found in {}; add policy documents there or pass --docs",
            dir.display()
        )));
    }

    let total = files.len();
    let mut report = UploadReport {
        bucket: bucket.to_string(),
        keys: Vec::with_capacity(total),
        bytes: 0,
    };
    for (i, path) in files.iter().enumerate() {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| ClaimStackError::io(path, e))?;
        let key = object_key(prefix, file_name);
        report.bytes += body.len() as u64;
        objects
            .put_object(bucket, &key, body, content_type_for(path))
            .await?;
        progress.item(file_name, i + 1, total);
        report.keys.push(key);
    }
    info!(documents = total, bytes = report.bytes, "documents uploaded");
    Ok(report)
}

// ---------------------------------------------------------------------------
// Monitoring
// ---------------------------------------------------------------------------

pub struct IngestionMonitor<'a> {
    api: &'a dyn IngestionApi,
    progress: &'a dyn ProgressReporter,
    journal: Option<&'a Journal>,
    policy: WaitPolicy,
}

impl<'a> IngestionMonitor<'a> {
    /// Fixed-interval polling; `timeout_secs = 0` waits without a bound.
    pub fn new(
        api: &'a dyn IngestionApi,
        config: &IngestionConfig,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        let timeout = (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs));
        Self {
            api,
            progress,
            journal: None,
            policy: WaitPolicy::fixed(Duration::from_secs(config.poll_interval_secs), timeout),
        }
    }

    pub fn with_journal(mut self, journal: &'a Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Start one job and wait for it to finish.
    #[instrument(skip_all, fields(kb_id = %kb_id, data_source_id = %data_source_id))]
    pub async fn start_and_wait(
        &self,
        kb_id: &str,
        data_source_id: &str,
    ) -> Result<IngestionJob> {
        let job = self.api.start_ingestion(kb_id, data_source_id).await?;
        info!(job_id = %job.job_id, "ingestion job started");
        self.record(kb_id, data_source_id, &job).await;
        self.wait(kb_id, data_source_id, &job.job_id).await
    }

    /// Poll an existing job until `COMPLETE`, or fail with its reasons.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn wait(
        &self,
        kb_id: &str,
        data_source_id: &str,
        job_id: &str,
    ) -> Result<IngestionJob> {
        let what = format!("ingestion job {job_id}");
        let job = poll_until(&self.policy, &what, self.progress, || async move {
            let job = self.api.ingestion_job(kb_id, data_source_id, job_id).await?;
            self.record(kb_id, data_source_id, &job).await;
            match job.status {
                IngestionStatus::Complete => Ok(PollState::Ready(job)),
                IngestionStatus::Failed | IngestionStatus::Stopped => {
                    let mut reasons = job.failure_reasons;
                    if reasons.is_empty() {
                        reasons.push(format!("job ended in {} without a reason", job.status));
                    }
                    Err(ClaimStackError::IngestionFailed {
                        job_id: job.job_id,
                        reasons,
                    })
                }
                ref status => Ok(PollState::Pending(status.to_string())),
            }
        })
        .await?;
        info!("ingestion complete");
        Ok(job)
    }

    async fn record(&self, kb_id: &str, data_source_id: &str, job: &IngestionJob) {
        let Some(journal) = self.journal else {
            return;
        };
        let now = Utc::now();
        let record = IngestionRecord {
            job_id: job.job_id.clone(),
            knowledge_base_id: kb_id.to_string(),
            data_source_id: data_source_id.to_string(),
            status: job.status.to_string(),
            failure_reasons: job.failure_reasons.clone(),
            started_at: job.started_at.unwrap_or(now),
            updated_at: job.updated_at.unwrap_or(now),
        };
        if let Err(e) = journal.record_ingestion(&record).await {
            warn!(error = %e, job_id = %job.job_id, "could not journal ingestion job");
        }
    }
}

/// Most recent jobs of a data source, newest first.
pub async fn latest_jobs(
    api: &dyn IngestionApi,
    kb_id: &str,
    data_source_id: &str,
    limit: usize,
) -> Result<Vec<IngestionJob>> {
    api.list_ingestion_jobs(kb_id, data_source_id, limit).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::fakes::FakeIngestion;
    use crate::progress::SilentProgress;
    use claimstack_cloud::MemoryObjectStore;
    use uuid::Uuid;

    fn instant() -> IngestionConfig {
        IngestionConfig {
            poll_interval_secs: 0,
            timeout_secs: 60,
            ..IngestionConfig::default()
        }
    }

    #[tokio::test]
    async fn completes_and_stops_polling() {
        let api = FakeIngestion::scripted(&[
            IngestionStatus::Starting,
            IngestionStatus::InProgress,
            IngestionStatus::InProgress,
            IngestionStatus::Complete,
        ]);
        let job = IngestionMonitor::new(&api, &instant(), &SilentProgress)
            .start_and_wait("KB1", "DS1")
            .await
            .expect("ingestion completes");

        assert_eq!(job.status, IngestionStatus::Complete);
        assert_eq!(api.starts.load(Ordering::SeqCst), 1);
        assert_eq!(api.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failure_surfaces_reasons() {
        let mut api = FakeIngestion::scripted(&[
            IngestionStatus::Starting,
            IngestionStatus::InProgress,
            IngestionStatus::Failed,
        ]);
        api.failure_reasons = vec![
            "The vector dimension 1536 does not match the index dimension 1024".into(),
        ];

        let err = IngestionMonitor::new(&api, &instant(), &SilentProgress)
            .start_and_wait("KB1", "DS1")
            .await
            .unwrap_err();

        match err {
            ClaimStackError::IngestionFailed { job_id, reasons } => {
                assert_eq!(job_id, "JOB123");
                assert!(reasons[0].contains("does not match the index dimension"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(api.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stopped_job_is_a_failure() {
        let api = FakeIngestion::scripted(&[IngestionStatus::Stopped]);
        let err = IngestionMonitor::new(&api, &instant(), &SilentProgress)
            .wait("KB1", "DS1", "JOB123")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("STOPPED"));
    }

    #[tokio::test]
    async fn journal_keeps_final_status() {
        let tmp = std::env::temp_dir().join(format!("cs_ingest_{}.db", Uuid::now_v7()));
        let journal = Journal::open(&tmp).await.unwrap();
        let api = FakeIngestion::scripted(&[IngestionStatus::InProgress, IngestionStatus::Complete]);

        IngestionMonitor::new(&api, &instant(), &SilentProgress)
            .with_journal(&journal)
            .start_and_wait("KB1", "DS1")
            .await
            .unwrap();

        let jobs = journal.recent_ingestions("KB1", 5).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, "COMPLETE");
    }

    #[tokio::test]
    async fn uploads_visible_files_under_prefix() {
        let dir = std::env::temp_dir().join(format!("cs_docs_{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("auto-policy.txt"), "Collision coverage...").unwrap();
        std::fs::write(dir.join("medical.md"), "# Medical payments").unwrap();
        std::fs::write(dir.join(".DS_Store"), "junk").unwrap();

        let store = MemoryObjectStore::new();
        let report = upload_documents(&store, "kb-data", "policies/", &dir, &SilentProgress)
            .await
            .expect("upload");

        assert_eq!(
            report.keys,
            vec!["policies/auto-policy.txt", "policies/medical.md"]
        );
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.content_type("kb-data", "policies/medical.md").as_deref(),
            Some("text/markdown")
        );
    }

    #[tokio::test]
    async fn empty_directory_is_an_operator_error() {
        let dir = std::env::temp_dir().join(format!("cs_empty_{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let err = upload_documents(
            &MemoryObjectStore::new(),
            "kb-data",
            "policies/",
            &dir,
            &SilentProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClaimStackError::Operator { .. }));
    }

    #[test]
    fn keys_have_one_separator() {
        assert_eq!(object_key("policies/", "a.txt"), "policies/a.txt");
        assert_eq!(object_key("policies", "a.txt"), "policies/a.txt");
        assert_eq!(object_key("", "a.txt"), "a.txt");
    }
}
