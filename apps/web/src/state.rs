//! Shared handler state.

use std::sync::Arc;

use claimstack_cloud::ObjectStore;
use claimstack_core::feedback::FeedbackStore;
use claimstack_core::processing::ClaimAnalyzer;
use claimstack_shared::{ModelsConfig, WebConfig};

use crate::error::ApiError;

pub(crate) struct AppState {
    pub analyzer: ClaimAnalyzer,
    pub objects: Arc<dyn ObjectStore>,
    pub input_bucket: Option<String>,
    pub output_bucket: Option<String>,
    pub feedback: Option<FeedbackStore>,
    pub models: ModelsConfig,
    pub web: WebConfig,
}

impl AppState {
    pub(crate) fn input_bucket(&self) -> Result<&str, ApiError> {
        self.input_bucket
            .as_deref()
            .ok_or_else(|| ApiError::internal("input bucket is not configured (INPUT_BUCKET)"))
    }

    pub(crate) fn output_bucket(&self) -> Result<&str, ApiError> {
        self.output_bucket
            .as_deref()
            .ok_or_else(|| ApiError::internal("output bucket is not configured (OUTPUT_BUCKET)"))
    }

    pub(crate) fn feedback(&self) -> Result<&FeedbackStore, ApiError> {
        self.feedback
            .as_ref()
            .ok_or_else(|| ApiError::internal("feedback bucket is not configured (FEEDBACK_BUCKET)"))
    }
}

pub(crate) type SharedState = Arc<AppState>;
