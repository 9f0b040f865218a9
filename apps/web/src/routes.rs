//! HTTP routes of the demo application.

use std::collections::BTreeMap;

use axum::extract::multipart::MultipartError;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Request, State};
use axum::http::header::{CONTENT_TYPE, USER_AGENT};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use claimstack_core::feedback::{FeedbackEntry, FeedbackInput, FeedbackReport, FeedbackStatistics};
use claimstack_filter::ContentFilter;

use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;

pub(crate) fn router(state: SharedState) -> Router {
    let body_limit = state.web.max_upload_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/available-models", get(available_models))
        .route("/analyze-claim", post(analyze_claim))
        .route("/upload", post(upload))
        .route("/summaries", get(list_summaries))
        .route("/summary/{*key}", get(get_summary))
        .route("/compare", post(compare))
        .route("/compare-file", post(compare_file))
        .route("/filter-content", post(filter_content))
        .route("/detect-sensitive", post(detect_sensitive))
        .route("/feedback", get(list_feedback).post(submit_feedback))
        .route("/feedback/report", get(feedback_report))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

fn multipart_err(e: MultipartError) -> ApiError {
    ApiError::new(e.status(), e.body_text())
}

/// An uploaded text file plus the plain form fields sent with it.
struct FormUpload {
    filename: String,
    text: String,
    fields: BTreeMap<String, String>,
}

async fn read_form(mut multipart: Multipart) -> ApiResult<FormUpload> {
    let mut file = None;
    let mut fields = BTreeMap::new();
    while let Some(field) = multipart.next_field().await.map_err(multipart_err)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let filename = field.file_name().unwrap_or_default().to_string();
            let bytes = field.bytes().await.map_err(multipart_err)?;
            file = Some((filename, bytes));
        } else {
            let value = field.text().await.map_err(multipart_err)?;
            fields.insert(name, value);
        }
    }

    let (filename, bytes) = file.ok_or_else(|| ApiError::bad_request("No file provided"))?;
    if filename.is_empty() {
        return Err(ApiError::bad_request("No file selected"));
    }
    let text = String::from_utf8(bytes.to_vec())
        .map_err(|_| ApiError::bad_request(format!("{filename} is not UTF-8 text")))?;
    Ok(FormUpload {
        filename,
        text,
        fields,
    })
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"))
}

/// Keep letters, digits, `.`, `-` and `_`; other characters become `_`.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

fn requested_models(state: &SharedState, models: Option<Vec<String>>) -> Vec<String> {
    let models: Vec<String> = models
        .unwrap_or_default()
        .into_iter()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect();
    if models.is_empty() {
        state.models.compare.clone()
    } else {
        models
    }
}

// ---------------------------------------------------------------------------
// Service info
// ---------------------------------------------------------------------------

async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "input_bucket": state.input_bucket,
        "output_bucket": state.output_bucket,
        "knowledge_base": state.analyzer.has_knowledge_base(),
        "model": state.analyzer.model_id(),
    }))
}

async fn available_models(State(state): State<SharedState>) -> Json<Value> {
    let mut families: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for model in &state.models.catalogue {
        families.entry(model.family.as_str()).or_default().push(json!({
            "id": model.id,
            "name": model.name,
            "description": model.description,
            "cost": model.cost,
        }));
    }
    Json(json!(families))
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AnalyzeRequest {
    text: Option<String>,
    filename: Option<String>,
    apply_filtering: Option<bool>,
}

/// Accepts a multipart `file` (with an optional `apply_filtering` field)
/// or a JSON body with `text`.
async fn analyze_claim(State(state): State<SharedState>, request: Request) -> ApiResult<Json<Value>> {
    let (text, filename, apply_filtering) = if is_multipart(request.headers()) {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        let form = read_form(multipart).await?;
        let apply = form
            .fields
            .get("apply_filtering")
            .is_none_or(|v| v.trim().eq_ignore_ascii_case("true"));
        (form.text, form.filename, apply)
    } else {
        let body = json_body(Json::<AnalyzeRequest>::from_request(request, &state).await)?;
        let text = body
            .text
            .ok_or_else(|| ApiError::bad_request("No text provided"))?;
        (
            text,
            body.filename.unwrap_or_else(|| "unknown".into()),
            body.apply_filtering.unwrap_or(true),
        )
    };

    let analysis = state
        .analyzer
        .analyze(&text, &filename, apply_filtering)
        .await?;
    Ok(Json(serde_json::to_value(&analysis).map_err(|e| ApiError::internal(e.to_string()))?))
}

async fn upload(State(state): State<SharedState>, multipart: Multipart) -> ApiResult<Json<Value>> {
    let form = read_form(multipart).await?;
    let bucket = state.input_bucket()?;
    let filename = sanitize_filename(&form.filename);
    let key = format!(
        "documents/{}_{filename}",
        Utc::now().format("%Y%m%d_%H%M%S")
    );
    state
        .objects
        .put_object(bucket, &key, form.text.into_bytes(), "text/plain")
        .await?;
    info!(bucket, key = %key, "document uploaded");
    Ok(Json(json!({
        "message": "File uploaded successfully",
        "filename": filename,
        "s3_key": key,
        "status": "processing",
    })))
}

async fn list_summaries(State(state): State<SharedState>) -> ApiResult<Json<Value>> {
    let bucket = state.output_bucket()?;
    let objects = state.objects.list_objects(bucket, "summaries/").await?;
    let summaries: Vec<Value> = objects
        .into_iter()
        .map(|o| {
            json!({
                "key": o.key,
                "size": o.size,
                "last_modified": o.last_modified.map(|t| t.to_rfc3339()),
            })
        })
        .collect();
    Ok(Json(json!({ "summaries": summaries })))
}

async fn get_summary(State(state): State<SharedState>, Path(key): Path<String>) -> ApiResult<Json<Value>> {
    let bucket = state.output_bucket()?;
    let body = state
        .objects
        .get_object(bucket, &key)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("summary {key} not found")))?;
    let summary: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::internal(format!("summary {key} is not valid JSON: {e}")))?;
    Ok(Json(summary))
}

// ---------------------------------------------------------------------------
// Model comparison
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CompareRequest {
    text: Option<String>,
    models: Option<Vec<String>>,
}

async fn compare(
    State(state): State<SharedState>,
    payload: Result<Json<CompareRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let body = json_body(payload)?;
    let text = body
        .text
        .ok_or_else(|| ApiError::bad_request("No text provided"))?;
    let models = requested_models(&state, body.models);

    let comparison = state.analyzer.compare(&text, &models, false).await;
    Ok(Json(json!({
        "results": comparison.results,
        "report": comparison.report(),
        "models_compared": comparison.models_compared,
    })))
}

async fn compare_file(State(state): State<SharedState>, multipart: Multipart) -> ApiResult<Json<Value>> {
    let form = read_form(multipart).await?;
    let models = form
        .fields
        .get("models")
        .map(|v| v.split(',').map(str::to_string).collect());
    let models = requested_models(&state, models);

    let comparison = state.analyzer.compare(&form.text, &models, false).await;
    Ok(Json(json!({
        "results": comparison.results,
        "report": comparison.report(),
        "models_compared": comparison.models_compared,
        "filename": form.filename,
    })))
}

// ---------------------------------------------------------------------------
// Content filtering
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct FilterRequest {
    text: Option<String>,
    filter_types: Option<Vec<String>>,
}

impl FilterRequest {
    fn parts(self) -> ApiResult<(String, Option<Vec<String>>)> {
        let text = self
            .text
            .ok_or_else(|| ApiError::bad_request("No text provided"))?;
        Ok((text, self.filter_types))
    }
}

async fn filter_content(
    State(state): State<SharedState>,
    payload: Result<Json<FilterRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let (text, types) = json_body(payload)?.parts()?;
    let kinds: Option<Vec<&str>> = types.as_ref().map(|t| t.iter().map(String::as_str).collect());

    let result = state.analyzer.filter().filter(&text, kinds.as_deref());
    let report = ContentFilter::report(&result);
    Ok(Json(json!({
        "filtered_text": result.filtered_text,
        "detections": result.detections,
        "summary": result.summary,
        "report": report,
    })))
}

async fn detect_sensitive(
    State(state): State<SharedState>,
    payload: Result<Json<FilterRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let (text, types) = json_body(payload)?.parts()?;
    let kinds: Option<Vec<&str>> = types.as_ref().map(|t| t.iter().map(String::as_str).collect());

    let report = state.analyzer.filter().detect(&text, kinds.as_deref());
    Ok(Json(json!(report)))
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

async fn submit_feedback(
    State(state): State<SharedState>,
    headers: HeaderMap,
    payload: Result<Json<FeedbackInput>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let input = json_body(payload)?;
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let entry = FeedbackEntry::new(input, user_agent)?;
    state.feedback()?.save(&entry).await?;
    Ok(Json(json!({
        "message": "Feedback submitted successfully",
        "feedback_id": entry.id,
        "storage": "S3",
    })))
}

async fn list_feedback(State(state): State<SharedState>) -> ApiResult<Json<Value>> {
    let store = state.feedback()?;
    let entries = store.load_all().await?;
    let statistics = FeedbackStatistics::from_entries(&entries);
    Ok(Json(json!({
        "feedback": entries,
        "statistics": statistics,
        "storage": "S3",
        "bucket": store.bucket(),
    })))
}

async fn feedback_report(State(state): State<SharedState>) -> ApiResult<Json<Value>> {
    let store = state.feedback()?;
    let entries = store.load_all().await?;
    if entries.is_empty() {
        return Ok(Json(json!({
            "message": "No feedback data available",
            "storage": "S3",
            "bucket": store.bucket(),
        })));
    }
    let mut report = json!(FeedbackReport::from_entries(&entries));
    report["storage"] = json!("S3");
    report["bucket"] = json!(store.bucket());
    Ok(Json(report))
}
