//! User feedback on analyses, stored as one JSON object per entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use claimstack_cloud::ObjectStore;
use claimstack_shared::{ClaimStackError, Result};

pub const FEEDBACK_PREFIX: &str = "feedback/";
const RECENT_COMMENTS: usize = 10;

/// Fields a client submits.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedbackInput {
    pub rating: Option<u8>,
    pub feedback_type: Option<String>,
    pub model_id: Option<String>,
    pub document_id: Option<String>,
    #[serde(default)]
    pub comment: String,
    pub accuracy_rating: Option<u8>,
    pub speed_rating: Option<u8>,
    pub quality_rating: Option<u8>,
}

impl FeedbackInput {
    fn validate(&self) -> Result<()> {
        let ratings = [
            ("rating", self.rating),
            ("accuracy_rating", self.accuracy_rating),
            ("speed_rating", self.speed_rating),
            ("quality_rating", self.quality_rating),
        ];
        for (name, value) in ratings {
            if let Some(v) = value {
                if !(1..=5).contains(&v) {
                    return Err(ClaimStackError::validation(format!(
                        "{name} must be between 1 and 5, got {v}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub id: String,
    pub timestamp: String,
    pub rating: Option<u8>,
    pub feedback_type: Option<String>,
    pub model_id: Option<String>,
    pub document_id: Option<String>,
    #[serde(default)]
    pub comment: String,
    pub accuracy_rating: Option<u8>,
    pub speed_rating: Option<u8>,
    pub quality_rating: Option<u8>,
    #[serde(default)]
    pub user_agent: String,
}

impl FeedbackEntry {
    pub fn new(input: FeedbackInput, user_agent: impl Into<String>) -> Result<Self> {
        input.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: now.format("%Y%m%d_%H%M%S_%6f").to_string(),
            timestamp: now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            rating: input.rating,
            feedback_type: input.feedback_type,
            model_id: input.model_id,
            document_id: input.document_id,
            comment: input.comment,
            accuracy_rating: input.accuracy_rating,
            speed_rating: input.speed_rating,
            quality_rating: input.quality_rating,
            user_agent: user_agent.into(),
        })
    }

    pub fn key(&self) -> String {
        format!("{FEEDBACK_PREFIX}{}.json", self.id)
    }

    fn type_label(&self) -> &str {
        self.feedback_type.as_deref().unwrap_or("unknown")
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Mean of the present ratings, 0 when there are none.
fn average(ratings: impl Iterator<Item = Option<u8>>) -> (f64, usize) {
    let values: Vec<u8> = ratings.flatten().collect();
    if values.is_empty() {
        return (0.0, 0);
    }
    let sum: u32 = values.iter().map(|v| u32::from(*v)).sum();
    (round2(f64::from(sum) / values.len() as f64), values.len())
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackStatistics {
    pub total: usize,
    pub average_rating: f64,
    pub by_type: BTreeMap<String, usize>,
}

impl FeedbackStatistics {
    pub fn from_entries(entries: &[FeedbackEntry]) -> Self {
        let (average_rating, _) = average(entries.iter().map(|e| e.rating));
        Self {
            total: entries.len(),
            average_rating,
            by_type: count_by_type(entries),
        }
    }
}

fn count_by_type(entries: &[FeedbackEntry]) -> BTreeMap<String, usize> {
    let mut by_type = BTreeMap::new();
    for entry in entries {
        *by_type.entry(entry.type_label().to_string()).or_insert(0) += 1;
    }
    by_type
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RatingSummary {
    pub average: f64,
    pub count: usize,
}

impl RatingSummary {
    fn of(ratings: impl Iterator<Item = Option<u8>>) -> Self {
        let (average, count) = average(ratings);
        Self { average, count }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OverallRating {
    pub average_rating: f64,
    pub total_ratings: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailedRatings {
    pub accuracy: RatingSummary,
    pub speed: RatingSummary,
    pub quality: RatingSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelFeedback {
    pub count: usize,
    pub average_rating: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackReport {
    pub total_feedback: usize,
    pub overall: OverallRating,
    pub detailed: DetailedRatings,
    pub by_type: BTreeMap<String, usize>,
    pub by_model: BTreeMap<String, ModelFeedback>,
    pub recent_comments: Vec<FeedbackEntry>,
}

impl FeedbackReport {
    pub fn from_entries(entries: &[FeedbackEntry]) -> Self {
        let (average_rating, total_ratings) = average(entries.iter().map(|e| e.rating));

        let mut models: BTreeMap<String, Vec<Option<u8>>> = BTreeMap::new();
        for entry in entries {
            let model = entry.model_id.as_deref().unwrap_or("unknown").to_string();
            models.entry(model).or_default().push(entry.rating);
        }
        let by_model = models
            .into_iter()
            .map(|(model, ratings)| {
                let count = ratings.len();
                let (average_rating, _) = average(ratings.into_iter());
                (
                    model,
                    ModelFeedback {
                        count,
                        average_rating,
                    },
                )
            })
            .collect();

        let mut recent_comments: Vec<FeedbackEntry> = entries
            .iter()
            .filter(|e| !e.comment.trim().is_empty())
            .cloned()
            .collect();
        recent_comments.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent_comments.truncate(RECENT_COMMENTS);

        Self {
            total_feedback: entries.len(),
            overall: OverallRating {
                average_rating,
                total_ratings,
            },
            detailed: DetailedRatings {
                accuracy: RatingSummary::of(entries.iter().map(|e| e.accuracy_rating)),
                speed: RatingSummary::of(entries.iter().map(|e| e.speed_rating)),
                quality: RatingSummary::of(entries.iter().map(|e| e.quality_rating)),
            },
            by_type: count_by_type(entries),
            by_model,
            recent_comments,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FeedbackStore {
    objects: Arc<dyn ObjectStore>,
    bucket: String,
}

impl FeedbackStore {
    pub fn new(objects: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            objects,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip_all, fields(bucket = %self.bucket))]
    pub async fn save(&self, entry: &FeedbackEntry) -> Result<()> {
        let body = serde_json::to_vec_pretty(entry)?;
        self.objects
            .put_object(&self.bucket, &entry.key(), body, "application/json")
            .await?;
        info!(id = %entry.id, "feedback saved");
        Ok(())
    }

    /// Every stored entry. Objects that cannot be read or parsed are
    /// skipped with a warning.
    #[instrument(skip_all, fields(bucket = %self.bucket))]
    pub async fn load_all(&self) -> Result<Vec<FeedbackEntry>> {
        let listed = self.objects.list_objects(&self.bucket, FEEDBACK_PREFIX).await?;
        let mut entries = Vec::with_capacity(listed.len());
        for object in listed {
            let body = match self.objects.get_object(&self.bucket, &object.key).await {
                Ok(Some(body)) => body,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %object.key, error = %e, "could not read feedback");
                    continue;
                }
            };
            match serde_json::from_slice::<FeedbackEntry>(&body) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(key = %object.key, error = %e, "skipping malformed feedback"),
            }
        }
        Ok(entries)
    }
}
