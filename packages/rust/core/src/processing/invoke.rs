//! Model-family request and response shapes.

use serde_json::{Value, json};
use tracing::{debug, instrument};

use claimstack_cloud::ModelRuntime;
use claimstack_shared::{ClaimStackError, Result};

pub const MAX_TOKENS: u32 = 1000;
/// Deterministic extraction.
pub const EXTRACT_TEMPERATURE: f64 = 0.0;
pub const SUMMARY_TEMPERATURE: f64 = 0.7;

const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Anthropic and Mistral messages API.
    Messages,
    /// Amazon Nova.
    Nova,
    /// OpenAI gpt-oss.
    GptOss,
}

impl ModelFamily {
    /// Family of a model id, ignoring a cross-region inference profile
    /// prefix such as `us.` or `eu.`.
    pub fn of(model_id: &str) -> Self {
        let base = ["us.", "eu.", "apac.", "global."]
            .iter()
            .find_map(|prefix| model_id.strip_prefix(prefix))
            .unwrap_or(model_id);
        if base.starts_with("amazon.nova") {
            Self::Nova
        } else if base.starts_with("openai.gpt-oss") {
            Self::GptOss
        } else {
            Self::Messages
        }
    }

    pub fn request_body(self, model_id: &str, prompt: &str, temperature: f64, max_tokens: u32) -> Value {
        match self {
            Self::Nova => json!({
                "messages": [{ "role": "user", "content": [{ "text": prompt }] }],
                "inferenceConfig": { "max_new_tokens": max_tokens, "temperature": temperature },
            }),
            Self::GptOss => json!({
                "model": model_id,
                "messages": [{ "role": "user", "content": prompt }],
                "max_completion_tokens": max_tokens,
                "temperature": temperature,
            }),
            Self::Messages => json!({
                "anthropic_version": ANTHROPIC_VERSION,
                "max_tokens": max_tokens,
                "messages": [{ "role": "user", "content": prompt }],
                "temperature": temperature,
            }),
        }
    }

    /// Generated text, falling back to a top-level `completion` field.
    pub fn response_text(self, body: &Value) -> Option<String> {
        let text = match self {
            Self::Nova => body.pointer("/output/message/content/0/text"),
            Self::GptOss => body.pointer("/choices/0/message/content"),
            Self::Messages => body.pointer("/content/0/text"),
        };
        text.or_else(|| body.get("completion"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Run one prompt against `model_id`.
#[instrument(skip_all, fields(model_id = %model_id, temperature = temperature))]
pub async fn generate(
    runtime: &dyn ModelRuntime,
    model_id: &str,
    prompt: &str,
    temperature: f64,
) -> Result<String> {
    let family = ModelFamily::of(model_id);
    let body = family.request_body(model_id, prompt, temperature, MAX_TOKENS);
    let response = runtime.invoke(model_id, &body).await?;
    let text = family.response_text(&response).ok_or_else(|| {
        ClaimStackError::external(
            "bedrock-runtime",
            format!("{model_id} response carried no text"),
        )
    })?;
    debug!(chars = text.len(), "model responded");
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_by_prefix() {
        assert_eq!(ModelFamily::of("amazon.nova-pro-v1:0"), ModelFamily::Nova);
        assert_eq!(ModelFamily::of("us.amazon.nova-lite-v1:0"), ModelFamily::Nova);
        assert_eq!(ModelFamily::of("openai.gpt-oss-120b-1:0"), ModelFamily::GptOss);
        assert_eq!(
            ModelFamily::of("mistral.mistral-large-2402-v1:0"),
            ModelFamily::Messages
        );
        assert_eq!(
            ModelFamily::of("anthropic.claude-3-haiku-20240307-v1:0"),
            ModelFamily::Messages
        );
    }

    #[test]
    fn request_shapes() {
        let nova = ModelFamily::Nova.request_body("amazon.nova-pro-v1:0", "hi", 0.0, 1000);
        assert_eq!(nova["messages"][0]["content"][0]["text"], "hi");
        assert_eq!(nova["inferenceConfig"]["max_new_tokens"], 1000);

        let oss = ModelFamily::GptOss.request_body("openai.gpt-oss-20b-1:0", "hi", 0.7, 500);
        assert_eq!(oss["model"], "openai.gpt-oss-20b-1:0");
        assert_eq!(oss["max_completion_tokens"], 500);

        let messages = ModelFamily::Messages.request_body("anthropic.x", "hi", 0.7, 1000);
        assert_eq!(messages["anthropic_version"], ANTHROPIC_VERSION);
        assert_eq!(messages["temperature"], 0.7);
    }

    #[test]
    fn response_shapes() {
        let nova = json!({ "output": { "message": { "content": [{ "text": "nova" }] } } });
        assert_eq!(ModelFamily::Nova.response_text(&nova).as_deref(), Some("nova"));

        let oss = json!({ "choices": [{ "message": { "content": "oss" } }] });
        assert_eq!(ModelFamily::GptOss.response_text(&oss).as_deref(), Some("oss"));

        let legacy = json!({ "completion": "old" });
        assert_eq!(ModelFamily::Messages.response_text(&legacy).as_deref(), Some("old"));
        assert_eq!(ModelFamily::Messages.response_text(&json!({})), None);
    }
}
