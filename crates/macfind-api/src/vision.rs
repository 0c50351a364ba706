use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Asks for a deliberately vague label so the photo alone cannot be used to
/// fake a claim.
const PROMPT: &str = r#"
Return only JSON:
{
  "object_type": "item name",
  "color": "main color"
}
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisionLabel {
    pub object_type: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("vision request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vision API error ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("vision response had no text")]
    EmptyResponse,

    #[error("{0}")]
    Malformed(#[from] serde_json::Error),
}

/// Image labelling model. Returns the model's raw text reply.
#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn describe(&self, image: &[u8], mime_type: &str) -> Result<String, VisionError>;
}

/// Label an image: ask the model, then parse its reply.
pub async fn label_image(
    client: &dyn VisionClient,
    image: &[u8],
    mime_type: &str,
) -> Result<VisionLabel, VisionError> {
    let text = client.describe(image, mime_type).await?;
    parse_label(&text)
}

/// Models like to wrap JSON in markdown fences; strip them before parsing.
pub fn parse_label(text: &str) -> Result<VisionLabel, VisionError> {
    let cleaned = text.replace("```json", "").replace("```", "");
    Ok(serde_json::from_str(cleaned.trim())?)
}

/// Gemini `generateContent` client.
pub struct GeminiClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: GEMINI_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl VisionClient for GeminiClient {
    async fn describe(&self, image: &[u8], mime_type: &str) -> Result<String, VisionError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        let body = serde_json::json!({
            "contents": [{
                "parts": [
                    { "inline_data": { "mime_type": mime_type, "data": B64.encode(image) } },
                    { "text": PROMPT }
                ]
            }]
        });

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(VisionError::Status { status, body });
        }

        let response_json: serde_json::Value = response.json().await?;
        let text: String = response_json["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| parts.iter().filter_map(|p| p["text"].as_str()).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(VisionError::EmptyResponse);
        }
        Ok(text)
    }
}
