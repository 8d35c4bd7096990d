use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{check_status, map_http_error, ExtractionProvider, PromptSpec, ProviderError, ProviderKind};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
pub const BASE_URL_ENV: &str = "ANTHROPIC_BASE_URL";
const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client.
pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
            timeout,
        })
    }

    pub fn from_env(timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ProviderError::MissingApiKey(ProviderKind::Anthropic))?;
        let base_url = std::env::var(BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(&base_url, &api_key, timeout)
    }
}

/// Request body for /v1/messages
#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock<'a> {
    Image { source: ImageSource },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: &'static str,
    data: String,
}

/// Response body from /v1/messages
#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

fn build_request<'a>(image_png: &[u8], prompt: &'a PromptSpec) -> MessagesRequest<'a> {
    MessagesRequest {
        model: &prompt.model,
        max_tokens: prompt.max_output_tokens,
        temperature: prompt.temperature,
        system: &prompt.system,
        messages: vec![Message {
            role: "user",
            content: vec![
                ContentBlock::Image {
                    source: ImageSource {
                        kind: "base64",
                        media_type: "image/png",
                        data: base64::engine::general_purpose::STANDARD.encode(image_png),
                    },
                },
                ContentBlock::Text { text: &prompt.user },
            ],
        }],
    }
}

/// Concatenate all text blocks; tool-use and other block types are ignored.
fn collect_text(response: MessagesResponse) -> Result<String, ProviderError> {
    let text: String = response
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text)
        .collect();
    if text.trim().is_empty() {
        return Err(ProviderError::ResponseParsing("no text content blocks".into()));
    }
    Ok(text)
}

#[async_trait]
impl ExtractionProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn extract(&self, image_png: &[u8], prompt: &PromptSpec) -> Result<String, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = build_request(image_png, prompt);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_http_error(&self.base_url, self.timeout, e))?;

        let parsed: MessagesResponse = check_status(ProviderKind::Anthropic, response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::ResponseParsing(e.to_string()))?;

        collect_text(parsed)
    }
}
