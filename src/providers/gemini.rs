use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{check_status, map_http_error, ExtractionProvider, PromptSpec, ProviderError, ProviderKind};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const BASE_URL_ENV: &str = "GEMINI_BASE_URL";

/// Google Gemini `generateContent` client.
pub struct GeminiProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl GeminiProvider {
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
            .ok_or(ProviderError::MissingApiKey(ProviderKind::Gemini))?;
        let base_url = std::env::var(BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(&base_url, &api_key, timeout)
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text { text: &'a str },
    Inline { inline_data: InlineData },
}

#[derive(Serialize)]
struct InlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    response_mime_type: &'static str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

fn build_request<'a>(image_png: &[u8], prompt: &'a PromptSpec) -> GenerateRequest<'a> {
    GenerateRequest {
        system_instruction: Content {
            role: None,
            parts: vec![Part::Text { text: &prompt.system }],
        },
        contents: vec![Content {
            role: Some("user"),
            parts: vec![
                Part::Inline {
                    inline_data: InlineData {
                        mime_type: "image/png",
                        data: base64::engine::general_purpose::STANDARD.encode(image_png),
                    },
                },
                Part::Text { text: &prompt.user },
            ],
        }],
        generation_config: GenerationConfig {
            temperature: prompt.temperature,
            max_output_tokens: prompt.max_output_tokens,
            response_mime_type: "application/json",
        },
    }
}

fn first_candidate_text(response: GenerateResponse) -> Result<String, ProviderError> {
    response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect::<String>())
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ProviderError::ResponseParsing("no candidate text".into()))
}

#[async_trait]
impl ExtractionProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn extract(&self, image_png: &[u8], prompt: &PromptSpec) -> Result<String, ProviderError> {
        let body = build_request(image_png, prompt);

        let response = self
            .client
            .post(self.endpoint(&prompt.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_http_error(&self.base_url, self.timeout, e))?;

        let parsed: GenerateResponse = check_status(ProviderKind::Gemini, response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::ResponseParsing(e.to_string()))?;

        first_candidate_text(parsed)
    }
}
