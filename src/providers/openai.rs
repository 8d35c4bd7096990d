use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{check_status, map_http_error, ExtractionProvider, PromptSpec, ProviderError, ProviderKind};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const BASE_URL_ENV: &str = "OPENAI_BASE_URL";

/// OpenAI chat-completions client with image input.
pub struct OpenAiProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl OpenAiProvider {
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
            .ok_or(ProviderError::MissingApiKey(ProviderKind::OpenAi))?;
        let base_url = std::env::var(BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(&base_url, &api_key, timeout)
    }
}

/// Request body for /v1/chat/completions
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
    detail: &'static str,
}

/// Response body from /v1/chat/completions
#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

fn build_request<'a>(image_png: &[u8], prompt: &'a PromptSpec) -> ChatRequest<'a> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(image_png);
    ChatRequest {
        model: &prompt.model,
        temperature: prompt.temperature,
        max_tokens: prompt.max_output_tokens,
        response_format: ResponseFormat { kind: "json_object" },
        messages: vec![
            ChatMessage {
                role: "system",
                content: vec![ContentPart::Text { text: &prompt.system }],
            },
            ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text { text: &prompt.user },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: format!("data:image/png;base64,{encoded}"),
                            detail: "high",
                        },
                    },
                ],
            },
        ],
    }
}

fn first_choice_text(response: ChatResponse) -> Result<String, ProviderError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ProviderError::ResponseParsing("no message content in choices".into()))
}

#[async_trait]
impl ExtractionProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn extract(&self, image_png: &[u8], prompt: &PromptSpec) -> Result<String, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = build_request(image_png, prompt);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_http_error(&self.base_url, self.timeout, e))?;

        let parsed: ChatResponse = check_status(ProviderKind::OpenAi, response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::ResponseParsing(e.to_string()))?;

        first_choice_text(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> PromptSpec {
        PromptSpec {
            model: "gpt-4o-mini".into(),
            system: "extract receipts".into(),
            user: "return JSON".into(),
            temperature: 0.0,
            max_output_tokens: 1024,
        }
    }

    #[test]
    fn constructor_trims_trailing_slash() {
        let provider = OpenAiProvider::new("https://api.example.com/", "sk-test", Duration::from_secs(5)).unwrap();
        assert_eq!(provider.base_url, "https://api.example.com");
        assert_eq!(provider.kind(), ProviderKind::OpenAi);
    }

    #[test]
    fn request_embeds_image_as_data_url() {
        let p = prompt();
        let body = serde_json::to_value(build_request(&[1, 2, 3], &p)).unwrap();

        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"][0]["type"], "text");
        assert_eq!(body["messages"][1]["content"][1]["type"], "image_url");
        assert_eq!(
            body["messages"][1]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AQID"
        );
    }

    #[test]
    fn response_extracts_first_choice() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":"{\"vendor\":\"A\"}"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(first_choice_text(parsed).unwrap(), "{\"vendor\":\"A\"}");
    }

    #[test]
    fn empty_choices_is_response_error() {
        let parsed: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(first_choice_text(parsed), Err(ProviderError::ResponseParsing(_))));
    }
}
