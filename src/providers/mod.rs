//! Outbound extraction providers.
//!
//! Every vendor (and the non-AI OCR engine used as a last resort) sits behind
//! the same `ExtractionProvider` trait. Routing and orchestration only ever
//! see `Arc<dyn ExtractionProvider>` looked up by `ProviderKind` in a
//! `ProviderRegistry`; no code branches on vendor names.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod tesseract;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use tesseract::TesseractProvider;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Which backend serves a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    /// Deterministic OCR, no semantic parsing. Only used for the last resort.
    Tesseract,
}

impl ProviderKind {
    /// AI vendors incur per-request cost and return structured JSON.
    pub fn is_ai(&self) -> bool {
        !matches!(self, Self::Tesseract)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Tesseract => "tesseract",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instructions sent alongside the image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptSpec {
    /// Vendor model identifier, e.g. `gpt-4o-mini`.
    pub model: String,
    pub system: String,
    pub user: String,
    /// 0.0 for deterministic extraction.
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("{0} API key not configured")]
    MissingApiKey(ProviderKind),

    #[error("Cannot connect to {0}")]
    Connection(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("{provider} API error {status}: {body}")]
    Api {
        provider: ProviderKind,
        status: u16,
        body: String,
    },

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Unexpected response shape: {0}")]
    ResponseParsing(String),

    #[error("OCR engine failed: {0}")]
    Ocr(String),

    #[error("No provider registered for {0}")]
    NotRegistered(ProviderKind),
}

/// One extraction capability: image + prompt in, raw text out.
///
/// Implementations must not interpret the text. Parsing and validation
/// happen in the invoker so every vendor is held to the same contract.
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn extract(&self, image_png: &[u8], prompt: &PromptSpec) -> Result<String, ProviderError>;
}

// ═══════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════

/// Maps each `ProviderKind` to its implementation.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn ExtractionProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own `kind()`, replacing any previous one.
    pub fn with(mut self, provider: Arc<dyn ExtractionProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn ExtractionProvider>, ProviderError> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or(ProviderError::NotRegistered(kind))
    }

    pub fn contains(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    /// Build the production registry from environment variables.
    ///
    /// Vendors without an API key are skipped with a warning; route selection
    /// then passes over the routes that point at them.
    pub fn from_env(http_timeout: Duration) -> Self {
        let mut registry = Self::new();

        match OpenAiProvider::from_env(http_timeout) {
            Ok(p) => registry = registry.with(Arc::new(p)),
            Err(e) => tracing::warn!(error = %e, "OpenAI provider disabled"),
        }
        match AnthropicProvider::from_env(http_timeout) {
            Ok(p) => registry = registry.with(Arc::new(p)),
            Err(e) => tracing::warn!(error = %e, "Anthropic provider disabled"),
        }
        match GeminiProvider::from_env(http_timeout) {
            Ok(p) => registry = registry.with(Arc::new(p)),
            Err(e) => tracing::warn!(error = %e, "Gemini provider disabled"),
        }

        registry.with(Arc::new(TesseractProvider::from_env()))
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.providers.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("ProviderRegistry").field("providers", &kinds).finish()
    }
}

/// Map a reqwest failure onto the provider error taxonomy.
pub(crate) fn map_http_error(base_url: &str, timeout: Duration, e: reqwest::Error) -> ProviderError {
    if e.is_connect() {
        ProviderError::Connection(base_url.to_string())
    } else if e.is_timeout() {
        ProviderError::Timeout(timeout.as_secs())
    } else {
        ProviderError::Http(e.to_string())
    }
}

/// Turn a non-2xx response into `ProviderError::Api`, passing successes through.
pub(crate) async fn check_status(
    provider: ProviderKind,
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Api {
        provider,
        status: status.as_u16(),
        body,
    })
}

// ═══════════════════════════════════════════════════════════
// Mock implementation (testing)
// ═══════════════════════════════════════════════════════════

/// What a `MockProvider` does on one call.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Fail(String),
}

/// Scripted provider for tests.
///
/// Replies are consumed in order; once the script runs out, the default
/// reply repeats. An optional delay simulates a slow vendor.
pub struct MockProvider {
    kind: ProviderKind,
    script: Mutex<VecDeque<MockReply>>,
    default_reply: MockReply,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(kind: ProviderKind, response: &str) -> Self {
        Self {
            kind,
            script: Mutex::new(VecDeque::new()),
            default_reply: MockReply::Text(response.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(kind: ProviderKind, message: &str) -> Self {
        Self {
            default_reply: MockReply::Fail(message.to_string()),
            ..Self::new(kind, "")
        }
    }

    pub fn with_script(self, replies: Vec<MockReply>) -> Self {
        *self.script.lock().unwrap_or_else(PoisonError::into_inner) = replies.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn extract(&self, _image_png: &[u8], _prompt: &PromptSpec) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone());
        match reply {
            MockReply::Text(text) => Ok(text),
            MockReply::Fail(message) => Err(ProviderError::Http(message)),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> PromptSpec {
        PromptSpec {
            model: "test-model".into(),
            system: "sys".into(),
            user: "user".into(),
            temperature: 0.0,
            max_output_tokens: 256,
        }
    }

    #[test]
    fn provider_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ProviderKind::OpenAi).unwrap();
        assert_eq!(json, "\"open_ai\"");
        let parsed: ProviderKind = serde_json::from_str("\"gemini\"").unwrap();
        assert_eq!(parsed, ProviderKind::Gemini);
    }

    #[test]
    fn only_tesseract_is_non_ai() {
        assert!(ProviderKind::OpenAi.is_ai());
        assert!(ProviderKind::Anthropic.is_ai());
        assert!(ProviderKind::Gemini.is_ai());
        assert!(!ProviderKind::Tesseract.is_ai());
    }

    #[test]
    fn registry_lookup_missing_provider_errors() {
        let registry = ProviderRegistry::new();
        let err = registry.get(ProviderKind::Gemini).err().unwrap();
        assert!(matches!(err, ProviderError::NotRegistered(ProviderKind::Gemini)));
    }

    #[test]
    fn registry_keys_by_provider_kind() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(MockProvider::new(ProviderKind::OpenAi, "a")))
            .with(Arc::new(MockProvider::new(ProviderKind::OpenAi, "b")));
        assert!(registry.contains(ProviderKind::OpenAi));
        assert!(!registry.contains(ProviderKind::Anthropic));
        assert_eq!(format!("{registry:?}"), "ProviderRegistry { providers: [\"openai\"] }");
    }

    #[tokio::test]
    async fn mock_plays_script_then_default() {
        let mock = MockProvider::new(ProviderKind::Gemini, "default").with_script(vec![
            MockReply::Text("first".into()),
            MockReply::Fail("boom".into()),
        ]);

        assert_eq!(mock.extract(b"img", &prompt()).await.unwrap(), "first");
        assert!(mock.extract(b"img", &prompt()).await.is_err());
        assert_eq!(mock.extract(b"img", &prompt()).await.unwrap(), "default");
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn failing_mock_returns_http_error() {
        let mock = MockProvider::failing(ProviderKind::Anthropic, "503 upstream");
        let err = mock.extract(b"img", &prompt()).await.unwrap_err();
        assert!(err.to_string().contains("503 upstream"));
    }
}
