//! One extraction attempt against one route.
//!
//! The invoker never returns an error: every failure mode (provider error,
//! timeout, cancellation, unparseable output) becomes an outcome with
//! `candidate: None` so the cascade can move on. The route's cost is always
//! carried, because vendors bill for failed requests too.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::analysis::QualityMetrics;
use super::parser::{parse_response, ParseError};
use super::prompt::build_prompt;
use super::routing::ProcessingRoute;
use super::types::ExtractionCandidate;
use crate::providers::{ProviderError, ProviderRegistry};

#[derive(Error, Debug)]
pub enum InvocationError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Attempt cancelled")]
    Cancelled,
}

/// Result of one attempt.
#[derive(Debug)]
pub struct InvocationOutcome {
    pub route_name: String,
    pub candidate: Option<ExtractionCandidate>,
    pub cost: f64,
    pub elapsed_ms: u64,
    pub error: Option<InvocationError>,
}

impl InvocationOutcome {
    pub fn was_cancelled(&self) -> bool {
        matches!(self.error, Some(InvocationError::Cancelled))
    }
}

pub struct ModelInvoker {
    registry: Arc<ProviderRegistry>,
    default_currency: String,
}

impl ModelInvoker {
    pub fn new(registry: Arc<ProviderRegistry>, default_currency: &str) -> Self {
        Self {
            registry,
            default_currency: default_currency.to_string(),
        }
    }

    /// Run one attempt, bounded by `timeout` and aborted by `cancel`.
    pub async fn invoke(
        &self,
        image_png: &[u8],
        route: &ProcessingRoute,
        metrics: &QualityMetrics,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> InvocationOutcome {
        let span = info_span!("attempt", route = %route.name, provider = %route.provider, model = %route.model);
        let start = Instant::now();

        let result = self
            .attempt(image_png, route, metrics, timeout, cancel)
            .instrument(span.clone())
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let _guard = span.enter();
        match result {
            Ok(raw) => match parse_response(&raw) {
                Ok(parsed) => {
                    let candidate = parsed.into_candidate(route, elapsed_ms, metrics, &self.default_currency);
                    info!(
                        confidence = candidate.confidence,
                        line_items = candidate.line_items.len(),
                        cost = route.cost_per_request,
                        elapsed_ms,
                        "Attempt produced candidate"
                    );
                    self.outcome(route, Some(candidate), elapsed_ms, None)
                }
                Err(e) => {
                    warn!(error = %e, elapsed_ms, "Provider output rejected");
                    self.outcome(route, None, elapsed_ms, Some(e.into()))
                }
            },
            Err(e) => {
                warn!(error = %e, elapsed_ms, "Attempt failed");
                self.outcome(route, None, elapsed_ms, Some(e))
            }
        }
    }

    async fn attempt(
        &self,
        image_png: &[u8],
        route: &ProcessingRoute,
        metrics: &QualityMetrics,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, InvocationError> {
        let provider = self.registry.get(route.provider)?;
        let prompt = build_prompt(route, metrics);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(InvocationError::Cancelled),
            res = tokio::time::timeout(timeout, provider.extract(image_png, &prompt)) => match res {
                Ok(text) => Ok(text?),
                Err(_) => Err(InvocationError::Timeout(timeout)),
            },
        }
    }

    fn outcome(
        &self,
        route: &ProcessingRoute,
        candidate: Option<ExtractionCandidate>,
        elapsed_ms: u64,
        error: Option<InvocationError>,
    ) -> InvocationOutcome {
        InvocationOutcome {
            route_name: route.name.clone(),
            candidate,
            cost: route.cost_per_request,
            elapsed_ms,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MockProvider, ProviderKind};

    const GOOD: &str = r#"{"vendor": "Corner Cafe", "totalAmount": 8.5, "confidence": 82,
        "lineItems": [{"description": "Latte", "totalPrice": 8.5}]}"#;

    fn route() -> ProcessingRoute {
        ProcessingRoute::new("gpt-4o-mini", ProviderKind::OpenAi, "gpt-4o-mini", 0.003, 0.88, 2500)
    }

    fn metrics() -> QualityMetrics {
        QualityMetrics::from_scores(80.0, 75.0, 50.0, 15.0)
    }

    fn invoker(provider: MockProvider) -> ModelInvoker {
        ModelInvoker::new(Arc::new(ProviderRegistry::new().with(Arc::new(provider))), "USD")
    }

    #[tokio::test]
    async fn successful_attempt_builds_candidate() {
        let invoker = invoker(MockProvider::new(ProviderKind::OpenAi, GOOD));
        let out = invoker
            .invoke(b"png", &route(), &metrics(), Duration::from_secs(5), &CancellationToken::new())
            .await;

        let candidate = out.candidate.unwrap();
        assert_eq!(candidate.vendor, "Corner Cafe");
        assert_eq!(candidate.confidence, 82.0);
        assert_eq!(candidate.route_name, "gpt-4o-mini");
        assert_eq!(candidate.cost_estimate, 0.003);
        assert_eq!(candidate.currency, "USD");
        assert!(candidate.quality_metrics.is_some());
        assert_eq!(out.cost, 0.003);
        assert!(out.error.is_none());
    }

    #[tokio::test]
    async fn unparseable_output_keeps_cost() {
        let invoker = invoker(MockProvider::new(ProviderKind::OpenAi, "Sorry, I can't help."));
        let out = invoker
            .invoke(b"png", &route(), &metrics(), Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert!(out.candidate.is_none());
        assert_eq!(out.cost, 0.003);
        assert!(matches!(out.error, Some(InvocationError::Parse(ParseError::NoJsonObject))));
    }

    #[tokio::test]
    async fn provider_failure_is_absorbed() {
        let invoker = invoker(MockProvider::failing(ProviderKind::OpenAi, "500"));
        let out = invoker
            .invoke(b"png", &route(), &metrics(), Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert!(out.candidate.is_none());
        assert!(matches!(out.error, Some(InvocationError::Provider(_))));
    }

    #[tokio::test]
    async fn unregistered_provider_is_absorbed() {
        let invoker = invoker(MockProvider::new(ProviderKind::Gemini, GOOD));
        let out = invoker
            .invoke(b"png", &route(), &metrics(), Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert!(matches!(
            out.error,
            Some(InvocationError::Provider(ProviderError::NotRegistered(ProviderKind::OpenAi)))
        ));
        assert_eq!(out.cost, 0.003);
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let invoker = invoker(MockProvider::new(ProviderKind::OpenAi, GOOD).with_delay(Duration::from_secs(5)));
        let out = invoker
            .invoke(b"png", &route(), &metrics(), Duration::from_millis(20), &CancellationToken::new())
            .await;
        assert!(out.candidate.is_none());
        assert!(matches!(out.error, Some(InvocationError::Timeout(_))));
        assert!(out.elapsed_ms < 5000);
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_call() {
        let invoker = invoker(MockProvider::new(ProviderKind::OpenAi, GOOD).with_delay(Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let out = invoker
            .invoke(b"png", &route(), &metrics(), Duration::from_secs(10), &cancel)
            .await;
        assert!(out.was_cancelled());
        assert!(out.candidate.is_none());
    }
}
