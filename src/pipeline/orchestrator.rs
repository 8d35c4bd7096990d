//! Fallback-cascade orchestrator.
//!
//! Drives one receipt through:
//! 1. decode + quality analysis + enhancement (blocking pool)
//! 2. primary route, chosen from complexity, account tier and budget
//! 3. one fallback route when the primary is missing or below threshold
//! 4. fusion with a second provider for marginal complex receipts
//! 5. Tesseract OCR as the last resort
//! 6. arithmetic post-processing of whichever candidate survives
//!
//! Provider, parse and budget failures are absorbed here. Only an
//! undecodable image, an expired deadline or a failing last resort with
//! nothing else to return reach the caller as errors.
//!
//! Uses trait-based DI for analysis, enhancement and every provider so the
//! whole cascade runs against mocks in tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::analysis::{decode_image, quality_warnings, PerceptualAnalyzer, QualityAnalyzer, QualityMetrics};
use super::budget::CostBudget;
use super::enhance::{ConditionalEnhancer, EnhancedImage, ImageEnhancer};
use super::fusion::{fuse, FusionSettings};
use super::invoker::ModelInvoker;
use super::parser::parse_ocr_text;
use super::routing::{ProcessingRoute, RouteCatalog, RouteSelector};
use super::types::{
    AccountTier, AttemptRecord, AttemptStage, ComplexityTier, ExtractionCandidate, ExtractionResult,
    ExtractionWarning,
};
use super::validation::post_process;
use super::ReceiptError;
use crate::config::{AppConfig, ConfigError, PipelineConfig};
use crate::providers::{PromptSpec, ProviderKind, ProviderRegistry};

/// Route name reported for the OCR last resort.
pub const LAST_RESORT_ROUTE: &str = "tesseract-ocr";

// ═══════════════════════════════════════════════════════════
// Request options
// ═══════════════════════════════════════════════════════════

/// Caller-side controls for one request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Cancelling aborts in-flight provider calls; the last resort still runs.
    pub cancel: CancellationToken,
    /// Hard stop. Once passed, no further stage starts.
    pub deadline: Option<tokio::time::Instant>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(tokio::time::Instant::now() + timeout),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(tokio::time::Instant::now()))
    }

    fn expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    /// `limit`, shortened to whatever is left before the deadline.
    fn bound(&self, limit: Duration) -> Duration {
        self.remaining().map_or(limit, |r| r.min(limit))
    }
}

// ═══════════════════════════════════════════════════════════
// Cascade bookkeeping
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct CascadeLog {
    routes_attempted: Vec<String>,
    attempts: Vec<AttemptRecord>,
    total_cost: f64,
    fallback_used: bool,
    fusion_used: bool,
}

impl CascadeLog {
    fn record(&mut self, record: AttemptRecord) {
        self.total_cost += record.cost;
        self.routes_attempted.push(record.route_name.clone());
        self.attempts.push(record);
    }
}

/// Decoded image ready for the AI stages.
struct Prepared {
    metrics: QualityMetrics,
    enhanced: Result<EnhancedImage, ReceiptError>,
}

// ═══════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════

/// End-to-end receipt extraction service.
///
/// Cheap to share behind an `Arc`: all per-request state lives on the stack
/// of `process_receipt`; the budget is the only shared mutable state.
pub struct ReceiptPipeline {
    analyzer: Arc<dyn QualityAnalyzer>,
    enhancer: Arc<dyn ImageEnhancer>,
    catalog: RouteCatalog,
    config: PipelineConfig,
    registry: Arc<ProviderRegistry>,
    budget: Arc<CostBudget>,
    invoker: ModelInvoker,
}

impl ReceiptPipeline {
    pub fn new(
        config: PipelineConfig,
        catalog: RouteCatalog,
        registry: Arc<ProviderRegistry>,
        budget: Arc<CostBudget>,
    ) -> Self {
        let invoker = ModelInvoker::new(Arc::clone(&registry), &config.default_currency);
        Self {
            analyzer: Arc::new(PerceptualAnalyzer::default()),
            enhancer: Arc::new(ConditionalEnhancer::default()),
            catalog,
            config,
            registry,
            budget,
            invoker,
        }
    }

    pub fn from_config(
        app: &AppConfig,
        registry: Arc<ProviderRegistry>,
        budget: Arc<CostBudget>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(app.pipeline.clone(), app.catalog()?, registry, budget))
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn QualityAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_enhancer(mut self, enhancer: Arc<dyn ImageEnhancer>) -> Self {
        self.enhancer = enhancer;
        self
    }

    pub fn budget(&self) -> &Arc<CostBudget> {
        &self.budget
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &RouteCatalog {
        &self.catalog
    }

    /// Extract one receipt.
    pub async fn process_receipt(
        &self,
        image_bytes: &[u8],
        tier: AccountTier,
        options: RequestOptions,
    ) -> Result<ExtractionResult, ReceiptError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("receipt", request_id = %request_id, tier = %tier, bytes = image_bytes.len());
        self.run(request_id, image_bytes, tier, &options).instrument(span).await
    }

    async fn run(
        &self,
        request_id: Uuid,
        image_bytes: &[u8],
        tier: AccountTier,
        options: &RequestOptions,
    ) -> Result<ExtractionResult, ReceiptError> {
        let start = Instant::now();
        self.budget.rollover_if_needed(Utc::now().date_naive());
        let mut log = CascadeLog::default();

        let (metrics, ocr_input, best) = match self.prepare(image_bytes).await {
            Ok(Prepared {
                metrics,
                enhanced: Ok(enhanced),
            }) => {
                info!(
                    complexity = ?metrics.processing_route,
                    overall = format!("{:.1}", metrics.overall_score),
                    steps = enhanced.steps.len(),
                    "Image prepared"
                );
                let best = self
                    .ai_stages(&enhanced.png_bytes, &metrics, tier, options, &mut log)
                    .await;
                (Some(metrics), enhanced.png_bytes, best)
            }
            Ok(Prepared {
                metrics,
                enhanced: Err(e),
            }) => {
                warn!(error = %e, "Enhancement failed, skipping AI routes");
                (Some(metrics), image_bytes.to_vec(), None)
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Image preparation failed, skipping AI routes");
                (None, image_bytes.to_vec(), None)
            }
            Err(e) => {
                error!(error = %e, "Receipt rejected");
                return Err(e);
            }
        };

        let candidate = match best {
            Some(c) if self.accepts(Some(&c)) => c,
            rejected => {
                log.fallback_used = true;
                self.last_resort(&ocr_input, metrics.as_ref(), rejected, options, &mut log)
                    .await?
            }
        };

        let mut data = post_process(candidate);
        data.cost_estimate = log.total_cost;
        let data = data.with_warnings(metrics.as_ref().map(quality_warnings).unwrap_or_default());
        self.budget.finish_receipt();

        let processing_time_ms = start.elapsed().as_millis() as u64;
        info!(
            route = %data.route_name,
            confidence = format!("{:.1}", data.confidence),
            total_cost = format!("{:.4}", log.total_cost),
            fallback_used = log.fallback_used,
            fusion_used = log.fusion_used,
            elapsed_ms = processing_time_ms,
            "Receipt processed"
        );

        Ok(ExtractionResult {
            request_id,
            success: true,
            data: Some(data),
            error: None,
            fallback_used: log.fallback_used,
            fusion_used: log.fusion_used,
            total_cost: log.total_cost,
            processing_time_ms,
            routes_attempted: log.routes_attempted,
            attempts: log.attempts,
        })
    }

    /// Decode, analyze and enhance on the blocking pool.
    async fn prepare(&self, image_bytes: &[u8]) -> Result<Prepared, ReceiptError> {
        let bytes = image_bytes.to_vec();
        let analyzer = Arc::clone(&self.analyzer);
        let enhancer = Arc::clone(&self.enhancer);

        tokio::task::spawn_blocking(move || -> Result<Prepared, ReceiptError> {
            let image = decode_image(&bytes)?;
            let metrics = analyzer.analyze(&image);
            let enhanced = enhancer.enhance(&image, &metrics);
            Ok(Prepared { metrics, enhanced })
        })
        .await?
    }

    fn accepts(&self, candidate: Option<&ExtractionCandidate>) -> bool {
        candidate.is_some_and(|c| c.confidence >= self.config.acceptance_threshold)
    }

    fn should_fuse(&self, candidate: &ExtractionCandidate, metrics: &QualityMetrics, tier: AccountTier) -> bool {
        metrics.processing_route == ComplexityTier::Complex
            && tier != AccountTier::Free
            && candidate.confidence < self.config.fusion_trigger_threshold
    }

    // ═══════════════════════════════════════════════════════════
    // AI stages
    // ═══════════════════════════════════════════════════════════

    async fn ai_stages(
        &self,
        png: &[u8],
        metrics: &QualityMetrics,
        tier: AccountTier,
        options: &RequestOptions,
        log: &mut CascadeLog,
    ) -> Option<ExtractionCandidate> {
        let selector = RouteSelector::new(&self.catalog, &self.config).with_registry(&self.registry);

        let primary = selector.select_route(metrics, tier, &self.budget);
        let mut best = self
            .attempt(AttemptStage::Primary, primary, png, metrics, options, log)
            .await;

        if !self.accepts(best.as_ref()) {
            match selector.select_fallback(tier, &self.budget, &log.routes_attempted) {
                Some(route) => {
                    log.fallback_used = true;
                    let fallback = self
                        .attempt(AttemptStage::Fallback, route, png, metrics, options, log)
                        .await;
                    best = higher_confidence(best, fallback);
                }
                None => debug!("No fallback route available"),
            }
        }

        match best {
            Some(c) if self.accepts(Some(&c)) && self.should_fuse(&c, metrics, tier) => {
                Some(self.fusion_stage(c, png, metrics, tier, options, log).await)
            }
            other => other,
        }
    }

    /// Charge, invoke and record one route. `None` when skipped or failed.
    async fn attempt(
        &self,
        stage: AttemptStage,
        route: &ProcessingRoute,
        png: &[u8],
        metrics: &QualityMetrics,
        options: &RequestOptions,
        log: &mut CascadeLog,
    ) -> Option<ExtractionCandidate> {
        if options.cancel.is_cancelled() || options.expired() {
            debug!(route = %route.name, stage = ?stage, "Attempt skipped, request cancelled or out of time");
            return None;
        }
        if !self.registry.contains(route.provider) {
            warn!(route = %route.name, provider = %route.provider, stage = ?stage, "Attempt skipped, provider not configured");
            return None;
        }
        if let Err(e) = self.budget.try_charge(route) {
            warn!(route = %route.name, stage = ?stage, error = %e, "Attempt skipped");
            return None;
        }

        let timeout = options.bound(self.config.attempt_timeout());
        let outcome = self
            .invoker
            .invoke(png, route, metrics, timeout, &options.cancel)
            .await;
        if outcome.was_cancelled() {
            info!(route = %route.name, stage = ?stage, "Request cancelled mid-attempt");
        }

        let confidence = outcome.candidate.as_ref().map(|c| c.confidence);
        log.record(AttemptRecord {
            stage,
            route_name: outcome.route_name.clone(),
            cost: outcome.cost,
            confidence,
            accepted: self.accepts(outcome.candidate.as_ref()),
            error: outcome.error.as_ref().map(|e| e.to_string()),
            elapsed_ms: outcome.elapsed_ms,
        });
        outcome.candidate
    }

    async fn fusion_stage(
        &self,
        primary: ExtractionCandidate,
        png: &[u8],
        metrics: &QualityMetrics,
        tier: AccountTier,
        options: &RequestOptions,
        log: &mut CascadeLog,
    ) -> ExtractionCandidate {
        let Some(exclude) = self.catalog.get(&primary.route_name).map(|r| r.provider) else {
            return primary;
        };
        let selector = RouteSelector::new(&self.catalog, &self.config).with_registry(&self.registry);
        let Some(route) = selector.select_secondary(tier, &self.budget, exclude, &log.routes_attempted) else {
            debug!(primary = %primary.route_name, "No affordable secondary route for fusion");
            return primary;
        };

        match self
            .attempt(AttemptStage::Fusion, route, png, metrics, options, log)
            .await
        {
            Some(secondary) if self.accepts(Some(&secondary)) => {
                let fused = fuse(&primary, &secondary, &FusionSettings::from(&self.config));
                log.fusion_used = true;
                info!(
                    primary = %primary.route_name,
                    secondary = %secondary.route_name,
                    confidence = format!("{:.1}", fused.confidence),
                    "Fusion applied"
                );
                fused
            }
            _ => {
                debug!(route = %route.name, "Secondary extraction unusable, keeping primary");
                primary
            }
        }
    }

    // ═══════════════════════════════════════════════════════════
    // Last resort
    // ═══════════════════════════════════════════════════════════

    /// OCR the image. `rejected` is only returned when OCR itself fails.
    async fn last_resort(
        &self,
        image: &[u8],
        metrics: Option<&QualityMetrics>,
        rejected: Option<ExtractionCandidate>,
        options: &RequestOptions,
        log: &mut CascadeLog,
    ) -> Result<ExtractionCandidate, ReceiptError> {
        if options.expired() {
            warn!("Deadline passed before last resort");
            return Err(ReceiptError::Timeout);
        }

        let timeout = options.bound(self.config.ocr_timeout());
        let start = Instant::now();
        let text = match self.registry.get(ProviderKind::Tesseract) {
            Ok(ocr) => match tokio::time::timeout(timeout, ocr.extract(image, &ocr_prompt())).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("OCR timed out after {timeout:?}")),
            },
            Err(e) => Err(e.to_string()),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match text {
            Ok(text) => {
                let candidate = self.ocr_candidate(&text, metrics, elapsed_ms);
                log.record(AttemptRecord {
                    stage: AttemptStage::LastResort,
                    route_name: LAST_RESORT_ROUTE.to_string(),
                    cost: 0.0,
                    confidence: Some(candidate.confidence),
                    accepted: true,
                    error: None,
                    elapsed_ms,
                });
                info!(vendor = %candidate.vendor, total = candidate.total_amount, elapsed_ms, "Last resort OCR complete");

                Ok(candidate)
            }
            Err(reason) => {
                log.record(AttemptRecord {
                    stage: AttemptStage::LastResort,
                    route_name: LAST_RESORT_ROUTE.to_string(),
                    cost: 0.0,
                    confidence: None,
                    accepted: false,
                    error: Some(reason.clone()),
                    elapsed_ms,
                });
                match rejected {
                    Some(r) => {
                        warn!(error = %reason, route = %r.route_name, "Last resort failed, returning best rejected candidate");
                        Ok(r)
                    }
                    None => {
                        error!(error = %reason, "Last resort failed");
                        Err(ReceiptError::ProcessingFailed(reason))
                    }
                }
            }
        }
    }

    fn ocr_candidate(&self, text: &str, metrics: Option<&QualityMetrics>, elapsed_ms: u64) -> ExtractionCandidate {
        let fields = parse_ocr_text(text);
        ExtractionCandidate {
            vendor: fields.vendor,
            date: fields.date,
            total_amount: fields.total.unwrap_or(0.0),
            subtotal: None,
            tax: None,
            currency: fields
                .currency
                .unwrap_or_else(|| self.config.default_currency.clone()),
            line_items: Vec::new(),
            category: None,
            confidence: self.config.last_resort_confidence,
            processing_time_ms: elapsed_ms,
            route_name: LAST_RESORT_ROUTE.to_string(),
            cost_estimate: 0.0,
            quality_metrics: metrics.cloned(),
            warnings: vec![ExtractionWarning::LastResortOcr],
        }
    }
}

fn higher_confidence(
    current: Option<ExtractionCandidate>,
    challenger: Option<ExtractionCandidate>,
) -> Option<ExtractionCandidate> {
    match (current, challenger) {
        (Some(c), Some(n)) if n.confidence > c.confidence => Some(n),
        (Some(c), _) => Some(c),
        (None, n) => n,
    }
}

/// OCR ignores prompts; the trait still wants one.
fn ocr_prompt() -> PromptSpec {
    PromptSpec {
        model: LAST_RESORT_ROUTE.to_string(),
        system: String::new(),
        user: String::new(),
        temperature: 0.0,
        max_output_tokens: 0,
    }
}
