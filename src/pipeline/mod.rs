pub mod analysis; // Perceptual quality metrics + complexity tier
pub mod enhance; // Metric-gated preprocessing
pub mod routing; // Route catalog + tier/budget-aware selection
pub mod budget; // Process-wide daily spend ledger
pub mod prompt; // Extraction instructions tailored by metrics
pub mod parser; // Strict JSON parsing of provider output
pub mod invoker; // One bounded attempt against one route
pub mod fusion; // Cross-model merge with line-item reconciliation
pub mod validation; // Arithmetic reconciliation + confidence caps
pub mod orchestrator; // Primary -> fallback -> last-resort cascade
pub mod types;

use thiserror::Error;

pub use analysis::{PerceptualAnalyzer, QualityAnalyzer, QualityMetrics};
pub use budget::{BudgetError, BudgetSnapshot, CostBudget};
pub use enhance::{ConditionalEnhancer, EnhancedImage, ImageEnhancer};
pub use orchestrator::{ReceiptPipeline, RequestOptions};
pub use routing::{ProcessingRoute, RouteCatalog, RouteSelector};
pub use types::{
    AccountTier, AttemptRecord, AttemptStage, ComplexityTier, ExtractionCandidate, ExtractionResult,
    ExtractionWarning, LineItem,
};

/// Errors that reach the caller of `ReceiptPipeline::process_receipt`.
///
/// Provider, parse and budget failures never surface here: the cascade
/// absorbs them and degrades to the next stage.
#[derive(Error, Debug)]
pub enum ReceiptError {
    #[error("Image could not be decoded: {0}")]
    ImageDecode(String),

    #[error("Image enhancement failed: {0}")]
    Enhancement(String),

    #[error("Receipt processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Request deadline exceeded")]
    Timeout,

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl ReceiptError {
    /// Whether the cascade should still try the last resort after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Enhancement(_) | Self::Task(_))
    }
}
