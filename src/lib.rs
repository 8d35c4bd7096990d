pub mod config;
pub mod pipeline;
pub mod providers; // OpenAI / Anthropic / Gemini / Tesseract behind one trait

pub use config::{AppConfig, ConfigError, PipelineConfig};
pub use pipeline::{
    AccountTier, CostBudget, ExtractionCandidate, ExtractionResult, ReceiptError, ReceiptPipeline, RequestOptions,
    RouteCatalog,
};
pub use providers::{ExtractionProvider, ProviderKind, ProviderRegistry};

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Logs go to stderr so stdout stays
/// machine-readable. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
