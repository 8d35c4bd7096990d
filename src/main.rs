//! receipt-extract - run one receipt image through the extraction cascade
//! and print the result as JSON.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use receipt_core::config::{self, AppConfig};
use receipt_core::{AccountTier, CostBudget, ExtractionResult, ProviderRegistry, ReceiptError, ReceiptPipeline, RequestOptions};

#[derive(Parser)]
#[command(name = "receipt-extract")]
#[command(about = "Extract structured data from a receipt image", long_about = None)]
#[command(version = config::APP_VERSION)]
struct Cli {
    /// Receipt image (JPEG, PNG, TIFF or WebP)
    image: PathBuf,

    /// Account tier: free, pro, enterprise
    #[arg(short, long, default_value = "pro")]
    tier: AccountTier,

    /// TOML config file
    #[arg(short, long, env = config::CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Override the daily budget limit (USD)
    #[arg(long)]
    budget: Option<f64>,

    /// Overall request deadline in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    receipt_core::init_tracing();
    let cli = Cli::parse();
    let start = Instant::now();

    let result = match run(&cli).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "Extraction failed");
            ExtractionResult::from_error(&e, start.elapsed().as_millis() as u64)
        }
    };

    let json = if cli.pretty {
        serde_json::to_string_pretty(&result)
    } else {
        serde_json::to_string(&result)
    };
    match json {
        Ok(out) => println!("{out}"),
        Err(e) => {
            eprintln!("Failed to serialize result: {e}");
            return ExitCode::FAILURE;
        }
    }

    if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run(cli: &Cli) -> Result<ExtractionResult, ReceiptError> {
    tracing::info!("{} v{}", config::APP_NAME, config::APP_VERSION);

    let app = AppConfig::load(cli.config.as_deref())?;
    let daily_limit = cli.budget.unwrap_or(app.pipeline.daily_budget_limit);
    let registry = ProviderRegistry::from_env(app.pipeline.attempt_timeout());
    let pipeline = ReceiptPipeline::from_config(&app, Arc::new(registry), Arc::new(CostBudget::new(daily_limit)))?;

    let bytes = tokio::fs::read(&cli.image)
        .await
        .map_err(|e| ReceiptError::ImageDecode(format!("{}: {e}", cli.image.display())))?;

    let options = match cli.timeout_secs {
        Some(secs) => RequestOptions::with_timeout(Duration::from_secs(secs)),
        None => RequestOptions::default(),
    };
    pipeline.process_receipt(&bytes, cli.tier, options).await
}
