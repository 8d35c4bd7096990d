//! Runtime configuration.
//!
//! Everything has a built-in default; an optional TOML file overrides
//! pipeline thresholds and/or replaces the route catalog:
//!
//! ```toml
//! [pipeline]
//! acceptance_threshold = 65.0
//! daily_budget_limit = 10.0
//!
//! [pipeline.tier_caps]
//! pro = 0.01
//!
//! [[routes]]
//! name = "gemini-flash"
//! provider = "gemini"
//! model = "gemini-1.5-flash"
//! cost_per_request = 0.001
//! expected_accuracy = 0.85
//! average_latency_ms = 1800
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::routing::{ProcessingRoute, RouteCatalog};
use crate::pipeline::types::{AccountTier, ComplexityTier};

/// Application-level constants
pub const APP_NAME: &str = "receipt-core";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Config file consulted when no explicit path is given.
pub const CONFIG_PATH_ENV: &str = "RECEIPT_CORE_CONFIG";

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "info,receipt_core=debug,reqwest=warn,hyper=warn"
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Route catalog is empty")]
    EmptyCatalog,

    #[error("Duplicate route name: {0}")]
    DuplicateRoute(String),

    #[error("Invalid route {name}: {reason}")]
    InvalidRoute { name: String, reason: String },

    #[error("Invalid pipeline setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

// ═══════════════════════════════════════════════════════════
// Pipeline settings
// ═══════════════════════════════════════════════════════════

/// Highest per-request cost each account tier may spend. `None` = unrestricted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierCostCaps {
    pub free: Option<f64>,
    pub pro: Option<f64>,
    pub enterprise: Option<f64>,
}

impl Default for TierCostCaps {
    fn default() -> Self {
        Self {
            free: Some(0.001),
            pro: Some(0.005),
            enterprise: None,
        }
    }
}

impl TierCostCaps {
    pub fn cap_for(&self, tier: AccountTier) -> Option<f64> {
        match tier {
            AccountTier::Free => self.free,
            AccountTier::Pro => self.pro,
            AccountTier::Enterprise => self.enterprise,
        }
    }
}

/// First-choice route name per complexity tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferredRoutes {
    pub simple: String,
    pub standard: String,
    pub complex: String,
}

impl Default for PreferredRoutes {
    fn default() -> Self {
        Self {
            simple: "gemini-flash".into(),
            standard: "gpt-4o-mini".into(),
            complex: "gpt-4o".into(),
        }
    }
}

impl PreferredRoutes {
    pub fn for_tier(&self, tier: ComplexityTier) -> &str {
        match tier {
            ComplexityTier::Simple => &self.simple,
            ComplexityTier::Standard => &self.standard,
            ComplexityTier::Complex => &self.complex,
        }
    }
}

/// Thresholds and limits for one pipeline instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum confidence for a candidate to end the cascade.
    pub acceptance_threshold: f64,
    /// Fusion is considered only below this confidence.
    pub fusion_trigger_threshold: f64,
    /// Ceiling on fused confidence.
    pub fusion_confidence_cap: f64,
    /// Fixed confidence of the OCR last resort.
    pub last_resort_confidence: f64,
    /// Relative difference under which two amounts are averaged.
    pub numeric_agreement_tolerance: f64,
    /// Similarity a line-item pair must exceed to merge.
    pub line_item_match_threshold: f64,
    pub attempt_timeout_secs: u64,
    pub ocr_timeout_secs: u64,
    pub daily_budget_limit: f64,
    /// Used when neither the model nor the OCR text names a currency.
    pub default_currency: String,
    pub tier_caps: TierCostCaps,
    pub preferred_routes: PreferredRoutes,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 60.0,
            fusion_trigger_threshold: 85.0,
            fusion_confidence_cap: 95.0,
            last_resort_confidence: 30.0,
            numeric_agreement_tolerance: 0.05,
            line_item_match_threshold: 0.7,
            attempt_timeout_secs: 45,
            ocr_timeout_secs: 30,
            daily_budget_limit: 25.0,
            default_currency: "USD".into(),
            tier_caps: TierCostCaps::default(),
            preferred_routes: PreferredRoutes::default(),
        }
    }
}

impl PipelineConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let percent = |field: &'static str, v: f64| {
            if (0.0..=100.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::InvalidSetting {
                    field,
                    reason: format!("{v} is outside 0-100"),
                })
            }
        };
        percent("acceptance_threshold", self.acceptance_threshold)?;
        percent("fusion_trigger_threshold", self.fusion_trigger_threshold)?;
        percent("fusion_confidence_cap", self.fusion_confidence_cap)?;
        percent("last_resort_confidence", self.last_resort_confidence)?;

        if !(0.0..=1.0).contains(&self.numeric_agreement_tolerance) {
            return Err(ConfigError::InvalidSetting {
                field: "numeric_agreement_tolerance",
                reason: "must be a fraction between 0 and 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.line_item_match_threshold) {
            return Err(ConfigError::InvalidSetting {
                field: "line_item_match_threshold",
                reason: "must be between 0 and 1".into(),
            });
        }
        if self.attempt_timeout_secs == 0 || self.ocr_timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "attempt_timeout_secs",
                reason: "timeouts must be at least one second".into(),
            });
        }
        if !self.daily_budget_limit.is_finite() || self.daily_budget_limit < 0.0 {
            return Err(ConfigError::InvalidSetting {
                field: "daily_budget_limit",
                reason: "must be a non-negative amount".into(),
            });
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// File loading
// ═══════════════════════════════════════════════════════════

/// Top-level config file shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    /// Replaces the built-in catalog when non-empty.
    pub routes: Vec<ProcessingRoute>,
}

impl AppConfig {
    /// Load from `path`, else from `$RECEIPT_CORE_CONFIG`, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        let Some(path) = path else {
            tracing::debug!("No config file, using built-in defaults");
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::info!(path = %path.display(), routes = config.routes.len(), "Config loaded");
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.pipeline.validate()?;
        if !config.routes.is_empty() {
            validate_routes(&config.routes)?;
        }
        Ok(config)
    }

    /// The configured catalog, or the built-in one.
    pub fn catalog(&self) -> Result<RouteCatalog, ConfigError> {
        if self.routes.is_empty() {
            Ok(RouteCatalog::builtin())
        } else {
            RouteCatalog::new(self.routes.clone())
        }
    }
}

/// Catalog sanity: non-empty, unique names, AI providers only, sane numbers.
pub fn validate_routes(routes: &[ProcessingRoute]) -> Result<(), ConfigError> {
    if routes.is_empty() {
        return Err(ConfigError::EmptyCatalog);
    }

    let mut seen = HashSet::new();
    for route in routes {
        if !seen.insert(route.name.as_str()) {
            return Err(ConfigError::DuplicateRoute(route.name.clone()));
        }
        let invalid = |reason: &str| ConfigError::InvalidRoute {
            name: route.name.clone(),
            reason: reason.to_string(),
        };
        if route.name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        if !route.provider.is_ai() {
            return Err(invalid("catalog routes must use an AI provider"));
        }
        if !route.cost_per_request.is_finite() || route.cost_per_request < 0.0 {
            return Err(invalid("cost_per_request must be non-negative"));
        }
        if !(0.0..=1.0).contains(&route.expected_accuracy) {
            return Err(invalid("expected_accuracy must be between 0 and 1"));
        }
    }
    Ok(())
}
