use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::analysis::QualityMetrics;
use super::ReceiptError;

/// Complexity class derived from image quality; drives route choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Simple,
    Standard,
    Complex,
}

/// Customer plan; caps which routes may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountTier {
    Free,
    Pro,
    Enterprise,
}

impl AccountTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for AccountTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown account tier '{other}' (expected free, pro or enterprise)")),
        }
    }
}

/// One purchased item as read off the receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub total_price: f64,
    pub category: Option<String>,
    pub confidence: Option<f64>,
}

impl LineItem {
    pub fn new(description: &str, quantity: f64, unit_price: f64, total_price: f64) -> Self {
        Self {
            description: description.to_string(),
            quantity,
            unit_price,
            total_price,
            category: None,
            confidence: None,
        }
    }
}

/// Warnings attached to a candidate as it moves through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionWarning {
    BlurryImage,
    PoorContrast,
    Underexposed,
    Overexposed,
    DenseText { estimated_line_items: u32 },
    LineItemDropped { reason: String },
    SubtotalRecomputed { reported: Option<f64>, computed: f64 },
    TaxRecomputed { reported: Option<f64>, computed: f64 },
    ConfidenceCapped { reason: String, from: f64, to: f64 },
    FusionConflict { field: String, kept: String, discarded: String },
    LastResortOcr,
}

/// A structured extraction produced by one route (or by fusing two).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionCandidate {
    pub vendor: String,
    pub date: Option<NaiveDate>,
    pub total_amount: f64,
    pub subtotal: Option<f64>,
    pub tax: Option<f64>,
    pub currency: String,
    pub line_items: Vec<LineItem>,
    pub category: Option<String>,
    /// 0–100.
    pub confidence: f64,
    pub processing_time_ms: u64,
    pub route_name: String,
    pub cost_estimate: f64,
    pub quality_metrics: Option<QualityMetrics>,
    pub warnings: Vec<ExtractionWarning>,
}

impl ExtractionCandidate {
    pub fn has_vendor(&self) -> bool {
        !self.vendor.trim().is_empty()
    }

    /// Lower confidence to `cap`, recording why. No-op when already at or below.
    pub fn cap_confidence(mut self, cap: f64, reason: &str) -> Self {
        if self.confidence > cap {
            self.warnings.push(ExtractionWarning::ConfidenceCapped {
                reason: reason.to_string(),
                from: self.confidence,
                to: cap,
            });
            self.confidence = cap;
        }
        self
    }

    pub fn with_warnings(mut self, warnings: impl IntoIterator<Item = ExtractionWarning>) -> Self {
        for w in warnings {
            if !self.warnings.contains(&w) {
                self.warnings.push(w);
            }
        }
        self
    }
}

/// Pipeline stage an attempt belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStage {
    Primary,
    Fallback,
    Fusion,
    LastResort,
}

/// Audit entry for one route invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub stage: AttemptStage,
    pub route_name: String,
    pub cost: f64,
    pub confidence: Option<f64>,
    pub accepted: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// What the caller receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub request_id: Uuid,
    pub success: bool,
    pub data: Option<ExtractionCandidate>,
    pub error: Option<String>,
    pub fallback_used: bool,
    pub fusion_used: bool,
    pub total_cost: f64,
    pub processing_time_ms: u64,
    pub routes_attempted: Vec<String>,
    pub attempts: Vec<AttemptRecord>,
}

impl ExtractionResult {
    /// Labelled failure envelope for callers that report fatal errors in-band.
    pub fn from_error(error: &ReceiptError, processing_time_ms: u64) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            success: false,
            data: None,
            error: Some(error.to_string()),
            fallback_used: false,
            fusion_used: false,
            total_cost: 0.0,
            processing_time_ms,
            routes_attempted: Vec::new(),
            attempts: Vec::new(),
        }
    }
}

/// Round a money amount to whole cents.
pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(confidence: f64) -> ExtractionCandidate {
        ExtractionCandidate {
            vendor: "Corner Cafe".into(),
            date: None,
            total_amount: 10.0,
            subtotal: None,
            tax: None,
            currency: "USD".into(),
            line_items: vec![],
            category: None,
            confidence,
            processing_time_ms: 0,
            route_name: "test".into(),
            cost_estimate: 0.0,
            quality_metrics: None,
            warnings: vec![],
        }
    }

    #[test]
    fn account_tier_parses_case_insensitively() {
        assert_eq!("PRO".parse::<AccountTier>().unwrap(), AccountTier::Pro);
        assert_eq!(" free ".parse::<AccountTier>().unwrap(), AccountTier::Free);
        assert!("platinum".parse::<AccountTier>().is_err());
    }

    #[test]
    fn cap_confidence_records_warning_only_when_lowering() {
        let capped = candidate(80.0).cap_confidence(50.0, "no line items");
        assert_eq!(capped.confidence, 50.0);
        assert_eq!(capped.warnings.len(), 1);

        let untouched = candidate(40.0).cap_confidence(50.0, "no line items");
        assert_eq!(untouched.confidence, 40.0);
        assert!(untouched.warnings.is_empty());
    }

    #[test]
    fn with_warnings_skips_duplicates() {
        let c = candidate(70.0)
            .with_warnings([ExtractionWarning::BlurryImage])
            .with_warnings([ExtractionWarning::BlurryImage, ExtractionWarning::PoorContrast]);
        assert_eq!(c.warnings, vec![ExtractionWarning::BlurryImage, ExtractionWarning::PoorContrast]);
    }

    #[test]
    fn round_cents_rounds_to_nearest_cent() {
        assert_eq!(round_cents(42.306), 42.31);
        assert_eq!(round_cents(-1.004), -1.0);
        assert_eq!(round_cents(7.0), 7.0);
    }

    #[test]
    fn warning_serializes_with_kind_tag() {
        let json = serde_json::to_value(ExtractionWarning::TaxRecomputed {
            reported: Some(1.0),
            computed: 1.5,
        })
        .unwrap();
        assert_eq!(json["kind"], "tax_recomputed");
        assert_eq!(json["computed"], 1.5);
    }

    #[test]
    fn error_envelope_is_unsuccessful() {
        let result = ExtractionResult::from_error(&ReceiptError::ProcessingFailed("ocr down".into()), 12);
        assert!(!result.success);
        assert!(result.data.is_none());
        assert!(result.error.unwrap().contains("ocr down"));
    }
}
