//! Strict parsing of provider output into receipt fields.
//!
//! Models answer with a JSON object, bare or inside a ```json fence.
//! Required fields are enforced here: a response without a vendor or with a
//! non-numeric total is a `ParseError`, not a low-confidence candidate.
//! Line items are parsed leniently; a bad item is dropped with a warning
//! rather than failing the whole receipt.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use super::analysis::QualityMetrics;
use super::routing::ProcessingRoute;
use super::types::{round_cents, ExtractionCandidate, ExtractionWarning, LineItem};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("No JSON object found in response")]
    NoJsonObject,

    #[error("Unclosed JSON block")]
    UnclosedFence,

    #[error("JSON parsing failed: {0}")]
    InvalidJson(String),

    #[error("Required field missing: {0}")]
    MissingField(&'static str),

    #[error("Field {field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Confidence assumed when the model omits its own estimate.
const DEFAULT_MODEL_CONFIDENCE: f64 = 50.0;

static DECIMAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-?\d+(?:\.\d+)?$").unwrap());

/// Receipt fields as read from one provider response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReceipt {
    pub vendor: String,
    pub date: Option<NaiveDate>,
    pub total_amount: f64,
    pub subtotal: Option<f64>,
    pub tax: Option<f64>,
    pub currency: Option<String>,
    pub category: Option<String>,
    pub line_items: Vec<LineItem>,
    pub confidence: f64,
    pub warnings: Vec<ExtractionWarning>,
}

impl ParsedReceipt {
    pub fn into_candidate(
        self,
        route: &ProcessingRoute,
        processing_time_ms: u64,
        metrics: &QualityMetrics,
        default_currency: &str,
    ) -> ExtractionCandidate {
        ExtractionCandidate {
            vendor: self.vendor,
            date: self.date,
            total_amount: self.total_amount,
            subtotal: self.subtotal,
            tax: self.tax,
            currency: self.currency.unwrap_or_else(|| default_currency.to_string()),
            line_items: self.line_items,
            category: self.category,
            confidence: self.confidence,
            processing_time_ms,
            route_name: route.name.clone(),
            cost_estimate: route.cost_per_request,
            quality_metrics: Some(metrics.clone()),
            warnings: self.warnings,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Number(f64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    #[serde(alias = "merchant")]
    vendor: Option<String>,
    date: Option<String>,
    #[serde(alias = "total_amount", alias = "total")]
    total_amount: Option<RawAmount>,
    subtotal: Option<RawAmount>,
    tax: Option<RawAmount>,
    currency: Option<String>,
    category: Option<String>,
    #[serde(default, alias = "line_items", alias = "items")]
    line_items: Option<Vec<serde_json::Value>>,
    confidence: Option<RawAmount>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLineItem {
    #[serde(alias = "name")]
    description: Option<String>,
    #[serde(alias = "qty")]
    quantity: Option<RawAmount>,
    #[serde(alias = "unit_price")]
    unit_price: Option<RawAmount>,
    #[serde(alias = "total_price", alias = "price", alias = "amount")]
    total_price: Option<RawAmount>,
    category: Option<String>,
    confidence: Option<RawAmount>,
}

/// Parse a provider response.
pub fn parse_response(raw: &str) -> Result<ParsedReceipt, ParseError> {
    let json = extract_json_object(raw)?;
    let receipt: RawReceipt = serde_json::from_str(json).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    let vendor = receipt
        .vendor
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ParseError::MissingField("vendor"))?;

    let total_amount = amount("totalAmount", receipt.total_amount)?.ok_or(ParseError::MissingField("totalAmount"))?;
    if total_amount < 0.0 {
        return Err(ParseError::InvalidField {
            field: "totalAmount",
            reason: format!("negative total {total_amount}"),
        });
    }

    let mut warnings = Vec::new();
    let line_items = receipt
        .line_items
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .filter_map(|(i, value)| match parse_line_item(value) {
            Ok(item) => Some(item),
            Err(reason) => {
                warnings.push(ExtractionWarning::LineItemDropped {
                    reason: format!("item {i}: {reason}"),
                });
                None
            }
        })
        .collect();

    Ok(ParsedReceipt {
        vendor,
        date: receipt.date.as_deref().and_then(parse_date),
        total_amount: round_cents(total_amount),
        subtotal: amount("subtotal", receipt.subtotal)?.map(round_cents),
        tax: amount("tax", receipt.tax)?.map(round_cents),
        currency: receipt
            .currency
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| c.len() == 3 && c.chars().all(|ch| ch.is_ascii_alphabetic())),
        category: non_empty(receipt.category),
        line_items,
        confidence: normalize_confidence(amount("confidence", receipt.confidence)?),
        warnings,
    })
}

/// Locate the JSON object: a ```json fence, a bare ``` fence, or the
/// outermost `{ ... }` span.
fn extract_json_object(response: &str) -> Result<&str, ParseError> {
    for fence in ["```json", "```"] {
        if let Some(start) = response.find(fence) {
            let content_start = start + fence.len();
            let end = response[content_start..].find("```").ok_or(ParseError::UnclosedFence)?;
            let inner = response[content_start..content_start + end].trim();
            if inner.starts_with('{') {
                return Ok(inner);
            }
        }
    }

    let start = response.find('{').ok_or(ParseError::NoJsonObject)?;
    let end = response.rfind('}').ok_or(ParseError::NoJsonObject)?;
    if end < start {
        return Err(ParseError::NoJsonObject);
    }
    Ok(&response[start..=end])
}

fn amount(field: &'static str, raw: Option<RawAmount>) -> Result<Option<f64>, ParseError> {
    match raw {
        None => Ok(None),
        Some(RawAmount::Number(n)) if n.is_finite() => Ok(Some(n)),
        Some(RawAmount::Number(n)) => Err(ParseError::InvalidField {
            field,
            reason: format!("{n} is not finite"),
        }),
        Some(RawAmount::Text(s)) => {
            let s = s.trim();
            if s.is_empty() {
                Ok(None)
            } else if DECIMAL.is_match(s) {
                s.parse::<f64>().map(Some).map_err(|e| ParseError::InvalidField {
                    field,
                    reason: e.to_string(),
                })
            } else {
                Err(ParseError::InvalidField {
                    field,
                    reason: format!("'{s}' is not a number"),
                })
            }
        }
    }
}

/// Clamp to 0–100; values in 0–1 are treated as fractions.
pub fn normalize_confidence(raw: Option<f64>) -> f64 {
    match raw {
        None => DEFAULT_MODEL_CONFIDENCE,
        Some(c) if c <= 1.0 => (c * 100.0).clamp(0.0, 100.0),
        Some(c) => c.clamp(0.0, 100.0),
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty() && v != "null")
}

/// Parse one item. Missing totals are derived; non-positive quantities become 1.
fn parse_line_item(value: serde_json::Value) -> Result<LineItem, String> {
    let raw: RawLineItem = serde_json::from_value(value).map_err(|e| e.to_string())?;

    let description = non_empty(raw.description).ok_or("empty description")?;
    let quantity = amount("quantity", raw.quantity)
        .map_err(|e| e.to_string())?
        .filter(|q| *q > 0.0)
        .unwrap_or(1.0);
    let unit_price = amount("unitPrice", raw.unit_price).map_err(|e| e.to_string())?;
    let total_price = amount("totalPrice", raw.total_price).map_err(|e| e.to_string())?;

    let (unit_price, total_price) = match (unit_price, total_price) {
        (Some(u), Some(t)) => (u, t),
        (Some(u), None) => (u, u * quantity),
        (None, Some(t)) => (t / quantity, t),
        (None, None) => return Err(format!("'{description}' has no price")),
    };

    Ok(LineItem {
        description,
        quantity,
        unit_price: round_cents(unit_price),
        total_price: round_cents(total_price),
        category: non_empty(raw.category),
        confidence: amount("confidence", raw.confidence)
            .ok()
            .flatten()
            .map(|c| normalize_confidence(Some(c))),
    })
}

// ═══════════════════════════════════════════════════════════
// OCR text (last resort)
// ═══════════════════════════════════════════════════════════

static TOTAL_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:grand\s+)?total\b(?:\s+due)?[^0-9\-]*(-?\d{1,6}(?:[.,]\d{2}))").unwrap());
static SUBTOTAL_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)sub\s*-?\s*total").unwrap());
static OCR_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{4}|\d{1,2}\.\d{1,2}\.\d{4})\b").unwrap());

/// What can be salvaged from unstructured OCR output.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrFields {
    pub vendor: String,
    pub total: Option<f64>,
    pub date: Option<NaiveDate>,
    pub currency: Option<String>,
}

/// Best-effort fields from raw OCR text. Never fails.
///
/// The vendor is the first line with at least three letters; the total is
/// the last "TOTAL" line that is not a subtotal. Line items are not parsed.
pub fn parse_ocr_text(text: &str) -> OcrFields {
    let vendor = text
        .lines()
        .map(str::trim)
        .find(|l| l.chars().filter(|c| c.is_alphabetic()).count() >= 3)
        .map(|l| l.chars().take(64).collect::<String>())
        .unwrap_or_default();

    let total = text
        .lines()
        .filter(|l| !SUBTOTAL_WORD.is_match(l))
        .filter_map(|l| TOTAL_LINE.captures(l))
        .filter_map(|c| c.get(1))
        .filter_map(|m| m.as_str().replace(',', ".").parse::<f64>().ok())
        .last();

    let date = OCR_DATE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| parse_date(m.as_str()));

    let currency = if text.contains('€') {
        Some("EUR")
    } else if text.contains('£') {
        Some("GBP")
    } else if text.contains('$') {
        Some("USD")
    } else {
        None
    };

    OcrFields {
        vendor,
        total: total.map(round_cents),
        date,
        currency: currency.map(str::to_string),
    }
}
