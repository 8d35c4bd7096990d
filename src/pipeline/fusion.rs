//! Cross-model fusion of two extraction candidates.
//!
//! Field-wise rules:
//! - scalars (vendor, date, currency, category) come from the
//!   higher-confidence side; ties go to the first argument
//! - amounts that agree within the tolerance are averaged with squared
//!   confidence weights; amounts that disagree are taken from the
//!   higher-confidence side unchanged
//! - line items are matched greedily by description and price similarity,
//!   matched pairs merged, unmatched items from both sides kept
//!
//! Disagreements are surfaced as `FusionConflict` warnings, never hidden.

use tracing::{debug, warn};

use super::types::{round_cents, ExtractionCandidate, ExtractionWarning, LineItem};
use crate::config::PipelineConfig;

/// Vendor names below this normalized similarity are reported as a conflict.
const VENDOR_CONFLICT_BELOW: f64 = 0.8;

const TEXT_WEIGHT: f64 = 0.7;
const PRICE_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionSettings {
    /// Relative difference up to which two amounts are averaged.
    pub numeric_agreement_tolerance: f64,
    /// Line-item similarity a pair must exceed to merge.
    pub line_item_match_threshold: f64,
    pub confidence_cap: f64,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for FusionSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            numeric_agreement_tolerance: config.numeric_agreement_tolerance,
            line_item_match_threshold: config.line_item_match_threshold,
            confidence_cap: config.fusion_confidence_cap,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Candidate fusion
// ═══════════════════════════════════════════════════════════

/// Merge two independent extractions of the same receipt.
pub fn fuse(a: &ExtractionCandidate, b: &ExtractionCandidate, settings: &FusionSettings) -> ExtractionCandidate {
    let (hi, lo) = if b.confidence > a.confidence { (b, a) } else { (a, b) };
    let mut conflicts = Vec::new();

    let vendor = if !hi.has_vendor() {
        lo.vendor.clone()
    } else {
        if lo.has_vendor() {
            let similarity = strsim::normalized_levenshtein(
                &hi.vendor.trim().to_lowercase(),
                &lo.vendor.trim().to_lowercase(),
            );
            if similarity < VENDOR_CONFLICT_BELOW {
                conflicts.push(conflict("vendor", &hi.vendor, &lo.vendor));
            }
        }
        hi.vendor.clone()
    };

    let tolerance = settings.numeric_agreement_tolerance;
    if !amounts_agree(hi.total_amount, lo.total_amount, tolerance) {
        conflicts.push(conflict(
            "total_amount",
            &format!("{:.2}", hi.total_amount),
            &format!("{:.2}", lo.total_amount),
        ));
    }
    let total_amount = fuse_amount(hi.total_amount, hi.confidence, lo.total_amount, lo.confidence, tolerance);
    let subtotal = fuse_optional_amount(hi.subtotal, hi.confidence, lo.subtotal, lo.confidence, tolerance);
    let tax = fuse_optional_amount(hi.tax, hi.confidence, lo.tax, lo.confidence, tolerance);

    let line_items = fuse_line_items(
        &a.line_items,
        a.confidence,
        &b.line_items,
        b.confidence,
        settings.line_item_match_threshold,
    );
    let confidence = fused_confidence(a.confidence, b.confidence, settings.confidence_cap);

    if !conflicts.is_empty() {
        warn!(conflicts = conflicts.len(), primary = %a.route_name, secondary = %b.route_name, "Fusion conflicts detected");
    }
    debug!(
        confidence = format!("{:.1}", confidence),
        items_a = a.line_items.len(),
        items_b = b.line_items.len(),
        items_fused = line_items.len(),
        "Candidates fused"
    );

    let mut warnings = a.warnings.clone();
    for w in b.warnings.iter().cloned().chain(conflicts) {
        if !warnings.contains(&w) {
            warnings.push(w);
        }
    }

    ExtractionCandidate {
        vendor,
        date: hi.date.or(lo.date),
        total_amount,
        subtotal,
        tax,
        currency: hi.currency.clone(),
        line_items,
        category: hi.category.clone().or_else(|| lo.category.clone()),
        confidence,
        processing_time_ms: a.processing_time_ms + b.processing_time_ms,
        route_name: format!("{}+{}", a.route_name, b.route_name),
        cost_estimate: a.cost_estimate + b.cost_estimate,
        quality_metrics: a.quality_metrics.clone().or_else(|| b.quality_metrics.clone()),
        warnings,
    }
}

fn conflict(field: &str, kept: &str, discarded: &str) -> ExtractionWarning {
    ExtractionWarning::FusionConflict {
        field: field.to_string(),
        kept: kept.to_string(),
        discarded: discarded.to_string(),
    }
}

/// Confidence-weighted mean of the two confidences, capped.
pub fn fused_confidence(a: f64, b: f64, cap: f64) -> f64 {
    let weight = a + b;
    let mean = if weight <= 0.0 { 0.0 } else { (a * a + b * b) / weight };
    mean.min(cap)
}

// ═══════════════════════════════════════════════════════════
// Amounts
// ═══════════════════════════════════════════════════════════

/// Relative difference, measured against the larger magnitude.
pub fn amounts_agree(a: f64, b: f64, tolerance: f64) -> bool {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        return true;
    }
    (a - b).abs() / scale <= tolerance
}

/// Weighted average when the two agree, else the higher-confidence value.
pub fn fuse_amount(a: f64, a_conf: f64, b: f64, b_conf: f64, tolerance: f64) -> f64 {
    if !amounts_agree(a, b, tolerance) {
        return if b_conf > a_conf { b } else { a };
    }
    let (wa, wb) = (a_conf * a_conf, b_conf * b_conf);
    if wa + wb <= 0.0 {
        return round_cents((a + b) / 2.0);
    }
    round_cents((a * wa + b * wb) / (wa + wb))
}

fn fuse_optional_amount(a: Option<f64>, a_conf: f64, b: Option<f64>, b_conf: f64, tolerance: f64) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(fuse_amount(x, a_conf, y, b_conf, tolerance)),
        (x, y) => x.or(y),
    }
}

// ═══════════════════════════════════════════════════════════
// Line items
// ═══════════════════════════════════════════════════════════

/// Lowercase, alphanumerics only, numeric tokens dropped.
///
/// `"Cofee - $3.50"` and `"COFFEE 2x"` become `"cofee"` and `"coffee 2x"`.
pub fn normalize_description(s: &str) -> String {
    let cleaned: String = s
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned
        .split_whitespace()
        .filter(|token| !token.chars().all(|c| c.is_ascii_digit()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `1 - levenshtein / max_len` over normalized descriptions.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (normalize_description(a), normalize_description(b));
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - strsim::levenshtein(&a, &b) as f64 / max_len as f64
}

pub fn price_similarity(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        return 1.0;
    }
    1.0 - ((a - b).abs() / scale).min(1.0)
}

pub fn line_item_similarity(a: &LineItem, b: &LineItem) -> f64 {
    TEXT_WEIGHT * text_similarity(&a.description, &b.description)
        + PRICE_WEIGHT * price_similarity(a.total_price, b.total_price)
}

/// Greedy matching: each item of `a` pairs with its most similar unmatched
/// item of `b` above `threshold`. Output keeps `a`'s order, followed by the
/// unmatched remainder of `b`.
pub fn fuse_line_items(a: &[LineItem], a_conf: f64, b: &[LineItem], b_conf: f64, threshold: f64) -> Vec<LineItem> {
    let mut taken = vec![false; b.len()];
    let mut fused = Vec::with_capacity(a.len().max(b.len()));

    for item in a {
        let best = b
            .iter()
            .enumerate()
            .filter(|(j, _)| !taken[*j])
            .map(|(j, other)| (j, line_item_similarity(item, other)))
            .filter(|(_, sim)| *sim > threshold)
            .fold(None, |best: Option<(usize, f64)>, (j, sim)| match best {
                Some((_, s)) if s >= sim => best,
                _ => Some((j, sim)),
            });

        match best {
            Some((j, sim)) => {
                taken[j] = true;
                debug!(a = %item.description, b = %b[j].description, similarity = format!("{:.2}", sim), "Line items matched");
                fused.push(merge_items(item, a_conf, &b[j], b_conf));
            }
            None => fused.push(item.clone()),
        }
    }

    fused.extend(b.iter().zip(&taken).filter(|(_, t)| !**t).map(|(item, _)| item.clone()));
    fused
}

fn merge_items(a: &LineItem, a_conf: f64, b: &LineItem, b_conf: f64) -> LineItem {
    let b_wins = b_conf > a_conf;
    let pick = |x: f64, y: f64| match (x != 0.0, y != 0.0) {
        (true, true) => {
            if b_wins {
                y
            } else {
                x
            }
        }
        (false, true) => y,
        _ => x,
    };

    let description = if b.description.trim().chars().count() > a.description.trim().chars().count() {
        b.description.clone()
    } else {
        a.description.clone()
    };
    let (first, second) = if b_wins { (&b.category, &a.category) } else { (&a.category, &b.category) };
    let confidence = match (a.confidence, b.confidence) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    };

    LineItem {
        description,
        quantity: pick(a.quantity, b.quantity),
        unit_price: pick(a.unit_price, b.unit_price),
        total_price: pick(a.total_price, b.total_price),
        category: first.clone().or_else(|| second.clone()),
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(route: &str, vendor: &str, total: f64, confidence: f64, items: Vec<LineItem>) -> ExtractionCandidate {
        ExtractionCandidate {
            vendor: vendor.into(),
            date: None,
            total_amount: total,
            subtotal: None,
            tax: None,
            currency: "USD".into(),
            line_items: items,
            category: None,
            confidence,
            processing_time_ms: 100,
            route_name: route.into(),
            cost_estimate: 0.01,
            quality_metrics: None,
            warnings: vec![],
        }
    }

    #[test]
    fn close_totals_are_confidence_weighted() {
        let a = candidate("gpt-4o", "Corner Cafe", 42.00, 70.0, vec![]);
        let b = candidate("claude-sonnet", "Corner Cafe", 42.50, 90.0, vec![]);
        let fused = fuse(&a, &b, &FusionSettings::default());
        assert_eq!(fused.total_amount, 42.31);
        assert!(!fused.warnings.iter().any(|w| matches!(w, ExtractionWarning::FusionConflict { .. })));
    }

    #[test]
    fn distant_totals_take_higher_confidence_value_exactly() {
        let a = candidate("gpt-4o", "Corner Cafe", 40.0, 70.0, vec![]);
        let b = candidate("claude-sonnet", "Corner Cafe", 80.0, 90.0, vec![]);
        let fused = fuse(&a, &b, &FusionSettings::default());
        assert_eq!(fused.total_amount, 80.0);
        assert!(fused.warnings.contains(&ExtractionWarning::FusionConflict {
            field: "total_amount".into(),
            kept: "80.00".into(),
            discarded: "40.00".into(),
        }));
    }

    #[test]
    fn five_percent_is_the_agreement_boundary() {
        assert!(amounts_agree(100.0, 95.0, 0.05));
        assert!(!amounts_agree(100.0, 94.0, 0.05));
        assert!(amounts_agree(0.0, 0.0, 0.05));
    }

    #[test]
    fn misspelled_item_with_same_price_merges() {
        let a = vec![LineItem::new("Coffee", 1.0, 3.50, 3.50)];
        let b = vec![LineItem::new("Cofee - $3.50", 1.0, 3.50, 3.50)];
        assert!(line_item_similarity(&a[0], &b[0]) > 0.7);

        let fused = fuse_line_items(&a, 70.0, &b, 90.0, 0.7);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].total_price, 3.50);
    }

    #[test]
    fn unrelated_items_are_all_kept() {
        let a = vec![LineItem::new("Latte", 1.0, 4.5, 4.5), LineItem::new("Bagel", 1.0, 3.0, 3.0)];
        let b = vec![
            LineItem::new("Latte", 1.0, 4.5, 4.5),
            LineItem::new("Orange juice", 1.0, 5.25, 5.25),
            LineItem::new("Muffin", 2.0, 2.0, 4.0),
        ];
        let fused = fuse_line_items(&a, 80.0, &b, 75.0, 0.7);

        // 1 matched pair + 1 unmatched from a + 2 unmatched from b
        assert_eq!(fused.len(), 4);
        assert!(fused.len() >= a.len().max(b.len()));
        assert!(fused.len() <= a.len() + b.len());
        let names: Vec<_> = fused.iter().map(|i| i.description.as_str()).collect();
        assert_eq!(names, vec!["Latte", "Bagel", "Orange juice", "Muffin"]);
    }

    #[test]
    fn merge_prefers_longer_description_and_nonzero_numbers() {
        let mut a = LineItem::new("Choc croissant", 0.0, 0.0, 3.2);
        a.confidence = Some(0.6);
        let mut b = LineItem::new("Chocolate croissant", 1.0, 3.2, 3.2);
        b.category = Some("bakery".into());
        b.confidence = Some(0.8);

        let merged = merge_items(&a, 90.0, &b, 70.0);
        assert_eq!(merged.description, "Chocolate croissant");
        assert_eq!(merged.quantity, 1.0);
        assert_eq!(merged.unit_price, 3.2);
        assert_eq!(merged.category.as_deref(), Some("bakery"));
        assert_eq!(merged.confidence, Some(0.8));
    }

    #[test]
    fn each_item_matches_at_most_once() {
        let a = vec![LineItem::new("Water", 1.0, 1.0, 1.0), LineItem::new("Water", 1.0, 1.0, 1.0)];
        let b = vec![LineItem::new("Water", 1.0, 1.0, 1.0)];
        let fused = fuse_line_items(&a, 80.0, &b, 80.0, 0.7);
        assert_eq!(fused.len(), 2);
    }

    #[test]
    fn normalization_drops_punctuation_and_prices() {
        assert_eq!(normalize_description("Cofee - $3.50"), "cofee");
        assert_eq!(normalize_description("  COFFEE,  Large "), "coffee large");
        assert_eq!(normalize_description("2x Bagel"), "2x bagel");
        assert_eq!(text_similarity("", ""), 1.0);
    }

    #[test]
    fn price_similarity_bounds() {
        assert_eq!(price_similarity(0.0, 0.0), 1.0);
        assert_eq!(price_similarity(3.5, 3.5), 1.0);
        assert_eq!(price_similarity(10.0, 0.0), 0.0);
        assert!((price_similarity(10.0, 5.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn fused_confidence_within_bounds() {
        for (x, y) in [(70.0, 90.0), (60.0, 61.0), (10.0, 84.0), (84.0, 84.0)] {
            let c = fused_confidence(x, y, 95.0);
            assert!(c >= f64::min(x, y), "{c} below inputs {x}/{y}");
            assert!(c <= 95.0);
        }
        assert_eq!(fused_confidence(94.0, 99.0, 95.0), 95.0);
        assert_eq!(fused_confidence(0.0, 0.0, 95.0), 0.0);
    }

    #[test]
    fn scalars_follow_higher_confidence_and_costs_add() {
        let mut a = candidate("gpt-4o", "Corner Cafe", 10.0, 70.0, vec![]);
        a.date = chrono::NaiveDate::from_ymd_opt(2026, 3, 14);
        a.category = Some("dining".into());
        let mut b = candidate("claude-sonnet", "Corner Café", 10.0, 80.0, vec![]);
        b.currency = "EUR".into();

        let fused = fuse(&a, &b, &FusionSettings::default());
        assert_eq!(fused.vendor, "Corner Café");
        assert_eq!(fused.currency, "EUR");
        assert_eq!(fused.date, a.date);
        assert_eq!(fused.category.as_deref(), Some("dining"));
        assert_eq!(fused.route_name, "gpt-4o+claude-sonnet");
        assert!((fused.cost_estimate - 0.02).abs() < 1e-12);
        assert_eq!(fused.processing_time_ms, 200);
        assert!(!fused.warnings.iter().any(|w| matches!(w, ExtractionWarning::FusionConflict { .. })));
    }

    #[test]
    fn vendor_disagreement_is_reported() {
        let a = candidate("gpt-4o", "Corner Cafe", 10.0, 70.0, vec![]);
        let b = candidate("claude-sonnet", "Shell Station 114", 10.0, 80.0, vec![]);
        let fused = fuse(&a, &b, &FusionSettings::default());
        assert_eq!(fused.vendor, "Shell Station 114");
        assert!(fused
            .warnings
            .iter()
            .any(|w| matches!(w, ExtractionWarning::FusionConflict { field, .. } if field == "vendor")));
    }

    #[test]
    fn one_sided_subtotal_is_kept() {
        let mut a = candidate("gpt-4o", "Corner Cafe", 10.8, 70.0, vec![]);
        a.subtotal = Some(10.0);
        let b = candidate("claude-sonnet", "Corner Cafe", 10.8, 80.0, vec![]);
        let fused = fuse(&a, &b, &FusionSettings::default());
        assert_eq!(fused.subtotal, Some(10.0));
        assert_eq!(fused.tax, None);
    }
}
