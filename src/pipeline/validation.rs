//! Arithmetic consistency pass applied to the final candidate.
//!
//! After this runs, `subtotal + tax == total_amount` within one cent and
//! every correction is recorded as a warning on the candidate.

use super::types::{round_cents, ExtractionCandidate, ExtractionWarning};

/// Smallest gap between reported and recomputed figures that counts as a
/// disagreement. Amounts are in cents by then, so any nonzero gap qualifies.
pub const CENT_TOLERANCE: f64 = 0.01;

/// Confidence ceiling for a receipt with no line items.
pub const NO_ITEMS_CONFIDENCE_CAP: f64 = 50.0;
/// Confidence ceiling when no vendor was read.
pub const NO_VENDOR_CONFIDENCE_CAP: f64 = 60.0;

pub fn post_process(mut candidate: ExtractionCandidate) -> ExtractionCandidate {
    candidate.total_amount = round_cents(candidate.total_amount);
    candidate.subtotal = candidate.subtotal.map(round_cents);
    candidate.tax = candidate.tax.map(round_cents);
    for item in &mut candidate.line_items {
        item.unit_price = round_cents(item.unit_price);
        item.total_price = round_cents(item.total_price);
    }

    reconcile_subtotal(&mut candidate);
    reconcile_tax(&mut candidate);

    if candidate.line_items.is_empty() {
        candidate = candidate.cap_confidence(NO_ITEMS_CONFIDENCE_CAP, "no line items");
    }
    if !candidate.has_vendor() {
        candidate = candidate.cap_confidence(NO_VENDOR_CONFIDENCE_CAP, "vendor missing");
    }
    candidate
}

fn disagrees(a: f64, b: f64) -> bool {
    round_cents((a - b).abs()) >= CENT_TOLERANCE
}

fn reconcile_subtotal(c: &mut ExtractionCandidate) {
    if c.line_items.is_empty() {
        if c.subtotal.is_none() {
            c.subtotal = Some(round_cents(c.total_amount - c.tax.unwrap_or(0.0)));
        }
        return;
    }

    let computed = round_cents(c.line_items.iter().map(|i| i.total_price).sum());
    let stale = match c.subtotal {
        None => true,
        Some(reported) => disagrees(reported, computed),
    };
    if stale {
        tracing::debug!(reported = ?c.subtotal, computed, "Subtotal recomputed from line items");
        c.warnings.push(ExtractionWarning::SubtotalRecomputed {
            reported: c.subtotal,
            computed,
        });
        c.subtotal = Some(computed);
    }
}

fn reconcile_tax(c: &mut ExtractionCandidate) {
    let subtotal = c.subtotal.unwrap_or(c.total_amount);
    let consistent = match c.tax {
        None => false,
        Some(tax) => !disagrees(subtotal + tax, c.total_amount),
    };
    if consistent {
        return;
    }

    let computed = round_cents(c.total_amount - subtotal);
    if c.tax.is_some() {
        tracing::debug!(reported = ?c.tax, computed, "Tax recomputed from total and subtotal");
        c.warnings.push(ExtractionWarning::TaxRecomputed {
            reported: c.tax,
            computed,
        });
    }
    c.tax = Some(computed);
}
