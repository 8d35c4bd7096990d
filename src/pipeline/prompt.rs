use super::analysis::QualityMetrics;
use super::routing::ProcessingRoute;
use crate::providers::PromptSpec;

pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"
You are a receipt data extraction assistant. Your ONLY role is to read the
receipt image and return the financial data printed on it as JSON.

RULES:
1. Extract ONLY what is printed on the receipt. Never guess missing values.
2. If a field is unreadable or absent, output null for that field.
3. Amounts are plain numbers without currency symbols or thousands separators.
4. Dates use YYYY-MM-DD.
5. One entry per purchased line; do not merge or split lines.
6. "confidence" is your own 0-100 estimate of how reliable the whole extraction is.
7. Output a single JSON object and nothing else.
"#;

const MAX_OUTPUT_TOKENS: u32 = 2048;

/// Sharpness or contrast below this earns a caution note.
const CAUTION_SCORE_BELOW: f64 = 40.0;
/// Predicted item count at or above this earns a completeness note.
const MANY_ITEMS_AT: u32 = 10;

/// Build the prompt for one attempt.
pub fn build_prompt(route: &ProcessingRoute, metrics: &QualityMetrics) -> PromptSpec {
    PromptSpec {
        model: route.model.clone(),
        system: EXTRACTION_SYSTEM_PROMPT.trim().to_string(),
        user: build_user_prompt(metrics),
        temperature: 0.0,
        max_output_tokens: MAX_OUTPUT_TOKENS,
    }
}

/// Quality-driven notes prepended to the user prompt.
pub fn caution_notes(metrics: &QualityMetrics) -> Vec<String> {
    let mut notes = Vec::new();
    if metrics.sharpness < CAUTION_SCORE_BELOW {
        notes.push(
            "NOTE: The image is blurry. Digits such as 1/7, 3/8, 5/6 and 0/8 are easily \
             confused; if a value cannot be read with certainty, output null and lower confidence."
                .to_string(),
        );
    }
    if metrics.contrast < CAUTION_SCORE_BELOW {
        notes.push(
            "NOTE: The image has low contrast (faded thermal paper is common). Faint print \
             still counts; do not skip lines that are hard to see."
                .to_string(),
        );
    }
    if metrics.estimated_line_items >= MANY_ITEMS_AT {
        notes.push(format!(
            "NOTE: This receipt likely has {} or more line items. List every one; \
             do not summarize or stop early.",
            metrics.estimated_line_items
        ));
    }
    notes
}

fn build_user_prompt(metrics: &QualityMetrics) -> String {
    let notes = caution_notes(metrics).join("\n");
    format!(
        r#"{notes}
Extract the receipt in the image into exactly this JSON structure:

{{
  "vendor": "store or merchant name",
  "date": "YYYY-MM-DD or null",
  "totalAmount": 0.00,
  "subtotal": 0.00,
  "tax": 0.00,
  "currency": "ISO 4217 code, e.g. USD",
  "category": "groceries | dining | travel | fuel | office | other | null",
  "lineItems": [
    {{
      "description": "item text as printed",
      "quantity": 1,
      "unitPrice": 0.00,
      "totalPrice": 0.00,
      "category": "category or null"
    }}
  ],
  "confidence": 0
}}"#
    )
    .trim_start()
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;

    fn route() -> ProcessingRoute {
        ProcessingRoute::new("gpt-4o-mini", ProviderKind::OpenAi, "gpt-4o-mini", 0.003, 0.88, 2500)
    }

    #[test]
    fn clean_image_has_no_caution_notes() {
        let metrics = QualityMetrics::from_scores(80.0, 75.0, 50.0, 15.0);
        assert!(caution_notes(&metrics).is_empty());
        let prompt = build_prompt(&route(), &metrics);
        assert!(prompt.user.starts_with("Extract the receipt"));
        assert!(!prompt.user.contains("NOTE:"));
    }

    #[test]
    fn prompt_carries_route_model_and_schema() {
        let prompt = build_prompt(&route(), &QualityMetrics::from_scores(80.0, 75.0, 50.0, 15.0));
        assert_eq!(prompt.model, "gpt-4o-mini");
        assert_eq!(prompt.temperature, 0.0);
        assert!(prompt.system.starts_with("You are a receipt"));
        assert!(prompt.user.contains("\"totalAmount\""));
        assert!(prompt.user.contains("\"lineItems\""));
    }

    #[test]
    fn blurry_faded_dense_image_gets_all_notes() {
        let metrics = QualityMetrics::from_scores(20.0, 30.0, 50.0, 100.0);
        let notes = caution_notes(&metrics);
        assert_eq!(notes.len(), 3);
        assert!(notes[0].contains("blurry"));
        assert!(notes[1].contains("low contrast"));
        assert!(notes[2].contains("10 or more"));

        let prompt = build_prompt(&route(), &metrics);
        assert!(prompt.user.starts_with("NOTE: The image is blurry"));
    }

    #[test]
    fn nine_predicted_items_is_below_note_threshold() {
        let metrics = QualityMetrics::from_scores(80.0, 75.0, 50.0, 95.0);
        assert_eq!(metrics.estimated_line_items, 9);
        assert!(caution_notes(&metrics).is_empty());
    }
}
