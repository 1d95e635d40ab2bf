//! The provider result envelope.
//!
//! Every transport returns a single JSON object:
//!
//! ```json
//! {"output": "...", "success": true, "duration_ms": 1200,
//!  "cost": {"input_tokens": 900, "output_tokens": 350}}
//! ```
//!
//! `cost.sub_cents` may be reported directly by the provider; when absent
//! it is derived from the token counts and the provider's rates.

use serde::Deserialize;

use crate::error::CoreError;

/// Raw envelope as deserialized from provider output.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultEnvelope {
    pub output: String,
    pub success: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub cost: CostEnvelope,
    #[serde(default)]
    pub error: Option<String>,
}

/// Cost section of the envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CostEnvelope {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub sub_cents: Option<i64>,
}

/// Parse the envelope out of raw provider text.
///
/// Providers are expected to emit the JSON object as their entire output,
/// but some wrap it in logging noise; the parser falls back to the last
/// line that parses as an object with an `output` field.
pub fn parse_result_envelope(raw: &str) -> Result<ResultEnvelope, CoreError> {
    let trimmed = raw.trim();

    if let Ok(envelope) = serde_json::from_str::<ResultEnvelope>(trimmed) {
        return check_success(envelope);
    }

    for line in trimmed.lines().rev() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        if let Ok(envelope) = serde_json::from_str::<ResultEnvelope>(line) {
            return check_success(envelope);
        }
    }

    Err(CoreError::ParseError(format!(
        "provider output is not a result envelope: {:?}",
        truncate(trimmed, 200)
    )))
}

fn check_success(envelope: ResultEnvelope) -> Result<ResultEnvelope, CoreError> {
    if !envelope.success {
        let reason = envelope
            .error
            .clone()
            .unwrap_or_else(|| "provider reported failure".to_string());
        return Err(CoreError::ProviderError(reason));
    }
    Ok(envelope)
}

fn truncate(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
