//! Correlation ids: the idempotency key of one logical trigger.
//!
//! Format: `{trigger_key}:{scenario_id}:{unix_millis}:{random}[:{extra}...]`

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;

const RANDOM_TOKEN_LEN: usize = 9;

/// Errors from parsing a correlation id
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationIdError {
    #[error("Correlation id '{id}' has {parts} parts, at least 4 are required")]
    TooFewParts { id: String, parts: usize },

    #[error("Correlation id '{id}' contains an empty part at position {position}")]
    EmptyPart { id: String, position: usize },
}

/// Components of a parsed correlation id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCorrelationId {
    pub trigger_key: String,
    pub scenario_id: String,
    pub timestamp: String,
    pub random: String,
    pub extra: Vec<String>,
}

impl ParsedCorrelationId {
    /// Creation time in unix milliseconds, if the timestamp part is numeric
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.timestamp.parse().ok()
    }
}

/// Create a fresh correlation id for a trigger of a scenario
pub fn create_correlation_id(trigger_key: &str, scenario_id: &str) -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_TOKEN_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();

    format!(
        "{}:{}:{}:{}",
        trigger_key,
        scenario_id,
        Utc::now().timestamp_millis(),
        token
    )
}

/// Create a correlation id carrying extra context after the random token
pub fn create_correlation_id_with_extra(trigger_key: &str, scenario_id: &str, extra: &str) -> String {
    format!("{}:{}", create_correlation_id(trigger_key, scenario_id), extra)
}

/// Correlation id of one step of a sequence sharing `shared` as prefix
pub fn step_correlation_id(shared: &str, step: u32) -> String {
    format!("{}:step_{}", shared, step)
}

/// Split a correlation id back into its components
pub fn parse_correlation_id(id: &str) -> Result<ParsedCorrelationId, CorrelationIdError> {
    let parts: Vec<&str> = id.split(':').collect();

    if parts.len() < 4 {
        return Err(CorrelationIdError::TooFewParts {
            id: id.to_string(),
            parts: parts.len(),
        });
    }

    if let Some(position) = parts.iter().position(|p| p.is_empty()) {
        return Err(CorrelationIdError::EmptyPart {
            id: id.to_string(),
            position,
        });
    }

    Ok(ParsedCorrelationId {
        trigger_key: parts[0].to_string(),
        scenario_id: parts[1].to_string(),
        timestamp: parts[2].to_string(),
        random: parts[3].to_string(),
        extra: parts[4..].iter().map(|p| p.to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let id = create_correlation_id("webhook", "scn_42");
        let parsed = parse_correlation_id(&id).unwrap();

        assert_eq!(parsed.trigger_key, "webhook");
        assert_eq!(parsed.scenario_id, "scn_42");
        assert!(parsed.timestamp_ms().is_some());
        assert_eq!(parsed.random.len(), RANDOM_TOKEN_LEN);
        assert!(parsed.extra.is_empty());
    }

    #[test]
    fn test_extra_context_is_kept() {
        let shared = create_correlation_id_with_extra("manual", "scn_1", "batch");
        let step = step_correlation_id(&shared, 2);
        let parsed = parse_correlation_id(&step).unwrap();

        assert_eq!(parsed.extra, vec!["batch".to_string(), "step_2".to_string()]);
    }

    #[test]
    fn test_too_few_parts() {
        let err = parse_correlation_id("manual:scn_1:123").unwrap_err();
        assert!(matches!(err, CorrelationIdError::TooFewParts { parts: 3, .. }));
    }

    #[test]
    fn test_empty_part_is_invalid() {
        let err = parse_correlation_id("manual::123:abc").unwrap_err();
        assert!(matches!(err, CorrelationIdError::EmptyPart { position: 1, .. }));
    }
}
