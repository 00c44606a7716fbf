//! `data_transform` action: reshapes JSON input.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Action, ActionContext};
use crate::domain::{ActionResult, ErrorCode};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformType {
    /// Return the input unchanged
    #[default]
    Passthrough,

    /// Pull the value at `field_path` into `{output_field: value}`
    ExtractField,

    /// Add `timestamp` and `processed_at` to an object input
    AddTimestamp,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub transform_type: TransformType,

    /// Dot-separated path; numeric segments index into arrays
    pub field_path: String,

    pub output_field: String,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            transform_type: TransformType::Passthrough,
            field_path: "data".to_string(),
            output_field: "extracted".to_string(),
        }
    }
}

pub struct DataTransformAction;

#[async_trait]
impl Action for DataTransformAction {
    type Config = TransformConfig;
    type Input = Value;
    type Output = Value;

    fn action_type(&self) -> &str {
        "data_transform"
    }

    fn description(&self) -> &str {
        "Pass through, extract a field from, or timestamp the input"
    }

    async fn execute(
        &self,
        _ctx: &ActionContext,
        input: Value,
        config: TransformConfig,
    ) -> Result<ActionResult<Value>> {
        let result = match config.transform_type {
            TransformType::Passthrough => ActionResult::success(input),
            TransformType::ExtractField => {
                // A missing path yields an empty object, not a null field
                let mut output = serde_json::Map::new();
                if let Some(value) = extract_field(&input, &config.field_path) {
                    output.insert(config.output_field, value.clone());
                }
                ActionResult::success(Value::Object(output))
            }
            TransformType::AddTimestamp => match input {
                Value::Object(mut object) => {
                    let now = Utc::now();
                    object.insert("timestamp".to_string(), now.timestamp_millis().into());
                    object.insert("processed_at".to_string(), now.to_rfc3339().into());
                    ActionResult::success(Value::Object(object))
                }
                other => ActionResult::fatal(
                    ErrorCode::ValidationFailed,
                    format!("add_timestamp requires an object input, got {}", type_name(&other)),
                ),
            },
        };

        Ok(result)
    }
}

/// Follow a dot path through objects and arrays
pub fn extract_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
