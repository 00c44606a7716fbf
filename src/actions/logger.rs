//! `logger` action: writes its input to the log and echoes it back.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{Action, ActionContext};
use crate::domain::ActionResult;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggerOutput {
    pub logged: bool,
    pub message: String,
    pub input_data: Value,

    /// Unix milliseconds
    pub timestamp: i64,
}

pub struct LoggerAction;

#[async_trait]
impl Action for LoggerAction {
    type Config = LoggerConfig;
    type Input = Value;
    type Output = LoggerOutput;

    fn action_type(&self) -> &str {
        "logger"
    }

    fn description(&self) -> &str {
        "Log a message with the input data"
    }

    async fn execute(
        &self,
        ctx: &ActionContext,
        input: Value,
        config: LoggerConfig,
    ) -> Result<ActionResult<LoggerOutput>> {
        let message = config
            .message
            .unwrap_or_else(|| "Logger action executed".to_string());

        info!(
            run_id = %ctx.run_id,
            correlation_id = %ctx.correlation_id,
            input = %input,
            "{}",
            message
        );

        Ok(ActionResult::success(LoggerOutput {
            logged: true,
            message,
            input_data: input,
            timestamp: Utc::now().timestamp_millis(),
        }))
    }
}
