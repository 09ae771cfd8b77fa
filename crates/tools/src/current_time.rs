//! Current time tool — reports the wall clock, optionally shifted to a
//! fixed UTC offset.

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde_json::{Value, json};
use turnflow_core::error::ToolError;
use turnflow_core::tool::Tool;

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time. Optionally pass a UTC offset in minutes and a strftime format."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "utc_offset_minutes": {
                    "type": "integer",
                    "description": "Offset from UTC in minutes, e.g. 60 for CET, -300 for EST"
                },
                "format": {
                    "type": "string",
                    "description": "strftime format string, e.g. '%Y-%m-%d %H:%M'"
                }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let offset_minutes = arguments
            .get("utc_offset_minutes")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let offset = offset_minutes
            .checked_mul(60)
            .and_then(|secs| i32::try_from(secs).ok())
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                ToolError::InvalidArguments(format!("utc_offset_minutes out of range: {offset_minutes}"))
            })?;

        let now = Utc::now();
        let local = now.with_timezone(&offset);

        let formatted = match arguments.get("format").and_then(Value::as_str) {
            Some(fmt) => {
                use std::fmt::Write;
                let mut out = String::new();
                write!(out, "{}", local.format(fmt)).map_err(|_| {
                    ToolError::InvalidArguments(format!("invalid format string: {fmt}"))
                })?;
                out
            }
            None => local.to_rfc3339(),
        };

        Ok(json!({
            "utc": now.to_rfc3339(),
            "local": formatted,
            "utc_offset_minutes": offset_minutes,
            "unix": now.timestamp(),
        }))
    }
}
