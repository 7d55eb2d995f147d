use chrono::{FixedOffset, Utc};
use futures::future::BoxFuture;
use serde::Deserialize;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::Tool;
use conductor_core::types::{ParameterSpec, ToolContext, ToolOutput, ToolSchema};

pub struct CurrentTimeTool;

#[derive(Deserialize, Default)]
struct CurrentTimeInput {
    #[serde(default)]
    offset_hours: Option<f64>,
}

impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn timeout_secs(&self) -> u64 {
        5
    }

    fn description(&self) -> &str {
        "Current date and time as RFC 3339. Defaults to UTC."
    }

    fn parameters(&self) -> ToolSchema {
        let mut schema = ToolSchema::new();
        schema.insert(
            "offset_hours".into(),
            ParameterSpec::new("number", "UTC offset in hours, e.g. -5 or 5.5"),
        );
        schema
    }

    fn execute(
        &self,
        params: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let p: CurrentTimeInput = if params.is_null() {
                CurrentTimeInput::default()
            } else {
                serde_json::from_value(params)
                    .map_err(|e| ConductorError::ToolValidation(e.to_string()))?
            };

            let offset = match offset_from_hours(p.offset_hours.unwrap_or(0.0)) {
                Some(o) => o,
                None => return Ok(ToolOutput::failure("offset_hours must be within ±24")),
            };
            let now = Utc::now().with_timezone(&offset);
            Ok(ToolOutput::success(now.to_rfc3339()).with_data(serde_json::json!({
                "unix": now.timestamp(),
            })))
        })
    }
}

fn offset_from_hours(hours: f64) -> Option<FixedOffset> {
    if !hours.is_finite() {
        return None;
    }
    FixedOffset::east_opt((hours * 3600.0).round() as i32)
}
