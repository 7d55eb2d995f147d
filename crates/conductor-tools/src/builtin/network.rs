use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::Tool;
use conductor_core::types::{ParameterSpec, ToolContext, ToolOutput, ToolSchema};

use super::truncate;

const MAX_BODY_BYTES: usize = 10_000;

pub struct HttpRequestTool;

#[derive(Deserialize)]
struct HttpRequestInput {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

fn default_method() -> String {
    "GET".into()
}

impl Tool for HttpRequestTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn timeout_secs(&self) -> u64 {
        60
    }

    fn description(&self) -> &str {
        "Make an HTTP request. Returns status, headers, and body."
    }

    fn parameters(&self) -> ToolSchema {
        let mut schema = ToolSchema::new();
        schema.insert("url".into(), ParameterSpec::new("string", "Request URL"));
        schema.insert(
            "method".into(),
            ParameterSpec::new("string", "HTTP method (default: GET)")
                .with_enum(&["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"]),
        );
        schema.insert(
            "headers".into(),
            ParameterSpec::new("object", "Request headers"),
        );
        schema.insert("body".into(), ParameterSpec::new("string", "Request body"));
        schema
    }

    fn execute(
        &self,
        params: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let p: HttpRequestInput = serde_json::from_value(params)
                .map_err(|e| ConductorError::ToolValidation(e.to_string()))?;
            let method = parse_method(&p.method)?;

            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| ConductorError::ToolExecution {
                    tool: "http_request".into(),
                    message: e.to_string(),
                })?;

            debug!(method = %method, url = %p.url, "HTTP request");
            let mut req = client.request(method, &p.url);
            for (k, v) in &p.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Some(body) = p.body {
                req = req.body(body);
            }

            let resp = match req.send().await {
                Ok(r) => r,
                Err(e) => return Ok(ToolOutput::failure(format!("Request failed: {}", e))),
            };
            let status = resp.status();
            let headers = resp
                .headers()
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v.to_str().unwrap_or("?")))
                .collect::<Vec<_>>()
                .join("\n");
            let body = resp.text().await.unwrap_or_default();

            let text = format!(
                "HTTP {} {}\n\n{}\n\n{}",
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
                headers,
                truncate(&body, MAX_BODY_BYTES)
            );
            let data = serde_json::json!({ "status": status.as_u16() });
            if status.is_success() {
                Ok(ToolOutput::success(text).with_data(data))
            } else {
                Ok(ToolOutput::failure(text).with_data(data))
            }
        })
    }
}

fn parse_method(method: &str) -> Result<reqwest::Method> {
    method
        .to_uppercase()
        .parse::<reqwest::Method>()
        .map_err(|e| ConductorError::ToolValidation(format!("Invalid method: {}", e)))
}
