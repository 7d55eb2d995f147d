use serde::Deserialize;

use conductor_core::error::{ConductorError, Result};

/// Message body returned by the completion endpoint.
#[derive(Deserialize, Debug)]
struct MessageResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize, Debug)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Extract the response text from a message body.
///
/// Text blocks of the `content` array are concatenated in order; other block
/// types are ignored.
pub fn extract_text(body: &str) -> Result<String> {
    let parsed: MessageResponse =
        serde_json::from_str(body).map_err(|e| ConductorError::LlmParse(e.to_string()))?;

    let text: String = parsed
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text)
        .collect::<Vec<_>>()
        .join("");

    Ok(text)
}

/// Turn a non-2xx response into a request error carrying status and body.
pub fn status_error(status: reqwest::StatusCode, body: String) -> ConductorError {
    ConductorError::LlmRequest(format!("HTTP {}: {}", status, body))
}
