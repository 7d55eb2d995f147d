use futures::future::BoxFuture;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::CompletionClient;
use conductor_core::types::CompletionRequest;

use crate::response::{extract_text, status_error};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            http: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| ANTHROPIC_API_URL.to_string()),
        }
    }
}

// Anthropic API request types
#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

fn build_request(request: CompletionRequest) -> AnthropicRequest {
    AnthropicRequest {
        model: request.model,
        max_tokens: request.max_tokens,
        temperature: if request.temperature > 0.0 {
            Some(request.temperature)
        } else {
            None
        },
        messages: vec![ApiMessage {
            role: "user",
            content: request.prompt,
        }],
        system: request.system_prompt,
        // Responses are read whole; streaming is not used here.
        stream: false,
    }
}

impl CompletionClient for AnthropicClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let body = build_request(request);
            debug!(model = %body.model, "Sending Anthropic messages request");

            let response = self
                .http
                .post(&self.base_url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| ConductorError::LlmRequest(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());

            if !status.is_success() {
                return Err(status_error(status, text));
            }

            extract_text(&text)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_shape() {
        let req = CompletionRequest {
            prompt: "What is 2+2?".into(),
            system_prompt: "You are terse.".into(),
            model: "claude-sonnet-4-20250514".into(),
            temperature: 0.0,
            max_tokens: 256,
            stream: true,
        };
        let json = serde_json::to_value(build_request(req)).unwrap();
        assert_eq!(json["system"], "You are terse.");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "What is 2+2?");
        assert_eq!(json["stream"], false);
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn default_base_url() {
        let client = AnthropicClient::new("sk-test", None);
        assert_eq!(client.base_url, ANTHROPIC_API_URL);
    }
}
