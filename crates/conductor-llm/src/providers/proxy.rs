use futures::future::BoxFuture;
use reqwest::Client;
use tracing::debug;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::CompletionClient;
use conductor_core::types::CompletionRequest;

use crate::response::{extract_text, status_error};

/// Client for an application completion route.
///
/// The route accepts `{prompt, systemPrompt, model, temperature, maxTokens,
/// stream}` and answers with a Messages-style body.
pub struct ProxyClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl ProxyClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl CompletionClient for ProxyClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            debug!(endpoint = %self.endpoint, model = %request.model, "Sending completion request");

            let mut req = self
                .http
                .post(&self.endpoint)
                .header("content-type", "application/json")
                .json(&request);
            if let Some(ref key) = self.api_key {
                req = req.bearer_auth(key);
            }

            let response = req
                .send()
                .await
                .map_err(|e| ConductorError::LlmRequest(e.to_string()))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| ConductorError::LlmRequest(e.to_string()))?;

            if !status.is_success() {
                return Err(status_error(status, body));
            }

            extract_text(&body)
        })
    }
}
