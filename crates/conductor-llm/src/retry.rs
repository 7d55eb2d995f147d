use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use conductor_core::config::{ModelConfig, RetryConfig};
use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::CompletionClient;
use conductor_core::types::CompletionRequest;

/// A completion client that retries failed requests and falls back to alternative endpoints.
pub struct RetryingClient {
    primary: Box<dyn CompletionClient>,
    fallbacks: Vec<(ModelConfig, Box<dyn CompletionClient>)>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn CompletionClient>,
        fallbacks: Vec<(ModelConfig, Box<dyn CompletionClient>)>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }

    pub fn fallback_count(&self) -> usize {
        self.fallbacks.len()
    }
}

fn is_retryable(e: &ConductorError) -> bool {
    match e {
        ConductorError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl CompletionClient for RetryingClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            let mut last_err = None;
            for attempt in 0..=max_retries {
                match self.primary.complete(request.clone()).await {
                    Ok(text) => return Ok(text),
                    Err(e) => {
                        if is_retryable(&e) && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying completion request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }

            if !self.fallbacks.is_empty() {
                info!("Primary endpoint exhausted, trying fallback models");
            }
            for (fb_config, fb_client) in &self.fallbacks {
                let mut fb_request = request.clone();
                fb_request.model = fb_config.model_id.clone();
                match fb_client.complete(fb_request).await {
                    Ok(text) => {
                        info!(
                            model = %fb_config.model_id,
                            provider = %fb_config.provider,
                            "Fell back to alternative model"
                        );
                        return Ok(text);
                    }
                    Err(e) => {
                        warn!(
                            model = %fb_config.model_id,
                            error = %e,
                            "Fallback model also failed"
                        );
                        continue;
                    }
                }
            }

            Err(last_err
                .unwrap_or_else(|| ConductorError::LlmRequest("All endpoints failed".into())))
        })
    }
}
