pub mod providers;
pub mod response;
pub mod retry;

use conductor_core::config::ModelConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::CompletionClient;

pub use providers::anthropic::AnthropicClient;
pub use providers::proxy::ProxyClient;
pub use retry::RetryingClient;

/// Create a completion client based on the provider name.
///
/// Returns `ConfigAbsent` when the deployment settings the provider needs
/// are missing.
pub fn create_client(config: &ModelConfig) -> Result<Box<dyn CompletionClient>> {
    match config.provider.as_str() {
        "anthropic" | "claude" => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                ConductorError::ConfigAbsent("model.api_key is required for anthropic".into())
            })?;
            Ok(Box::new(AnthropicClient::new(api_key, config.endpoint.clone())))
        }
        "proxy" => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                ConductorError::ConfigAbsent("model.endpoint is required for proxy".into())
            })?;
            Ok(Box::new(ProxyClient::new(endpoint, config.api_key.clone())))
        }
        other => Err(ConductorError::Config(format!(
            "unsupported completion provider: {}",
            other
        ))),
    }
}

/// Create the primary client wrapped with retries and configured fallbacks.
pub fn create_retrying_client(
    primary: &ModelConfig,
    fallbacks: &[ModelConfig],
) -> Result<RetryingClient> {
    let client = create_client(primary)?;
    let mut fallback_clients = Vec::new();
    for fb in fallbacks {
        match create_client(fb) {
            Ok(c) => fallback_clients.push((fb.clone(), c)),
            Err(e) => {
                tracing::warn!(model = %fb.model_id, error = %e, "Skipping fallback model");
            }
        }
    }
    Ok(RetryingClient::new(
        client,
        fallback_clients,
        primary.retry.clone().unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(provider: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            model_id: "claude-sonnet-4-20250514".into(),
            endpoint: None,
            api_key: None,
            max_tokens: 1024,
            temperature: 0.7,
            retry: None,
        }
    }

    #[test]
    fn proxy_without_endpoint_is_config_absent() {
        let err = create_client(&model("proxy")).err().unwrap();
        assert!(matches!(err, ConductorError::ConfigAbsent(_)));
    }

    #[test]
    fn anthropic_without_key_is_config_absent() {
        let err = create_client(&model("anthropic")).err().unwrap();
        assert!(matches!(err, ConductorError::ConfigAbsent(_)));
    }

    #[test]
    fn unknown_provider_is_config_error() {
        let err = create_client(&model("carrier-pigeon")).err().unwrap();
        assert!(matches!(err, ConductorError::Config(_)));
    }

    #[test]
    fn proxy_with_endpoint_builds() {
        let mut cfg = model("proxy");
        cfg.endpoint = Some("http://localhost:3000/api/claude".into());
        assert!(create_client(&cfg).is_ok());
    }

    #[test]
    fn unusable_fallbacks_are_skipped() {
        let mut primary = model("proxy");
        primary.endpoint = Some("http://localhost:3000/api/claude".into());
        let client = create_retrying_client(&primary, &[model("anthropic")]).unwrap();
        assert_eq!(client.fallback_count(), 0);
    }
}
