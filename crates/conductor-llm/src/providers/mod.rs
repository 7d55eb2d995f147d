pub mod anthropic;
pub mod proxy;

pub use anthropic::AnthropicClient;
pub use proxy::ProxyClient;
