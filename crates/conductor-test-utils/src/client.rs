use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::CompletionClient;
use conductor_core::types::CompletionRequest;

/// One scripted completion outcome.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Respond with this text.
    Text(String),
    /// Fail with `LlmRequest(message)`.
    Fail(String),
    /// Sleep, then respond with this text.
    Delayed(Duration, String),
}

#[derive(Default)]
struct Inner {
    replies: Mutex<VecDeque<Reply>>,
    repeat: Option<Reply>,
    requests: Mutex<Vec<CompletionRequest>>,
}

/// Completion client that plays back a fixed script and records requests.
///
/// Clones share the same script and request log.
#[derive(Clone, Default)]
pub struct ScriptedClient {
    inner: Arc<Inner>,
}

impl ScriptedClient {
    /// Play `replies` in order; fail once they run out.
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            inner: Arc::new(Inner {
                replies: Mutex::new(replies.into()),
                repeat: None,
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Play the given texts in order.
    pub fn texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Reply::Text(t.to_string())).collect())
    }

    /// Answer every request with the same reply.
    pub fn repeating(reply: Reply) -> Self {
        Self {
            inner: Arc::new(Inner {
                replies: Mutex::new(VecDeque::new()),
                repeat: Some(reply),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.inner.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.inner.requests.lock().unwrap().len()
    }

    fn next_reply(&self) -> Option<Reply> {
        let queued = self.inner.replies.lock().unwrap().pop_front();
        queued.or_else(|| self.inner.repeat.clone())
    }
}

impl CompletionClient for ScriptedClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.inner.requests.lock().unwrap().push(request);
            match self.next_reply() {
                Some(Reply::Text(text)) => Ok(text),
                Some(Reply::Fail(message)) => Err(ConductorError::LlmRequest(message)),
                Some(Reply::Delayed(delay, text)) => {
                    tokio::time::sleep(delay).await;
                    Ok(text)
                }
                None => Err(ConductorError::LlmRequest("script exhausted".into())),
            }
        })
    }
}
