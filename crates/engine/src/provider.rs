// The AI completion port.
//
// The engine consumes a text generator as a black box. Output is treated
// as adversarial: it may be malformed, truncated, or prose-wrapped JSON
// (the recovery parser deals with that). There is deliberately no timeout
// at this boundary; hosts that need one wrap their implementation in
// `tokio::time::timeout`.

use std::future::Future;
use std::pin::Pin;

/// Completion output. `reported_tokens` is the upstream usage figure when
/// the provider supplies one; the dispatcher falls back to a length-based
/// estimate when it doesn't.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub reported_tokens: Option<i64>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), reported_tokens: None }
    }
}

/// Trait for calling the upstream text generator.
///
/// In production this is an HTTP client for the platform's completion
/// service. Tests inject scripted implementations.
pub trait AiProvider: Send + Sync {
    fn complete(
        &self,
        system: &str,
        prompt: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Completion, ProviderError>> + Send>>;
}

/// Errors from the provider (network or upstream-side). Parse failures are
/// not errors: garbage text is a successful completion as far as this port
/// is concerned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider connection failed: {0}")]
    ConnectionFailed(String),
    #[error("provider rejected the request: {0}")]
    Rejected(String),
    #[error("provider returned an empty response")]
    EmptyResponse,
}
