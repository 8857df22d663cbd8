//! Deadline wrapper for completion services.

use std::sync::Arc;
use std::time::Duration;

use crate::{CompletionError, CompletionRequest, CompletionService};

/// A [`CompletionService`] that fails with [`CompletionError::Timeout`] when
/// the inner service does not answer in time.
pub struct TimeoutCompletion {
    inner: Arc<dyn CompletionService>,
    timeout: Duration,
}

impl TimeoutCompletion {
    /// Wrap `inner` with a per-call deadline.
    pub fn new(inner: Arc<dyn CompletionService>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait::async_trait]
impl CompletionService for TimeoutCompletion {
    #[tracing::instrument(skip(self, request), fields(timeout_ms = self.timeout.as_millis() as u64))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Vec<String>, CompletionError> {
        match tokio::time::timeout(self.timeout, self.inner.complete(request)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(CompletionError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}
