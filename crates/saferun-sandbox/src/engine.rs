//! Engine abstraction shared by the local and container backends.

use async_trait::async_trait;
use saferun_core::{ExecutionRequest, ExecutionResult};

/// A backend that runs one request to completion.
///
/// `dispatch` never fails: infrastructure problems, policy violations, and
/// resource overruns all come back as `ExecutionResult { ok: false, .. }`.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Run `request` and report the outcome.
    async fn dispatch(&self, request: &ExecutionRequest) -> ExecutionResult;
}
