//! Mock command runner for testing.
//!
//! Provides a configurable implementation of [`CommandRunner`] that records
//! every request and replays predefined responses, so executor behaviour can
//! be tested without a Proxmox host.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::error::{RunnerError, RunnerResult};
use crate::runner::{CommandRunner, ExecutionResult, RunRequest};

/// Predefined mock response for a script execution.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl MockResponse {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            duration_ms: 100,
        }
    }

    pub fn failure(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration_ms: 100,
        }
    }
}

/// Mock runner for testing.
///
/// Responses are handed out in order; once they run out every further call
/// succeeds with empty output. A response can also be bound to a command
/// name, which takes precedence over the queue.
#[derive(Clone, Default)]
pub struct MockRunner {
    /// Queued responses.
    responses: Arc<RwLock<Vec<MockResponse>>>,
    /// Responses keyed by command name.
    named: Arc<RwLock<Vec<(String, MockResponse)>>>,
    /// Index of next queued response.
    response_index: Arc<AtomicUsize>,
    /// Captured requests for verification.
    captured_calls: Arc<RwLock<Vec<RunRequest>>>,
    /// Simulated transport failure.
    simulate_failure: Arc<RwLock<Option<String>>>,
}

impl MockRunner {
    /// Create a new mock runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next call.
    pub fn add_response(self, response: MockResponse) -> Self {
        self.responses.write().push(response);
        self
    }

    /// Answer calls for the command `name` with `response`.
    pub fn respond_to(self, name: impl Into<String>, response: MockResponse) -> Self {
        self.named.write().push((name.into(), response));
        self
    }

    /// Fail every call as if the connection broke.
    pub fn simulate_failure(self, message: impl Into<String>) -> Self {
        *self.simulate_failure.write() = Some(message.into());
        self
    }

    /// Clear all captured calls.
    pub fn clear_calls(&self) {
        self.captured_calls.write().clear();
    }

    /// Get all captured calls.
    pub fn get_calls(&self) -> Vec<RunRequest> {
        self.captured_calls.read().clone()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.captured_calls.read().len()
    }

    /// Names of the commands run, in order.
    pub fn called_names(&self) -> Vec<String> {
        self.captured_calls.read().iter().map(|c| c.name.clone()).collect()
    }

    fn next_response(&self, name: &str) -> MockResponse {
        if let Some((_, response)) = self.named.read().iter().find(|(n, _)| n == name) {
            return response.clone();
        }
        let responses = self.responses.read();
        let index = self.response_index.fetch_add(1, Ordering::SeqCst);
        responses
            .get(index)
            .cloned()
            .unwrap_or_else(|| MockResponse::success(""))
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, request: &RunRequest) -> RunnerResult<ExecutionResult> {
        self.captured_calls.write().push(request.clone());

        if let Some(message) = self.simulate_failure.read().clone() {
            return Err(RunnerError::ExecutionFailed(message));
        }

        let response = self.next_response(&request.name);
        let started_at = Utc::now();
        let finished_at = started_at + chrono::Duration::milliseconds(response.duration_ms as i64);

        Ok(ExecutionResult {
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
            started_at,
            finished_at,
            duration_ms: response.duration_ms,
        })
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunTarget;

    #[tokio::test]
    async fn test_queued_then_default_responses() {
        let runner = MockRunner::new()
            .add_response(MockResponse::success("first"))
            .add_response(MockResponse::failure(2, "boom"));
        let request = RunRequest::new("step", RunTarget::Host, "true");

        assert_eq!(runner.run(&request).await.unwrap().stdout, "first");
        assert_eq!(runner.run(&request).await.unwrap().exit_code, 2);
        assert!(runner.run(&request).await.unwrap().success());
        assert_eq!(runner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_named_response_wins() {
        let runner = MockRunner::new()
            .add_response(MockResponse::success("queued"))
            .respond_to("special", MockResponse::success("named"));

        let special = RunRequest::new("special", RunTarget::Host, "true");
        let other = RunRequest::new("other", RunTarget::Host, "true");
        assert_eq!(runner.run(&special).await.unwrap().stdout, "named");
        assert_eq!(runner.run(&other).await.unwrap().stdout, "queued");
        assert_eq!(runner.called_names(), vec!["special", "other"]);
    }

    #[tokio::test]
    async fn test_simulated_failure() {
        let runner = MockRunner::new().simulate_failure("connection refused");
        let request = RunRequest::new("step", RunTarget::Host, "true");
        assert!(matches!(
            runner.run(&request).await,
            Err(RunnerError::ExecutionFailed(_))
        ));
        runner.clear_calls();
        assert_eq!(runner.get_calls().len(), 0);
    }
}
