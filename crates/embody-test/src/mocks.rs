//! Mock tool backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use embody_broker::{ToolError, ToolHandler, ToolRegistry};
use embody_discovery::BodyDefinition;
use serde_json::{Value, json};

/// A [`ToolHandler`] that records every call and answers with a canned
/// value, optionally after a delay or with a failure.
///
/// Clones share the recorded calls.
#[derive(Debug, Clone)]
pub struct MockToolBackend {
    calls: Arc<Mutex<Vec<Value>>>,
    response: Value,
    delay: Option<Duration>,
    failure: Option<String>,
}

impl Default for MockToolBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockToolBackend {
    /// Backend answering `{"ok": true}`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            response: json!({ "ok": true }),
            delay: None,
            failure: None,
        }
    }

    /// Answer with `response` instead.
    #[must_use]
    pub fn with_response(mut self, response: Value) -> Self {
        self.response = response;
        self
    }

    /// Sleep before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every call with `message`.
    #[must_use]
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Bind this backend to every tool of `body`.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    #[allow(clippy::expect_used)]
    pub fn install(&self, registry: &ToolRegistry, body: &BodyDefinition) {
        let handler: Arc<dyn ToolHandler> = Arc::new(self.clone());
        registry.register_body(body, &handler).expect("register tools");
    }

    /// Parameters of every call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().map_or(0, |c| c.len())
    }
}

#[async_trait]
impl ToolHandler for MockToolBackend {
    async fn execute(&self, parameters: Value) -> Result<Value, ToolError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(parameters);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.failure {
            Some(message) => Err(ToolError::Execution(message.clone())),
            None => Ok(self.response.clone()),
        }
    }
}
