//! Tool dispatch table.
//!
//! Hosts bind a handler to every tool a body declares before the body is
//! published. Dispatch is a lookup by `(body, tool)`; nothing is resolved
//! by name at call time outside this table.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use embody_core::BodyId;
use embody_discovery::{BodyDefinition, CapabilityIndex};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};

/// Failure reported by a tool backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    /// No handler is bound for the tool.
    #[error("no handler for tool '{0}'")]
    NotFound(String),

    /// The backend ran and failed.
    #[error("{0}")]
    Execution(String),
}

/// Executes one tool on the host side.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool. Parameters have already passed the permission
    /// validator.
    async fn execute(&self, parameters: Value) -> Result<Value, ToolError>;
}

type HandlerMap = HashMap<BodyId, HashMap<String, Arc<dyn ToolHandler>>>;

/// Handlers keyed by body and tool name.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: RwLock<HandlerMap>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bodies = self.handlers.read().map_or(0, |h| h.len());
        f.debug_struct("ToolRegistry")
            .field("bodies", &bodies)
            .finish_non_exhaustive()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler, replacing any previous one for the same tool.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Execution`] if the table lock is poisoned.
    pub fn register(
        &self,
        body_id: BodyId,
        tool: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), ToolError> {
        let tool = tool.into();
        let mut handlers = self
            .handlers
            .write()
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        debug!(body = %body_id, tool = %tool, "Tool handler bound");
        handlers.entry(body_id).or_default().insert(tool, handler);
        Ok(())
    }

    /// Bind the same handler to every tool of a body.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Execution`] if the table lock is poisoned.
    pub fn register_body(
        &self,
        body: &BodyDefinition,
        handler: &Arc<dyn ToolHandler>,
    ) -> Result<(), ToolError> {
        for name in body.tool_names() {
            self.register(body.body_id.clone(), name, Arc::clone(handler))?;
        }
        Ok(())
    }

    /// Drop every handler of a body. Returns how many were bound.
    pub fn remove_body(&self, body_id: &BodyId) -> usize {
        self.handlers
            .write()
            .ok()
            .and_then(|mut h| h.remove(body_id))
            .map_or(0, |tools| tools.len())
    }

    /// Handler for a tool, if bound.
    #[must_use]
    pub fn get(&self, body_id: &BodyId, tool: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers
            .read()
            .ok()?
            .get(body_id)?
            .get(tool)
            .map(Arc::clone)
    }

    /// Declared tools of `body` that have no handler, in declaration order.
    #[must_use]
    pub fn missing(&self, body: &BodyDefinition) -> Vec<String> {
        body.tool_names()
            .filter(|name| self.get(&body.body_id, name).is_none())
            .map(str::to_string)
            .collect()
    }

    /// Refuse a body that declares a tool without a handler.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::MissingHandler`] naming the first such tool.
    pub fn ensure_complete(&self, body: &BodyDefinition) -> BrokerResult<()> {
        match self.missing(body).into_iter().next() {
            Some(tool) => Err(BrokerError::MissingHandler {
                body_id: body.body_id.clone(),
                tool,
            }),
            None => Ok(()),
        }
    }

    /// Run an already authorized call and feed its latency into the index.
    pub(crate) async fn invoke(
        &self,
        index: &CapabilityIndex,
        body_id: &BodyId,
        tool: &str,
        parameters: Value,
    ) -> Result<Value, ToolError> {
        let handler = self
            .get(body_id, tool)
            .ok_or_else(|| ToolError::NotFound(tool.to_string()))?;

        let started = Instant::now();
        let result = handler.execute(parameters).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        if let Err(e) = index.record_latency(body_id, elapsed_ms) {
            warn!(body = %body_id, error = %e, "Failed to record latency");
        }
        if let Err(e) = &result {
            warn!(body = %body_id, tool, error = %e, "Tool execution failed");
        }
        result
    }
}
