//! Session-scoped MCP-style tool endpoint.
//!
//! Each granted session gets `/sessions/{token}/mcp`. Requests are JSON-RPC
//! 2.0 objects with method `tools/list` or `tools/call`; responses carry an
//! HTTP-like status so any transport can map them directly:
//!
//! | Status | Meaning |
//! |--------|---------|
//! | 200 | Handled (tool failures are reported with `isError: true`) |
//! | 400 | Malformed path, JSON, method or parameters |
//! | 401 | Missing, unknown, expired, revoked or ended session |
//! | 403 | The permission validator refused the call |
//! | 503 | The call could not be audited |

use std::sync::Arc;

use embody_core::{SessionState, SessionToken, Timestamp};
use embody_policy::ResourceUsage;
use embody_protocol::ToolOutcome;
use embody_session::{SessionError, SessionInfo};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::service::EmbodimentService;

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;
const UNAUTHORIZED: i64 = -32001;
const FORBIDDEN: i64 = -32003;
const UNAVAILABLE: i64 = -32004;

/// Response of the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct McpResponse {
    /// HTTP-style status.
    pub status: u16,
    /// JSON-RPC response object.
    pub body: Value,
}

impl McpResponse {
    fn result(id: &Value, result: Value) -> Self {
        Self {
            status: 200,
            body: json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        }
    }

    fn error(status: u16, id: &Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        let mut error = json!({ "code": code, "message": message.into() });
        if let Some(data) = data {
            error["data"] = data;
        }
        Self {
            status,
            body: json!({ "jsonrpc": "2.0", "id": id, "error": error }),
        }
    }

    fn unauthorized(id: &Value, message: impl Into<String>) -> Self {
        Self::error(401, id, UNAUTHORIZED, message, None)
    }

    fn bad_request(id: &Value, code: i64, message: impl Into<String>) -> Self {
        Self::error(400, id, code, message, None)
    }

    /// True for a 2xx status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Extract the session token from `/sessions/{token}/mcp`.
///
/// Returns `None` if the path has a different shape and `Some(None)` if
/// the token segment is empty.
#[must_use]
pub fn parse_session_path(path: &str) -> Option<Option<&str>> {
    let token = path.strip_prefix("/sessions/")?.strip_suffix("/mcp")?;
    if token.contains('/') {
        return None;
    }
    Some((!token.is_empty()).then_some(token))
}

/// Serves tool calls for granted sessions.
#[derive(Debug, Clone)]
pub struct McpEndpoint {
    service: Arc<EmbodimentService>,
}

impl McpEndpoint {
    /// Create an endpoint over a broker service.
    #[must_use]
    pub fn new(service: Arc<EmbodimentService>) -> Self {
        Self { service }
    }

    /// Handle one request.
    pub async fn handle(&self, path: &str, body: &[u8], now: Timestamp) -> McpResponse {
        let null = Value::Null;
        let Some(raw_token) = parse_session_path(path) else {
            return McpResponse::bad_request(&null, INVALID_REQUEST, format!("no such endpoint: {path}"));
        };
        let Some(token) = raw_token.and_then(|t| SessionToken::parse(t).ok()) else {
            return McpResponse::unauthorized(&null, "missing or malformed session token");
        };
        let info = match self.live_session(&null, &token, now) {
            Ok(info) => info,
            Err(response) => return response,
        };

        let request: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => return McpResponse::bad_request(&null, PARSE_ERROR, e.to_string()),
        };
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            return McpResponse::bad_request(&id, INVALID_REQUEST, "missing method");
        };
        let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

        debug!(session = %token, method, "MCP request");
        match method {
            "tools/list" => self.list_tools(&id, &info),
            "tools/call" => self.call_tool(&id, &token, params, now).await,
            other => McpResponse::bad_request(&id, METHOD_NOT_FOUND, format!("unknown method: {other}")),
        }
    }

    /// Resolve the token to a live session before anything in the request
    /// body is looked at.
    fn live_session(
        &self,
        id: &Value,
        token: &SessionToken,
        now: Timestamp,
    ) -> Result<SessionInfo, McpResponse> {
        match self.service.sessions().session_info(token) {
            Ok(info) if info.state == SessionState::Active && now < info.expires_at => Ok(info),
            Ok(info) => {
                let state = effective_state(info.state, now, info.expires_at);
                Err(McpResponse::unauthorized(id, format!("session is {state}")))
            },
            Err(e) => Err(McpResponse::unauthorized(id, e.to_string())),
        }
    }

    fn list_tools(&self, id: &Value, info: &SessionInfo) -> McpResponse {
        let body = match self.service.index().get(&info.body_id) {
            Ok(Some(body)) => body,
            Ok(None) => return McpResponse::unauthorized(id, "body no longer offered"),
            Err(e) => return McpResponse::error(500, id, INTERNAL_ERROR, e.to_string(), None),
        };

        let tools: Vec<Value> = body
            .tools
            .iter()
            .filter(|tool| info.permissions.iter().any(|p| p.tool().matches(&tool.name)))
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.parameters,
                })
            })
            .collect();
        McpResponse::result(id, json!({ "tools": tools }))
    }

    async fn call_tool(&self, id: &Value, token: &SessionToken, params: Value, now: Timestamp) -> McpResponse {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return McpResponse::bad_request(id, INVALID_PARAMS, "tools/call needs a tool name");
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let estimated = match params.get("estimatedUsage") {
            None | Some(Value::Null) => ResourceUsage::default(),
            Some(v) => match serde_json::from_value::<ResourceUsage>(v.clone()) {
                Ok(usage) => usage,
                Err(e) => return McpResponse::bad_request(id, INVALID_PARAMS, e.to_string()),
            },
        };

        match self.service.execute(token, name, arguments, estimated, now).await {
            Ok(ToolOutcome::Ok { result }) => {
                McpResponse::result(id, json!({ "content": result, "isError": false }))
            },
            Ok(ToolOutcome::Error { message }) => {
                McpResponse::result(id, json!({ "content": message, "isError": true }))
            },
            Ok(ToolOutcome::Denied {
                code,
                message,
                violation_count,
            }) => McpResponse::error(
                403,
                id,
                FORBIDDEN,
                message,
                Some(json!({ "code": code, "violationCount": violation_count })),
            ),
            Err(BrokerError::Session(e)) if e.is_unauthenticated() => {
                McpResponse::unauthorized(id, e.to_string())
            },
            Err(BrokerError::Session(SessionError::AuditUnavailable(e))) => {
                warn!(session = %token, error = %e, "Tool call refused: audit unavailable");
                McpResponse::error(503, id, UNAVAILABLE, "audit log unavailable", None)
            },
            Err(e) => McpResponse::error(500, id, INTERNAL_ERROR, e.to_string(), None),
        }
    }
}

fn effective_state(state: SessionState, now: Timestamp, expires_at: Timestamp) -> SessionState {
    if state == SessionState::Active && now >= expires_at {
        SessionState::Expired
    } else {
        state
    }
}
