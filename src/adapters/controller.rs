//! Controller surface adapter: translates a wire-level command request into
//! a `CommandDispatcher` call and the result back into the documented
//! response envelope.
//!
//! The envelope's `status`/`code` fields are distinct from the sequencer's
//! internal `TargetStatus::status` field — they describe the wire response,
//! not domain state, and are never conflated.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::dispatcher::CommandDispatcher;
use crate::error::CoreError;

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerRequest {
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerResponse {
    pub status: &'static str,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControllerResponse {
    fn success(result: Value) -> Self {
        Self {
            status: "success",
            code: 200,
            result: Some(result),
            error: None,
        }
    }

    fn error(err: &CoreError) -> Self {
        Self {
            status: "error",
            code: http_like_code(err),
            result: None,
            error: Some(err.to_string()),
        }
    }
}

/// Map a `CoreError` kind to an HTTP-like status code for the envelope.
fn http_like_code(err: &CoreError) -> u16 {
    match err {
        CoreError::NotFound(_) => 404,
        CoreError::InvalidArgument(_) => 400,
        CoreError::InvalidState(_) => 409,
        CoreError::Timeout(_) => 504,
        CoreError::Canceled(_) => 499,
        CoreError::ConnectionLost(_) => 502,
        CoreError::HandlerFailed(_) => 500,
        CoreError::PolicyViolation(_) => 403,
        CoreError::DefinitionError(_) => 422,
    }
}

/// Dispatch one controller request and translate the outcome to the
/// documented envelope. Never panics on dispatcher failure — every
/// `CoreError` kind maps to an envelope, not a transport-level error.
pub async fn handle_request(dispatcher: &CommandDispatcher, request: ControllerRequest) -> ControllerResponse {
    debug!(command = %request.command, "handle_request: called");
    match dispatcher.dispatch(&request.command, request.args).await {
        Ok(value) => ControllerResponse::success(value),
        Err(err) => ControllerResponse::error(&err),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::event_loop::{EventLoop, EventLoopConfig};

    fn start_loop() -> Arc<EventLoop> {
        Arc::new(EventLoop::start(EventLoopConfig {
            workers: 2,
            timer_tick: Duration::from_millis(2),
        }))
    }

    #[tokio::test]
    async fn unknown_command_maps_to_not_found_envelope() {
        let dispatcher = CommandDispatcher::new(start_loop());

        let response = handle_request(
            &dispatcher,
            ControllerRequest {
                command: "no-such-command".into(),
                args: Value::Null,
            },
        )
        .await;

        assert_eq!(response.status, "error");
        assert_eq!(response.code, 404);
        assert!(response.result.is_none());
    }

    #[tokio::test]
    async fn registered_command_maps_to_success_envelope() {
        let dispatcher = CommandDispatcher::new(start_loop());
        dispatcher
            .register("echo", Arc::new(|args: Value| Ok(args)), Default::default())
            .await
            .unwrap();

        let response = handle_request(
            &dispatcher,
            ControllerRequest {
                command: "echo".into(),
                args: json!({"x": 1}),
            },
        )
        .await;

        assert_eq!(response.status, "success");
        assert_eq!(response.code, 200);
        assert_eq!(response.result, Some(json!({"x": 1})));
    }
}
