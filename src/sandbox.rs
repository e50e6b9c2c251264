//! The isolated execution context that compiles and renders templates.
//!
//! It runs on its own OS thread and only ever sees wire messages: it owns no
//! settings, no note service handle and no correlation state. A panic while
//! rendering is contained and answered as a failed response.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::error::ChannelError;
use crate::template;

/// Identifies the sandbox in its readiness handshake.
pub const SANDBOX_SOURCE: &str = "web-notes-sandbox";

const RENDER_COMMAND: &str = "render";
const RESPONSE_TYPE: &str = "response";

/// Wire form of a render request: `{ command: "render", id, template, context }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub id: String,
    pub template: String,
    #[serde(default)]
    pub context: Value,
}

impl RenderRequest {
    pub fn new(template: String, context: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            template,
            context,
        }
    }

    pub fn to_message(&self) -> Value {
        json!({
            "command": RENDER_COMMAND,
            "id": self.id,
            "template": self.template,
            "context": self.context,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    Rendered(String),
    Failed(String),
}

/// A response as seen by the caller: the echoed request id and the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderResponse {
    pub id: String,
    pub outcome: RenderOutcome,
}

impl RenderResponse {
    /// Build the wire response for `request` (the original request message).
    pub fn to_message(request: &Value, outcome: &RenderOutcome) -> Value {
        match outcome {
            RenderOutcome::Rendered(rendered) => json!({
                "type": RESPONSE_TYPE,
                "success": true,
                "request": request,
                "rendered": rendered,
            }),
            RenderOutcome::Failed(message) => json!({
                "type": RESPONSE_TYPE,
                "success": false,
                "request": request,
                "message": message,
            }),
        }
    }

    /// Parse a message received from the sandbox. Returns `Ok(None)` for
    /// anything that is not a response (the handshake, for instance).
    pub fn from_message(message: &Value) -> Result<Option<Self>, ChannelError> {
        if message.get("type").and_then(Value::as_str) != Some(RESPONSE_TYPE) {
            return Ok(None);
        }
        let id = response_id(message)
            .ok_or_else(|| ChannelError::Malformed("response without request.id".to_string()))?;
        let success = message
            .get("success")
            .and_then(Value::as_bool)
            .ok_or_else(|| ChannelError::Malformed(format!("response '{}' without success flag", id)))?;

        let text_field = |key: &str| {
            message
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ChannelError::Malformed(format!("response '{}' without {}", id, key)))
        };
        let outcome = if success {
            RenderOutcome::Rendered(text_field("rendered")?)
        } else {
            RenderOutcome::Failed(text_field("message")?)
        };
        Ok(Some(Self { id, outcome }))
    }
}

/// The request id a response echoes, even when the rest of the response is
/// unusable. A non-string id is taken as its JSON text.
pub fn response_id(message: &Value) -> Option<String> {
    if message.get("type").and_then(Value::as_str) != Some(RESPONSE_TYPE) {
        return None;
    }
    match message.get("request")?.get("id")? {
        Value::String(id) => Some(id.clone()),
        other => Some(other.to_string()),
    }
}

/// Readiness announcement sent once when the sandbox starts.
pub fn handshake() -> Value {
    json!({ "source": SANDBOX_SOURCE, "success": true })
}

pub fn is_handshake(message: &Value) -> bool {
    message.get("type").is_none()
        && message.get("source").and_then(Value::as_str) == Some(SANDBOX_SOURCE)
}

/// Dispatch one inbound message. Returns the reply to send back, if any.
pub fn handle_message(message: &Value) -> Option<Value> {
    let command = match message.get("command").and_then(Value::as_str) {
        Some(command) => command,
        None => {
            warn!("sandbox: ignoring message without a command");
            return None;
        }
    };

    match command {
        RENDER_COMMAND => {
            let request: RenderRequest = match serde_json::from_value(message.clone()) {
                Ok(request) => request,
                Err(e) => {
                    warn!("sandbox: dropping uncorrelatable render request: {}", e);
                    return None;
                }
            };
            let outcome = render_contained(&request);
            Some(RenderResponse::to_message(message, &outcome))
        }
        other => {
            warn!("sandbox: ignoring unknown command '{}'", other);
            None
        }
    }
}

fn render_contained(request: &RenderRequest) -> RenderOutcome {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        template::render(&request.template, &request.context)
    }));
    match result {
        Ok(Ok(rendered)) => RenderOutcome::Rendered(rendered),
        Ok(Err(e)) => {
            debug!("sandbox: request {} failed: {}", request.id, e);
            RenderOutcome::Failed(e.to_string())
        }
        Err(_) => RenderOutcome::Failed("template sandbox panicked while rendering".to_string()),
    }
}

/// Start the sandbox thread. It announces itself on `outbound`, then serves
/// `inbound` until every sender for it is dropped.
pub fn spawn(
    inbound: UnboundedReceiver<Value>,
    outbound: UnboundedSender<Value>,
) -> Result<thread::JoinHandle<()>, ChannelError> {
    thread::Builder::new()
        .name("template-sandbox".to_string())
        .spawn(move || serve(inbound, outbound))
        .map_err(|e| ChannelError::Spawn(e.to_string()))
}

fn serve(mut inbound: UnboundedReceiver<Value>, outbound: UnboundedSender<Value>) {
    if outbound.send(handshake()).is_err() {
        return;
    }
    while let Some(message) = inbound.blocking_recv() {
        if let Some(reply) = handle_message(&message) {
            if outbound.send(reply).is_err() {
                break;
            }
        }
    }
    debug!("sandbox: inbound channel closed, stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_request_wire_shape() {
        let request = RenderRequest::new("{{a}}".to_string(), json!({ "a": 1 }));
        let message = request.to_message();
        assert_eq!(message["command"], "render");
        assert_eq!(message["id"], request.id.as_str());
        assert_eq!(message["template"], "{{a}}");
        assert_eq!(message["context"], json!({ "a": 1 }));
    }

    #[test]
    fn test_handle_render_success() {
        let request = json!({ "command": "render", "id": "r1", "template": "hi {{name}}", "context": { "name": "bo" } });
        let reply = handle_message(&request).unwrap();
        assert_eq!(
            reply,
            json!({ "type": "response", "success": true, "request": request, "rendered": "hi bo" })
        );
    }

    #[test]
    fn test_handle_render_compile_failure() {
        let request = json!({ "command": "render", "id": "r2", "template": "{{#if x}}", "context": {} });
        let reply = handle_message(&request).unwrap();
        assert_eq!(reply["success"], false);
        assert_eq!(reply["request"]["id"], "r2");
        assert!(reply["message"].as_str().unwrap().contains("unclosed"));
    }

    #[test]
    fn test_handle_render_runtime_failure() {
        let request = json!({ "command": "render", "id": "r3", "template": "{{quote 3}}", "context": {} });
        let reply = handle_message(&request).unwrap();
        assert_eq!(reply["success"], false);
        assert!(reply["message"].as_str().unwrap().contains("quote"));
    }

    #[test]
    fn test_unknown_command_and_missing_id_are_ignored() {
        assert!(handle_message(&json!({ "command": "eval", "id": "x" })).is_none());
        assert!(handle_message(&json!({ "command": "render", "template": "" })).is_none());
        assert!(handle_message(&json!({ "hello": true })).is_none());
    }

    #[test]
    fn test_response_parsing() {
        let ok = json!({ "type": "response", "success": true, "request": { "id": "a" }, "rendered": "x" });
        let err = json!({ "type": "response", "success": false, "request": { "id": "b" }, "message": "bad" });
        assert_eq!(
            RenderResponse::from_message(&ok).unwrap(),
            Some(RenderResponse { id: "a".to_string(), outcome: RenderOutcome::Rendered("x".to_string()) })
        );
        assert_eq!(
            RenderResponse::from_message(&err).unwrap(),
            Some(RenderResponse { id: "b".to_string(), outcome: RenderOutcome::Failed("bad".to_string()) })
        );
        assert_eq!(RenderResponse::from_message(&handshake()).unwrap(), None);
        assert!(RenderResponse::from_message(&json!({ "type": "response", "success": true })).is_err());
    }

    #[test]
    fn test_response_id_survives_missing_fields() {
        let partial = json!({ "type": "response", "success": true, "request": { "id": "a" } });
        assert!(RenderResponse::from_message(&partial).is_err());
        assert_eq!(response_id(&partial).as_deref(), Some("a"));
        assert_eq!(
            response_id(&json!({ "type": "response", "request": { "id": 7 } })).as_deref(),
            Some("7")
        );
        assert_eq!(response_id(&json!({ "type": "response", "success": true })), None);
        assert_eq!(response_id(&handshake()), None);
    }

    #[test]
    fn test_thread_sends_handshake_then_serves() {
        let (to_sandbox, inbound) = mpsc::unbounded_channel();
        let (outbound, mut from_sandbox) = mpsc::unbounded_channel();
        let handle = spawn(inbound, outbound).unwrap();

        let first = from_sandbox.blocking_recv().unwrap();
        assert!(is_handshake(&first));

        let request = RenderRequest::new("{{x}}".to_string(), json!({ "x": "y" }));
        to_sandbox.send(request.to_message()).unwrap();
        let reply = from_sandbox.blocking_recv().unwrap();
        let response = RenderResponse::from_message(&reply).unwrap().unwrap();
        assert_eq!(response.id, request.id);
        assert_eq!(response.outcome, RenderOutcome::Rendered("y".to_string()));

        drop(to_sandbox);
        handle.join().unwrap();
    }
}
