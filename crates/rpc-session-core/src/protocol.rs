//! JSON-RPC message model shared by both sides of a session.
//!
//! Payload schemas are intentionally loose (`serde_json::Value`); only the
//! envelope fields that drive correlation are typed.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Envelope version tag attached to every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol version offered by default.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions both sides accept, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Method names that are part of the wire contract.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";

    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const COMPLETION_COMPLETE: &str = "completion/complete";

    pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
    pub const NOTIFICATION_CANCELLED: &str = "notifications/cancelled";
    pub const NOTIFICATION_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const NOTIFICATION_PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    pub const NOTIFICATION_RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const NOTIFICATION_RESOURCES_UPDATED: &str = "notifications/resources/updated";
}

/// Request identifier, numeric or string as the peer chooses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const REQUEST_HANGED: i64 = -32001;
    pub const NOT_FOUND: i64 = -32002;
    pub const FORBIDDEN: i64 = -32003;
    pub const REQUEST_CANCELLED: i64 = -32800;

    /// Create an error object without data.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Method not found for `method`.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Shape of a message, derived from which envelope fields are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
    Error,
    Invalid,
}

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

/// A single protocol message.
///
/// One flat envelope covers requests, notifications, responses and errors;
/// [`Message::kind`] tells them apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Message {
    fn empty() -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    /// Create a request.
    #[must_use]
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// Create a notification.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// Create a successful response.
    #[must_use]
    pub fn response(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::empty()
        }
    }

    /// Create an error response.
    #[must_use]
    pub fn error_response(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            id,
            error: Some(error),
            ..Self::empty()
        }
    }

    /// Stamp the envelope version tag.
    #[must_use]
    pub fn with_version_tag(mut self) -> Self {
        JSONRPC_VERSION.clone_into(&mut self.jsonrpc);
        self
    }

    /// Classify the message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        if self.error.is_some() {
            return MessageKind::Error;
        }
        match (&self.id, &self.method, &self.result) {
            (Some(_), _, Some(_)) => MessageKind::Response,
            (Some(_), Some(_), None) => MessageKind::Request,
            (None, Some(_), _) => MessageKind::Notification,
            _ => MessageKind::Invalid,
        }
    }

    /// Method name, if any.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    #[must_use]
    pub const fn is_request(&self) -> bool {
        matches!(self.kind(), MessageKind::Request)
    }

    #[must_use]
    pub const fn is_notification(&self) -> bool {
        matches!(self.kind(), MessageKind::Notification)
    }

    /// True for both successful and error responses.
    #[must_use]
    pub const fn is_response(&self) -> bool {
        matches!(self.kind(), MessageKind::Response | MessageKind::Error)
    }

    /// Deserialize params into `T`, treating absent params as `null`.
    ///
    /// # Errors
    /// Returns error if params do not match `T`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.params.clone().unwrap_or(Value::Null))
    }

    /// Deserialize the result into `T`.
    ///
    /// # Errors
    /// Returns error if the result does not match `T`.
    pub fn result_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.result.clone().unwrap_or(Value::Null))
    }
}

/// Name and version of a peer implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Implementation {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for Implementation {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }
}

/// `initialize` request params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub client_info: Implementation,
}

/// `initialize` response result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// A callable tool advertised by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl Tool {
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            input_schema: default_input_schema(),
        }
    }
}

/// Argument accepted by a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// A prompt template advertised by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

impl Prompt {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            arguments: Vec::new(),
        }
    }
}

/// A readable resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl Resource {
    #[must_use]
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            mime_type: None,
        }
    }
}

/// A parameterised family of resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    pub uri_template: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ResourceTemplate {
    #[must_use]
    pub fn new(uri_template: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri_template: uri_template.into(),
            name: name.into(),
            mime_type: None,
        }
    }
}

/// Params of `notifications/cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Params carrying a single resource URI (subscribe, unsubscribe, updated, read).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUriParams {
    pub uri: String,
}

/// Params of a cursor-paginated list call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginatedParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind() {
        let req = Message::request(1, methods::PING, None);
        assert_eq!(req.kind(), MessageKind::Request);

        let note = Message::notification(methods::NOTIFICATION_INITIALIZED, None);
        assert_eq!(note.kind(), MessageKind::Notification);

        let resp = Message::response(RequestId::from(1), serde_json::json!({}));
        assert_eq!(resp.kind(), MessageKind::Response);
        assert!(resp.is_response());

        let err = Message::error_response(None, ErrorObject::method_not_found("nope"));
        assert_eq!(err.kind(), MessageKind::Error);

        let empty: Message = serde_json::from_str(r#"{"jsonrpc":"2.0"}"#).unwrap();
        assert_eq!(empty.kind(), MessageKind::Invalid);
    }

    #[test]
    fn test_request_id_untagged() {
        let msg: Message =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc","method":"ping"}"#).unwrap();
        assert_eq!(msg.id, Some(RequestId::String("abc".to_string())));

        let msg: Message = serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"result":{}}"#).unwrap();
        assert_eq!(msg.id, Some(RequestId::Number(7)));
    }

    #[test]
    fn test_message_serialization_omits_absent_fields() {
        let msg = Message::notification(methods::NOTIFICATION_TOOLS_LIST_CHANGED, None);
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#
        );
    }

    #[test]
    fn test_version_tag_overwrites() {
        let mut msg = Message::notification("x", None);
        msg.jsonrpc = String::new();
        assert_eq!(msg.with_version_tag().jsonrpc, JSONRPC_VERSION);
    }

    #[test]
    fn test_cancelled_params_camel_case() {
        let params: CancelledParams =
            serde_json::from_value(serde_json::json!({ "requestId": 3, "reason": "user" })).unwrap();
        assert_eq!(params.request_id, RequestId::Number(3));
        assert_eq!(params.reason.as_deref(), Some("user"));
    }
}
