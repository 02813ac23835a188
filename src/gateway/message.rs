//! 网关消息协议定义
//!
//! 所有消息使用统一信封 `{id, type, timestamp, payload}`（WebSocket 文本帧）。
//! 入站解析分两步：先解析信封，再按 type 解析 payload；失败时给出
//! `PARSE_ERROR` 或 `UNKNOWN_MESSAGE_TYPE`，连接保持打开。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::ModelOverrides;

/// 入站解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Parse(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Parse(_) => "PARSE_ERROR",
            ProtocolError::UnknownType(_) => "UNKNOWN_MESSAGE_TYPE",
        }
    }
}

/// SESSION_INIT.config
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionInitConfig {
    /// 恢复已有会话
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, alias = "max_retries")]
    pub max_retry_count: Option<u32>,
    #[serde(default)]
    pub output_directory: Option<String>,
    #[serde(default, alias = "model_config")]
    pub models: ModelOverrides,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionInitPayload {
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub config: SessionInitConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserMessagePayload {
    #[serde(default)]
    pub content: String,
    /// base64 或 data URL
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolResponsePayload {
    #[serde(alias = "tool_call_id")]
    pub request_id: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmResponsePayload {
    pub confirm_id: String,
    pub approved: bool,
}

/// 客户端 → 服务端
#[derive(Debug, Clone)]
pub enum ClientMessage {
    SessionInit(SessionInitPayload),
    UserMessage(UserMessagePayload),
    ToolResponse(ToolResponsePayload),
    ConfirmResponse(ConfirmResponsePayload),
    CancelTask,
    SessionEnd,
    Ping,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: &str,
    value: serde_json::Value,
) -> Result<T, ProtocolError> {
    let value = if value.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        value
    };
    serde_json::from_value(value).map_err(|e| ProtocolError::Parse(format!("{kind}: {e}")))
}

/// 解析一帧入站文本
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let raw: RawEnvelope =
        serde_json::from_str(text).map_err(|e| ProtocolError::Parse(e.to_string()))?;

    let msg = match raw.kind.as_str() {
        "SESSION_INIT" => ClientMessage::SessionInit(payload(&raw.kind, raw.payload)?),
        "USER_MESSAGE" => ClientMessage::UserMessage(payload(&raw.kind, raw.payload)?),
        "TOOL_RESPONSE" => ClientMessage::ToolResponse(payload(&raw.kind, raw.payload)?),
        "CONFIRM_RESPONSE" => ClientMessage::ConfirmResponse(payload(&raw.kind, raw.payload)?),
        "CANCEL_TASK" => ClientMessage::CancelTask,
        "SESSION_END" => ClientMessage::SessionEnd,
        "PING" | "ping" => ClientMessage::Ping,
        other => return Err(ProtocolError::UnknownType(other.to_string())),
    };
    Ok(msg)
}

/// 服务端 → 客户端（payload 部分；type 由 `kind()` 给出）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    SessionReady {
        session_id: String,
        is_new: bool,
    },
    Response {
        content: String,
    },
    StreamChunk {
        content: String,
        is_final: bool,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
    ToolCallRequest {
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    ConfirmRequest {
        confirm_id: String,
        action: String,
        details: serde_json::Value,
    },
    ProgressUpdate {
        stage: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<f32>,
    },
    ArtifactPreview {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    TaskComplete {
        message: String,
    },
    SessionEnded {},
    Pong {},
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn response(content: impl Into<String>) -> Self {
        ServerMessage::Response {
            content: content.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SessionReady { .. } => "SESSION_READY",
            ServerMessage::Response { .. } => "RESPONSE",
            ServerMessage::StreamChunk { .. } => "STREAM_CHUNK",
            ServerMessage::Error { .. } => "ERROR",
            ServerMessage::ToolCallRequest { .. } => "TOOL_CALL_REQUEST",
            ServerMessage::ConfirmRequest { .. } => "CONFIRM_REQUEST",
            ServerMessage::ProgressUpdate { .. } => "PROGRESS_UPDATE",
            ServerMessage::ArtifactPreview { .. } => "ARTIFACT_PREVIEW",
            ServerMessage::TaskComplete { .. } => "TASK_COMPLETE",
            ServerMessage::SessionEnded {} => "SESSION_ENDED",
            ServerMessage::Pong {} => "PONG",
        }
    }

    /// 套上信封
    pub fn envelope(&self) -> Envelope<'_> {
        Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            kind: self.kind(),
            timestamp: Utc::now(),
            payload: self,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.envelope())
    }
}

/// 出站信封
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: DateTime<Utc>,
    pub payload: &'a ServerMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_user_message() {
        let text = r#"{"id":"1","type":"USER_MESSAGE","timestamp":"2024-01-01T00:00:00Z","payload":{"content":"make a toon shader","images":["AAAA"]}}"#;
        match parse_client_message(text).unwrap() {
            ClientMessage::UserMessage(p) => {
                assert_eq!(p.content, "make a toon shader");
                assert_eq!(p.images.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tool_response_alias() {
        let text = r#"{"type":"TOOL_RESPONSE","payload":{"tool_call_id":"abc","result":{"success":true}}}"#;
        match parse_client_message(text).unwrap() {
            ClientMessage::ToolResponse(p) => {
                assert_eq!(p.request_id, "abc");
                assert_eq!(p.result, json!({"success": true}));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_session_init_without_payload() {
        let msg = parse_client_message(r#"{"type":"SESSION_INIT"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SessionInit(p) if p.project_path.is_none()));

        let msg = parse_client_message(
            r#"{"type":"SESSION_INIT","payload":{"config":{"session_id":"session_x","max_retry_count":5,"models":{"code_model":"qwen-coder"}}}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::SessionInit(p) => {
                assert_eq!(p.config.session_id.as_deref(), Some("session_x"));
                assert_eq!(p.config.max_retry_count, Some(5));
                assert_eq!(p.config.models.code_model.as_deref(), Some("qwen-coder"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_lowercase_ping() {
        assert!(matches!(
            parse_client_message(r#"{"type":"ping"}"#),
            Ok(ClientMessage::Ping)
        ));
    }

    #[test]
    fn test_parse_errors() {
        let err = parse_client_message("{not json").unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");

        let err = parse_client_message(r#"{"payload":{}}"#).unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");

        let err = parse_client_message(r#"{"type":"CONFIRM_RESPONSE","payload":{"confirm_id":"x"}}"#)
            .unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");

        let err = parse_client_message(r#"{"type":"FROBNICATE","payload":{}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("FROBNICATE".to_string()));
        assert_eq!(err.code(), "UNKNOWN_MESSAGE_TYPE");
    }

    #[test]
    fn test_server_envelope_shape() {
        let msg = ServerMessage::ToolCallRequest {
            tool_call_id: "t1".to_string(),
            tool_name: "compile_shader".to_string(),
            arguments: json!({"code": "Shader \"A\" {}"}),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "TOOL_CALL_REQUEST");
        assert_eq!(value["payload"]["tool_call_id"], "t1");
        assert!(value["id"].is_string());
        assert!(value["timestamp"].is_string());

        let value: serde_json::Value =
            serde_json::from_str(&ServerMessage::error("PARSE_ERROR", "bad").to_json().unwrap())
                .unwrap();
        assert!(value["payload"].get("details").is_none());

        let value: serde_json::Value =
            serde_json::from_str(&ServerMessage::SessionEnded {}.to_json().unwrap()).unwrap();
        assert_eq!(value["payload"], json!({}));
    }
}
