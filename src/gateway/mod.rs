//! 网关：Unity 编辑器经 WebSocket 接入
//!
//! - **hub**: 监听、连接读写循环、按消息类型分发
//! - **message**: 协议信封与消息类型
//! - **intent**: 用户意图识别
//! - **runtime**: 意图到工作流/保存/问答的执行
//! - **session**: 会话、当前着色器与活动任务

mod hub;
mod intent;
mod message;
mod runtime;
mod session;

pub use hub::{ConnectionHandler, Hub};
pub use intent::{Intent, IntentRecognizer};
pub use message::{
    parse_client_message, ClientMessage, ConfirmResponsePayload, Envelope, ProtocolError,
    ServerMessage, SessionInitConfig, SessionInitPayload, ToolResponsePayload, UserMessagePayload,
};
pub use runtime::{Connection, ModelFactory, Outbound, ShaderRuntime, SAVE_TOOL};
pub use session::{ActiveTask, Session, SessionConfig, SessionId, SessionManager, ShaderVersion};
