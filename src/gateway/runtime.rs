//! Shader Runtime（着色器运行时）
//!
//! 处理用户消息：识别意图后分别走生成/修改工作流、保存确认、流式问答。
//! 与具体传输解耦，所有出站消息写入连接的发送通道。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::intent::{Intent, IntentRecognizer};
use super::message::{
    ConfirmResponsePayload, ServerMessage, SessionInitPayload, ToolResponsePayload,
    UserMessagePayload,
};
use super::session::{SessionConfig, SessionId, SessionManager, ShaderVersion};
use crate::config::AppConfig;
use crate::core::{CorrelationKey, Correlator, IdSpace, Owner, Resolution, Waiter, WorkflowError};
use crate::llm::{ModelOverrides, ModelRole, ModelSet};
use crate::memory::{ImageAttachment, Message};
use crate::workflow::engine::shader_output_path;
use crate::workflow::{
    EngineContext, EngineSettings, FailReason, ShaderTask, ShaderTaskBuilder, Stage,
    StageOutcome, ToolCall, ToolHost, WorkflowEngine,
};

pub const SAVE_TOOL: &str = "save_shader";

const CHAT_PROMPT: &str = "You are Tint, an assistant that helps Unity developers write URP shaders. \
Answer concisely. If the user wants a shader, tell them to describe the effect they want.";

const EXPLAIN_PROMPT: &str = "You are a Unity shader expert. Explain shader concepts and code clearly, \
with short HLSL snippets where they help. Target the Universal Render Pipeline.";

/// 出站通道
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// 按会话的模型覆盖构造模型集合
pub type ModelFactory = Arc<dyn Fn(&ModelOverrides) -> ModelSet + Send + Sync>;

/// 一条客户端连接
#[derive(Clone)]
pub struct Connection {
    pub id: String,
    tx: Outbound,
}

impl Connection {
    pub fn new(tx: Outbound) -> Self {
        Self {
            id: format!("conn_{}", uuid::Uuid::new_v4()),
            tx,
        }
    }

    /// 连接已关闭时静默丢弃
    pub fn send(&self, msg: ServerMessage) {
        if self.tx.send(msg).is_err() {
            tracing::debug!(connection_id = %self.id, "connection closed, message dropped");
        }
    }
}

/// 以客户端连接作为工具宿主
struct ConnectionHost {
    conn: Connection,
}

#[async_trait]
impl ToolHost for ConnectionHost {
    fn connection_id(&self) -> &str {
        &self.conn.id
    }

    async fn issue(&self, call: ToolCall) -> Result<(), WorkflowError> {
        self.conn
            .tx
            .send(ServerMessage::ToolCallRequest {
                tool_call_id: call.id,
                tool_name: call.tool_name,
                arguments: call.arguments,
            })
            .map_err(|_| WorkflowError::HostUnavailable(format!("connection {} closed", self.conn.id)))
    }

    fn progress(&self, task: &ShaderTask) {
        let stage = task.stage();
        self.conn.send(ServerMessage::ProgressUpdate {
            stage: stage.as_str().to_string(),
            message: stage.describe().to_string(),
            progress: Some(stage.progress()),
        });
    }
}

/// 开始处理一条用户消息时的会话快照
struct Snapshot {
    config: SessionConfig,
    current_shader: Option<ShaderVersion>,
    /// 不含本条消息的上下文
    context: String,
    /// 含本条消息的最近历史
    history: Vec<Message>,
}

/// 一次用户请求（已占用会话）
struct Work {
    conn: Connection,
    session_id: SessionId,
    work_id: String,
    cancel: CancellationToken,
    payload: UserMessagePayload,
}

/// Shader Runtime
pub struct ShaderRuntime {
    config: AppConfig,
    sessions: Arc<SessionManager>,
    correlator: Arc<Correlator>,
    models: ModelFactory,
}

impl ShaderRuntime {
    pub fn new(config: AppConfig, sessions: Arc<SessionManager>, correlator: Arc<Correlator>) -> Self {
        let llm = config.llm.clone();
        let models: ModelFactory = Arc::new(move |overrides| ModelSet::from_config(&llm, overrides));
        Self {
            config,
            sessions,
            correlator,
            models,
        }
    }

    /// 替换模型来源（测试注入脚本化模型）
    pub fn with_models(mut self, models: ModelFactory) -> Self {
        self.models = models;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// 创建或恢复会话；返回 (session_id, is_new)
    pub async fn init_session(&self, payload: SessionInitPayload) -> (SessionId, bool) {
        if let Some(id) = payload.config.session_id.as_deref() {
            if self.sessions.resume(id).await {
                return (id.to_string(), false);
            }
            tracing::warn!(session_id = %id, "unknown session id, creating a new session");
        }
        let config = SessionConfig::from_init(&self.config.workflow, &payload.config);
        let id = self.sessions.create(payload.project_path, config).await;
        (id, true)
    }

    /// 占用会话并在后台处理；会话忙时立即回 TASK_IN_PROGRESS
    pub async fn submit_user_message(
        self: &Arc<Self>,
        conn: &Connection,
        session_id: &str,
        payload: UserMessagePayload,
    ) -> Option<JoinHandle<()>> {
        let work_id = format!("task_{}", uuid::Uuid::new_v4());
        let reserved = self
            .sessions
            .with_session(session_id, |s| s.begin_task(&work_id, &conn.id))
            .await;

        let cancel = match reserved {
            None => {
                conn.send(ServerMessage::error("SESSION_NOT_FOUND", "Session does not exist"));
                return None;
            }
            Some(None) => {
                conn.send(ServerMessage::error(
                    "TASK_IN_PROGRESS",
                    "A task is already running in this session. Cancel it or wait for it to finish.",
                ));
                return None;
            }
            Some(Some(token)) => token,
        };

        let work = Work {
            conn: conn.clone(),
            session_id: session_id.to_string(),
            work_id,
            cancel,
            payload,
        };
        let runtime = Arc::clone(self);
        Some(tokio::spawn(async move { runtime.process(work).await }))
    }

    async fn process(&self, work: Work) {
        let content = work.payload.content.trim().to_string();
        let image = work.payload.images.first().map(|raw| ImageAttachment::from_client(raw));
        let max_context = self.config.workflow.max_context_messages;

        let snapshot = self
            .sessions
            .with_session(&work.session_id, |s| {
                let context = s.conversation.build_context(max_context);
                let mut message = Message::user(content.clone());
                if let Some(img) = &image {
                    message = message.with_image(img.clone());
                }
                s.conversation.push(message);
                let messages = s.conversation.messages();
                let start = messages.len().saturating_sub(max_context);
                Snapshot {
                    config: s.config.clone(),
                    current_shader: s.current_shader.clone(),
                    context,
                    history: messages[start..].to_vec(),
                }
            })
            .await;

        let Some(snapshot) = snapshot else {
            work.conn
                .send(ServerMessage::error("SESSION_NOT_FOUND", "Session does not exist"));
            return;
        };

        let models = (self.models)(&snapshot.config.models);
        let recognizer = IntentRecognizer::new(Arc::clone(models.client(ModelRole::Router)));
        let intent = recognizer
            .recognize(&content, image.is_some(), snapshot.current_shader.is_some())
            .await;
        tracing::info!(
            session_id = %work.session_id,
            work_id = %work.work_id,
            ?intent,
            "user message routed"
        );

        match intent {
            Intent::GenerateShader | Intent::ModifyShader => {
                self.run_shader_task(&work, intent, content, image, snapshot, models)
                    .await
            }
            Intent::SaveAsset => self.save_shader(&work, snapshot).await,
            Intent::ExplainShader | Intent::Chat => {
                self.answer(&work, intent, snapshot, models).await
            }
        }

        self.sessions
            .with_session(&work.session_id, |s| s.end_task(&work.work_id))
            .await;
    }

    async fn run_shader_task(
        &self,
        work: &Work,
        intent: Intent,
        requirement: String,
        image: Option<ImageAttachment>,
        snapshot: Snapshot,
        models: ModelSet,
    ) {
        let mut builder = ShaderTaskBuilder::new(&work.session_id, requirement)
            .task_id(&work.work_id)
            .conversation_context(snapshot.context)
            .max_retries(snapshot.config.max_retries)
            .error_history_limit(self.config.workflow.error_history_limit);
        if let Some(image) = image {
            builder = builder.reference_image(image);
        }
        if let (Intent::ModifyShader, Some(current)) = (intent, &snapshot.current_shader) {
            builder = builder.modify(current.code.clone());
        }

        let mut task = match builder.build() {
            Ok(task) => task,
            Err(e) => {
                work.conn.send(ServerMessage::error("INVALID_REQUEST", e.to_string()));
                return;
            }
        };

        let settings = EngineSettings {
            output_directory: snapshot.config.output_directory.clone(),
            ..EngineSettings::from_config(&self.config.workflow)
        };
        let engine = WorkflowEngine::new(
            EngineContext::new(models, Arc::clone(&self.correlator), settings),
            Arc::new(ConnectionHost {
                conn: work.conn.clone(),
            }),
        );

        let outcome = engine.drive(&mut task, &work.cancel).await;
        let reply = match outcome {
            StageOutcome::Succeed => {
                let name = task.shader_name().to_string();
                work.conn.send(ServerMessage::ArtifactPreview {
                    content: task.generated_code().to_string(),
                    name: Some(name.clone()),
                });
                work.conn.send(ServerMessage::TaskComplete {
                    message: format!("Shader '{name}' compiled successfully"),
                });
                format!("Generated shader '{name}'.")
            }
            StageOutcome::Fail(reason) => {
                work.conn.send(ServerMessage::Error {
                    code: reason.code().to_string(),
                    message: reason.to_string(),
                    details: Some(json!({
                        "task_id": task.id(),
                        "stage": task.stage().as_str(),
                        "retry_count": task.retry_count(),
                    })),
                });
                match reason {
                    FailReason::Cancelled(_) => "Task cancelled.".to_string(),
                    other => format!("Shader generation failed: {other}"),
                }
            }
            other => {
                tracing::error!(task_id = %task.id(), ?other, "drive returned a non-terminal outcome");
                work.conn
                    .send(ServerMessage::error("INTERNAL_ERROR", "Task stopped unexpectedly"));
                "Shader generation stopped unexpectedly.".to_string()
            }
        };

        self.sessions
            .with_session(&work.session_id, move |s| {
                if task.stage() == Stage::Success {
                    s.set_current_shader(task.shader_name(), task.generated_code());
                }
                s.conversation.push(Message::assistant(reply));
                s.finish_task(task);
            })
            .await;
    }

    /// 保存：先征得用户确认，再请求宿主写入工程
    async fn save_shader(&self, work: &Work, snapshot: Snapshot) {
        let Some(shader) = snapshot.current_shader else {
            work.conn.send(ServerMessage::response(
                "There is no shader to save yet. Describe the effect you want first.",
            ));
            return;
        };
        let output_path = shader_output_path(&snapshot.config.output_directory, &shader.name);
        let owner = Owner::new(&work.conn.id, &work.work_id);

        let confirm_key = CorrelationKey::fresh(IdSpace::Confirm);
        let details = json!({ "shader_name": shader.name, "output_path": output_path });
        let resolution = match self.correlator.expect(confirm_key.clone(), owner.clone()) {
            Ok(waiter) => {
                work.conn.send(ServerMessage::ConfirmRequest {
                    confirm_id: confirm_key.id.clone(),
                    action: SAVE_TOOL.to_string(),
                    details,
                });
                self.wait_or_cancel(waiter, self.config.workflow.confirm_timeout(), &work.cancel)
                    .await
            }
            Err(e) => {
                tracing::error!(error = %e, "confirm registration failed");
                work.conn.send(ServerMessage::error("INTERNAL_ERROR", e.to_string()));
                return;
            }
        };

        let approved = matches!(
            &resolution,
            Resolution::Reply(v) if v.get("approved").and_then(serde_json::Value::as_bool) == Some(true)
        );
        if !approved {
            work.conn.send(ServerMessage::response("Save cancelled."));
            return;
        }

        let call_key = CorrelationKey::fresh(IdSpace::ToolCall);
        let waiter = match self.correlator.expect(call_key.clone(), owner) {
            Ok(waiter) => waiter,
            Err(e) => {
                tracing::error!(error = %e, "save registration failed");
                work.conn.send(ServerMessage::error("INTERNAL_ERROR", e.to_string()));
                return;
            }
        };
        work.conn.send(ServerMessage::ToolCallRequest {
            tool_call_id: call_key.id.clone(),
            tool_name: SAVE_TOOL.to_string(),
            arguments: json!({
                "code": shader.code,
                "shader_name": shader.name,
                "output_path": output_path,
            }),
        });

        let resolution = self
            .wait_or_cancel(waiter, self.config.workflow.compile_timeout(), &work.cancel)
            .await;
        let msg = match resolution {
            Resolution::Reply(v) if v.get("success").and_then(serde_json::Value::as_bool) == Some(true) => {
                let path = v
                    .get("shader_path")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or(&output_path)
                    .to_string();
                ServerMessage::TaskComplete {
                    message: format!("Shader saved to {path}"),
                }
            }
            Resolution::Reply(v) => ServerMessage::error(
                "SAVE_FAILED",
                v.get("error")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("save_shader failed"),
            ),
            Resolution::TimedOut => ServerMessage::error("SAVE_FAILED", "save_shader timed out"),
            Resolution::Cancelled(_) => ServerMessage::response("Save cancelled."),
        };
        work.conn.send(msg);
    }

    /// 问答：流式输出，最后一块 is_final = true
    async fn answer(&self, work: &Work, intent: Intent, snapshot: Snapshot, models: ModelSet) {
        let (role, system) = match intent {
            Intent::ExplainShader => (ModelRole::Code, EXPLAIN_PROMPT),
            _ => (ModelRole::Router, CHAT_PROMPT),
        };
        let mut messages = vec![Message::system(system)];
        if let (Intent::ExplainShader, Some(shader)) = (intent, &snapshot.current_shader) {
            messages.push(Message::system(format!(
                "Current shader '{}':\n```hlsl\n{}\n```",
                shader.name, shader.code
            )));
        }
        messages.extend(snapshot.history);

        let mut stream = match models.generate_stream(role, &messages).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "answer generation failed");
                work.conn.send(ServerMessage::error("GENERATION_FAILED", e.to_string()));
                return;
            }
        };

        let mut full = String::new();
        loop {
            let next = tokio::select! {
                _ = work.cancel.cancelled() => None,
                chunk = stream.next() => Some(chunk),
            };
            match next {
                None => break,
                Some(None) => break,
                Some(Some(Ok(chunk))) => {
                    full.push_str(&chunk);
                    work.conn.send(ServerMessage::StreamChunk {
                        content: chunk,
                        is_final: false,
                    });
                }
                Some(Some(Err(e))) => {
                    tracing::warn!(error = %e, "answer stream interrupted");
                    work.conn.send(ServerMessage::error("GENERATION_FAILED", e.to_string()));
                    break;
                }
            }
        }
        work.conn.send(ServerMessage::StreamChunk {
            content: String::new(),
            is_final: true,
        });

        if !full.is_empty() {
            self.sessions
                .with_session(&work.session_id, |s| {
                    s.conversation.push(Message::assistant(full))
                })
                .await;
        }
    }

    async fn wait_or_cancel(
        &self,
        waiter: Waiter,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Resolution {
        let key = waiter.key().clone();
        let resolution = tokio::select! {
            _ = cancel.cancelled() => None,
            r = self.correlator.wait(waiter, timeout) => Some(r),
        };
        match resolution {
            Some(r) => r,
            None => {
                self.correlator.cancel(&key, "cancelled by user");
                Resolution::Cancelled("cancelled by user".to_string())
            }
        }
    }

    /// TOOL_RESPONSE：未知 id 由关联器记日志后丢弃
    pub fn handle_tool_response(&self, payload: ToolResponsePayload) {
        let key = CorrelationKey::tool_call(payload.request_id);
        let _ = self.correlator.resolve(&key, payload.result);
    }

    pub fn handle_confirm_response(&self, payload: ConfirmResponsePayload) {
        let key = CorrelationKey::confirm(payload.confirm_id);
        let _ = self
            .correlator
            .resolve(&key, json!({ "approved": payload.approved }));
    }

    /// CANCEL_TASK：取消令牌并立即释放该任务的全部关联
    pub async fn cancel_task(&self, conn: &Connection, session_id: &str) {
        let cancelled = self
            .sessions
            .with_session(session_id, |s| s.cancel_active())
            .await
            .flatten();

        match cancelled {
            Some(task_id) => {
                let released = self.correlator.cancel_task(&task_id, "cancelled by user");
                tracing::info!(%session_id, %task_id, released, "task cancel requested");
            }
            None => conn.send(ServerMessage::response("No active task to cancel.")),
        }
    }

    /// SESSION_END：取消活动任务并离开会话
    pub async fn end_session(&self, conn: &Connection, session_id: &str) {
        let cancelled = self
            .sessions
            .with_session(session_id, |s| {
                let cancelled = s.cancel_active();
                s.detach();
                cancelled
            })
            .await
            .flatten();
        if let Some(task_id) = cancelled {
            self.correlator.cancel_task(&task_id, "session ended");
        }
        tracing::info!(%session_id, "session ended by client");
        conn.send(ServerMessage::SessionEnded {});
    }

    /// 连接断开：取消该连接的全部关联，以及由它发起的活动任务
    pub async fn connection_closed(&self, connection_id: &str, session_id: Option<&str>) {
        let released = self
            .correlator
            .cancel_connection(connection_id, "connection closed");

        if let Some(session_id) = session_id {
            self.sessions
                .with_session(session_id, |s| {
                    if s
                        .active_task()
                        .is_some_and(|a| a.connection_id == connection_id)
                    {
                        s.cancel_active();
                    }
                    s.detach();
                })
                .await;
        }
        tracing::info!(%connection_id, released, "connection closed");
    }
}
