//! Hub（轮毂/中枢）
//!
//! WebSocket 服务端：接受 Unity 编辑器连接，逐帧解析协议消息并交给 ShaderRuntime。
//! 每个连接一个读循环和一个写任务；出站消息统一走连接的发送通道。

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::message::{parse_client_message, ClientMessage, ServerMessage};
use super::runtime::{Connection, ShaderRuntime};
use super::session::{SessionId, SessionManager};
use crate::config::AppConfig;
use crate::core::Correlator;

/// 单个连接的协议状态
pub struct ConnectionHandler {
    conn: Connection,
    runtime: Arc<ShaderRuntime>,
    session_id: Option<SessionId>,
}

impl ConnectionHandler {
    pub fn new(conn: Connection, runtime: Arc<ShaderRuntime>) -> Self {
        Self {
            conn,
            runtime,
            session_id: None,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// 处理一帧文本；返回后台任务句柄（仅 USER_MESSAGE 产生）
    pub async fn handle_text(&mut self, text: &str) -> Option<JoinHandle<()>> {
        match parse_client_message(text) {
            Ok(msg) => self.dispatch(msg).await,
            Err(e) => {
                tracing::warn!(connection_id = %self.conn.id, error = %e, "bad client frame");
                self.conn.send(ServerMessage::error(e.code(), e.to_string()));
                None
            }
        }
    }

    async fn dispatch(&mut self, msg: ClientMessage) -> Option<JoinHandle<()>> {
        match msg {
            ClientMessage::SessionInit(payload) => {
                if let Some(old) = self.session_id.take() {
                    self.runtime.sessions().detach(&old).await;
                }
                let (session_id, is_new) = self.runtime.init_session(payload).await;
                self.session_id = Some(session_id.clone());
                self.conn
                    .send(ServerMessage::SessionReady { session_id, is_new });
                None
            }
            ClientMessage::Ping => {
                self.conn.send(ServerMessage::Pong {});
                None
            }
            ClientMessage::ToolResponse(payload) => {
                self.runtime.handle_tool_response(payload);
                None
            }
            ClientMessage::ConfirmResponse(payload) => {
                self.runtime.handle_confirm_response(payload);
                None
            }
            other => {
                let Some(session_id) = self.session_id.clone() else {
                    self.conn.send(ServerMessage::error(
                        "NO_SESSION",
                        "Send SESSION_INIT before other messages",
                    ));
                    return None;
                };
                match other {
                    ClientMessage::UserMessage(payload) => {
                        self.runtime
                            .submit_user_message(&self.conn, &session_id, payload)
                            .await
                    }
                    ClientMessage::CancelTask => {
                        self.runtime.cancel_task(&self.conn, &session_id).await;
                        None
                    }
                    ClientMessage::SessionEnd => {
                        self.runtime.end_session(&self.conn, &session_id).await;
                        self.session_id = None;
                        None
                    }
                    _ => None,
                }
            }
        }
    }

    /// 连接断开
    pub async fn close(self) {
        self.runtime
            .connection_closed(&self.conn.id, self.session_id.as_deref())
            .await;
    }
}

/// Hub
pub struct Hub {
    bind_addr: String,
    runtime: Arc<ShaderRuntime>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl Hub {
    pub fn new(config: AppConfig) -> Self {
        let sessions = Arc::new(SessionManager::new(
            config.workflow.max_context_messages,
            config.server.session_timeout_secs,
        ));
        let correlator = Arc::new(Correlator::new());
        let bind_addr = config.server.bind_addr.clone();
        let runtime = Arc::new(ShaderRuntime::new(config, sessions, correlator));
        Self::with_runtime(bind_addr, runtime)
    }

    pub fn with_runtime(bind_addr: impl Into<String>, runtime: Arc<ShaderRuntime>) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        Self {
            bind_addr: bind_addr.into(),
            runtime,
            shutdown: shutdown_tx,
        }
    }

    pub fn runtime(&self) -> &Arc<ShaderRuntime> {
        &self.runtime
    }

    /// 绑定端口并在后台接受连接；返回实际监听地址
    pub async fn start(&self) -> Result<SocketAddr, String> {
        let addr: SocketAddr = self
            .bind_addr
            .parse()
            .map_err(|e| format!("Invalid bind address: {}", e))?;

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind: {}", e))?;
        let local = listener
            .local_addr()
            .map_err(|e| format!("Failed to read local address: {}", e))?;

        tracing::info!("Gateway listening on ws://{}", local);

        let mut shutdown_rx = self.shutdown.subscribe();
        let runtime = Arc::clone(&self.runtime);

        tokio::spawn(async move {
            let mut cleanup_timer = tokio::time::interval(tokio::time::Duration::from_secs(60));

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = cleanup_timer.tick() => {
                        let expired = runtime.sessions().cleanup_expired().await;
                        if expired > 0 {
                            let remaining = runtime.sessions().active_count().await;
                            tracing::info!("Cleaned up {} expired sessions, {} remaining", expired, remaining);
                        }
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let runtime = Arc::clone(&runtime);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, addr, runtime).await {
                                        tracing::error!("Connection error from {}: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(local)
    }

    /// 停止接受新连接
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    runtime: Arc<ShaderRuntime>,
) -> Result<(), String> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut handler = ConnectionHandler::new(Connection::new(tx), runtime);

    tracing::info!(connection_id = %handler.connection().id, "New WebSocket connection from {}", addr);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match msg.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(kind = msg.kind(), "Serialize error: {}", e);
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("WebSocket receive error: {}", e);
                break;
            }
        };

        match msg {
            WsMessage::Text(text) => {
                handler.handle_text(&text).await;
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    handler.close().await;
    writer.abort();
    tracing::info!("WebSocket connection closed: {}", addr);
    Ok(())
}
