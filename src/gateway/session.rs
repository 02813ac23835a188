//! 会话管理
//!
//! 一个会话对应一个 Unity 工程的协作上下文：对话历史、当前着色器及版本、任务历史。
//! 同一会话同一时刻最多一个活动任务；断线后可凭 session_id 恢复。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::WorkflowSection;
use crate::llm::ModelOverrides;
use crate::memory::ConversationMemory;
use crate::workflow::ShaderTask;

use super::message::SessionInitConfig;

/// 会话 ID
pub type SessionId = String;

/// 会话级配置（SESSION_INIT.config 覆盖全局默认）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_retries: u32,
    pub output_directory: String,
    pub models: ModelOverrides,
}

impl SessionConfig {
    pub fn from_init(defaults: &WorkflowSection, init: &SessionInitConfig) -> Self {
        Self {
            max_retries: init.max_retry_count.unwrap_or(defaults.max_retries),
            output_directory: init
                .output_directory
                .clone()
                .unwrap_or_else(|| defaults.output_directory.clone()),
            models: init.models.clone(),
        }
    }
}

/// 着色器版本
#[derive(Debug, Clone)]
pub struct ShaderVersion {
    pub name: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
}

/// 活动任务：id + 取消令牌 + 发起连接
#[derive(Debug, Clone)]
pub struct ActiveTask {
    pub task_id: String,
    pub connection_id: String,
    pub cancel: CancellationToken,
}

/// 单个会话
pub struct Session {
    pub id: SessionId,
    pub project_path: Option<String>,
    pub config: SessionConfig,
    pub conversation: ConversationMemory,
    /// 最近一次成功的着色器
    pub current_shader: Option<ShaderVersion>,
    pub shader_history: Vec<ShaderVersion>,
    /// 已结束的任务
    pub task_history: Vec<ShaderTask>,
    active: Option<ActiveTask>,
    /// 当前附着的连接数
    connections: usize,
    pub last_active: Instant,
}

impl Session {
    pub fn new(project_path: Option<String>, config: SessionConfig, max_context_turns: usize) -> Self {
        Self {
            id: format!("session_{}", uuid::Uuid::new_v4()),
            project_path,
            config,
            conversation: ConversationMemory::new(max_context_turns),
            current_shader: None,
            shader_history: Vec::new(),
            task_history: Vec::new(),
            active: None,
            connections: 0,
            last_active: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_task(&self) -> Option<&ActiveTask> {
        self.active.as_ref()
    }

    /// 占用会话；已有活动任务时返回 None
    pub fn begin_task(&mut self, task_id: &str, connection_id: &str) -> Option<CancellationToken> {
        if self.active.is_some() {
            return None;
        }
        let cancel = CancellationToken::new();
        self.active = Some(ActiveTask {
            task_id: task_id.to_string(),
            connection_id: connection_id.to_string(),
            cancel: cancel.clone(),
        });
        self.touch();
        Some(cancel)
    }

    /// 释放会话；只释放与 task_id 匹配的活动任务
    pub fn end_task(&mut self, task_id: &str) {
        if self.active.as_ref().is_some_and(|a| a.task_id == task_id) {
            self.active = None;
        }
        self.touch();
    }

    /// 结束并归档着色器任务
    pub fn finish_task(&mut self, task: ShaderTask) {
        self.end_task(task.id());
        self.task_history.push(task);
    }

    /// 取消活动任务；返回被取消的任务 id
    pub fn cancel_active(&mut self) -> Option<String> {
        let active = self.active.as_ref()?;
        active.cancel.cancel();
        Some(active.task_id.clone())
    }

    /// 设置当前着色器；与当前版本代码相同时不追加历史
    pub fn set_current_shader(&mut self, name: &str, code: &str) {
        if self
            .current_shader
            .as_ref()
            .is_some_and(|s| s.code == code)
        {
            return;
        }
        let version = ShaderVersion {
            name: name.to_string(),
            code: code.to_string(),
            created_at: Utc::now(),
        };
        self.shader_history.push(version.clone());
        self.current_shader = Some(version);
    }

    pub fn attach(&mut self) {
        self.connections += 1;
        self.touch();
    }

    pub fn detach(&mut self) {
        self.connections = self.connections.saturating_sub(1);
        self.touch();
    }

    pub fn has_connections(&self) -> bool {
        self.connections > 0
    }

    /// 空闲超时且没有连接、没有活动任务
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout && !self.has_connections() && !self.is_busy()
    }
}

/// 会话管理器
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Session>>,
    max_context_turns: usize,
    session_timeout: Duration,
}

impl SessionManager {
    pub fn new(max_context_turns: usize, session_timeout_secs: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_context_turns,
            session_timeout: Duration::from_secs(session_timeout_secs),
        }
    }

    /// 新建会话并附着一个连接
    pub async fn create(&self, project_path: Option<String>, config: SessionConfig) -> SessionId {
        let mut session = Session::new(project_path, config, self.max_context_turns);
        session.attach();
        let session_id = session.id.clone();
        tracing::info!(
            %session_id,
            project_path = session.project_path.as_deref().unwrap_or("-"),
            "session created"
        );
        self.sessions.write().await.insert(session_id.clone(), session);
        session_id
    }

    /// 恢复已有会话；不存在返回 false
    pub async fn resume(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.attach();
                tracing::info!(%session_id, "session resumed");
                true
            }
            None => false,
        }
    }

    /// 连接离开会话
    pub async fn detach(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.detach();
        }
    }

    pub async fn with_session<F, R>(&self, session_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let mut sessions = self.sessions.write().await;
        sessions.get_mut(session_id).map(f)
    }

    /// 清理过期会话
    pub async fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(self.session_timeout));
        before - sessions.len()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(20, 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::from_init(&WorkflowSection::default(), &SessionInitConfig::default())
    }

    #[test]
    fn test_config_overrides() {
        let init = SessionInitConfig {
            max_retry_count: Some(7),
            ..SessionInitConfig::default()
        };
        let cfg = SessionConfig::from_init(&WorkflowSection::default(), &init);
        assert_eq!(cfg.max_retries, 7);
        assert_eq!(cfg.output_directory, WorkflowSection::default().output_directory);
    }

    #[test]
    fn test_one_active_task_per_session() {
        let mut session = Session::new(None, config(), 10);
        let token = session.begin_task("t1", "c1").unwrap();
        assert!(session.begin_task("t2", "c1").is_none());

        assert_eq!(session.cancel_active().as_deref(), Some("t1"));
        assert!(token.is_cancelled());

        session.end_task("other");
        assert!(session.is_busy());
        session.end_task("t1");
        assert!(!session.is_busy());
        assert!(session.begin_task("t2", "c1").is_some());
    }

    #[test]
    fn test_shader_versions_deduplicated() {
        let mut session = Session::new(None, config(), 10);
        session.set_current_shader("A", "code-a");
        session.set_current_shader("A", "code-a");
        session.set_current_shader("B", "code-b");
        assert_eq!(session.shader_history.len(), 2);
        assert_eq!(session.current_shader.as_ref().unwrap().name, "B");
    }

    #[tokio::test]
    async fn test_create_resume_and_expire() {
        let manager = SessionManager::new(10, 0);
        let id = manager.create(Some("/proj".into()), config()).await;
        assert_eq!(
            manager.with_session(&id, |s| s.project_path.clone()).await,
            Some(Some("/proj".to_string()))
        );
        assert!(manager.resume(&id).await);
        assert!(!manager.resume("session_missing").await);

        // 仍有连接，不会过期
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.cleanup_expired().await, 0);

        manager.detach(&id).await;
        manager.detach(&id).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.cleanup_expired().await, 1);
        assert_eq!(manager.active_count().await, 0);
    }
}
