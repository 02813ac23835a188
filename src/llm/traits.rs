//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / 脚本化）实现 LlmClient：complete（非流式）、complete_stream（流式 Token）。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use thiserror::Error;

use crate::memory::Message;

/// 生成调用失败（网络、鉴权、空响应等），由工作流引擎在阶段边界转为任务失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// LLM 客户端 trait：非流式完成与流式完成（返回 Token 流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 流式完成；默认把完整结果作为单个 chunk
    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, LlmError> {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }
}

/// 模型角色：路由（意图分类/需求分析）、代码生成、视觉分析
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    Router,
    Code,
    Vision,
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelRole::Router => write!(f, "router"),
            ModelRole::Code => write!(f, "code"),
            ModelRole::Vision => write!(f, "vision"),
        }
    }
}
