//! Tint - Unity 着色器生成工作流服务
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 请求/回复关联器、重试控制、错误类型
//! - **gateway**: WebSocket 网关、会话与意图路由
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / 脚本化）
//! - **memory**: 会话对话记忆
//! - **observability**: 日志初始化
//! - **workflow**: 着色器任务状态机、校验门与工作流引擎

pub mod config;
pub mod core;
#[cfg(feature = "gateway")]
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod workflow;
