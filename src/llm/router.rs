//! 按角色路由的模型集合
//!
//! 工作流的每个阶段只声明需要的角色：
//! - 需求分析 / 意图分类：路由模型（快、低温）
//! - 着色器生成与修复：代码模型
//! - 参考图分析：视觉模型

use std::sync::Arc;
use std::time::Duration;

use super::{LlmClient, LlmError, MockLlmClient, ModelRole, OpenAiClient, TokenStream};
use crate::config::LlmSection;
use crate::memory::Message;

/// 会话级模型名覆盖（SESSION_INIT 的 config.models）
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ModelOverrides {
    pub router_model: Option<String>,
    pub code_model: Option<String>,
    pub vl_model: Option<String>,
}

/// 三个角色各自的客户端
#[derive(Clone)]
pub struct ModelSet {
    router: Arc<dyn LlmClient>,
    code: Arc<dyn LlmClient>,
    vision: Arc<dyn LlmClient>,
}

impl ModelSet {
    pub fn new(
        router: Arc<dyn LlmClient>,
        code: Arc<dyn LlmClient>,
        vision: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            router,
            code,
            vision,
        }
    }

    /// 三个角色共用一个客户端（测试常用）
    pub fn uniform(client: Arc<dyn LlmClient>) -> Self {
        Self::new(Arc::clone(&client), Arc::clone(&client), client)
    }

    /// 全部使用 Mock
    pub fn mock() -> Self {
        Self::new(
            Arc::new(MockLlmClient::new(ModelRole::Router)),
            Arc::new(MockLlmClient::new(ModelRole::Code)),
            Arc::new(MockLlmClient::new(ModelRole::Vision)),
        )
    }

    /// 根据配置创建 OpenAI 兼容客户端；没有 API Key 时退回 Mock
    pub fn from_config(cfg: &LlmSection, overrides: &ModelOverrides) -> Self {
        let Some(api_key) = cfg.resolve_api_key() else {
            tracing::warn!("No LLM API key configured, using Mock models");
            return Self::mock();
        };

        let base = cfg.base_url.as_deref();
        let timeout = Duration::from_secs(cfg.request_timeout_secs);
        let pick = |o: &Option<String>, d: &str| o.clone().unwrap_or_else(|| d.to_string());

        let router_model = pick(&overrides.router_model, &cfg.router_model);
        let code_model = pick(&overrides.code_model, &cfg.code_model);
        let vl_model = pick(&overrides.vl_model, &cfg.vl_model);
        tracing::info!(%router_model, %code_model, %vl_model, "Using OpenAI-compatible models");

        Self::new(
            Arc::new(OpenAiClient::new(
                base,
                &router_model,
                &api_key,
                cfg.router_temperature,
                timeout,
            )),
            Arc::new(OpenAiClient::new(
                base,
                &code_model,
                &api_key,
                cfg.code_temperature,
                timeout,
            )),
            Arc::new(OpenAiClient::new(
                base,
                &vl_model,
                &api_key,
                cfg.vision_temperature,
                timeout,
            )),
        )
    }

    pub fn client(&self, role: ModelRole) -> &Arc<dyn LlmClient> {
        match role {
            ModelRole::Router => &self.router,
            ModelRole::Code => &self.code,
            ModelRole::Vision => &self.vision,
        }
    }

    pub async fn generate(&self, role: ModelRole, messages: &[Message]) -> Result<String, LlmError> {
        self.client(role).complete(messages).await
    }

    pub async fn generate_stream(
        &self,
        role: ModelRole,
        messages: &[Message],
    ) -> Result<TokenStream, LlmError> {
        self.client(role).complete_stream(messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    #[tokio::test]
    async fn test_roles_route_to_their_clients() {
        let router = Arc::new(ScriptedLlmClient::new(["router"]));
        let code = Arc::new(ScriptedLlmClient::new(["code"]));
        let vision = Arc::new(ScriptedLlmClient::new(["vision"]));
        let set = ModelSet::new(router.clone(), code.clone(), vision.clone());

        let msgs = [Message::user("hi")];
        assert_eq!(set.generate(ModelRole::Code, &msgs).await.unwrap(), "code");
        assert_eq!(set.generate(ModelRole::Vision, &msgs).await.unwrap(), "vision");
        assert_eq!(router.calls(), 0);
        assert_eq!(code.calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_code_role_returns_shader() {
        let set = ModelSet::mock();
        let out = set
            .generate(ModelRole::Code, &[Message::user("unlit")])
            .await
            .unwrap();
        assert!(out.contains("SubShader"));
    }
}
