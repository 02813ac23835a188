//! Mock / 脚本化 LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! - `MockLlmClient`：按角色返回固定内容；代码角色返回一个能通过结构校验的 URP Unlit 着色器
//! - `ScriptedLlmClient`：按顺序弹出预设响应，并记录收到的每次提示词

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, ModelRole};
use crate::memory::{Message, Role};

pub const MOCK_SHADER: &str = r#"Shader "Custom/MockUnlit"
{
    Properties
    {
        _BaseColor ("Base Color", Color) = (1, 1, 1, 1)
    }
    SubShader
    {
        Tags { "RenderType"="Opaque" "RenderPipeline"="UniversalPipeline" }
        Pass
        {
            HLSLPROGRAM
            #pragma vertex vert
            #pragma fragment frag
            #include "Packages/com.unity.render-pipelines.universal/ShaderLibrary/Core.hlsl"

            struct Attributes { float4 positionOS : POSITION; };
            struct Varyings { float4 positionHCS : SV_POSITION; };

            CBUFFER_START(UnityPerMaterial)
                half4 _BaseColor;
            CBUFFER_END

            Varyings vert(Attributes IN)
            {
                Varyings OUT;
                OUT.positionHCS = TransformObjectToHClip(IN.positionOS.xyz);
                return OUT;
            }

            half4 frag(Varyings IN) : SV_Target
            {
                return _BaseColor;
            }
            ENDHLSL
        }
    }
}"#;

/// Mock 客户端：不访问网络
#[derive(Debug)]
pub struct MockLlmClient {
    role: ModelRole,
}

impl MockLlmClient {
    pub fn new(role: ModelRole) -> Self {
        Self { role }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(match self.role {
            ModelRole::Code => format!("```hlsl\n{}\n```", MOCK_SHADER),
            ModelRole::Router => format!("Mock analysis of: {}", last_user),
            ModelRole::Vision => "Mock image analysis: flat colors, soft rim light.".to_string(),
        })
    }
}

/// 脚本化客户端：响应耗尽后返回 EmptyResponse
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(|s| Ok(s.into())).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 追加一个失败响应
    pub fn push_error(&self, err: LlmError) {
        self.lock_responses().push_back(Err(err));
    }

    pub fn push(&self, response: impl Into<String>) {
        self.lock_responses().push_back(Ok(response.into()));
    }

    /// 已收到的调用次数
    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// 第 n 次调用的全部消息内容拼接（便于断言提示词）
    pub fn prompt_text(&self, n: usize) -> Option<String> {
        let prompts = self.prompts.lock().ok()?;
        prompts.get(n).map(|msgs| {
            msgs.iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, LlmError>>> {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(messages.to_vec());
        }
        self.lock_responses()
            .pop_front()
            .unwrap_or(Err(LlmError::EmptyResponse))
    }
}
