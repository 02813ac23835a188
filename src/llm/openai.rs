//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；带图片的用户消息以 image_url 内容块发送，供视觉模型使用。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestMessageContentPartImageArgs,
    ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
    ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageUrlArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：一个实例对应一个模型名 + 温度
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    timeout: Duration,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: &str,
        temperature: f32,
        timeout: Duration,
    ) -> Self {
        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature,
            timeout,
            usage: TokenUsage::default(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages.iter().map(to_openai_message).collect()
    }
}

fn invalid(e: impl std::fmt::Display) -> LlmError {
    LlmError::InvalidRequest(e.to_string())
}

fn to_openai_message(m: &Message) -> Result<ChatCompletionRequestMessage, LlmError> {
    let msg = match m.role {
        Role::System => ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(m.content.clone())
                .build()
                .map_err(invalid)?,
        ),
        Role::Assistant => ChatCompletionRequestMessage::Assistant(
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(m.content.clone())
                .build()
                .map_err(invalid)?,
        ),
        Role::User => {
            let content = match &m.image {
                None => ChatCompletionRequestUserMessageContent::Text(m.content.clone()),
                Some(image) => {
                    let text = ChatCompletionRequestMessageContentPartTextArgs::default()
                        .text(m.content.clone())
                        .build()
                        .map_err(invalid)?;
                    let image_url = ImageUrlArgs::default()
                        .url(image.data_url())
                        .build()
                        .map_err(invalid)?;
                    let image_part = ChatCompletionRequestMessageContentPartImageArgs::default()
                        .image_url(image_url)
                        .build()
                        .map_err(invalid)?;
                    ChatCompletionRequestUserMessageContent::Array(vec![
                        ChatCompletionRequestUserMessageContentPart::Text(text),
                        ChatCompletionRequestUserMessageContentPart::ImageUrl(image_part),
                    ])
                }
            };
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(content)
                    .build()
                    .map_err(invalid)?,
            )
        }
    };
    Ok(msg)
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(self.temperature)
            .messages(self.to_openai_messages(messages)?)
            .build()
            .map_err(invalid)?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        let (prompt_tokens, completion_tokens) = self.usage.get();
        tracing::debug!(
            model = %self.model,
            chars = content.len(),
            prompt_tokens,
            completion_tokens,
            "completion received"
        );
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_shared_between_clones() {
        let usage = TokenUsage::default();
        let clone = usage.clone();
        usage.add(120, 30);
        clone.add(80, 20);
        assert_eq!(usage.get(), (200, 50));
        assert_eq!(clone.get(), (200, 50));
    }
}
