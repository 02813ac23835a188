//! 短期记忆：对话历史
//!
//! 保留最近 N 轮对话（user/assistant 对），超出时自动剪枝；`build_context` 拼出生成提示词所需的上下文。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        }
    }
}

/// 随消息附带的图片（base64，不做解码）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub mime_type: String,
    pub data_b64: String,
}

impl ImageAttachment {
    /// 接受裸 base64 或 `data:<mime>;base64,<data>` 形式
    pub fn from_client(raw: &str) -> Self {
        if let Some(rest) = raw.strip_prefix("data:") {
            if let Some((header, data)) = rest.split_once(',') {
                let mime = header.trim_end_matches(";base64");
                return Self {
                    mime_type: if mime.is_empty() {
                        "image/png".to_string()
                    } else {
                        mime.to_string()
                    },
                    data_b64: data.to_string(),
                };
            }
        }
        Self {
            mime_type: "image/png".to_string(),
            data_b64: raw.to_string(),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data_b64)
    }
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageAttachment>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            image: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            image: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: ImageAttachment) -> Self {
        self.image = Some(image);
        self
    }
}

/// 短期记忆：最近 N 轮对话（每轮含 user + assistant，故实际保留约 max_turns*2 条消息）
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.prune();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 最近 max_messages 条，格式为 `User: ...`，以空行分隔
    pub fn build_context(&self, max_messages: usize) -> String {
        let start = self.messages.len().saturating_sub(max_messages);
        self.messages[start..]
            .iter()
            .map(|m| format!("{}: {}", m.role.label(), m.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// 超出 max_turns*2 时丢弃最旧的消息，保留最近部分
    fn prune(&mut self) {
        if self.messages.len() > self.max_turns * 2 {
            let keep = self.max_turns * 2;
            self.messages.drain(..self.messages.len() - keep);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
