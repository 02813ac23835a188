//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock / 脚本化）与按角色路由

pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use mock::{MockLlmClient, ScriptedLlmClient, MOCK_SHADER};
pub use openai::{OpenAiClient, TokenUsage};
pub use router::{ModelOverrides, ModelSet};
pub use traits::{LlmClient, LlmError, ModelRole, TokenStream};
