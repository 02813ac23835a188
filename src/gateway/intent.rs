//! 意图识别模块
//!
//! 先做关键词快速匹配，匹配不到再交给路由模型分类。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm::LlmClient;
use crate::memory::Message;

/// 识别出的意图类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    /// 新建着色器
    GenerateShader,
    /// 修改当前着色器
    ModifyShader,
    /// 解释着色器概念或代码
    ExplainShader,
    /// 保存当前着色器到工程
    SaveAsset,
    /// 其它对话
    Chat,
}

const CLASSIFICATION_PROMPT: &str = r#"You are an intent classifier for a Unity shader generation assistant.
Classify the user message into exactly one of these intents:

- GENERATE_SHADER: create a NEW shader ("创建一个卡通着色器", "make a dissolve shader")
- MODIFY_SHADER: change the EXISTING shader ("把颜色改成蓝色", "add rim lighting")
- EXPLAIN_SHADER: explanation about shaders ("什么是法线贴图", "how does PBR work")
- SAVE_ASSET: save the current work ("保存", "save the shader")
- CHAT: anything else ("你是谁", "what can you do")

Respond with ONLY the intent name in UPPERCASE, nothing else."#;

const SAVE_KEYWORDS: &[&str] = &["保存", "save", "export", "导出"];
const CREATE_KEYWORDS: &[&str] = &["创建", "生成", "制作", "写一个", "create", "generate", "make", "build"];
const SHADER_KEYWORDS: &[&str] = &["shader", "着色器", "材质", "效果"];
const MODIFY_KEYWORDS: &[&str] = &["修改", "改成", "调整", "换成", "change", "modify", "adjust", "tweak"];
const EXPLAIN_KEYWORDS: &[&str] = &["什么是", "解释", "explain", "what is", "how does"];

fn contains_any(input: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| input.contains(k))
}

/// 意图识别器
pub struct IntentRecognizer {
    llm: Arc<dyn LlmClient>,
    /// 启用快速规则匹配（不调用 LLM）
    enable_fast_match: bool,
}

impl IntentRecognizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            enable_fast_match: true,
        }
    }

    /// 识别用户意图；没有当前着色器时「修改」退化为「新建」
    pub async fn recognize(&self, user_input: &str, has_image: bool, has_shader: bool) -> Intent {
        let intent = match self.fast_match(user_input, has_shader) {
            Some(intent) if self.enable_fast_match => intent,
            _ => self.llm_recognize(user_input, has_image, has_shader).await,
        };

        match intent {
            Intent::ModifyShader if !has_shader => Intent::GenerateShader,
            other => other,
        }
    }

    /// 快速规则匹配（不调用 LLM）
    fn fast_match(&self, input: &str, has_shader: bool) -> Option<Intent> {
        let input = input.to_lowercase();

        if contains_any(&input, SAVE_KEYWORDS) {
            return Some(Intent::SaveAsset);
        }
        if contains_any(&input, CREATE_KEYWORDS) && contains_any(&input, SHADER_KEYWORDS) {
            return Some(Intent::GenerateShader);
        }
        if has_shader && contains_any(&input, MODIFY_KEYWORDS) {
            return Some(Intent::ModifyShader);
        }
        if contains_any(&input, EXPLAIN_KEYWORDS) {
            return Some(Intent::ExplainShader);
        }
        None
    }

    /// 使用路由模型识别意图；失败或无法识别时按新建着色器处理
    async fn llm_recognize(&self, user_input: &str, has_image: bool, has_shader: bool) -> Intent {
        let mut context = Vec::new();
        if has_image {
            context.push("User has attached an image.");
        }
        if has_shader {
            context.push("There is an existing shader in the conversation.");
        }
        let content = format!("{}\n\nUser message: {}", context.join(" "), user_input);

        let messages = vec![
            Message::system(CLASSIFICATION_PROMPT),
            Message::user(content.trim().to_string()),
        ];

        match self.llm.complete(&messages).await {
            Ok(response) => parse_intent(&response),
            Err(e) => {
                tracing::warn!(error = %e, "intent classification failed, defaulting to generate");
                Intent::GenerateShader
            }
        }
    }
}

fn parse_intent(response: &str) -> Intent {
    match response.trim().to_uppercase().as_str() {
        "GENERATE_SHADER" => Intent::GenerateShader,
        "MODIFY_SHADER" => Intent::ModifyShader,
        "EXPLAIN_SHADER" => Intent::ExplainShader,
        "SAVE_ASSET" => Intent::SaveAsset,
        "CHAT" | "QUESTION" | "OTHER" => Intent::Chat,
        _ => Intent::GenerateShader,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn recognizer(responses: &[&str]) -> (IntentRecognizer, Arc<ScriptedLlmClient>) {
        let llm = Arc::new(ScriptedLlmClient::new(responses.iter().copied()));
        (IntentRecognizer::new(llm.clone()), llm)
    }

    #[tokio::test]
    async fn test_fast_match_generate_and_save() {
        let (r, llm) = recognizer(&[]);
        assert_eq!(
            r.recognize("帮我创建一个卡通着色器", false, false).await,
            Intent::GenerateShader
        );
        assert_eq!(r.recognize("Save it please", false, true).await, Intent::SaveAsset);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_modify_without_shader_falls_back_to_generate() {
        let (r, _) = recognizer(&["MODIFY_SHADER"]);
        assert_eq!(
            r.recognize("make the edges glow more", false, false).await,
            Intent::GenerateShader
        );
    }

    #[tokio::test]
    async fn test_fast_match_modify_with_shader() {
        let (r, llm) = recognizer(&[]);
        assert_eq!(r.recognize("把颜色改成蓝色", false, true).await, Intent::ModifyShader);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_llm_classification() {
        let (r, llm) = recognizer(&["  chat\n", "SOMETHING_ELSE"]);
        assert_eq!(r.recognize("你是谁", false, false).await, Intent::Chat);
        assert_eq!(r.recognize("hmm", true, false).await, Intent::GenerateShader);
        assert!(llm.prompt_text(1).unwrap().contains("User has attached an image."));
    }

    #[tokio::test]
    async fn test_classifier_failure_defaults_to_generate() {
        let (r, _) = recognizer(&[]);
        assert_eq!(r.recognize("hmm", false, false).await, Intent::GenerateShader);
    }
}
