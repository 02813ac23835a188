//! 任务构建器
//!
//! 提供流畅的 API 来构建 ShaderTask

use crate::core::WorkflowError;
use crate::memory::ImageAttachment;
use crate::workflow::{ShaderTask, TaskInput};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_HISTORY_LIMIT: usize = 10;

/// 着色器任务构建器
pub struct ShaderTaskBuilder {
    task_id: Option<String>,
    session_id: String,
    input: TaskInput,
    max_retries: u32,
    error_history_limit: usize,
}

impl ShaderTaskBuilder {
    pub fn new(session_id: impl Into<String>, requirement: impl Into<String>) -> Self {
        Self {
            task_id: None,
            session_id: session_id.into(),
            input: TaskInput {
                requirement: requirement.into(),
                ..TaskInput::default()
            },
            max_retries: DEFAULT_MAX_RETRIES,
            error_history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// 指定任务 id（默认随机生成）
    pub fn task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    /// 附带参考图（会先经过视觉分析）
    pub fn reference_image(mut self, image: ImageAttachment) -> Self {
        self.input.reference_image = Some(image);
        self
    }

    /// 修改已有着色器
    pub fn modify(mut self, previous_code: impl Into<String>) -> Self {
        self.input.previous_code = Some(previous_code.into());
        self.input.is_modification = true;
        self
    }

    pub fn conversation_context(mut self, context: impl Into<String>) -> Self {
        self.input.conversation_context = context.into();
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn error_history_limit(mut self, limit: usize) -> Self {
        self.error_history_limit = limit;
        self
    }

    pub fn build(self) -> Result<ShaderTask, WorkflowError> {
        if self.input.requirement.trim().is_empty() && self.input.reference_image.is_none() {
            return Err(WorkflowError::InvalidTask(
                "requirement or reference image is required".to_string(),
            ));
        }
        if self.input.is_modification
            && self
                .input
                .previous_code
                .as_deref()
                .map_or(true, |c| c.trim().is_empty())
        {
            return Err(WorkflowError::InvalidTask(
                "modification requires previous code".to_string(),
            ));
        }

        let task_id = self
            .task_id
            .unwrap_or_else(|| format!("task_{}", uuid::Uuid::new_v4()));
        Ok(ShaderTask::new(
            task_id,
            self.session_id,
            self.input,
            self.max_retries,
            self.error_history_limit,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Stage;

    #[test]
    fn test_build_simple_task() {
        let task = ShaderTaskBuilder::new("session_1", "a dissolve shader")
            .conversation_context("User: hi")
            .max_retries(2)
            .build()
            .expect("Failed to build task");
        assert!(task.id().starts_with("task_"));

        assert_eq!(task.stage(), Stage::Init);
        assert_eq!(task.max_retries(), 2);
        assert_eq!(task.input().requirement, "a dissolve shader");
        assert!(!task.input().is_modification);
    }

    #[test]
    fn test_explicit_task_id() {
        let task = ShaderTaskBuilder::new("session_1", "fire")
            .task_id("task_fixed")
            .build()
            .unwrap();
        assert_eq!(task.id(), "task_fixed");
    }

    #[test]
    fn test_build_without_requirement_fails() {
        let result = ShaderTaskBuilder::new("session_1", "  ").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_image_only_task_is_valid() {
        let task = ShaderTaskBuilder::new("session_1", "")
            .reference_image(ImageAttachment::from_client("AAAA"))
            .build();
        assert!(task.is_ok());
    }

    #[test]
    fn test_modification_requires_code() {
        let result = ShaderTaskBuilder::new("session_1", "make it blue")
            .modify("")
            .build();
        assert!(result.is_err());

        let task = ShaderTaskBuilder::new("session_1", "make it blue")
            .modify("Shader \"A\" {}")
            .build()
            .unwrap();
        assert!(task.input().is_modification);
    }
}
