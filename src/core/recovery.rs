//! 重试控制
//!
//! 编译失败（含编译超时）后决定是回到生成阶段还是放弃。所有失败共享同一个重试预算。

use crate::workflow::{FailReason, ShaderTask};

/// 单次决策结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    GiveUp,
}

/// 重试控制器：无状态，计数保存在任务上
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryController;

impl RetryController {
    pub fn new() -> Self {
        Self
    }

    /// retry_count < max_retries 时允许再试一次
    pub fn decide(&self, task: &ShaderTask) -> RetryDecision {
        if task.retry_count() < task.max_retries() {
            RetryDecision::Retry
        } else {
            RetryDecision::GiveUp
        }
    }

    /// 放弃时的失败原因：完整错误历史 + 最后一次编译错误
    pub fn give_up(&self, task: &ShaderTask) -> FailReason {
        FailReason::RetriesExhausted {
            retries: task.retry_count(),
            history: task.error_history().to_vec(),
            final_errors: task.compile_result().error_lines(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{CompileResult, ShaderTaskBuilder};
    use serde_json::json;

    fn failed_task(max_retries: u32) -> ShaderTask {
        let mut task = ShaderTaskBuilder::new("session_1", "water shader")
            .max_retries(max_retries)
            .build()
            .unwrap();
        task.record_compile_result(CompileResult::from_tool_result(&json!({
            "success": false,
            "errors": ["undeclared identifier 'foo'"]
        })));
        task
    }

    #[test]
    fn test_retry_while_budget_remains() {
        let controller = RetryController::new();
        let mut task = failed_task(2);

        assert_eq!(controller.decide(&task), RetryDecision::Retry);
        task.record_retry();
        assert_eq!(controller.decide(&task), RetryDecision::Retry);
        task.record_retry();
        assert_eq!(controller.decide(&task), RetryDecision::GiveUp);
        assert_eq!(task.retry_count(), 2);
    }

    #[test]
    fn test_zero_budget_gives_up_immediately() {
        let controller = RetryController::new();
        let task = failed_task(0);
        assert_eq!(controller.decide(&task), RetryDecision::GiveUp);
    }

    #[test]
    fn test_give_up_summary_lists_history_in_order() {
        let controller = RetryController::new();
        let mut task = failed_task(2);
        task.record_retry();
        task.record_retry();

        let reason = controller.give_up(&task);
        let text = reason.to_string();
        let first = text.find("Attempt 1:").unwrap();
        let second = text.find("Attempt 2:").unwrap();
        assert!(first < second);
        assert!(text.contains("Final errors:"));
        assert!(text.contains("undeclared identifier 'foo'"));
    }
}
