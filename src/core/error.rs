//! 错误类型
//!
//! - `CorrelationError`：关联器的重复登记 / 未知回复
//! - `WorkflowError`：工作流单步执行失败，由引擎在阶段边界转为 `FailReason`

use thiserror::Error;

use crate::core::CorrelationKey;
use crate::llm::LlmError;
use crate::workflow::{Stage, TransitionError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    /// 同一 key 仍在等待时再次登记
    #[error("duplicate correlation id {0}")]
    Duplicate(CorrelationKey),

    /// 回复对应的 key 不存在（未发出、已回复、已取消或已超时）
    #[error("unknown correlation id {0}")]
    Unknown(CorrelationKey),
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("generation failed during {stage}: {source}")]
    Generation {
        stage: Stage,
        #[source]
        source: LlmError,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    /// 工具宿主（客户端连接）不可用
    #[error("tool host unavailable: {0}")]
    HostUnavailable(String),

    /// 任务仍在等待工具回复时又被推进
    #[error("task is still awaiting reply {0}")]
    AwaitingReply(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),
}

impl WorkflowError {
    /// 内部契约被破坏（而不是外部调用失败）
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            WorkflowError::Transition(_)
                | WorkflowError::Correlation(_)
                | WorkflowError::AwaitingReply(_)
        )
    }
}
