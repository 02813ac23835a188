//! 阶段迁移表
//!
//! 纯函数 `transition(stage, event)`：合法迁移返回下一阶段，其余一律报错。
//! 终止阶段不接受任何事件。

use std::fmt;

use thiserror::Error;

use crate::workflow::Stage;

/// 驱动阶段迁移的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    Started { has_image: bool },
    ImageAnalyzed,
    RequirementAnalyzed,
    Generated,
    ValidationPassed,
    ValidationFailed,
    Fixed,
    ReplyReceived,
    CompileSucceeded,
    RetryGranted,
    RetriesExhausted,
    /// 阶段调用失败或内部错误
    Aborted,
    Cancelled,
}

impl fmt::Display for StageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("stage {0} is terminal")]
    Terminal(Stage),

    #[error("illegal transition from {from} on {event}")]
    Illegal { from: Stage, event: StageEvent },
}

pub fn transition(from: Stage, event: StageEvent) -> Result<Stage, TransitionError> {
    use Stage as S;
    use StageEvent as E;

    if from.is_terminal() {
        return Err(TransitionError::Terminal(from));
    }

    let next = match (from, event) {
        (_, E::Cancelled) => S::Cancelled,
        (_, E::Aborted) => S::Fail,

        (S::Init, E::Started { has_image: true }) => S::ImageAnalysis,
        (S::Init, E::Started { has_image: false }) => S::RequirementAnalysis,
        (S::ImageAnalysis, E::ImageAnalyzed) => S::RequirementAnalysis,
        (S::RequirementAnalysis, E::RequirementAnalyzed) => S::Generate,
        (S::Generate, E::Generated) => S::Validate,
        (S::Validate, E::ValidationPassed) => S::AwaitingCompile,
        (S::Validate, E::ValidationFailed) => S::Fix,
        (S::Fix, E::Fixed) => S::Validate,
        (S::AwaitingCompile, E::ReplyReceived) => S::RetryDecision,
        (S::RetryDecision, E::CompileSucceeded) => S::Success,
        (S::RetryDecision, E::RetryGranted) => S::Generate,
        (S::RetryDecision, E::RetriesExhausted) => S::Fail,

        (from, event) => return Err(TransitionError::Illegal { from, event }),
    };

    Ok(next)
}
