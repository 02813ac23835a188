//! 工作流类型定义
//!
//! 阶段、阶段结果、失败原因与编译结果

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{CorrelationKey, Waiter};

pub type TaskId = String;

/// 工作流阶段（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    /// 参考图分析（仅在附带图片时进入）
    ImageAnalysis,
    RequirementAnalysis,
    Generate,
    /// 结构校验
    Validate,
    /// 根据校验缺陷修复
    Fix,
    /// 已发出编译请求，等待宿主回复
    AwaitingCompile,
    RetryDecision,
    Success,
    Fail,
    Cancelled,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Success | Stage::Fail | Stage::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::ImageAnalysis => "image_analysis",
            Stage::RequirementAnalysis => "requirement_analysis",
            Stage::Generate => "generate",
            Stage::Validate => "validate",
            Stage::Fix => "fix",
            Stage::AwaitingCompile => "awaiting_compile",
            Stage::RetryDecision => "retry_decision",
            Stage::Success => "success",
            Stage::Fail => "fail",
            Stage::Cancelled => "cancelled",
        }
    }

    /// 进度提示文本
    pub fn describe(&self) -> &'static str {
        match self {
            Stage::Init => "Starting task",
            Stage::ImageAnalysis => "Analyzing reference image",
            Stage::RequirementAnalysis => "Analyzing requirements",
            Stage::Generate => "Generating shader code",
            Stage::Validate => "Validating shader structure",
            Stage::Fix => "Fixing structural issues",
            Stage::AwaitingCompile => "Compiling shader in Unity",
            Stage::RetryDecision => "Checking compile result",
            Stage::Success => "Shader compiled successfully",
            Stage::Fail => "Task failed",
            Stage::Cancelled => "Task cancelled",
        }
    }

    /// 粗略进度（0.0 ~ 1.0）
    pub fn progress(&self) -> f32 {
        match self {
            Stage::Init => 0.0,
            Stage::ImageAnalysis => 0.1,
            Stage::RequirementAnalysis => 0.2,
            Stage::Generate => 0.4,
            Stage::Validate => 0.6,
            Stage::Fix => 0.65,
            Stage::AwaitingCompile => 0.8,
            Stage::RetryDecision => 0.9,
            Stage::Success | Stage::Fail | Stage::Cancelled => 1.0,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务失败原因；Display 即写入任务的终止错误信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// 某阶段的生成调用失败（不消耗重试）
    StageFailed { stage: Stage, message: String },
    /// 结构校验连续修复仍未通过
    FixLimitExceeded {
        iterations: u32,
        deficiencies: Vec<String>,
    },
    /// 重试预算耗尽
    RetriesExhausted {
        retries: u32,
        history: Vec<String>,
        final_errors: Vec<String>,
    },
    Cancelled(String),
    /// Unity 编辑器无法接收工具调用（不消耗重试）
    HostUnavailable(String),
    /// 内部契约被破坏（重复关联 id、非法迁移等）
    Internal(String),
}

impl FailReason {
    /// 对外错误码（ERROR 消息的 code）
    pub fn code(&self) -> &'static str {
        match self {
            FailReason::StageFailed { .. } => "GENERATION_FAILED",
            FailReason::FixLimitExceeded { .. } => "VALIDATION_FAILED",
            FailReason::RetriesExhausted { .. } => "COMPILE_FAILED",
            FailReason::Cancelled(_) => "TASK_CANCELLED",
            FailReason::HostUnavailable(_) => "HOST_UNAVAILABLE",
            FailReason::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::StageFailed { stage, message } => {
                write!(f, "Stage {stage} failed: {message}")
            }
            FailReason::FixLimitExceeded {
                iterations,
                deficiencies,
            } => {
                write!(
                    f,
                    "Shader failed structural validation after {iterations} fix attempts:"
                )?;
                for d in deficiencies {
                    write!(f, "\n- {d}")?;
                }
                Ok(())
            }
            FailReason::RetriesExhausted {
                retries,
                history,
                final_errors,
            } => {
                write!(
                    f,
                    "Shader generation failed after maximum retry attempts ({retries})."
                )?;
                if !history.is_empty() {
                    f.write_str("\n\nError history:")?;
                    for entry in history {
                        write!(f, "\n{entry}")?;
                    }
                }
                f.write_str("\n\nFinal errors:")?;
                for e in final_errors {
                    write!(f, "\n- {e}")?;
                }
                Ok(())
            }
            FailReason::Cancelled(reason) => write!(f, "Task cancelled: {reason}"),
            FailReason::HostUnavailable(msg) => write!(f, "Unity editor unavailable: {msg}"),
            FailReason::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

/// 挂起点：工作流等待一次外部回复
#[derive(Debug)]
pub struct Suspension {
    pub(crate) waiter: Waiter,
}

impl Suspension {
    pub fn key(&self) -> &CorrelationKey {
        self.waiter.key()
    }

    pub fn id(&self) -> &str {
        &self.waiter.key().id
    }
}

/// 单步执行结果
#[derive(Debug)]
pub enum StageOutcome {
    Continue(Stage),
    Suspend(Suspension),
    Retry,
    Succeed,
    Fail(FailReason),
}

impl StageOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageOutcome::Succeed | StageOutcome::Fail(_))
    }
}

/// 编译状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

/// 单条编译诊断
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
            severity: None,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(col)) => write!(f, "line {line}:{col}: {}", self.message),
            (Some(line), None) => write!(f, "line {line}: {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

/// 宿主既可能回纯字符串也可能回结构化对象
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDiagnostic {
    Text(String),
    Detailed(CompileError),
}

impl From<RawDiagnostic> for CompileError {
    fn from(raw: RawDiagnostic) -> Self {
        match raw {
            RawDiagnostic::Text(s) => CompileError::new(s),
            RawDiagnostic::Detailed(e) => e,
        }
    }
}

fn diagnostics(value: Option<&serde_json::Value>) -> Vec<CompileError> {
    let Some(serde_json::Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|v| serde_json::from_value::<RawDiagnostic>(v.clone()).ok())
        .map(CompileError::from)
        .collect()
}

/// 编译结果
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompileResult {
    pub status: CompileStatus,
    pub errors: Vec<CompileError>,
    pub warnings: Vec<CompileError>,
    pub shader_path: Option<String>,
}

impl CompileResult {
    /// 解析 compile_shader 的 TOOL_RESPONSE.result
    ///
    /// 期望形如 `{"success": bool, "errors": [...], "warnings": [...], "shader_path": "..."}`；
    /// 缺少 success 或格式不符一律视为失败。
    pub fn from_tool_result(result: &serde_json::Value) -> Self {
        let success = result
            .get("success")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let mut errors = diagnostics(result.get("errors"));
        if !success && errors.is_empty() {
            let msg = result
                .get("error")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("compile failed without diagnostics");
            errors.push(CompileError::new(msg));
        }

        Self {
            status: if success {
                CompileStatus::Success
            } else {
                CompileStatus::Failed
            },
            errors,
            warnings: diagnostics(result.get("warnings")),
            shader_path: result
                .get("shader_path")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
        }
    }

    /// 编译请求超时按一次编译失败处理
    pub fn timed_out(timeout_secs: u64) -> Self {
        Self {
            status: CompileStatus::Failed,
            errors: vec![CompileError::new(format!(
                "compile_shader timed out after {timeout_secs}s"
            ))],
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CompileStatus::Success
    }

    pub fn error_lines(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}
