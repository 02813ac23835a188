//! 着色器任务状态
//!
//! 一次生成请求从创建到终止的全部状态。字段只读对外暴露，写入只发生在工作流引擎内部；
//! 进入终止阶段后任何写入都会被忽略。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::ImageAttachment;
use crate::workflow::{
    transition, CompileResult, FailReason, Stage, StageEvent, TaskId, TransitionError, Verdict,
};

/// 任务输入（创建后不变）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInput {
    pub requirement: String,
    pub reference_image: Option<ImageAttachment>,
    /// 修改已有着色器时的原代码
    pub previous_code: Option<String>,
    pub is_modification: bool,
    /// 最近对话拼成的上下文
    pub conversation_context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShaderTask {
    id: TaskId,
    session_id: String,
    created_at: DateTime<Utc>,
    input: TaskInput,
    stage: Stage,
    image_analysis: Option<String>,
    requirement_analysis: Option<String>,
    generated_code: String,
    shader_name: String,
    validation_passed: bool,
    deficiencies: Vec<String>,
    compile_result: CompileResult,
    retry_count: u32,
    max_retries: u32,
    fix_iterations: u32,
    error_history: Vec<String>,
    error_history_limit: usize,
    pending_call: Option<String>,
    error: Option<String>,
}

impl ShaderTask {
    pub(crate) fn new(
        id: TaskId,
        session_id: String,
        input: TaskInput,
        max_retries: u32,
        error_history_limit: usize,
    ) -> Self {
        Self {
            id,
            session_id,
            created_at: Utc::now(),
            input,
            stage: Stage::Init,
            image_analysis: None,
            requirement_analysis: None,
            generated_code: String::new(),
            shader_name: String::new(),
            validation_passed: false,
            deficiencies: Vec::new(),
            compile_result: CompileResult::default(),
            retry_count: 0,
            max_retries,
            fix_iterations: 0,
            error_history: Vec::new(),
            // 历史容量不小于重试上限，保证放弃时能列出每一次尝试
            error_history_limit: error_history_limit.max(max_retries as usize),
            pending_call: None,
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn input(&self) -> &TaskInput {
        &self.input
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn image_analysis(&self) -> Option<&str> {
        self.image_analysis.as_deref()
    }

    pub fn requirement_analysis(&self) -> Option<&str> {
        self.requirement_analysis.as_deref()
    }

    pub fn generated_code(&self) -> &str {
        &self.generated_code
    }

    pub fn shader_name(&self) -> &str {
        &self.shader_name
    }

    pub fn validation_passed(&self) -> bool {
        self.validation_passed
    }

    pub fn deficiencies(&self) -> &[String] {
        &self.deficiencies
    }

    pub fn compile_result(&self) -> &CompileResult {
        &self.compile_result
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn fix_iterations(&self) -> u32 {
        self.fix_iterations
    }

    pub fn error_history(&self) -> &[String] {
        &self.error_history
    }

    /// 正在等待回复的编译请求 id
    pub fn pending_call(&self) -> Option<&str> {
        self.pending_call.as_deref()
    }

    /// 终止时的错误信息（成功为 None）
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn writable(&self) -> bool {
        if self.is_terminal() {
            tracing::warn!(task_id = %self.id, stage = %self.stage, "write to terminal task ignored");
            return false;
        }
        true
    }

    pub(crate) fn set_stage(&mut self, stage: Stage) {
        if self.writable() {
            self.stage = stage;
        }
    }

    pub(crate) fn record_image_analysis(&mut self, analysis: String) {
        if self.writable() {
            self.image_analysis = Some(analysis);
        }
    }

    pub(crate) fn record_requirement_analysis(&mut self, analysis: String) {
        if self.writable() {
            self.requirement_analysis = Some(analysis);
        }
    }

    /// 新一轮生成：替换代码，清空校验结论，修复计数归零
    pub(crate) fn record_generation(&mut self, code: String, shader_name: String) {
        if self.writable() {
            self.generated_code = code;
            self.shader_name = shader_name;
            self.validation_passed = false;
            self.deficiencies.clear();
            self.fix_iterations = 0;
        }
    }

    pub(crate) fn record_fix(&mut self, code: String, shader_name: String) {
        if self.writable() {
            self.generated_code = code;
            self.shader_name = shader_name;
            self.fix_iterations += 1;
        }
    }

    pub(crate) fn record_validation(&mut self, verdict: &Verdict) {
        if self.writable() {
            self.validation_passed = verdict.passed;
            self.deficiencies = verdict.deficiencies.clone();
        }
    }

    pub(crate) fn begin_compile(&mut self, call_id: String) {
        if self.writable() {
            self.compile_result = CompileResult::default();
            self.pending_call = Some(call_id);
        }
    }

    pub(crate) fn record_compile_result(&mut self, result: CompileResult) {
        if self.writable() {
            self.pending_call = None;
            self.compile_result = result;
        }
    }

    /// 消耗一次重试，并把本次编译错误追加到历史（超出容量时丢弃最旧的）；
    /// 已达上限时拒绝并返回 false
    pub(crate) fn record_retry(&mut self) -> bool {
        if !self.writable() {
            return false;
        }
        if self.retry_count >= self.max_retries {
            tracing::warn!(
                task_id = %self.id,
                retry_count = self.retry_count,
                max_retries = self.max_retries,
                "retry refused, ceiling reached"
            );
            return false;
        }
        self.retry_count += 1;
        let errors = self.compile_result.error_lines();
        let summary = if errors.is_empty() {
            "compile failed without diagnostics".to_string()
        } else {
            errors.join("; ")
        };
        self.error_history
            .push(format!("Attempt {}: {}", self.retry_count, summary));
        if self.error_history.len() > self.error_history_limit {
            let overflow = self.error_history.len() - self.error_history_limit;
            self.error_history.drain(..overflow);
        }
        true
    }

    /// 终止迁移同样经过迁移表；非法时任务保持不变
    fn terminate(&mut self, event: StageEvent, error: Option<String>) -> Result<(), TransitionError> {
        let next = transition(self.stage, event)?;
        self.stage = next;
        self.pending_call = None;
        self.error = error;
        Ok(())
    }

    /// 只能从 RetryDecision 进入 Success
    pub(crate) fn finish_success(&mut self) -> Result<(), TransitionError> {
        if !self.writable() {
            return Ok(());
        }
        self.terminate(StageEvent::CompileSucceeded, None)
    }

    pub(crate) fn finish_failure(&mut self, reason: &FailReason) -> Result<(), TransitionError> {
        if !self.writable() {
            return Ok(());
        }
        let event = match reason {
            FailReason::Cancelled(_) => StageEvent::Cancelled,
            FailReason::RetriesExhausted { .. } => StageEvent::RetriesExhausted,
            _ => StageEvent::Aborted,
        };
        self.terminate(event, Some(reason.to_string()))
    }

    /// 取消；已终止时返回 false 且不做任何修改
    pub fn cancel(&mut self, reason: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.finish_failure(&FailReason::Cancelled(reason.to_string()))
            .is_ok()
    }
}
