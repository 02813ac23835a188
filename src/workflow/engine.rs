//! 工作流引擎
//!
//! 单个任务的状态机驱动：从当前阶段连续执行同步阶段，遇到编译请求时挂起，
//! 收到回复（或超时 / 取消）后从挂起点继续，直到终止。
//!
//! - 阶段调用失败：任务以 `FailReason::StageFailed` 终止，不消耗重试
//! - 宿主不可用：任务以 `FailReason::HostUnavailable` 终止，不消耗重试
//! - 校验失败：进入修复，连续修复超过上限则终止
//! - 编译失败：交给 `RetryController` 决定重试或放弃
//! - 已终止的任务再次推进时原样返回终止结果

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::WorkflowSection;
use crate::core::{
    CorrelationKey, Correlator, Owner, Resolution, RetryController, RetryDecision,
    WorkflowError,
};
use crate::llm::{ModelRole, ModelSet};
use crate::workflow::graph::{transition, StageEvent};
use crate::workflow::{
    prompts, CompileResult, FailReason, ShaderTask, Stage, StageOutcome, Suspension,
    ValidationGate,
};

pub const COMPILE_TOOL: &str = "compile_shader";

/// 发往宿主的工具调用
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// 工具宿主：把工具调用交给外部执行者（Unity 编辑器），并接收进度通知
#[async_trait]
pub trait ToolHost: Send + Sync {
    /// 发起调用的连接，用于关联器归属
    fn connection_id(&self) -> &str;

    /// 新调用的 id（默认随机 uuid）
    fn call_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// 发出调用；Err 表示宿主不可用
    async fn issue(&self, call: ToolCall) -> Result<(), WorkflowError>;

    /// 进入新阶段时的通知（尽力而为）
    fn progress(&self, _task: &ShaderTask) {}
}

/// 引擎参数
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_fix_iterations: u32,
    pub compile_timeout: Duration,
    pub output_directory: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&WorkflowSection::default())
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &WorkflowSection) -> Self {
        Self {
            max_fix_iterations: cfg.max_fix_iterations,
            compile_timeout: cfg.compile_timeout(),
            output_directory: cfg.output_directory.clone(),
        }
    }
}

/// 引擎依赖：模型、校验门、重试控制、关联器
#[derive(Clone)]
pub struct EngineContext {
    pub models: ModelSet,
    pub gate: ValidationGate,
    pub retry: RetryController,
    pub correlator: Arc<Correlator>,
    pub settings: EngineSettings,
}

impl EngineContext {
    pub fn new(models: ModelSet, correlator: Arc<Correlator>, settings: EngineSettings) -> Self {
        Self {
            models,
            gate: ValidationGate::new(),
            retry: RetryController::new(),
            correlator,
            settings,
        }
    }
}

/// 工作流引擎
pub struct WorkflowEngine {
    ctx: EngineContext,
    host: Arc<dyn ToolHost>,
}

impl WorkflowEngine {
    pub fn new(ctx: EngineContext, host: Arc<dyn ToolHost>) -> Self {
        Self { ctx, host }
    }

    /// 从当前阶段推进到挂起或终止
    pub async fn advance(&self, task: &mut ShaderTask) -> StageOutcome {
        if task.is_terminal() {
            return terminal_outcome(task);
        }

        loop {
            let stage = task.stage();
            self.host.progress(task);

            let outcome = match self.step(task).await {
                Ok(outcome) => outcome,
                Err(e) => StageOutcome::Fail(self.failure_reason(task, stage, e)),
            };

            match outcome {
                StageOutcome::Continue(next) => {
                    tracing::debug!(task_id = %task.id(), from = %stage, to = %next, "stage transition");
                    task.set_stage(next);
                }
                StageOutcome::Retry => {
                    if !task.record_retry() {
                        return self.fail(task, FailReason::Internal("retry ceiling reached".to_string()));
                    }
                    tracing::info!(
                        task_id = %task.id(),
                        retry = task.retry_count(),
                        max_retries = task.max_retries(),
                        "compile failed, retrying generation"
                    );
                    match transition(stage, StageEvent::RetryGranted) {
                        Ok(next) => task.set_stage(next),
                        Err(e) => return self.fail(task, FailReason::Internal(e.to_string())),
                    }
                }
                StageOutcome::Suspend(suspension) => {
                    tracing::debug!(task_id = %task.id(), call_id = suspension.id(), "task suspended");
                    return StageOutcome::Suspend(suspension);
                }
                StageOutcome::Succeed => {
                    if let Err(e) = task.finish_success() {
                        return self.fail(task, FailReason::Internal(e.to_string()));
                    }
                    self.host.progress(task);
                    tracing::info!(
                        task_id = %task.id(),
                        shader = task.shader_name(),
                        retries = task.retry_count(),
                        "task succeeded"
                    );
                    return StageOutcome::Succeed;
                }
                StageOutcome::Fail(reason) => return self.fail(task, reason),
            }
        }
    }

    /// 以外部结果恢复挂起的任务
    pub async fn resume(&self, task: &mut ShaderTask, resolution: Resolution) -> StageOutcome {
        if task.is_terminal() {
            return terminal_outcome(task);
        }
        if task.stage() != Stage::AwaitingCompile {
            let msg = format!("unexpected reply while task is in {}", task.stage());
            tracing::error!(task_id = %task.id(), "{msg}");
            return self.fail(task, FailReason::Internal(msg));
        }

        let result = match resolution {
            Resolution::Reply(value) => CompileResult::from_tool_result(&value),
            Resolution::TimedOut => {
                tracing::warn!(task_id = %task.id(), "compile request timed out");
                CompileResult::timed_out(self.ctx.settings.compile_timeout.as_secs())
            }
            Resolution::Cancelled(reason) => {
                return self.fail(task, FailReason::Cancelled(reason));
            }
        };
        task.record_compile_result(result);

        match transition(Stage::AwaitingCompile, StageEvent::ReplyReceived) {
            Ok(next) => task.set_stage(next),
            Err(e) => return self.fail(task, FailReason::Internal(e.to_string())),
        }
        self.advance(task).await
    }

    /// 等待挂起点的回复（超时由关联器清理）
    pub async fn wait(&self, suspension: Suspension) -> Resolution {
        self.ctx
            .correlator
            .wait(suspension.waiter, self.ctx.settings.compile_timeout)
            .await
    }

    /// 驱动任务直到终止；令牌取消时任务以 Cancelled 终止
    pub async fn drive(&self, task: &mut ShaderTask, cancel: &CancellationToken) -> StageOutcome {
        let mut outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            o = self.advance(task) => Some(o),
        };

        loop {
            let current = match outcome {
                Some(o) => o,
                None => return self.cancel(task, "cancelled by user"),
            };

            let suspension = match current {
                StageOutcome::Suspend(s) => s,
                StageOutcome::Continue(_) | StageOutcome::Retry => {
                    outcome = Some(self.advance(task).await);
                    continue;
                }
                done => return done,
            };

            let key = suspension.key().clone();
            let resolution = tokio::select! {
                _ = cancel.cancelled() => None,
                r = self.wait(suspension) => Some(r),
            };
            let resolution = match resolution {
                Some(r) => r,
                None => {
                    self.ctx.correlator.cancel(&key, "cancelled by user");
                    return self.cancel(task, "cancelled by user");
                }
            };

            outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                o = self.resume(task, resolution) => Some(o),
            };
        }
    }

    /// 取消任务（已终止则不变）
    pub fn cancel(&self, task: &mut ShaderTask, reason: &str) -> StageOutcome {
        if task.is_terminal() {
            return terminal_outcome(task);
        }
        self.ctx.correlator.cancel_task(task.id(), reason);
        tracing::info!(task_id = %task.id(), stage = %task.stage(), reason, "task cancelled");
        if !task.cancel(reason) {
            tracing::error!(task_id = %task.id(), stage = %task.stage(), "cancel rejected by transition table");
        }
        self.host.progress(task);
        StageOutcome::Fail(FailReason::Cancelled(reason.to_string()))
    }

    async fn step(&self, task: &mut ShaderTask) -> Result<StageOutcome, WorkflowError> {
        let stage = task.stage();
        let models = &self.ctx.models;

        let outcome = match stage {
            Stage::Init => {
                let has_image = task.input().reference_image.is_some();
                StageOutcome::Continue(transition(stage, StageEvent::Started { has_image })?)
            }
            Stage::ImageAnalysis => {
                let analysis = models
                    .generate(ModelRole::Vision, &prompts::image_analysis(task))
                    .await
                    .map_err(|source| WorkflowError::Generation { stage, source })?;
                task.record_image_analysis(analysis);
                StageOutcome::Continue(transition(stage, StageEvent::ImageAnalyzed)?)
            }
            Stage::RequirementAnalysis => {
                let analysis = models
                    .generate(ModelRole::Router, &prompts::requirement_analysis(task))
                    .await
                    .map_err(|source| WorkflowError::Generation { stage, source })?;
                let combined = prompts::combine_analysis(&analysis, task.image_analysis());
                task.record_requirement_analysis(combined);
                StageOutcome::Continue(transition(stage, StageEvent::RequirementAnalyzed)?)
            }
            Stage::Generate => {
                let raw = models
                    .generate(ModelRole::Code, &prompts::generation(task))
                    .await
                    .map_err(|source| WorkflowError::Generation { stage, source })?;
                let code = prompts::extract_shader_code(&raw);
                let name = prompts::extract_shader_name(&code);
                task.record_generation(code, name);
                StageOutcome::Continue(transition(stage, StageEvent::Generated)?)
            }
            Stage::Validate => {
                let verdict = self.ctx.gate.check(task.generated_code());
                task.record_validation(&verdict);
                if verdict.passed {
                    StageOutcome::Continue(transition(stage, StageEvent::ValidationPassed)?)
                } else if task.fix_iterations() >= self.ctx.settings.max_fix_iterations {
                    StageOutcome::Fail(FailReason::FixLimitExceeded {
                        iterations: task.fix_iterations(),
                        deficiencies: verdict.deficiencies,
                    })
                } else {
                    tracing::debug!(
                        task_id = %task.id(),
                        deficiencies = ?verdict.deficiencies,
                        "validation failed"
                    );
                    StageOutcome::Continue(transition(stage, StageEvent::ValidationFailed)?)
                }
            }
            Stage::Fix => {
                let raw = models
                    .generate(ModelRole::Code, &prompts::fix(task))
                    .await
                    .map_err(|source| WorkflowError::Generation { stage, source })?;
                let code = prompts::extract_shader_code(&raw);
                let name = prompts::extract_shader_name(&code);
                task.record_fix(code, name);
                StageOutcome::Continue(transition(stage, StageEvent::Fixed)?)
            }
            Stage::AwaitingCompile => {
                if let Some(pending) = task.pending_call() {
                    return Err(WorkflowError::AwaitingReply(pending.to_string()));
                }
                StageOutcome::Suspend(self.request_compile(task).await?)
            }
            Stage::RetryDecision => {
                if task.compile_result().is_success() {
                    StageOutcome::Succeed
                } else {
                    match self.ctx.retry.decide(task) {
                        RetryDecision::Retry => StageOutcome::Retry,
                        RetryDecision::GiveUp => StageOutcome::Fail(self.ctx.retry.give_up(task)),
                    }
                }
            }
            Stage::Success | Stage::Fail | Stage::Cancelled => terminal_outcome(task),
        };

        Ok(outcome)
    }

    /// 登记关联后再发出调用，保证回复不会早于登记到达
    async fn request_compile(&self, task: &mut ShaderTask) -> Result<Suspension, WorkflowError> {
        let key = CorrelationKey::tool_call(self.host.call_id());
        let owner = Owner::new(self.host.connection_id(), task.id());
        let waiter = self.ctx.correlator.expect(key.clone(), owner)?;

        let call = ToolCall {
            id: key.id.clone(),
            tool_name: COMPILE_TOOL.to_string(),
            arguments: json!({
                "code": task.generated_code(),
                "shader_name": task.shader_name(),
                "output_path": shader_output_path(&self.ctx.settings.output_directory, task.shader_name()),
            }),
        };

        if let Err(e) = self.host.issue(call).await {
            self.ctx.correlator.expire(&key);
            return Err(e);
        }

        task.begin_compile(key.id.clone());
        tracing::info!(task_id = %task.id(), call_id = %key.id, shader = task.shader_name(), "compile requested");
        Ok(Suspension { waiter })
    }

    fn failure_reason(&self, task: &ShaderTask, stage: Stage, err: WorkflowError) -> FailReason {
        if err.is_internal() {
            tracing::error!(task_id = %task.id(), %stage, error = %err, "workflow invariant violated");
            FailReason::Internal(err.to_string())
        } else if let WorkflowError::HostUnavailable(message) = err {
            tracing::warn!(task_id = %task.id(), %stage, %message, "unity host unavailable");
            FailReason::HostUnavailable(message)
        } else {
            tracing::warn!(task_id = %task.id(), %stage, error = %err, "stage failed");
            FailReason::StageFailed {
                stage,
                message: err.to_string(),
            }
        }
    }

    fn fail(&self, task: &mut ShaderTask, reason: FailReason) -> StageOutcome {
        if let Some(call_id) = task.pending_call() {
            self.ctx.correlator.cancel(&CorrelationKey::tool_call(call_id), "task failed");
        }
        let reason = match task.finish_failure(&reason) {
            Ok(()) => reason,
            Err(e) => {
                tracing::error!(task_id = %task.id(), code = reason.code(), error = %e, "failure edge rejected");
                let internal = FailReason::Internal(e.to_string());
                if let Err(e) = task.finish_failure(&internal) {
                    tracing::error!(task_id = %task.id(), error = %e, "task could not be terminated");
                }
                internal
            }
        };
        self.host.progress(task);
        tracing::warn!(task_id = %task.id(), code = reason.code(), "task failed");
        StageOutcome::Fail(reason)
    }
}

/// 已终止任务的结果（不做任何修改）
fn terminal_outcome(task: &ShaderTask) -> StageOutcome {
    match task.stage() {
        Stage::Success => StageOutcome::Succeed,
        Stage::Cancelled => StageOutcome::Fail(FailReason::Cancelled(
            task.error().unwrap_or("cancelled").to_string(),
        )),
        _ => StageOutcome::Fail(FailReason::Internal(
            task.error().unwrap_or("task already failed").to_string(),
        )),
    }
}

/// `Custom/Toon Water` -> `<dir>/Custom_Toon_Water.shader`
pub fn shader_output_path(output_directory: &str, shader_name: &str) -> String {
    let file: String = shader_name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{}/{}.shader", output_directory.trim_end_matches('/'), file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, ScriptedLlmClient, MOCK_SHADER};
    use crate::workflow::ShaderTaskBuilder;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHost {
        calls: Mutex<Vec<ToolCall>>,
        stages: Mutex<Vec<Stage>>,
        fixed_call_id: Option<String>,
        offline: bool,
    }

    impl RecordingHost {
        fn calls(&self) -> Vec<ToolCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolHost for RecordingHost {
        fn connection_id(&self) -> &str {
            "conn-test"
        }

        fn call_id(&self) -> String {
            match &self.fixed_call_id {
                Some(id) => id.clone(),
                None => uuid::Uuid::new_v4().to_string(),
            }
        }

        async fn issue(&self, call: ToolCall) -> Result<(), WorkflowError> {
            if self.offline {
                return Err(WorkflowError::HostUnavailable("editor disconnected".to_string()));
            }
            self.calls.lock().unwrap().push(call);
            Ok(())
        }

        fn progress(&self, task: &ShaderTask) {
            self.stages.lock().unwrap().push(task.stage());
        }
    }

    fn fenced(code: &str) -> String {
        format!("```hlsl\n{code}\n```")
    }

    fn setup(
        llm: Arc<ScriptedLlmClient>,
    ) -> (WorkflowEngine, Arc<RecordingHost>, Arc<Correlator>) {
        setup_with_host(llm, RecordingHost::default())
    }

    fn setup_with_host(
        llm: Arc<ScriptedLlmClient>,
        host: RecordingHost,
    ) -> (WorkflowEngine, Arc<RecordingHost>, Arc<Correlator>) {
        let host = Arc::new(host);
        let correlator = Arc::new(Correlator::new());
        let ctx = EngineContext::new(
            ModelSet::uniform(llm),
            Arc::clone(&correlator),
            EngineSettings {
                compile_timeout: Duration::from_millis(50),
                ..EngineSettings::default()
            },
        );
        (WorkflowEngine::new(ctx, host.clone()), host, correlator)
    }

    #[tokio::test]
    async fn test_advance_suspends_on_compile() {
        let llm = Arc::new(ScriptedLlmClient::new(["analysis".to_string(), fenced(MOCK_SHADER)]));
        let (engine, host, correlator) = setup(llm);
        let mut task = ShaderTaskBuilder::new("s", "unlit color").build().unwrap();

        let suspension = match engine.advance(&mut task).await {
            StageOutcome::Suspend(s) => s,
            other => panic!("expected suspension, got {other:?}"),
        };
        assert_eq!(task.stage(), Stage::AwaitingCompile);
        assert_eq!(task.pending_call(), Some(suspension.id()));
        assert_eq!(task.shader_name(), "Custom/MockUnlit");

        let calls = host.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, COMPILE_TOOL);
        assert_eq!(calls[0].arguments["shader_name"], "Custom/MockUnlit");
        assert!(correlator.is_pending(suspension.key()));
    }

    #[tokio::test]
    async fn test_generation_error_fails_without_retry() {
        let llm = Arc::new(ScriptedLlmClient::new(["analysis"]));
        llm.push_error(LlmError::Timeout(120));
        let (engine, host, _) = setup(llm);
        let mut task = ShaderTaskBuilder::new("s", "fire").build().unwrap();

        let outcome = engine.advance(&mut task).await;
        assert!(matches!(
            outcome,
            StageOutcome::Fail(FailReason::StageFailed { stage: Stage::Generate, .. })
        ));
        assert_eq!(task.stage(), Stage::Fail);
        assert_eq!(task.retry_count(), 0);
        assert_eq!(task.generated_code(), "");
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_correlation_fails_as_internal() {
        let llm = Arc::new(ScriptedLlmClient::new(["analysis".to_string(), fenced(MOCK_SHADER)]));
        let host = RecordingHost {
            fixed_call_id: Some("call-1".to_string()),
            ..RecordingHost::default()
        };
        let (engine, host, correlator) = setup_with_host(llm, host);
        let foreign = CorrelationKey::tool_call("call-1");
        let _other = correlator
            .expect(foreign.clone(), Owner::new("conn-other", "other-task"))
            .unwrap();
        let mut task = ShaderTaskBuilder::new("s", "unlit").build().unwrap();

        let outcome = engine.advance(&mut task).await;
        let StageOutcome::Fail(reason) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(reason.code(), "INTERNAL_ERROR");
        assert_eq!(task.stage(), Stage::Fail);
        assert_eq!(task.retry_count(), 0);
        assert_eq!(task.pending_call(), None);
        assert!(host.calls().is_empty());

        // 只剩另一个任务的条目，且未被触碰
        assert_eq!(correlator.pending_count(), 1);
        assert!(correlator.is_pending(&foreign));
        assert_eq!(correlator.cancel_task(task.id(), "cleanup"), 0);
    }

    #[tokio::test]
    async fn test_host_unavailable_expires_entry_without_retry() {
        let llm = Arc::new(ScriptedLlmClient::new(["analysis".to_string(), fenced(MOCK_SHADER)]));
        let host = RecordingHost {
            offline: true,
            ..RecordingHost::default()
        };
        let (engine, host, correlator) = setup_with_host(llm, host);
        let mut task = ShaderTaskBuilder::new("s", "unlit").build().unwrap();

        let outcome = engine.advance(&mut task).await;
        match outcome {
            StageOutcome::Fail(FailReason::HostUnavailable(message)) => {
                assert_eq!(message, "editor disconnected")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(task.stage(), Stage::Fail);
        assert_eq!(task.retry_count(), 0);
        assert!(task.error_history().is_empty());
        assert_eq!(task.pending_call(), None);
        assert!(host.calls().is_empty());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fix_limit_terminates_task() {
        let broken = "Shader \"Broken\" { }";
        let llm = Arc::new(ScriptedLlmClient::new([
            "analysis".to_string(),
            fenced(broken),
            fenced(broken),
            fenced(broken),
            fenced(broken),
        ]));
        let (engine, host, _) = setup(llm.clone());
        let mut task = ShaderTaskBuilder::new("s", "anything").build().unwrap();

        let outcome = engine.advance(&mut task).await;
        match outcome {
            StageOutcome::Fail(FailReason::FixLimitExceeded { iterations, .. }) => {
                assert_eq!(iterations, 3)
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(task.stage(), Stage::Fail);
        assert!(task.error().unwrap().contains("after 3 fix attempts"));
        assert_eq!(llm.calls(), 5);
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_task_is_returned_unchanged() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        let (engine, host, _) = setup(llm.clone());
        let mut task = ShaderTaskBuilder::new("s", "anything").build().unwrap();
        task.cancel("stop");
        let snapshot = task.clone();

        let outcome = engine.advance(&mut task).await;
        assert!(matches!(outcome, StageOutcome::Fail(FailReason::Cancelled(_))));
        let outcome = engine.resume(&mut task, Resolution::TimedOut).await;
        assert!(matches!(outcome, StageOutcome::Fail(FailReason::Cancelled(_))));

        assert_eq!(task.stage(), snapshot.stage());
        assert_eq!(task.error(), snapshot.error());
        assert_eq!(llm.calls(), 0);
        assert!(host.stages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compile_timeout_consumes_retry() {
        let llm = Arc::new(ScriptedLlmClient::new([
            "analysis".to_string(),
            fenced(MOCK_SHADER),
            fenced(MOCK_SHADER),
        ]));
        let (engine, host, correlator) = setup(llm);
        let mut task = ShaderTaskBuilder::new("s", "unlit").build().unwrap();

        let StageOutcome::Suspend(suspension) = engine.advance(&mut task).await else {
            panic!("expected suspension");
        };
        let resolution = engine.wait(suspension).await;
        assert_eq!(resolution, Resolution::TimedOut);

        let outcome = engine.resume(&mut task, resolution).await;
        assert!(matches!(outcome, StageOutcome::Suspend(_)));
        assert_eq!(task.retry_count(), 1);
        assert!(task.error_history()[0].contains("timed out"));
        assert_eq!(host.calls().len(), 2);
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_drive_cancelled_while_suspended() {
        let llm = Arc::new(ScriptedLlmClient::new(["analysis".to_string(), fenced(MOCK_SHADER)]));
        let host = Arc::new(RecordingHost::default());
        let correlator = Arc::new(Correlator::new());
        let ctx = EngineContext::new(
            ModelSet::uniform(llm),
            Arc::clone(&correlator),
            EngineSettings::default(),
        );
        let engine = WorkflowEngine::new(ctx, host.clone());
        let mut task = ShaderTaskBuilder::new("s", "unlit").build().unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome = engine.drive(&mut task, &token).await;
        assert!(matches!(outcome, StageOutcome::Fail(FailReason::Cancelled(_))));
        assert_eq!(task.stage(), Stage::Cancelled);
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(host.calls().len(), 1);
    }

    #[test]
    fn test_shader_output_path() {
        assert_eq!(
            shader_output_path("Assets/Shaders/", "Custom/Toon Water"),
            "Assets/Shaders/Custom_Toon_Water.shader"
        );
    }
}
