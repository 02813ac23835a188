//! 着色器生成工作流：阶段状态机、任务状态、结构校验、提示词与引擎

pub mod builder;
pub mod engine;
pub mod graph;
pub mod prompts;
pub mod task;
pub mod types;
pub mod validation;

pub use builder::ShaderTaskBuilder;
pub use engine::{EngineContext, EngineSettings, ToolCall, ToolHost, WorkflowEngine, COMPILE_TOOL};
pub use graph::{transition, StageEvent, TransitionError};
pub use task::{ShaderTask, TaskInput};
pub use types::*;
pub use validation::{ValidationGate, Verdict};
