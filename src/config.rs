//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TINT__*` 覆盖（双下划线表示嵌套，如 `TINT__WORKFLOW__MAX_RETRIES=5`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub log: LogSection,
}

/// [server] 段：WebSocket 监听地址与会话过期时间
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 无连接会话的过期时间（秒）
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_session_timeout_secs() -> u64 {
    3600
}

/// [llm] 段：OpenAI 兼容端点与三种角色的模型名
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    pub base_url: Option<String>,
    /// 未设置时依次读取 LLM_API_KEY、OPENAI_API_KEY
    pub api_key: Option<String>,
    #[serde(default = "default_router_model")]
    pub router_model: String,
    #[serde(default = "default_code_model")]
    pub code_model: String,
    #[serde(default = "default_vl_model")]
    pub vl_model: String,
    #[serde(default = "default_code_temperature")]
    pub code_temperature: f32,
    #[serde(default)]
    pub router_temperature: f32,
    #[serde(default = "default_vision_temperature")]
    pub vision_temperature: f32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            router_model: default_router_model(),
            code_model: default_code_model(),
            vl_model: default_vl_model(),
            code_temperature: default_code_temperature(),
            router_temperature: 0.0,
            vision_temperature: default_vision_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl LlmSection {
    /// 配置中的 key 优先，其次环境变量；占位符视为未配置
    pub fn resolve_api_key(&self) -> Option<String> {
        let usable = |k: &String| !k.is_empty() && k != "sk-your-api-key-here";
        self.api_key
            .clone()
            .filter(usable)
            .or_else(|| std::env::var("LLM_API_KEY").ok().filter(usable))
            .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(usable))
    }
}

fn default_router_model() -> String {
    "qwen-turbo".to_string()
}

fn default_code_model() -> String {
    "qwen-max".to_string()
}

fn default_vl_model() -> String {
    "qwen-vl-plus".to_string()
}

fn default_code_temperature() -> f32 {
    0.2
}

fn default_vision_temperature() -> f32 {
    0.5
}

fn default_request_timeout_secs() -> u64 {
    120
}

/// [workflow] 段：重试上限、修复轮数、外部往返超时
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    /// 编译失败后的最大重试次数（会话可覆盖）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 每次生成后结构校验修复的最大轮数
    #[serde(default = "default_max_fix_iterations")]
    pub max_fix_iterations: u32,
    #[serde(default = "default_compile_timeout_secs")]
    pub compile_timeout_secs: u64,
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
    #[serde(default = "default_error_history_limit")]
    pub error_history_limit: usize,
    /// 拼接对话上下文时取最近多少条消息
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
    #[serde(default = "default_output_directory")]
    pub output_directory: String,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_fix_iterations: default_max_fix_iterations(),
            compile_timeout_secs: default_compile_timeout_secs(),
            confirm_timeout_secs: default_confirm_timeout_secs(),
            error_history_limit: default_error_history_limit(),
            max_context_messages: default_max_context_messages(),
            output_directory: default_output_directory(),
        }
    }
}

impl WorkflowSection {
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_fix_iterations() -> u32 {
    3
}

fn default_compile_timeout_secs() -> u64 {
    30
}

fn default_confirm_timeout_secs() -> u64 {
    120
}

fn default_error_history_limit() -> usize {
    10
}

fn default_max_context_messages() -> usize {
    10
}

fn default_output_directory() -> String {
    "Assets/Shaders/Generated".to_string()
}

/// [log] 段
#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 从 config 目录加载配置，环境变量 TINT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TINT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TINT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.workflow.max_retries, 3);
        assert_eq!(cfg.workflow.max_fix_iterations, 3);
        assert_eq!(cfg.workflow.compile_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.llm.code_model, "qwen-max");
        assert_eq!(cfg.server.bind_addr, "127.0.0.1:8765");
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[workflow]\nmax_retries = 5\ncompile_timeout_secs = 10\n\n[llm]\ncode_model = \"gpt-4o\""
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.workflow.max_retries, 5);
        assert_eq!(cfg.workflow.compile_timeout_secs, 10);
        assert_eq!(cfg.workflow.max_fix_iterations, 3);
        assert_eq!(cfg.llm.code_model, "gpt-4o");
        assert_eq!(cfg.llm.router_model, "qwen-turbo");
    }

    #[test]
    fn test_placeholder_api_key_is_ignored() {
        let section = LlmSection {
            api_key: Some("sk-your-api-key-here".to_string()),
            ..LlmSection::default()
        };
        // 占位符被过滤后回落到环境变量
        if std::env::var("LLM_API_KEY").is_err() && std::env::var("OPENAI_API_KEY").is_err() {
            assert!(section.resolve_api_key().is_none());
        }
    }
}
