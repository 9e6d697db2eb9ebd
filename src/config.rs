use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::services::duplicate_gate::GatePolicy;

/// 程序配置文件
///
/// 加载顺序：默认值 → TOML 配置文件（可选）→ 环境变量
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 同时处理的知识点数量
    pub max_concurrent_units: usize,
    /// 知识点 TOML 文件存放目录
    pub atoms_dir: String,
    /// 检查点、任务记录、批量提交记录的根目录
    pub data_dir: String,
    /// 最终题目与拒绝日志的输出目录
    pub output_dir: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 日志过滤规则（RUST_LOG 优先）
    pub log_filter: String,
    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    /// 主模型重试耗尽后依次尝试的备用模型
    pub llm_fallback_models: Vec<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// 单次同步调用超时（秒）
    pub request_timeout_secs: u64,
    // --- 批处理 API 配置 ---
    /// 为空时沿用 LLM 的地址与密钥
    pub batch_api_base_url: String,
    pub batch_api_key: String,
    pub batch_completion_window: String,
    pub poll_interval_secs: u64,
    /// 轮询总超时（秒）
    pub poll_timeout_secs: u64,
    // --- 重试 ---
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    // --- 去重门控 ---
    pub gate: GatePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_units: 4,
            atoms_dir: "atoms".to_string(),
            data_dir: "data".to_string(),
            output_dir: "output".to_string(),
            verbose_logging: false,
            log_filter: "info".to_string(),
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
            llm_fallback_models: Vec::new(),
            temperature: 0.3,
            max_tokens: 4096,
            request_timeout_secs: 120,
            batch_api_base_url: String::new(),
            batch_api_key: String::new(),
            batch_completion_window: "24h".to_string(),
            poll_interval_secs: 30,
            poll_timeout_secs: 24 * 60 * 60,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            gate: GatePolicy::default(),
        }
    }
}

impl Config {
    /// 默认值叠加环境变量
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// 读取 TOML 配置文件，再叠加环境变量
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::storage(path.display(), e))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config.with_env_overrides())
    }

    /// 有配置文件就读文件，没有就只用环境变量
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    fn with_env_overrides(self) -> Self {
        let default = self;
        Self {
            max_concurrent_units: env_parse("MAX_CONCURRENT_UNITS").unwrap_or(default.max_concurrent_units),
            atoms_dir: std::env::var("ATOMS_DIR").unwrap_or(default.atoms_dir),
            data_dir: std::env::var("DATA_DIR").unwrap_or(default.data_dir),
            output_dir: std::env::var("OUTPUT_DIR").unwrap_or(default.output_dir),
            verbose_logging: env_parse("VERBOSE_LOGGING").unwrap_or(default.verbose_logging),
            log_filter: std::env::var("LOG_FILTER").unwrap_or(default.log_filter),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(default.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(default.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(default.llm_model_name),
            llm_fallback_models: std::env::var("LLM_FALLBACK_MODEL")
                .ok()
                .map(|v| split_list(&v))
                .unwrap_or(default.llm_fallback_models),
            temperature: env_parse("LLM_TEMPERATURE").unwrap_or(default.temperature),
            max_tokens: env_parse("LLM_MAX_TOKENS").unwrap_or(default.max_tokens),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS").unwrap_or(default.request_timeout_secs),
            batch_api_base_url: std::env::var("BATCH_API_BASE_URL").unwrap_or(default.batch_api_base_url),
            batch_api_key: std::env::var("BATCH_API_KEY").unwrap_or(default.batch_api_key),
            batch_completion_window: std::env::var("BATCH_COMPLETION_WINDOW").unwrap_or(default.batch_completion_window),
            poll_interval_secs: env_parse("POLL_INTERVAL_SECS").unwrap_or(default.poll_interval_secs),
            poll_timeout_secs: env_parse("POLL_TIMEOUT_SECS").unwrap_or(default.poll_timeout_secs),
            retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS").unwrap_or(default.retry_max_attempts),
            retry_base_delay_ms: default.retry_base_delay_ms,
            retry_max_delay_ms: default.retry_max_delay_ms,
            gate: default.gate,
        }
    }

    /// 基本合法性检查
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_units == 0 {
            return Err(PipelineError::Config("max_concurrent_units 必须大于 0".to_string()));
        }
        if self.poll_interval_secs == 0 {
            return Err(PipelineError::Config("poll_interval_secs 必须大于 0".to_string()));
        }
        if self.gate.skeleton_cap == 0 {
            return Err(PipelineError::Config("gate.skeleton_cap 必须大于 0".to_string()));
        }
        Ok(())
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("checkpoints")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("jobs")
    }

    pub fn batches_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("batches")
    }

    pub fn items_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_dir).join("items")
    }

    pub fn reject_log_path(&self) -> PathBuf {
        PathBuf::from(&self.output_dir).join("rejected.log")
    }

    pub fn effective_batch_base_url(&self) -> &str {
        if self.batch_api_base_url.is_empty() {
            &self.llm_api_base_url
        } else {
            &self.batch_api_base_url
        }
    }

    pub fn effective_batch_api_key(&self) -> &str {
        if self.batch_api_key.is_empty() {
            &self.llm_api_key
        } else {
            &self.batch_api_key
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
