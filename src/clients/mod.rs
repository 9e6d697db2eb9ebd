//! 外部协作方 - 客户端层
//!
//! 核心流程只依赖这里的 trait；具体实现（OpenAI 兼容接口、本地文件）
//! 可以在测试中整体替换为 mock。

pub mod batch_client;
pub mod file_sink;
pub mod llm_client;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;
use crate::models::batch::{BatchRequest, BatchResultLine, ExternalJob};
use crate::models::item::GeneratedItem;

pub use batch_client::OpenAiBatchClient;
pub use file_sink::FileSink;
pub use llm_client::OpenAiProvider;

/// 一次推理请求
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prompt {
    pub system: Option<String>,
    pub user: String,
    /// 图片 URL，追加到用户消息
    pub imgs: Vec<String>,
}

impl Prompt {
    pub fn new(system: Option<&str>, user: impl Into<String>) -> Self {
        Self {
            system: system.map(String::from),
            user: user.into(),
            imgs: Vec::new(),
        }
    }

    pub fn with_imgs(mut self, imgs: Option<&[String]>) -> Self {
        self.imgs = imgs.map(|i| i.to_vec()).unwrap_or_default();
        self
    }
}

/// 推理调用参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvokeOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// 调用方给定的超时，超时按可重试错误处理
    pub timeout: Duration,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 4096,
            timeout: Duration::from_secs(120),
        }
    }
}

impl InvokeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

/// 同步推理服务
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// 用于日志与错误信息
    fn name(&self) -> &str;

    async fn invoke(&self, prompt: &Prompt, options: &InvokeOptions) -> Result<String>;
}

/// 异步批处理服务
#[async_trait]
pub trait BatchService: Send + Sync {
    /// 上传请求文件，返回外部文件 ID
    async fn upload(&self, requests: &[BatchRequest]) -> Result<String>;

    /// 以已上传文件发起批处理，返回外部作业 ID
    async fn submit(&self, file_id: &str, metadata: &BTreeMap<String, String>) -> Result<String>;

    async fn status(&self, external_job_id: &str) -> Result<ExternalJob>;

    async fn download(&self, external_job_id: &str) -> Result<Vec<BatchResultLine>>;

    /// 外部服务上近期的作业（含已结束的），按元数据标签过滤
    async fn list_in_flight(&self, filter: &BTreeMap<String, String>) -> Result<Vec<ExternalJob>>;
}

/// 最终题目的持久化协作方
#[async_trait]
pub trait ItemSink: Send + Sync {
    /// 存储一道题，返回存储侧的 ID
    async fn store(&self, unit_id: &str, item: &GeneratedItem) -> Result<String>;
}

/// 元数据是否包含过滤条件中的全部键值
pub fn metadata_matches(metadata: &BTreeMap<String, String>, filter: &BTreeMap<String, String>) -> bool {
    filter
        .iter()
        .all(|(k, v)| metadata.get(k).map(|m| m == v).unwrap_or(false))
}
