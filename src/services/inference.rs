//! 推理调用 - 业务能力层
//!
//! 按顺序尝试多个推理服务，每个服务都套同一个重试策略；
//! 一个服务重试耗尽后换下一个，全部耗尽返回最后一个错误。

use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clients::{InferenceProvider, InvokeOptions, Prompt};
use crate::error::{PipelineError, Result};
use crate::infrastructure::clock::Clock;
use crate::services::retry::RetryPolicy;

pub struct FallbackInference {
    providers: Vec<Arc<dyn InferenceProvider>>,
    retry: RetryPolicy,
    options: InvokeOptions,
    clock: Arc<dyn Clock>,
}

impl FallbackInference {
    pub fn new(
        providers: Vec<Arc<dyn InferenceProvider>>,
        retry: RetryPolicy,
        options: InvokeOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            providers,
            retry,
            options,
            clock,
        }
    }

    pub async fn invoke(&self, prompt: &Prompt) -> Result<String> {
        let mut last_error = PipelineError::Config("没有可用的推理服务".to_string());

        for (idx, provider) in self.providers.iter().enumerate() {
            let result = self
                .retry
                .run(self.clock.as_ref(), provider.name(), || {
                    provider.invoke(prompt, &self.options)
                })
                .await;

            match result {
                Ok(text) => {
                    if idx > 0 {
                        debug!("备用推理服务 {} 调用成功", provider.name());
                    }
                    return Ok(text);
                }
                Err(e) if e.is_retryable() => {
                    warn!("推理服务 {} 重试耗尽: {}", provider.name(), e);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    /// 调用并把回复解析为 JSON
    pub async fn invoke_json<T: DeserializeOwned>(&self, prompt: &Prompt, context: &str) -> Result<T> {
        let text = self.invoke(prompt).await?;
        parse_json_reply(&text, context)
    }
}

/// 去掉 markdown 代码块包裹，取出 JSON 主体
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        // 跳过语言标记（```json）
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }

    let open = trimmed.find(['{', '[']);
    let close = trimmed.rfind(['}', ']']);
    match (open, close) {
        (Some(o), Some(c)) if c > o => &trimmed[o..=c],
        _ => trimmed,
    }
}

pub fn parse_json_reply<T: DeserializeOwned>(text: &str, context: &str) -> Result<T> {
    serde_json::from_str(extract_json(text)).map_err(|e| PipelineError::parse(context, e))
}
