//! OpenAI 兼容的批处理客户端
//!
//! 走 Files + Batches 接口：
//! - `POST /files`（purpose=batch）上传 JSONL
//! - `POST /batches` 发起作业，`GET /batches/{id}` 查询
//! - `GET /files/{output_file_id}/content` 下载结果
//! - `GET /batches?limit=N` 列出近期作业

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clients::{metadata_matches, BatchService};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::models::batch::{BatchRequest, BatchResultLine, ExternalJob, ExternalJobState};

const SERVICE: &str = "batch";
const LIST_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchObject {
    id: String,
    status: String,
    input_file_id: String,
    #[serde(default)]
    output_file_id: Option<String>,
    #[serde(default)]
    error_file_id: Option<String>,
    #[serde(default)]
    metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct BatchList {
    data: Vec<BatchObject>,
}

impl BatchObject {
    fn into_external(self) -> Result<ExternalJob> {
        let state = ExternalJobState::from_name(&self.status).ok_or_else(|| {
            PipelineError::parse("批处理状态", format!("未知状态: {}", self.status))
        })?;
        Ok(ExternalJob {
            external_job_id: self.id,
            external_file_id: self.input_file_id,
            state,
            metadata: self.metadata.unwrap_or_default(),
        })
    }
}

/// OpenAI 兼容批处理客户端
pub struct OpenAiBatchClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model_name: String,
    temperature: f32,
    max_tokens: u32,
    completion_window: String,
    timeout_ms: u64,
}

impl OpenAiBatchClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP 客户端初始化失败: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.effective_batch_base_url().trim_end_matches('/').to_string(),
            api_key: config.effective_batch_api_key().to_string(),
            model_name: config.llm_model_name.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            completion_window: config.batch_completion_window.clone(),
            timeout_ms: config.request_timeout_secs * 1000,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 每个请求一行 chat completions 调用
    fn encode_jsonl(&self, requests: &[BatchRequest]) -> Result<String> {
        let mut lines = Vec::with_capacity(requests.len());
        for req in requests {
            let mut messages = Vec::new();
            if let Some(system) = &req.system {
                messages.push(json!({"role": "system", "content": system}));
            }
            messages.push(json!({"role": "user", "content": req.prompt}));

            let line = json!({
                "custom_id": req.custom_id,
                "method": "POST",
                "url": "/v1/chat/completions",
                "body": {
                    "model": self.model_name,
                    "messages": messages,
                    "temperature": self.temperature,
                    "max_tokens": self.max_tokens,
                }
            });
            lines.push(serde_json::to_string(&line)?);
        }
        Ok(lines.join("\n"))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("批处理接口返回 {}: {}", status, body);
            return Err(PipelineError::external(SERVICE, format!("HTTP {}: {}", status, body)));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| PipelineError::parse("批处理响应", e))
    }
}

fn map_reqwest_error(e: reqwest::Error, timeout_ms: u64) -> PipelineError {
    if e.is_timeout() {
        PipelineError::ExternalTimeout {
            service: SERVICE.to_string(),
            timeout_ms,
        }
    } else {
        PipelineError::external(SERVICE, e)
    }
}

/// 解析结果 JSONL；单行解析失败记为该行的错误，不影响其他行
pub fn decode_result_lines(content: &str) -> Vec<BatchResultLine> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| match serde_json::from_str::<Value>(line) {
            Ok(value) => {
                let custom_id = value["custom_id"]
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| format!("line-{}", idx));
                let body = value["response"]["body"]["choices"][0]["message"]["content"]
                    .as_str()
                    .map(String::from);
                let error = if value["error"].is_null() {
                    None
                } else {
                    Some(value["error"].to_string())
                };
                let error = match (&body, error) {
                    (None, None) => Some(format!(
                        "响应缺少内容 (status_code={})",
                        value["response"]["status_code"]
                    )),
                    (_, e) => e,
                };
                BatchResultLine { custom_id, body, error }
            }
            Err(e) => BatchResultLine {
                custom_id: format!("line-{}", idx),
                body: None,
                error: Some(format!("结果行无法解析: {}", e)),
            },
        })
        .collect()
}

#[async_trait]
impl BatchService for OpenAiBatchClient {
    async fn upload(&self, requests: &[BatchRequest]) -> Result<String> {
        let jsonl = self.encode_jsonl(requests)?;
        debug!("上传批处理文件: {} 行, {} 字节", requests.len(), jsonl.len());

        let part = Part::bytes(jsonl.into_bytes())
            .file_name("batch.jsonl")
            .mime_str("application/jsonl")
            .map_err(|e| PipelineError::external(SERVICE, e))?;
        let form = Form::new().text("purpose", "batch").part("file", part);

        let file: FileObject = self
            .send_json(self.http.post(self.url("/files")).multipart(form))
            .await?;
        Ok(file.id)
    }

    async fn submit(&self, file_id: &str, metadata: &BTreeMap<String, String>) -> Result<String> {
        let body = json!({
            "input_file_id": file_id,
            "endpoint": "/v1/chat/completions",
            "completion_window": self.completion_window,
            "metadata": metadata,
        });
        let batch: BatchObject = self
            .send_json(self.http.post(self.url("/batches")).json(&body))
            .await?;
        Ok(batch.id)
    }

    async fn status(&self, external_job_id: &str) -> Result<ExternalJob> {
        let batch: BatchObject = self
            .send_json(self.http.get(self.url(&format!("/batches/{}", external_job_id))))
            .await?;
        batch.into_external()
    }

    async fn download(&self, external_job_id: &str) -> Result<Vec<BatchResultLine>> {
        let batch: BatchObject = self
            .send_json(self.http.get(self.url(&format!("/batches/{}", external_job_id))))
            .await?;

        let output_file_id = match (batch.output_file_id, batch.error_file_id) {
            (Some(id), _) => id,
            (None, Some(err_id)) => err_id,
            (None, None) => {
                return Err(PipelineError::external(
                    SERVICE,
                    format!("作业 {} 没有输出文件", external_job_id),
                ))
            }
        };

        let response = self
            .http
            .get(self.url(&format!("/files/{}/content", output_file_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout_ms))?;
        if !response.status().is_success() {
            return Err(PipelineError::external(
                SERVICE,
                format!("下载结果失败: HTTP {}", response.status()),
            ));
        }
        let content = response.text().await.map_err(|e| map_reqwest_error(e, self.timeout_ms))?;
        Ok(decode_result_lines(&content))
    }

    async fn list_in_flight(&self, filter: &BTreeMap<String, String>) -> Result<Vec<ExternalJob>> {
        let list: BatchList = self
            .send_json(self.http.get(self.url(&format!("/batches?limit={}", LIST_LIMIT))))
            .await?;

        let mut jobs = Vec::new();
        for batch in list.data {
            match batch.into_external() {
                Ok(job) if metadata_matches(&job.metadata, filter) => jobs.push(job),
                Ok(_) => {}
                Err(e) => warn!("跳过无法识别的批处理作业: {}", e),
            }
        }
        Ok(jobs)
    }
}
