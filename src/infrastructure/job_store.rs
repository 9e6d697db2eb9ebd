//! 任务存储 - 基础设施层
//!
//! 每个任务一个 JSON 文件：`{root}/{job_id}.json`。
//! 运行方显式持有存储句柄，没有进程级的全局任务表。

use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{PipelineError, Result};
use crate::infrastructure::fs_atomic::{is_temp_file, sanitize_id, write_atomic};
use crate::models::job::Job;

#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_id(job_id)))
    }

    pub async fn save(&self, job: &Job) -> Result<()> {
        let path = self.job_path(&job.job_id);
        let bytes = serde_json::to_vec_pretty(job)?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|e| PipelineError::storage(path.display(), e))
    }

    pub async fn load(&self, job_id: &str) -> Result<Job> {
        let path = self.job_path(job_id);
        let content = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::JobNotFound(job_id.to_string()));
            }
            Err(e) => return Err(PipelineError::storage(path.display(), e)),
        };
        serde_json::from_slice(&content)
            .map_err(|e| PipelineError::parse(format!("任务记录 {}", path.display()), e))
    }

    /// 全部任务，按开始时间倒序；损坏的记录跳过
    pub async fn list(&self) -> Result<Vec<Job>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::storage(self.root.display(), e)),
        };

        let mut jobs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::storage(self.root.display(), e))?
        {
            let path = entry.path();
            if is_temp_file(&path) || path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read(&path)
                .await
                .ok()
                .and_then(|bytes| serde_json::from_slice::<Job>(&bytes).ok());
            match parsed {
                Some(job) => jobs.push(job),
                None => tracing::warn!("跳过无法解析的任务记录: {}", path.display()),
            }
        }

        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(jobs)
    }

    pub async fn delete(&self, job_id: &str) -> Result<()> {
        let path = self.job_path(job_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PipelineError::JobNotFound(job_id.to_string()))
            }
            Err(e) => Err(PipelineError::storage(path.display(), e)),
        }
    }
}
