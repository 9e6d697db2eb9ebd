//! 批量提交存储 - 基础设施层
//!
//! `{root}/{submission_id}.json`，每次状态转换后整体重写，
//! 崩溃后以最后确认的状态为准。

use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{PipelineError, Result};
use crate::infrastructure::fs_atomic::{is_temp_file, sanitize_id, write_atomic};
use crate::models::batch::{BatchScope, BatchSubmission};

#[derive(Debug, Clone)]
pub struct BatchStore {
    root: PathBuf,
}

impl BatchStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn submission_path(&self, submission_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_id(submission_id)))
    }

    pub async fn save(&self, submission: &BatchSubmission) -> Result<()> {
        let path = self.submission_path(&submission.submission_id);
        let bytes = serde_json::to_vec_pretty(submission)?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|e| PipelineError::storage(path.display(), e))
    }

    pub async fn load(&self, submission_id: &str) -> Result<BatchSubmission> {
        let path = self.submission_path(submission_id);
        let content = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::SubmissionNotFound(submission_id.to_string()));
            }
            Err(e) => return Err(PipelineError::storage(path.display(), e)),
        };
        serde_json::from_slice(&content)
            .map_err(|e| PipelineError::parse(format!("批量提交 {}", path.display()), e))
    }

    async fn list_all(&self) -> Result<Vec<BatchSubmission>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::storage(self.root.display(), e)),
        };

        let mut submissions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::storage(self.root.display(), e))?
        {
            let path = entry.path();
            if is_temp_file(&path) || path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)
                .await
                .map_err(|e| PipelineError::storage(path.display(), e))?;
            match serde_json::from_slice::<BatchSubmission>(&bytes) {
                Ok(sub) => submissions.push(sub),
                Err(e) => tracing::warn!("跳过无法解析的批量提交 {}: {}", path.display(), e),
            }
        }
        submissions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(submissions)
    }

    /// 某个范围下的全部提交（按创建时间）
    pub async fn list_for_scope(&self, scope: &BatchScope) -> Result<Vec<BatchSubmission>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|s| &s.scope == scope)
            .collect())
    }

    /// 范围内唯一的非终态提交
    pub async fn find_active(&self, scope: &BatchScope) -> Result<Option<BatchSubmission>> {
        Ok(self
            .list_for_scope(scope)
            .await?
            .into_iter()
            .rev()
            .find(|s| s.is_active()))
    }

    /// 删除某任务下某单元的全部提交记录
    pub async fn delete_for_unit(&self, job_id: &str, unit_id: &str) -> Result<usize> {
        let mut removed = 0;
        for sub in self.list_all().await? {
            if sub.scope.job_id == job_id && sub.scope.unit_id == unit_id {
                let path = self.submission_path(&sub.submission_id);
                fs::remove_file(&path)
                    .await
                    .map_err(|e| PipelineError::storage(path.display(), e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
