//! 拒绝日志 - 业务能力层
//!
//! 只负责"把被门控拒绝的题目追加写入日志文件"，不关心流程

use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::models::item::RejectedItem;

/// 拒绝日志
///
/// 每行一条：`单元 {unit_id} | 题目 {item_id} | {fingerprint} | {reason}`
pub struct RejectLog {
    path: PathBuf,
}

impl RejectLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn write(&self, unit_id: &str, rejected: &[RejectedItem]) -> Result<()> {
        if rejected.is_empty() {
            return Ok(());
        }
        debug!("写入拒绝日志: 单元 {} | {} 条", unit_id, rejected.len());

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::storage(parent.display(), e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PipelineError::storage(self.path.display(), e))?;

        let mut buf = String::new();
        for item in rejected {
            buf.push_str(&format!(
                "单元 {} | 题目 {} | {} | {}\n",
                unit_id, item.item_id, item.fingerprint, item.reason
            ));
        }

        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| PipelineError::storage(self.path.display(), e))?;
        file.flush()
            .await
            .map_err(|e| PipelineError::storage(self.path.display(), e))
    }
}
