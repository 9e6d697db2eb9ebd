//! 本地文件形式的题目存储
//!
//! `{root}/{unit_id}/{item_id}.json`，同一道题重复写入会覆盖，
//! finalize 阶段重跑不会产生重复记录。

use async_trait::async_trait;
use std::path::PathBuf;

use crate::clients::ItemSink;
use crate::error::{PipelineError, Result};
use crate::infrastructure::fs_atomic::{sanitize_id, write_atomic};
use crate::models::item::GeneratedItem;

pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ItemSink for FileSink {
    async fn store(&self, unit_id: &str, item: &GeneratedItem) -> Result<String> {
        let path = self
            .root
            .join(sanitize_id(unit_id))
            .join(format!("{}.json", sanitize_id(&item.item_id)));
        let bytes = serde_json::to_vec_pretty(item)?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|e| PipelineError::storage(path.display(), e))?;
        Ok(format!("{}/{}", unit_id, item.item_id))
    }
}
