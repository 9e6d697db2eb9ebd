//! 检查点存储 - 基础设施层
//!
//! 布局：`{root}/{unit_id}/{phase}.json`，每个阶段一个文件，整体替换写入。

use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{PipelineError, Result};
use crate::infrastructure::fs_atomic::{is_temp_file, sanitize_id, write_atomic};
use crate::models::checkpoint::{PhasePayload, PhaseRecord};
use crate::models::phase::Phase;

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn unit_dir(&self, unit_id: &str) -> PathBuf {
        self.root.join(sanitize_id(unit_id))
    }

    fn record_path(&self, unit_id: &str, phase: Phase) -> PathBuf {
        self.unit_dir(unit_id).join(format!("{}.json", phase.as_str()))
    }

    /// 保存阶段产出
    ///
    /// 返回前记录已经 fsync 并 rename 到位；失败时返回 `CheckpointWrite`，
    /// 调用方必须中止当前单元。
    pub async fn save(
        &self,
        unit_id: &str,
        phase: Phase,
        payload: PhasePayload,
    ) -> Result<PhaseRecord> {
        if payload.phase() != phase {
            return Err(PipelineError::PayloadMismatch {
                expected: phase,
                actual: payload.phase(),
            });
        }

        let record = PhaseRecord {
            phase_name: phase,
            unit_of_work_id: unit_id.to_string(),
            payload,
            written_at: chrono::Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;

        write_atomic(&self.record_path(unit_id, phase), &bytes)
            .await
            .map_err(|source| PipelineError::CheckpointWrite {
                unit_id: unit_id.to_string(),
                phase,
                source,
            })?;

        tracing::debug!("[单元 {}] 检查点已写入: {}", unit_id, phase);
        Ok(record)
    }

    /// 读取阶段记录，不存在返回 `CheckpointNotFound`
    pub async fn load(&self, unit_id: &str, phase: Phase) -> Result<PhaseRecord> {
        let path = self.record_path(unit_id, phase);
        let content = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::CheckpointNotFound {
                    unit_id: unit_id.to_string(),
                    phase,
                });
            }
            Err(e) => return Err(PipelineError::storage(path.display(), e)),
        };

        let record: PhaseRecord = serde_json::from_slice(&content).map_err(|e| {
            PipelineError::parse(format!("检查点 {}", path.display()), e)
        })?;

        if record.payload.phase() != phase {
            return Err(PipelineError::PayloadMismatch {
                expected: phase,
                actual: record.payload.phase(),
            });
        }
        if record.unit_of_work_id != unit_id {
            return Err(PipelineError::UnitMismatch {
                expected: unit_id.to_string(),
                actual: record.unit_of_work_id,
                phase,
            });
        }
        Ok(record)
    }

    pub async fn exists(&self, unit_id: &str, phase: Phase) -> bool {
        fs::try_exists(self.record_path(unit_id, phase))
            .await
            .unwrap_or(false)
    }

    /// 已提交检查点的阶段（按声明顺序），临时文件不计入
    pub async fn completed_phases(&self, unit_id: &str) -> Result<Vec<Phase>> {
        let dir = self.unit_dir(unit_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::storage(dir.display(), e)),
        };

        let mut phases = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::storage(dir.display(), e))?
        {
            let path = entry.path();
            if is_temp_file(&path) {
                continue;
            }
            let phase = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(Phase::from_name);
            if let Some(phase) = phase {
                phases.push(phase);
            }
        }
        phases.sort();
        Ok(phases)
    }

    /// 按声明顺序最靠后的已提交阶段
    pub async fn highest_completed_phase(&self, unit_id: &str) -> Result<Option<Phase>> {
        let phases = self.completed_phases(unit_id).await?;
        Ok(phases.into_iter().max())
    }

    /// 删除单元的全部检查点
    pub async fn delete_unit(&self, unit_id: &str) -> Result<()> {
        let dir = self.unit_dir(unit_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::storage(dir.display(), e)),
        }
    }
}
