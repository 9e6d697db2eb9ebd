use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::models::phase::{Phase, PhaseTarget};

/// 流水线类型标记
pub const PIPELINE_KIND: &str = "atom_to_questions";

/// 任务 / 工作单元状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 续跑模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// 跳过已完成的单元，其余全部再跑
    Remaining,
    /// 只重试失败的单元
    FailedOnly,
}

impl ResumeMode {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "remaining" => Some(ResumeMode::Remaining),
            "failed_only" | "failed-only" => Some(ResumeMode::FailedOnly),
            _ => None,
        }
    }
}

/// 任务参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    /// 本任务覆盖的工作单元（知识点 ID）
    pub unit_ids: Vec<String>,
    pub target: PhaseTarget,
    pub max_concurrent_units: usize,
    #[serde(default)]
    pub source_dir: Option<String>,
}

/// 任务进度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub remaining: usize,
}

/// 失败的工作单元
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub id: String,
    pub error: String,
    /// 出错的阶段（任务级错误时为空）
    #[serde(default)]
    pub phase: Option<Phase>,
    /// 续跑时是否会自动重试
    #[serde(default)]
    pub retryable: bool,
}

/// 顶层任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub pipeline_kind: String,
    pub params: JobParams,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub completed_item_ids: Vec<String>,
    pub failed_items: Vec<FailedItem>,
    /// 跨进程取消标记，运行方在启动每个单元前检查
    #[serde(default)]
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(job_id: impl Into<String>, params: JobParams, now: DateTime<Utc>) -> Self {
        let mut job = Self {
            job_id: job_id.into(),
            pipeline_kind: PIPELINE_KIND.to_string(),
            params,
            status: JobStatus::Running,
            progress: JobProgress::default(),
            completed_item_ids: Vec::new(),
            failed_items: Vec::new(),
            cancel_requested: false,
            started_at: now,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
        };
        job.refresh_progress();
        job
    }

    /// 由完成/失败列表重新计算进度
    pub fn refresh_progress(&mut self) {
        let total = self.params.unit_ids.len();
        let completed = self.completed_item_ids.len();
        let failed = self.failed_items.len();
        self.progress = JobProgress {
            total,
            completed,
            failed,
            remaining: total.saturating_sub(completed + failed),
        };
    }

    pub fn is_completed(&self, unit_id: &str) -> bool {
        self.completed_item_ids.iter().any(|id| id == unit_id)
    }

    pub fn record_completed(&mut self, unit_id: &str) {
        self.failed_items.retain(|f| f.id != unit_id);
        if !self.is_completed(unit_id) {
            self.completed_item_ids.push(unit_id.to_string());
        }
        self.refresh_progress();
    }

    pub fn record_failed(&mut self, failure: FailedItem) {
        self.completed_item_ids.retain(|id| id != &failure.id);
        self.failed_items.retain(|f| f.id != failure.id);
        self.failed_items.push(failure);
        self.refresh_progress();
    }

    /// 根据续跑模式挑出需要再跑的单元，保持原始顺序
    pub fn units_for_resume(&self, mode: ResumeMode) -> Vec<String> {
        match mode {
            ResumeMode::Remaining => self
                .params
                .unit_ids
                .iter()
                .filter(|id| !self.is_completed(id))
                .cloned()
                .collect(),
            ResumeMode::FailedOnly => {
                let failed: HashSet<&str> =
                    self.failed_items.iter().map(|f| f.id.as_str()).collect();
                self.params
                    .unit_ids
                    .iter()
                    .filter(|id| failed.contains(id.as_str()))
                    .cloned()
                    .collect()
            }
        }
    }

    /// 进入续跑：清掉待重试单元的失败记录与终态时间戳
    pub fn reopen(&mut self, retry_ids: &[String]) {
        self.failed_items.retain(|f| !retry_ids.contains(&f.id));
        self.status = JobStatus::Running;
        self.cancel_requested = false;
        self.completed_at = None;
        self.failed_at = None;
        self.cancelled_at = None;
        self.refresh_progress();
    }

    /// 所有单元处理完毕后定终态
    pub fn finish(&mut self, cancelled: bool, now: DateTime<Utc>) {
        self.refresh_progress();
        if cancelled {
            self.status = JobStatus::Cancelled;
            self.cancelled_at = Some(now);
        } else if !self.failed_items.is_empty() || self.progress.remaining > 0 {
            self.status = JobStatus::Failed;
            self.failed_at = Some(now);
        } else {
            self.status = JobStatus::Completed;
            self.completed_at = Some(now);
        }
    }
}
