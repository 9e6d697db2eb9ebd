//! 批量提交数据
//!
//! 状态严格单调：pending → file_uploaded → submitted → results_downloaded → completed，
//! 任一非终态都可以直接进入 failed；终态不可再变。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{PipelineError, Result};
use crate::models::phase::Phase;

/// 批量提交的本地状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    FileUploaded,
    Submitted,
    ResultsDownloaded,
    Completed,
    Failed,
}

impl BatchState {
    /// 主链上的位置，failed 不在主链上
    fn rank(self) -> Option<u8> {
        match self {
            BatchState::Pending => Some(0),
            BatchState::FileUploaded => Some(1),
            BatchState::Submitted => Some(2),
            BatchState::ResultsDownloaded => Some(3),
            BatchState::Completed => Some(4),
            BatchState::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Completed | BatchState::Failed)
    }

    /// 只允许前进一步，或从非终态进入 failed
    pub fn can_transition_to(self, next: BatchState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == BatchState::Failed {
            return true;
        }
        match (self.rank(), next.rank()) {
            (Some(from), Some(to)) => to == from + 1,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchState::Pending => "pending",
            BatchState::FileUploaded => "file_uploaded",
            BatchState::Submitted => "submitted",
            BatchState::ResultsDownloaded => "results_downloaded",
            BatchState::Completed => "completed",
            BatchState::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 批量提交的归属范围：同一范围内同时最多一个非终态提交
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchScope {
    pub job_id: String,
    pub unit_id: String,
    pub phase: Phase,
}

impl BatchScope {
    pub fn new(job_id: impl Into<String>, unit_id: impl Into<String>, phase: Phase) -> Self {
        Self {
            job_id: job_id.into(),
            unit_id: unit_id.into(),
            phase,
        }
    }
}

impl fmt::Display for BatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.job_id, self.unit_id, self.phase)
    }
}

/// 批量请求中的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub custom_id: String,
    #[serde(default)]
    pub system: Option<String>,
    pub prompt: String,
}

/// 批量结果中的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResultLine {
    pub custom_id: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// 外部批处理作业的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalJobState {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelling,
    Cancelled,
}

impl ExternalJobState {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "validating" => Some(ExternalJobState::Validating),
            "in_progress" => Some(ExternalJobState::InProgress),
            "finalizing" => Some(ExternalJobState::Finalizing),
            "completed" => Some(ExternalJobState::Completed),
            "failed" => Some(ExternalJobState::Failed),
            "expired" => Some(ExternalJobState::Expired),
            "cancelling" => Some(ExternalJobState::Cancelling),
            "cancelled" => Some(ExternalJobState::Cancelled),
            _ => None,
        }
    }

    /// 外部作业已不可能再产出结果
    pub fn is_dead(self) -> bool {
        matches!(
            self,
            ExternalJobState::Failed | ExternalJobState::Expired | ExternalJobState::Cancelled
        )
    }
}

/// 外部服务列出的批处理作业
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalJob {
    pub external_job_id: String,
    pub external_file_id: String,
    pub state: ExternalJobState,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// 一次异步批量提交
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSubmission {
    pub submission_id: String,
    pub scope: BatchScope,
    pub state: BatchState,
    pub external_file_id: Option<String>,
    pub external_job_id: Option<String>,
    /// 提交时嵌入、由外部服务原样回传的标签
    pub metadata: BTreeMap<String, String>,
    pub requests: Vec<BatchRequest>,
    #[serde(default)]
    pub results: Vec<BatchResultLine>,
    #[serde(default)]
    pub error: Option<String>,
    /// 结果已被阶段判为不可用，之后不再复用（状态仍为 completed）
    #[serde(default)]
    pub discarded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchSubmission {
    pub fn new(
        submission_id: impl Into<String>,
        scope: BatchScope,
        requests: Vec<BatchRequest>,
        now: DateTime<Utc>,
    ) -> Self {
        let submission_id = submission_id.into();
        let mut metadata = BTreeMap::new();
        metadata.insert("submission_id".to_string(), submission_id.clone());
        metadata.insert("job_id".to_string(), scope.job_id.clone());
        metadata.insert("unit_id".to_string(), scope.unit_id.clone());
        metadata.insert("phase".to_string(), scope.phase.to_string());

        Self {
            submission_id,
            scope,
            state: BatchState::Pending,
            external_file_id: None,
            external_job_id: None,
            metadata,
            requests,
            results: Vec::new(),
            error: None,
            discarded: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// 推进状态，非法转换返回错误且不修改状态
    pub fn transition(&mut self, next: BatchState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                submission_id: self.submission_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// 已完成且结果仍可复用
    pub fn is_reusable(&self) -> bool {
        self.state == BatchState::Completed && !self.discarded
    }
}
