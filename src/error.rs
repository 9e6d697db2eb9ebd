use std::fmt::Display;
use thiserror::Error;

use crate::models::batch::BatchState;
use crate::models::job::JobStatus;
use crate::models::phase::Phase;

/// 流水线错误
///
/// 分类决定处理方式：外部服务错误与超时可重试，
/// 前置缺失与检查点写入失败对本次运行是致命的。
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 阶段顺序违规，补齐前置阶段之前无法重试
    #[error("前置检查点缺失: 单元 {unit_id} 的阶段 {phase} 需要 {missing}")]
    PrerequisiteNotMet {
        unit_id: String,
        phase: Phase,
        missing: Phase,
    },

    #[error("外部服务错误 ({service}): {message}")]
    ExternalService { service: String, message: String },

    #[error("外部服务超时 ({service}): 超过 {timeout_ms}ms")]
    ExternalTimeout { service: String, timeout_ms: u64 },

    #[error("解析失败 ({context}): {message}")]
    Parse { context: String, message: String },

    /// 检查点未确认落盘，必须中止
    #[error("检查点写入失败 (单元 {unit_id}, 阶段 {phase}): {source}")]
    CheckpointWrite {
        unit_id: String,
        phase: Phase,
        #[source]
        source: std::io::Error,
    },

    #[error("检查点不存在: 单元 {unit_id} 阶段 {phase}")]
    CheckpointNotFound { unit_id: String, phase: Phase },

    #[error("阶段产出不匹配: 期望 {expected}, 实际 {actual}")]
    PayloadMismatch { expected: Phase, actual: Phase },

    #[error("检查点归属不符: 读取单元 {expected} 的阶段 {phase}，记录属于 {actual}")]
    UnitMismatch {
        expected: String,
        actual: String,
        phase: Phase,
    },

    #[error("非法状态转换 (提交 {submission_id}): {from} → {to}")]
    InvalidTransition {
        submission_id: String,
        from: BatchState,
        to: BatchState,
    },

    #[error("范围 {scope} 已有进行中的提交 {submission_id}")]
    SubmissionConflict {
        scope: String,
        submission_id: String,
    },

    #[error("批量提交不存在: {0}")]
    SubmissionNotFound(String),

    #[error("任务不存在: {0}")]
    JobNotFound(String),

    #[error("任务 {job_id} 当前状态为 {status}，不能执行 {action}")]
    InvalidJobState {
        job_id: String,
        status: JobStatus,
        action: String,
    },

    /// 阶段未达到最低产出
    #[error("阶段 {phase} 失败 (单元 {unit_id}): {message}")]
    PhaseFailed {
        unit_id: String,
        phase: Phase,
        message: String,
    },

    #[error("已取消")]
    Cancelled,

    #[error("存储错误 ({path}): {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),
}

impl PipelineError {
    /// 是否属于瞬时错误（可退避重试）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::ExternalService { .. } | PipelineError::ExternalTimeout { .. }
        )
    }

    /// 续跑时是否会自动重新尝试（续跑从最后确认的检查点重新进入）
    pub fn resumable(&self) -> bool {
        !matches!(
            self,
            PipelineError::PrerequisiteNotMet { .. }
                | PipelineError::Config(_)
                | PipelineError::PayloadMismatch { .. }
                | PipelineError::UnitMismatch { .. }
        )
    }

    /// 该错误是否发生在某个阶段内
    pub fn phase(&self) -> Option<Phase> {
        match self {
            PipelineError::PrerequisiteNotMet { phase, .. }
            | PipelineError::CheckpointWrite { phase, .. }
            | PipelineError::CheckpointNotFound { phase, .. }
            | PipelineError::UnitMismatch { phase, .. }
            | PipelineError::PhaseFailed { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

// ========== 便捷构造函数 ==========

impl PipelineError {
    /// 创建外部服务错误
    pub fn external(service: impl Into<String>, message: impl Display) -> Self {
        PipelineError::ExternalService {
            service: service.into(),
            message: message.to_string(),
        }
    }

    /// 创建解析错误
    pub fn parse(context: impl Into<String>, message: impl Display) -> Self {
        PipelineError::Parse {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// 创建存储错误
    pub fn storage(path: impl Display, source: std::io::Error) -> Self {
        PipelineError::Storage {
            path: path.to_string(),
            source,
        }
    }

    /// 创建阶段失败错误
    pub fn phase_failed(unit_id: impl Into<String>, phase: Phase, message: impl Display) -> Self {
        PipelineError::PhaseFailed {
            unit_id: unit_id.into(),
            phase,
            message: message.to_string(),
        }
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(err: toml::de::Error) -> Self {
        PipelineError::parse("TOML", err)
    }
}

/// 流水线结果类型
pub type Result<T> = std::result::Result<T, PipelineError>;
