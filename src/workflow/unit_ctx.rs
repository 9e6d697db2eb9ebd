//! 工作单元上下文
//!
//! 封装"我正在处理哪个任务的哪个知识点"这一信息

use std::fmt::Display;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::models::atom::KnowledgeAtom;

/// 工作单元上下文
///
/// 包含处理单个知识点所需的所有上下文信息
#[derive(Debug, Clone)]
pub struct UnitCtx {
    /// 任务ID
    pub job_id: String,

    /// 单元在任务中的序号（从1开始，仅用于日志显示）
    pub unit_index: usize,

    /// 知识点
    pub atom: Arc<KnowledgeAtom>,

    /// 任务级取消信号
    pub cancel: CancellationToken,
}

impl UnitCtx {
    pub fn new(
        job_id: impl Into<String>,
        unit_index: usize,
        atom: Arc<KnowledgeAtom>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            unit_index,
            atom,
            cancel,
        }
    }

    pub fn unit_id(&self) -> &str {
        &self.atom.atom_id
    }
}

impl Display for UnitCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[任务 {} 单元#{} 知识点#{}]",
            self.job_id, self.unit_index, self.atom.atom_id
        )
    }
}
