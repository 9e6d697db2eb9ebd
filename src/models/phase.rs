//! 阶段定义
//!
//! 流水线阶段的固定顺序与静态前置依赖表

use serde::{Deserialize, Serialize};
use std::fmt;

/// 流水线阶段
///
/// 声明顺序即执行顺序：enrich → plan → generate → validate → finalize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// 知识点扩充
    Enrich,
    /// 出题规划
    Plan,
    /// 批量生成
    Generate,
    /// 逐题校验
    Validate,
    /// 落库
    Finalize,
}

impl Phase {
    /// 全部阶段（按执行顺序）
    pub const ALL: [Phase; 5] = [
        Phase::Enrich,
        Phase::Plan,
        Phase::Generate,
        Phase::Validate,
        Phase::Finalize,
    ];

    pub fn first() -> Self {
        Phase::Enrich
    }

    pub fn last() -> Self {
        Phase::Finalize
    }

    /// 在执行顺序中的位置（从 0 开始）
    pub fn index(self) -> usize {
        self as usize
    }

    /// 获取标准名称（同时也是检查点文件名）
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Enrich => "enrich",
            Phase::Plan => "plan",
            Phase::Generate => "generate",
            Phase::Validate => "validate",
            Phase::Finalize => "finalize",
        }
    }

    /// 从名称解析阶段（精确匹配）
    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim() {
            "enrich" => Some(Phase::Enrich),
            "plan" => Some(Phase::Plan),
            "generate" => Some(Phase::Generate),
            "validate" => Some(Phase::Validate),
            "finalize" => Some(Phase::Finalize),
            _ => None,
        }
    }

    /// 运行该阶段前必须已存在的检查点
    pub fn prerequisites(self) -> &'static [Phase] {
        match self {
            Phase::Enrich => &[],
            Phase::Plan => &[Phase::Enrich],
            Phase::Generate => &[Phase::Enrich, Phase::Plan],
            Phase::Validate => &[Phase::Generate],
            Phase::Finalize => &[Phase::Validate],
        }
    }

    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn previous(self) -> Option<Self> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    /// 是否走异步批量接口
    pub fn uses_batch(self) -> bool {
        matches!(self, Phase::Generate)
    }

    /// 闭区间 [from, to] 内的阶段
    pub fn range(from: Phase, to: Phase) -> Vec<Phase> {
        Self::ALL
            .iter()
            .copied()
            .filter(|p| *p >= from && *p <= to)
            .collect()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 运行目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "phase", rename_all = "snake_case")]
pub enum PhaseTarget {
    /// 从起点（或续跑点）一直跑到最后一个阶段
    All,
    /// 从起点（或续跑点）跑到指定阶段（含）
    Through(Phase),
    /// 只跑指定阶段
    Only(Phase),
}

impl PhaseTarget {
    /// 目标区间的终点
    pub fn end(self) -> Phase {
        match self {
            PhaseTarget::All => Phase::last(),
            PhaseTarget::Through(p) | PhaseTarget::Only(p) => p,
        }
    }

    /// 解析命令行写法：`all` / `through:<phase>` / `only:<phase>` / `<phase>`
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s == "all" {
            return Some(PhaseTarget::All);
        }
        match s.split_once(':') {
            Some(("through", p)) => Phase::from_name(p).map(PhaseTarget::Through),
            Some(("only", p)) => Phase::from_name(p).map(PhaseTarget::Only),
            Some(_) => None,
            None => Phase::from_name(s).map(PhaseTarget::Through),
        }
    }
}

impl fmt::Display for PhaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseTarget::All => f.write_str("all"),
            PhaseTarget::Through(p) => write!(f, "through:{}", p),
            PhaseTarget::Only(p) => write!(f, "only:{}", p),
        }
    }
}

/// 单个工作单元在一次运行中的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "phase", rename_all = "snake_case")]
pub enum UnitState {
    NotStarted,
    PhaseDone(Phase),
    AllPhasesDone,
    FailedAt(Phase),
}

impl UnitState {
    /// 由已提交的最高阶段推导状态
    pub fn from_highest(highest: Option<Phase>) -> Self {
        match highest {
            None => UnitState::NotStarted,
            Some(p) if p == Phase::last() => UnitState::AllPhasesDone,
            Some(p) => UnitState::PhaseDone(p),
        }
    }

    /// 续跑时的有效起点：`FailedAt(k)` 视为 `PhaseDone(k-1)`
    pub fn resume_from(self) -> Option<Phase> {
        match self {
            UnitState::NotStarted => Some(Phase::first()),
            UnitState::PhaseDone(p) => p.next(),
            UnitState::AllPhasesDone => None,
            UnitState::FailedAt(p) => Some(p),
        }
    }
}
