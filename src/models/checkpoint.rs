//! 检查点数据
//!
//! 各阶段的产出形状不同，用按阶段名打标签的枚举承载，
//! 每个阶段只读取属于自己的变体。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::item::{DistanceLevel, GeneratedItem, ItemFailure, RejectedItem};
use crate::models::phase::Phase;

/// enrich 阶段产出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichOutput {
    /// 模型返回的结构化知识（不透明）
    pub knowledge: serde_json::Value,
}

/// 出题规划中的一个槽位
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSlot {
    pub slot_id: String,
    pub intent: String,
    #[serde(default)]
    pub distance_level: DistanceLevel,
    #[serde(default)]
    pub exemplar_id: Option<String>,
}

/// plan 阶段产出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOutput {
    pub slots: Vec<PlanSlot>,
}

/// generate 阶段产出
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerateOutput {
    pub accepted: Vec<GeneratedItem>,
    #[serde(default)]
    pub rejected: Vec<RejectedItem>,
    #[serde(default)]
    pub parse_failures: Vec<ItemFailure>,
    #[serde(default)]
    pub submission_id: Option<String>,
}

/// validate 阶段产出
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidateOutput {
    pub passed: Vec<GeneratedItem>,
    #[serde(default)]
    pub failed: Vec<ItemFailure>,
}

/// finalize 阶段产出
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FinalizeOutput {
    pub stored_ids: Vec<String>,
    #[serde(default)]
    pub failed: Vec<ItemFailure>,
}

/// 阶段产出（按阶段名打标签）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "data", rename_all = "snake_case")]
pub enum PhasePayload {
    Enrich(EnrichOutput),
    Plan(PlanOutput),
    Generate(GenerateOutput),
    Validate(ValidateOutput),
    Finalize(FinalizeOutput),
}

impl PhasePayload {
    /// 该产出属于哪个阶段
    pub fn phase(&self) -> Phase {
        match self {
            PhasePayload::Enrich(_) => Phase::Enrich,
            PhasePayload::Plan(_) => Phase::Plan,
            PhasePayload::Generate(_) => Phase::Generate,
            PhasePayload::Validate(_) => Phase::Validate,
            PhasePayload::Finalize(_) => Phase::Finalize,
        }
    }
}

/// 检查点记录，写入后不可变，只能整体替换
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase_name: Phase,
    pub unit_of_work_id: String,
    pub payload: PhasePayload,
    pub written_at: DateTime<Utc>,
}

/// 已累积的阶段产出（前序阶段的输出）
#[derive(Debug, Clone, Default)]
pub struct PhaseState {
    outputs: BTreeMap<Phase, PhasePayload>,
}

impl PhaseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, payload: PhasePayload) {
        self.outputs.insert(payload.phase(), payload);
    }

    pub fn get(&self, phase: Phase) -> Option<&PhasePayload> {
        self.outputs.get(&phase)
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.outputs.contains_key(&phase)
    }

    /// 已加载的阶段（按执行顺序）
    pub fn phases(&self) -> Vec<Phase> {
        self.outputs.keys().copied().collect()
    }

    pub fn enrich(&self) -> Option<&EnrichOutput> {
        match self.outputs.get(&Phase::Enrich) {
            Some(PhasePayload::Enrich(out)) => Some(out),
            _ => None,
        }
    }

    pub fn plan(&self) -> Option<&PlanOutput> {
        match self.outputs.get(&Phase::Plan) {
            Some(PhasePayload::Plan(out)) => Some(out),
            _ => None,
        }
    }

    pub fn generate(&self) -> Option<&GenerateOutput> {
        match self.outputs.get(&Phase::Generate) {
            Some(PhasePayload::Generate(out)) => Some(out),
            _ => None,
        }
    }

    pub fn validate(&self) -> Option<&ValidateOutput> {
        match self.outputs.get(&Phase::Validate) {
            Some(PhasePayload::Validate(out)) => Some(out),
            _ => None,
        }
    }
}
