use serde::{Deserialize, Serialize};
use std::fmt;

use crate::services::fingerprint::Signature;

/// 与范例题的距离档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceLevel {
    Near,
    Medium,
    Far,
    #[default]
    Unset,
}

impl DistanceLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            DistanceLevel::Near => "near",
            DistanceLevel::Medium => "medium",
            DistanceLevel::Far => "far",
            DistanceLevel::Unset => "unset",
        }
    }
}

/// 题目内容
///
/// `choices` 的顺序不携带语义，指纹计算时会被规范化排序
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ItemContent {
    pub stem: String,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub analysis: String,
}

/// 生成阶段产出的题目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedItem {
    pub item_id: String,
    pub content: ItemContent,
    pub fingerprint: String,
    pub skeleton: String,
    #[serde(default)]
    pub numeric_signature: String,
    pub source_exemplar_id: Option<String>,
    #[serde(default)]
    pub distance_level: DistanceLevel,
}

impl GeneratedItem {
    /// 由内容构造题目，同时计算指纹、骨架与数值签名
    pub fn new(
        item_id: impl Into<String>,
        content: ItemContent,
        source_exemplar_id: Option<String>,
        distance_level: DistanceLevel,
    ) -> Self {
        let signature = Signature::of(&content);
        Self {
            item_id: item_id.into(),
            content,
            fingerprint: signature.fingerprint,
            skeleton: signature.skeleton,
            numeric_signature: signature.numeric_signature,
            source_exemplar_id,
            distance_level,
        }
    }
}

/// 范例题（距离约束的参照物）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    pub exemplar_id: String,
    pub content: ItemContent,
    #[serde(default)]
    pub distance_level: DistanceLevel,
}

impl Exemplar {
    pub fn signature(&self) -> Signature {
        Signature::of(&self.content)
    }
}

/// 门控拒绝原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// 与池中已有题目指纹相同
    DuplicateFingerprint,
    /// 同骨架题目已达上限
    SkeletonPoolFull { count: usize, cap: usize },
    /// 与范例题指纹相同
    ExemplarFingerprint { exemplar_id: String },
    /// 与范例题骨架相同
    ExemplarSkeleton { exemplar_id: String },
    /// 与范例题数值签名相同
    ExemplarNumericSignature { exemplar_id: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::DuplicateFingerprint => write!(f, "指纹重复"),
            RejectReason::SkeletonPoolFull { count, cap } => {
                write!(f, "同骨架题目已有 {} 道 (上限 {})", count, cap)
            }
            RejectReason::ExemplarFingerprint { exemplar_id } => {
                write!(f, "与范例 {} 指纹相同", exemplar_id)
            }
            RejectReason::ExemplarSkeleton { exemplar_id } => {
                write!(f, "与范例 {} 骨架相同", exemplar_id)
            }
            RejectReason::ExemplarNumericSignature { exemplar_id } => {
                write!(f, "与范例 {} 数值签名相同", exemplar_id)
            }
        }
    }
}

/// 被门控丢弃的题目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedItem {
    pub item_id: String,
    pub fingerprint: String,
    pub reason: RejectReason,
}

/// 单题级别的失败记录（不影响整个阶段）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item_id: String,
    pub error: String,
}

impl ItemFailure {
    pub fn new(item_id: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            item_id: item_id.into(),
            error: error.to_string(),
        }
    }
}
