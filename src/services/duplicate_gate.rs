//! 去重门控 - 业务能力层
//!
//! 只负责"这道题能不能进候选池"的判断。`admit` 是纯函数，
//! 池子由调用方持有并在接受后显式插入。

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::models::item::{DistanceLevel, Exemplar, GeneratedItem, RejectReason, RejectedItem};

/// 某个距离档位下与范例题比较的规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistanceRules {
    pub reject_fingerprint: bool,
    pub reject_skeleton: bool,
    pub reject_numeric: bool,
}

impl DistanceRules {
    const fn new(reject_fingerprint: bool, reject_skeleton: bool, reject_numeric: bool) -> Self {
        Self {
            reject_fingerprint,
            reject_skeleton,
            reject_numeric,
        }
    }
}

/// 门控策略（阈值是配置，不是硬约束）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatePolicy {
    /// 同骨架题目在池中的上限
    pub skeleton_cap: usize,
    pub near: DistanceRules,
    pub medium: DistanceRules,
    pub far: DistanceRules,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            skeleton_cap: 2,
            near: DistanceRules::new(true, false, false),
            medium: DistanceRules::new(true, true, false),
            far: DistanceRules::new(true, true, true),
        }
    }
}

impl GatePolicy {
    /// unset 与 near 同为最宽松的策略
    pub fn rules_for(&self, level: DistanceLevel) -> DistanceRules {
        match level {
            DistanceLevel::Near | DistanceLevel::Unset => self.near,
            DistanceLevel::Medium => self.medium,
            DistanceLevel::Far => self.far,
        }
    }
}

/// 门控结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject(RejectReason),
}

impl Admission {
    pub fn is_accept(&self) -> bool {
        matches!(self, Admission::Accept)
    }
}

/// 候选池
#[derive(Debug, Clone, Default)]
pub struct CandidatePool {
    fingerprints: HashSet<String>,
    skeleton_counts: HashMap<String, usize>,
    items: Vec<GeneratedItem>,
}

impl CandidatePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_fingerprint(&self, fingerprint: &str) -> bool {
        self.fingerprints.contains(fingerprint)
    }

    pub fn skeleton_count(&self, skeleton: &str) -> usize {
        self.skeleton_counts.get(skeleton).copied().unwrap_or(0)
    }

    pub fn insert(&mut self, item: GeneratedItem) {
        self.fingerprints.insert(item.fingerprint.clone());
        *self.skeleton_counts.entry(item.skeleton.clone()).or_insert(0) += 1;
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[GeneratedItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<GeneratedItem> {
        self.items
    }
}

/// 一批题目过门控后的结果
#[derive(Debug, Clone, Default)]
pub struct GateOutcome {
    pub accepted: Vec<GeneratedItem>,
    pub rejected: Vec<RejectedItem>,
}

/// 去重门控
#[derive(Debug, Clone, Default)]
pub struct DuplicateGate {
    policy: GatePolicy,
}

impl DuplicateGate {
    pub fn new(policy: GatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// 判断单道题能否进入候选池
    ///
    /// 检查顺序：范例距离 → 池内指纹 → 骨架上限
    pub fn admit(
        &self,
        item: &GeneratedItem,
        pool: &CandidatePool,
        exemplar: Option<&Exemplar>,
    ) -> Admission {
        if let Some(exemplar) = exemplar {
            if let Some(reason) = self.check_exemplar(item, exemplar) {
                return Admission::Reject(reason);
            }
        }

        if pool.contains_fingerprint(&item.fingerprint) {
            return Admission::Reject(RejectReason::DuplicateFingerprint);
        }

        let count = pool.skeleton_count(&item.skeleton);
        if count >= self.policy.skeleton_cap {
            return Admission::Reject(RejectReason::SkeletonPoolFull {
                count,
                cap: self.policy.skeleton_cap,
            });
        }

        Admission::Accept
    }

    fn check_exemplar(&self, item: &GeneratedItem, exemplar: &Exemplar) -> Option<RejectReason> {
        let rules = self.policy.rules_for(exemplar.distance_level);
        let signature = exemplar.signature();
        let exemplar_id = exemplar.exemplar_id.clone();

        if rules.reject_fingerprint && item.fingerprint == signature.fingerprint {
            return Some(RejectReason::ExemplarFingerprint { exemplar_id });
        }
        if rules.reject_skeleton && item.skeleton == signature.skeleton {
            return Some(RejectReason::ExemplarSkeleton { exemplar_id });
        }
        if rules.reject_numeric && item.numeric_signature == signature.numeric_signature {
            return Some(RejectReason::ExemplarNumericSignature { exemplar_id });
        }
        None
    }

    /// 整批过门控
    ///
    /// 先按 (指纹, item_id) 排成规范顺序再逐个判断，
    /// 同一批题无论以什么顺序到达，被接受的指纹集合都相同。
    pub fn filter<'a, F>(
        &self,
        mut items: Vec<GeneratedItem>,
        pool: &mut CandidatePool,
        exemplar_of: F,
    ) -> GateOutcome
    where
        F: Fn(&GeneratedItem) -> Option<&'a Exemplar>,
    {
        items.sort_by(|a, b| {
            a.fingerprint
                .cmp(&b.fingerprint)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });

        let mut outcome = GateOutcome::default();
        for item in items {
            match self.admit(&item, pool, exemplar_of(&item)) {
                Admission::Accept => {
                    pool.insert(item.clone());
                    outcome.accepted.push(item);
                }
                Admission::Reject(reason) => {
                    debug!("门控拒绝 {}: {}", item.item_id, reason);
                    outcome.rejected.push(RejectedItem {
                        item_id: item.item_id,
                        fingerprint: item.fingerprint,
                        reason,
                    });
                }
            }
        }
        outcome
    }
}
