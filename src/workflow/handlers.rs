//! 各阶段的默认实现 - 流程层
//!
//! | 阶段     | 外部调用            | 最低产出       |
//! |----------|---------------------|----------------|
//! | enrich   | 同步推理            | -              |
//! | plan     | 同步推理            | ≥1 个槽位      |
//! | generate | 异步批处理 + 门控   | ≥1 道接受的题  |
//! | validate | 同步推理（逐题）    | ≥1 道通过的题  |
//! | finalize | 题目存储            | ≥1 道已存储    |
//!
//! 单题级别的错误只记入产出，不让整个阶段失败，除非低于最低产出。

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clients::ItemSink;
use crate::error::{PipelineError, Result};
use crate::models::batch::{BatchRequest, BatchScope};
use crate::models::checkpoint::{
    EnrichOutput, FinalizeOutput, GenerateOutput, PhasePayload, PhaseState, PlanOutput, PlanSlot,
    ValidateOutput,
};
use crate::models::item::{DistanceLevel, Exemplar, GeneratedItem, ItemContent, ItemFailure};
use crate::models::phase::Phase;
use crate::services::batch_manager::BatchLifecycleManager;
use crate::services::duplicate_gate::{CandidatePool, DuplicateGate};
use crate::services::inference::{parse_json_reply, FallbackInference};
use crate::services::prompts::{PromptSource, Verdict};
use crate::services::reject_log::RejectLog;
use crate::workflow::phase_flow::PhaseHandler;
use crate::workflow::unit_ctx::UnitCtx;

fn missing_input(ctx: &UnitCtx, phase: Phase, missing: Phase) -> PipelineError {
    PipelineError::PrerequisiteNotMet {
        unit_id: ctx.unit_id().to_string(),
        phase,
        missing,
    }
}

// ========== enrich ==========

pub struct EnrichHandler {
    inference: Arc<FallbackInference>,
    prompts: Arc<dyn PromptSource>,
}

impl EnrichHandler {
    pub fn new(inference: Arc<FallbackInference>, prompts: Arc<dyn PromptSource>) -> Self {
        Self { inference, prompts }
    }
}

#[async_trait]
impl PhaseHandler for EnrichHandler {
    fn phase(&self) -> Phase {
        Phase::Enrich
    }

    async fn run(&self, ctx: &UnitCtx, _state: &PhaseState) -> Result<PhasePayload> {
        let prompt = self.prompts.enrich(&ctx.atom);
        let knowledge: serde_json::Value = self.inference.invoke_json(&prompt, "enrich").await?;
        Ok(PhasePayload::Enrich(EnrichOutput { knowledge }))
    }
}

// ========== plan ==========

#[derive(Debug, Deserialize)]
struct PlanReply {
    #[serde(default)]
    slots: Vec<PlanSlot>,
}

pub struct PlanHandler {
    inference: Arc<FallbackInference>,
    prompts: Arc<dyn PromptSource>,
}

impl PlanHandler {
    pub fn new(inference: Arc<FallbackInference>, prompts: Arc<dyn PromptSource>) -> Self {
        Self { inference, prompts }
    }
}

/// 槽位 ID 补齐并去重；引用了不存在的范例时去掉引用
fn normalize_slots(ctx: &UnitCtx, slots: Vec<PlanSlot>) -> Vec<PlanSlot> {
    let mut seen = HashSet::new();
    slots
        .into_iter()
        .enumerate()
        .map(|(idx, mut slot)| {
            if slot.slot_id.trim().is_empty() {
                slot.slot_id = format!("slot-{}", idx + 1);
            }
            if !seen.insert(slot.slot_id.clone()) {
                slot.slot_id = format!("{}-{}", slot.slot_id, idx + 1);
                seen.insert(slot.slot_id.clone());
            }
            if let Some(ex_id) = &slot.exemplar_id {
                if ctx.atom.exemplar(ex_id).is_none() {
                    warn!("{} 槽位 {} 引用了不存在的范例 {}", ctx, slot.slot_id, ex_id);
                    slot.exemplar_id = None;
                }
            }
            slot
        })
        .collect()
}

#[async_trait]
impl PhaseHandler for PlanHandler {
    fn phase(&self) -> Phase {
        Phase::Plan
    }

    async fn run(&self, ctx: &UnitCtx, state: &PhaseState) -> Result<PhasePayload> {
        let enrich = state
            .enrich()
            .ok_or_else(|| missing_input(ctx, Phase::Plan, Phase::Enrich))?;

        let prompt = self.prompts.plan(&ctx.atom, &enrich.knowledge);
        let reply: PlanReply = self.inference.invoke_json(&prompt, "plan").await?;
        let slots = normalize_slots(ctx, reply.slots);

        if slots.is_empty() {
            return Err(PipelineError::phase_failed(
                ctx.unit_id(),
                Phase::Plan,
                "模型没有给出任何出题槽位",
            ));
        }
        info!("{} 规划了 {} 个槽位", ctx, slots.len());
        Ok(PhasePayload::Plan(PlanOutput { slots }))
    }
}

// ========== generate ==========

pub struct GenerateHandler {
    batches: Arc<BatchLifecycleManager>,
    gate: DuplicateGate,
    prompts: Arc<dyn PromptSource>,
    reject_log: Arc<RejectLog>,
}

impl GenerateHandler {
    pub fn new(
        batches: Arc<BatchLifecycleManager>,
        gate: DuplicateGate,
        prompts: Arc<dyn PromptSource>,
        reject_log: Arc<RejectLog>,
    ) -> Self {
        Self {
            batches,
            gate,
            prompts,
            reject_log,
        }
    }
}

/// 槽位指定了距离档位时以槽位为准，否则沿用范例自身的档位
fn effective_exemplar(exemplar: &Exemplar, slot_level: DistanceLevel) -> Exemplar {
    let mut exemplar = exemplar.clone();
    if slot_level != DistanceLevel::Unset {
        exemplar.distance_level = slot_level;
    }
    exemplar
}

#[async_trait]
impl PhaseHandler for GenerateHandler {
    fn phase(&self) -> Phase {
        Phase::Generate
    }

    async fn run(&self, ctx: &UnitCtx, state: &PhaseState) -> Result<PhasePayload> {
        let enrich = state
            .enrich()
            .ok_or_else(|| missing_input(ctx, Phase::Generate, Phase::Enrich))?;
        let plan = state
            .plan()
            .ok_or_else(|| missing_input(ctx, Phase::Generate, Phase::Plan))?;

        let slots: HashMap<&str, &PlanSlot> =
            plan.slots.iter().map(|s| (s.slot_id.as_str(), s)).collect();

        let build_requests = || {
            plan.slots
                .iter()
                .map(|slot| {
                    let exemplar = slot.exemplar_id.as_deref().and_then(|id| ctx.atom.exemplar(id));
                    let prompt = self.prompts.generate(&ctx.atom, &enrich.knowledge, slot, exemplar);
                    BatchRequest {
                        custom_id: slot.slot_id.clone(),
                        system: prompt.system,
                        prompt: prompt.user,
                    }
                })
                .collect::<Vec<BatchRequest>>()
        };

        let parse = |line: &crate::models::batch::BatchResultLine| -> Result<GeneratedItem> {
            let slot = slots.get(line.custom_id.as_str()).ok_or_else(|| {
                PipelineError::parse("generate", format!("未知的槽位 {}", line.custom_id))
            })?;
            let body = line.body.as_deref().unwrap_or_default();
            let content: ItemContent = parse_json_reply(body, &line.custom_id)?;
            if content.stem.trim().is_empty() {
                return Err(PipelineError::parse(&line.custom_id, "题干为空"));
            }
            Ok(GeneratedItem::new(
                slot.slot_id.clone(),
                content,
                slot.exemplar_id.clone(),
                slot.distance_level,
            ))
        };

        let scope = BatchScope::new(&ctx.job_id, ctx.unit_id(), Phase::Generate);
        let run = self
            .batches
            .run_to_completion(&scope, build_requests, &ctx.cancel, parse)
            .await?;

        let exemplars: HashMap<String, Exemplar> = run
            .items
            .iter()
            .filter_map(|item| {
                let ex_id = item.source_exemplar_id.as_deref()?;
                let exemplar = ctx.atom.exemplar(ex_id)?;
                Some((item.item_id.clone(), effective_exemplar(exemplar, item.distance_level)))
            })
            .collect();

        let mut pool = CandidatePool::new();
        let outcome = self
            .gate
            .filter(run.items, &mut pool, |item| exemplars.get(&item.item_id));

        if !outcome.rejected.is_empty() {
            self.reject_log.write(ctx.unit_id(), &outcome.rejected).await?;
        }
        for failure in &run.failures {
            debug!("{} 结果 {} 无法使用: {}", ctx, failure.item_id, failure.error);
        }

        info!(
            "{} 生成结果: 接受 {} / 拒绝 {} / 解析失败 {}",
            ctx,
            outcome.accepted.len(),
            outcome.rejected.len(),
            run.failures.len()
        );

        if outcome.accepted.is_empty() {
            let reason = format!(
                "没有题目通过门控 (拒绝 {}, 解析失败 {})",
                outcome.rejected.len(),
                run.failures.len()
            );
            // 同样的结果重放只会得到同样的失败，续跑时重新提交
            self.batches.discard(&run.submission_id, &reason).await?;
            return Err(PipelineError::phase_failed(ctx.unit_id(), Phase::Generate, reason));
        }

        Ok(PhasePayload::Generate(GenerateOutput {
            accepted: outcome.accepted,
            rejected: outcome.rejected,
            parse_failures: run.failures,
            submission_id: Some(run.submission_id),
        }))
    }
}

// ========== validate ==========

pub struct ValidateHandler {
    inference: Arc<FallbackInference>,
    prompts: Arc<dyn PromptSource>,
}

impl ValidateHandler {
    pub fn new(inference: Arc<FallbackInference>, prompts: Arc<dyn PromptSource>) -> Self {
        Self { inference, prompts }
    }
}

#[async_trait]
impl PhaseHandler for ValidateHandler {
    fn phase(&self) -> Phase {
        Phase::Validate
    }

    async fn run(&self, ctx: &UnitCtx, state: &PhaseState) -> Result<PhasePayload> {
        let generate = state
            .generate()
            .ok_or_else(|| missing_input(ctx, Phase::Validate, Phase::Generate))?;

        let mut passed = Vec::new();
        let mut failed = Vec::new();
        let mut last_transient = None;

        for item in &generate.accepted {
            if ctx.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let prompt = self.prompts.validate(&ctx.atom, item);
            match self.inference.invoke_json::<Verdict>(&prompt, &item.item_id).await {
                Ok(verdict) if verdict.valid => passed.push(item.clone()),
                Ok(verdict) => {
                    debug!("{} 题目 {} 未通过校验: {}", ctx, item.item_id, verdict.reason);
                    failed.push(ItemFailure::new(&item.item_id, format!("校验未通过: {}", verdict.reason)));
                }
                Err(e) => {
                    warn!("{} 题目 {} 校验出错: {}", ctx, item.item_id, e);
                    failed.push(ItemFailure::new(&item.item_id, &e));
                    if e.is_retryable() {
                        last_transient = Some(e);
                    }
                }
            }
        }

        info!("{} 校验结果: 通过 {} / 未通过 {}", ctx, passed.len(), failed.len());

        if passed.is_empty() {
            // 全部因服务不可用而失败时保留可重试的分类
            if let Some(e) = last_transient {
                return Err(e);
            }
            return Err(PipelineError::phase_failed(
                ctx.unit_id(),
                Phase::Validate,
                format!("没有题目通过校验 (共 {} 道)", generate.accepted.len()),
            ));
        }

        Ok(PhasePayload::Validate(ValidateOutput { passed, failed }))
    }
}

// ========== finalize ==========

pub struct FinalizeHandler {
    sink: Arc<dyn ItemSink>,
}

impl FinalizeHandler {
    pub fn new(sink: Arc<dyn ItemSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl PhaseHandler for FinalizeHandler {
    fn phase(&self) -> Phase {
        Phase::Finalize
    }

    async fn run(&self, ctx: &UnitCtx, state: &PhaseState) -> Result<PhasePayload> {
        let validate = state
            .validate()
            .ok_or_else(|| missing_input(ctx, Phase::Finalize, Phase::Validate))?;

        let mut stored_ids = Vec::new();
        let mut failed = Vec::new();
        for item in &validate.passed {
            match self.sink.store(ctx.unit_id(), item).await {
                Ok(id) => stored_ids.push(id),
                Err(e) => {
                    warn!("{} 题目 {} 存储失败: {}", ctx, item.item_id, e);
                    failed.push(ItemFailure::new(&item.item_id, &e));
                }
            }
        }

        info!("{} 已存储 {} 道题", ctx, stored_ids.len());
        if stored_ids.is_empty() {
            return Err(PipelineError::phase_failed(
                ctx.unit_id(),
                Phase::Finalize,
                format!("没有题目存储成功 (失败 {})", failed.len()),
            ));
        }
        Ok(PhasePayload::Finalize(FinalizeOutput { stored_ids, failed }))
    }
}
