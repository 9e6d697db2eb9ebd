//! 阶段编排 - 流程层
//!
//! 核心职责：定义"一个知识点"的完整阶段流程
//!
//! 流程顺序：enrich → plan → generate → validate → finalize
//!
//! - 每个阶段成功后立即写检查点，写入确认之前不会开始下一个阶段
//! - 阶段失败时停在该阶段，不写检查点，之前的检查点保持可续跑
//! - 续跑时从已提交的最高阶段的下一个阶段开始

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{PipelineError, Result};
use crate::infrastructure::checkpoint_store::CheckpointStore;
use crate::models::checkpoint::{PhasePayload, PhaseState};
use crate::models::phase::{Phase, PhaseTarget, UnitState};
use crate::workflow::unit_ctx::UnitCtx;

/// 单个阶段的实现
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    fn phase(&self) -> Phase;

    /// 读取前序阶段的产出，返回本阶段产出；未达到最低产出时返回错误
    async fn run(&self, ctx: &UnitCtx, state: &PhaseState) -> Result<PhasePayload>;
}

/// 单个阶段在本次运行中的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// 本次执行并写入了检查点
    Completed(Phase),
    /// 直接复用已有检查点
    Reused(Phase),
    Failed { phase: Phase, error: String },
}

impl PhaseOutcome {
    pub fn phase(&self) -> Phase {
        match self {
            PhaseOutcome::Completed(p) | PhaseOutcome::Reused(p) => *p,
            PhaseOutcome::Failed { phase, .. } => *phase,
        }
    }
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseOutcome::Completed(p) => write!(f, "{} ✓", p),
            PhaseOutcome::Reused(p) => write!(f, "{} (复用)", p),
            PhaseOutcome::Failed { phase, error } => write!(f, "{} ✗ {}", phase, error),
        }
    }
}

/// 阶段失败
#[derive(Debug)]
pub struct PhaseFailure {
    pub phase: Phase,
    pub error: PipelineError,
}

/// 一个工作单元的一次运行
#[derive(Debug)]
pub struct UnitRun {
    pub unit_id: String,
    /// 按执行顺序
    pub outcomes: Vec<PhaseOutcome>,
    /// 运行结束时内存中的阶段产出
    pub state: PhaseState,
    pub failure: Option<PhaseFailure>,
}

impl UnitRun {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// 本次实际执行（非复用）的阶段
    pub fn executed(&self) -> Vec<Phase> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                PhaseOutcome::Completed(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    pub fn unit_state(&self) -> UnitState {
        match &self.failure {
            Some(f) => UnitState::FailedAt(f.phase),
            None => UnitState::from_highest(self.state.phases().into_iter().max()),
        }
    }
}

/// 阶段编排器
///
/// - 按静态前置关系检查检查点
/// - 决定从哪个阶段开始
/// - 只依赖阶段实现（handlers）和检查点存储
pub struct PhaseOrchestrator {
    handlers: BTreeMap<Phase, Arc<dyn PhaseHandler>>,
    store: CheckpointStore,
}

impl PhaseOrchestrator {
    pub fn new(store: CheckpointStore, handlers: Vec<Arc<dyn PhaseHandler>>) -> Self {
        let handlers = handlers.into_iter().map(|h| (h.phase(), h)).collect();
        Self { handlers, store }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// 前置阶段的检查点是否都已提交
    pub async fn check_prerequisites(&self, unit_id: &str, phase: Phase) -> Result<()> {
        for &missing in phase.prerequisites() {
            if !self.store.exists(unit_id, missing).await {
                return Err(PipelineError::PrerequisiteNotMet {
                    unit_id: unit_id.to_string(),
                    phase,
                    missing,
                });
            }
        }
        Ok(())
    }

    /// 把指定阶段的检查点读回内存
    pub async fn load_phase_state(&self, unit_id: &str, phases: &[Phase]) -> Result<PhaseState> {
        let mut state = PhaseState::new();
        for &phase in phases {
            let record = self.store.load(unit_id, phase).await?;
            state.insert(record.payload);
        }
        Ok(state)
    }

    /// 计算本次要执行的阶段区间，以及需要先读回的检查点
    async fn plan_run(
        &self,
        unit_id: &str,
        target: PhaseTarget,
        resume: bool,
    ) -> Result<(Vec<Phase>, Vec<Phase>)> {
        let committed = self.store.completed_phases(unit_id).await?;

        match target {
            PhaseTarget::Only(phase) => {
                let to_load: Vec<Phase> = committed.iter().copied().filter(|p| *p < phase).collect();
                if resume && committed.contains(&phase) {
                    let mut reuse = to_load;
                    reuse.push(phase);
                    return Ok((reuse, Vec::new()));
                }
                Ok((to_load, vec![phase]))
            }
            PhaseTarget::All | PhaseTarget::Through(_) => {
                let end = target.end();
                let start = if resume {
                    let highest = committed.iter().copied().max();
                    UnitState::from_highest(highest).resume_from()
                } else {
                    Some(Phase::first())
                };

                match start {
                    Some(start) if start <= end => {
                        let to_load = committed.iter().copied().filter(|p| *p < start).collect();
                        Ok((to_load, Phase::range(start, end)))
                    }
                    // 已提交的最高阶段已经覆盖目标区间
                    _ => {
                        let to_load = committed.iter().copied().filter(|p| *p <= end).collect();
                        Ok((to_load, Vec::new()))
                    }
                }
            }
        }
    }

    /// 运行一个工作单元
    ///
    /// # 参数
    /// - `target`: 运行目标（all / through / only）
    /// - `resume`: 是否从已有检查点续跑
    ///
    /// # 返回
    /// - `Ok(UnitRun)`：按顺序的阶段结果；阶段失败记录在 `failure` 中
    /// - `Err`：前置缺失、检查点写入失败、取消等必须中止本次运行的错误
    pub async fn run(&self, ctx: &UnitCtx, target: PhaseTarget, resume: bool) -> Result<UnitRun> {
        let unit_id = ctx.unit_id().to_string();
        let (to_load, to_run) = self.plan_run(&unit_id, target, resume).await?;

        let mut state = self.load_phase_state(&unit_id, &to_load).await?;
        let mut outcomes: Vec<PhaseOutcome> = to_load.iter().map(|p| PhaseOutcome::Reused(*p)).collect();

        if !to_load.is_empty() {
            info!("{} 读回检查点: {:?}", ctx, to_load);
        }
        if to_run.is_empty() {
            info!("{} 目标 {} 已全部完成，无需执行", ctx, target);
        }

        let mut failure = None;
        for phase in to_run {
            if ctx.cancel.is_cancelled() {
                warn!("{} 已取消，停止在阶段 {} 之前", ctx, phase);
                return Err(PipelineError::Cancelled);
            }

            self.check_prerequisites(&unit_id, phase).await?;
            let handler = self
                .handlers
                .get(&phase)
                .ok_or_else(|| PipelineError::Config(format!("阶段 {} 没有注册实现", phase)))?;

            info!("{} ▶ 阶段 {}", ctx, phase);
            match handler.run(ctx, &state).await {
                Ok(payload) => {
                    // 检查点确认落盘之后才进入下一阶段
                    self.store.save(&unit_id, phase, payload.clone()).await?;
                    state.insert(payload);
                    outcomes.push(PhaseOutcome::Completed(phase));
                    info!("{} ✓ 阶段 {} 完成", ctx, phase);
                }
                Err(PipelineError::Cancelled) => {
                    warn!("{} 阶段 {} 被取消", ctx, phase);
                    return Err(PipelineError::Cancelled);
                }
                Err(e) => {
                    error!("{} ✗ 阶段 {} 失败: {}", ctx, phase, e);
                    outcomes.push(PhaseOutcome::Failed {
                        phase,
                        error: e.to_string(),
                    });
                    failure = Some(PhaseFailure { phase, error: e });
                    break;
                }
            }
        }

        Ok(UnitRun {
            unit_id,
            outcomes,
            state,
            failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::atom::KnowledgeAtom;
    use crate::models::checkpoint::{EnrichOutput, PlanOutput, PlanSlot};
    use crate::models::item::DistanceLevel;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    /// 计数并可注入一次失败的阶段实现
    struct Counting {
        phase: Phase,
        calls: AtomicUsize,
        fail_next: AtomicBool,
    }

    impl Counting {
        fn new(phase: Phase) -> Arc<Self> {
            Arc::new(Self {
                phase,
                calls: AtomicUsize::new(0),
                fail_next: AtomicBool::new(false),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PhaseHandler for Counting {
        fn phase(&self) -> Phase {
            self.phase
        }

        async fn run(&self, ctx: &UnitCtx, state: &PhaseState) -> Result<PhasePayload> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for p in self.phase.prerequisites() {
                assert!(state.contains(*p), "{} 缺少前序产出 {}", self.phase, p);
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(PipelineError::external("llm", "503"));
            }
            Ok(match self.phase {
                Phase::Enrich => PhasePayload::Enrich(EnrichOutput {
                    knowledge: serde_json::json!({"unit": ctx.unit_id()}),
                }),
                Phase::Plan => PhasePayload::Plan(PlanOutput {
                    slots: vec![PlanSlot {
                        slot_id: "s1".to_string(),
                        intent: "变式".to_string(),
                        distance_level: DistanceLevel::Near,
                        exemplar_id: None,
                    }],
                }),
                Phase::Generate => PhasePayload::Generate(Default::default()),
                Phase::Validate => PhasePayload::Validate(Default::default()),
                Phase::Finalize => PhasePayload::Finalize(Default::default()),
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        handlers: Vec<Arc<Counting>>,
        orchestrator: PhaseOrchestrator,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let handlers: Vec<Arc<Counting>> = Phase::ALL.iter().map(|p| Counting::new(*p)).collect();
            let orchestrator = PhaseOrchestrator::new(
                CheckpointStore::new(dir.path()),
                handlers
                    .iter()
                    .map(|h| h.clone() as Arc<dyn PhaseHandler>)
                    .collect(),
            );
            Self {
                _dir: dir,
                handlers,
                orchestrator,
            }
        }

        fn handler(&self, phase: Phase) -> &Counting {
            &self.handlers[phase.index()]
        }
    }

    fn ctx() -> UnitCtx {
        let atom: KnowledgeAtom =
            toml::from_str("atom_id = \"a\"\ntitle = \"t\"\ncontent = \"c\"\n").unwrap();
        UnitCtx::new("job-1", 1, Arc::new(atom), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_runs_all_phases_in_order() {
        let f = Fixture::new();
        let run = f.orchestrator.run(&ctx(), PhaseTarget::All, false).await.unwrap();
        assert!(run.is_success());
        assert_eq!(run.executed(), Phase::ALL.to_vec());
        assert_eq!(run.unit_state(), UnitState::AllPhasesDone);
    }

    #[tokio::test]
    async fn test_failure_then_resume_reuses_checkpoints() {
        let f = Fixture::new();
        f.handler(Phase::Generate).fail_next.store(true, Ordering::SeqCst);

        let run = f.orchestrator.run(&ctx(), PhaseTarget::All, true).await.unwrap();
        assert_eq!(run.unit_state(), UnitState::FailedAt(Phase::Generate));
        assert!(run.failure.as_ref().unwrap().error.is_retryable());
        assert!(!f.orchestrator.store().exists("a", Phase::Generate).await);

        let run = f.orchestrator.run(&ctx(), PhaseTarget::All, true).await.unwrap();
        assert!(run.is_success());
        assert_eq!(
            run.outcomes[..2],
            [PhaseOutcome::Reused(Phase::Enrich), PhaseOutcome::Reused(Phase::Plan)]
        );
        assert_eq!(f.handler(Phase::Enrich).calls(), 1);
        assert_eq!(f.handler(Phase::Plan).calls(), 1);
        assert_eq!(f.handler(Phase::Generate).calls(), 2);
    }

    #[tokio::test]
    async fn test_resume_past_target_invokes_nothing() {
        let f = Fixture::new();
        f.orchestrator
            .run(&ctx(), PhaseTarget::Through(Phase::Plan), false)
            .await
            .unwrap();
        let run = f
            .orchestrator
            .run(&ctx(), PhaseTarget::Through(Phase::Enrich), true)
            .await
            .unwrap();
        assert!(run.executed().is_empty());
        assert_eq!(run.outcomes, vec![PhaseOutcome::Reused(Phase::Enrich)]);
        assert_eq!(f.handler(Phase::Enrich).calls(), 1);
    }

    #[tokio::test]
    async fn test_only_without_prerequisite_fails() {
        let f = Fixture::new();
        let err = f
            .orchestrator
            .run(&ctx(), PhaseTarget::Only(Phase::Generate), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PrerequisiteNotMet {
                phase: Phase::Generate,
                missing: Phase::Enrich,
                ..
            }
        ));
        assert_eq!(f.handler(Phase::Generate).calls(), 0);
    }

    #[tokio::test]
    async fn test_only_loads_prior_outputs() {
        let f = Fixture::new();
        f.orchestrator
            .run(&ctx(), PhaseTarget::Through(Phase::Plan), false)
            .await
            .unwrap();
        let run = f
            .orchestrator
            .run(&ctx(), PhaseTarget::Only(Phase::Generate), false)
            .await
            .unwrap();
        assert_eq!(run.executed(), vec![Phase::Generate]);
        assert_eq!(f.handler(Phase::Enrich).calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let f = Fixture::new();
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = f.orchestrator.run(&ctx, PhaseTarget::All, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(f.handler(Phase::Enrich).calls(), 0);
    }
}
