//! 任务运行器 - 编排层
//!
//! ## 职责
//!
//! 1. **任务生命周期**：创建、持久化、定终态
//! 2. **分批并发**：按 `max_concurrent_units` 分波处理工作单元（Semaphore + tokio::spawn）
//! 3. **取消**：进程内通过 CancellationToken，跨进程通过任务记录里的 `cancel_requested`
//! 4. **续跑**：`remaining` / `failed_only` 两种模式
//! 5. **删除**：删除任务记录，可选同时清理检查点与批量提交记录
//!
//! 每个工作单元结束后任务记录立即落盘，进程崩溃后可以按记录续跑。

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::infrastructure::{BatchStore, Clock, JobStore};
use crate::models::atom::KnowledgeAtom;
use crate::models::job::{FailedItem, Job, JobParams, JobStatus, ResumeMode};
use crate::utils::logging;
use crate::workflow::{PhaseOrchestrator, UnitCtx, UnitRun};

/// 单个工作单元的处理结果
#[derive(Debug)]
enum UnitResult {
    Completed,
    Failed(FailedItem),
    /// 被取消，不计入完成也不计入失败
    Cancelled,
}

/// 任务运行器
pub struct JobRunner {
    jobs: JobStore,
    batches: BatchStore,
    orchestrator: Arc<PhaseOrchestrator>,
    clock: Arc<dyn Clock>,
    /// 已加载的知识点（按 atom_id 索引）
    atoms: BTreeMap<String, Arc<KnowledgeAtom>>,
    /// 本进程内正在运行的任务
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl JobRunner {
    pub fn new(
        jobs: JobStore,
        batches: BatchStore,
        orchestrator: Arc<PhaseOrchestrator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            batches,
            orchestrator,
            clock,
            atoms: BTreeMap::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// 注册可处理的知识点
    pub fn with_atoms(mut self, atoms: Vec<KnowledgeAtom>) -> Self {
        for atom in atoms {
            self.atoms.insert(atom.atom_id.clone(), Arc::new(atom));
        }
        self
    }

    /// 新建任务记录（状态为 running，尚未执行）
    ///
    /// 重复的知识点 ID 只保留第一次出现，同一单元不会被并发处理两次。
    pub async fn create(&self, mut params: JobParams) -> Result<Job> {
        let requested = params.unit_ids.len();
        let mut seen = HashSet::new();
        params.unit_ids.retain(|id| seen.insert(id.clone()));
        if params.unit_ids.len() < requested {
            warn!(
                "知识点列表中有 {} 个重复 ID，已去重",
                requested - params.unit_ids.len()
            );
        }

        if params.unit_ids.is_empty() {
            return Err(PipelineError::Config("任务至少需要一个知识点".to_string()));
        }
        if params.max_concurrent_units == 0 {
            return Err(PipelineError::Config("max_concurrent_units 必须大于 0".to_string()));
        }
        let job = Job::new(Uuid::new_v4().to_string(), params, self.clock.now());
        self.jobs.save(&job).await?;
        info!("[任务 {}] 已创建，共 {} 个知识点", job.job_id, job.progress.total);
        Ok(job)
    }

    /// 启动任务并运行到结束
    ///
    /// `resume = true` 时每个单元从已有检查点续跑
    pub async fn start(&self, params: JobParams, resume: bool) -> Result<Job> {
        let job = self.create(params).await?;
        self.execute(&job.job_id, resume).await
    }

    /// 执行一个已创建的任务，处理其中所有未完成的单元
    pub async fn execute(&self, job_id: &str, resume: bool) -> Result<Job> {
        let job = self.jobs.load(job_id).await?;
        if job.status != JobStatus::Running {
            return Err(PipelineError::InvalidJobState {
                job_id: job.job_id,
                status: job.status,
                action: "execute".to_string(),
            });
        }
        let unit_ids = job.units_for_resume(ResumeMode::Remaining);
        self.drive(job, unit_ids, resume).await
    }

    pub async fn status(&self, job_id: &str) -> Result<Job> {
        self.jobs.load(job_id).await
    }

    /// 按开始时间倒序
    pub async fn list(&self) -> Result<Vec<Job>> {
        self.jobs.list().await
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.active_tokens().contains_key(job_id)
    }

    /// 请求取消一个运行中的任务
    ///
    /// 已在运行的阶段会在下一个检查点处停下，不会再启动新的单元。
    pub async fn cancel(&self, job_id: &str) -> Result<Job> {
        let mut job = self.jobs.load(job_id).await?;
        if job.status != JobStatus::Running {
            return Err(PipelineError::InvalidJobState {
                job_id: job.job_id,
                status: job.status,
                action: "cancel".to_string(),
            });
        }

        job.cancel_requested = true;
        self.jobs.save(&job).await?;

        let token = self.active_tokens().get(job_id).cloned();
        if let Some(token) = token {
            token.cancel();
        }
        warn!("[任务 {}] 已请求取消", job_id);
        Ok(job)
    }

    /// 续跑失败 / 已取消 / 异常中断的任务
    ///
    /// 不可自动重试的失败单元（例如前置缺失）保持失败记录，不再执行。
    pub async fn resume(&self, job_id: &str, mode: ResumeMode) -> Result<Job> {
        let mut job = self.jobs.load(job_id).await?;
        let resumable = match job.status {
            JobStatus::Failed | JobStatus::Cancelled => true,
            // 记录为运行中但不在本进程里，说明上次进程异常退出
            JobStatus::Running => !self.is_active(job_id),
            JobStatus::Completed => false,
        };
        if !resumable {
            return Err(PipelineError::InvalidJobState {
                job_id: job.job_id,
                status: job.status,
                action: "resume".to_string(),
            });
        }

        let unit_ids: Vec<String> = job
            .units_for_resume(mode)
            .into_iter()
            .filter(|id| {
                !job.failed_items
                    .iter()
                    .any(|f| &f.id == id && !f.retryable)
            })
            .collect();

        info!(
            "[任务 {}] 续跑 ({:?})，待处理 {} 个知识点",
            job_id,
            mode,
            unit_ids.len()
        );

        job.reopen(&unit_ids);
        self.jobs.save(&job).await?;
        self.drive(job, unit_ids, true).await
    }

    /// 删除任务记录
    ///
    /// `purge_checkpoints = true` 时同时删除该任务各单元的检查点与批量提交记录
    pub async fn delete(&self, job_id: &str, purge_checkpoints: bool) -> Result<()> {
        if self.is_active(job_id) {
            let job = self.jobs.load(job_id).await?;
            return Err(PipelineError::InvalidJobState {
                job_id: job.job_id,
                status: job.status,
                action: "delete".to_string(),
            });
        }

        let job = self.jobs.load(job_id).await?;
        if purge_checkpoints {
            for unit_id in &job.params.unit_ids {
                self.orchestrator.store().delete_unit(unit_id).await?;
                let removed = self.batches.delete_for_unit(job_id, unit_id).await?;
                info!(
                    "[任务 {}] 已清理知识点 {} 的检查点和 {} 条批量提交记录",
                    job_id, unit_id, removed
                );
            }
        }
        self.jobs.delete(job_id).await?;
        info!("[任务 {}] 记录已删除", job_id);
        Ok(())
    }

    // ========== 内部实现 ==========

    fn active_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        // 锁只保护一个 HashMap，被毒化时里面的数据仍然可用
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, job: &Job) -> Result<CancellationToken> {
        let mut active = self.active_tokens();
        if active.contains_key(&job.job_id) {
            return Err(PipelineError::InvalidJobState {
                job_id: job.job_id.clone(),
                status: job.status,
                action: "start".to_string(),
            });
        }
        let token = CancellationToken::new();
        active.insert(job.job_id.clone(), token.clone());
        Ok(token)
    }

    fn unregister(&self, job_id: &str) {
        self.active_tokens().remove(job_id);
    }

    async fn drive(&self, mut job: Job, unit_ids: Vec<String>, resume: bool) -> Result<Job> {
        let token = self.register(&job)?;
        let result = self.run_waves(&mut job, unit_ids, resume, &token).await;
        self.unregister(&job.job_id);

        if let Err(e) = result {
            // 记录写不下去时只能如实返回，任务保持 running，之后可按崩溃续跑
            error!("[任务 {}] ❌ 运行中止: {}", job.job_id, e);
            return Err(e);
        }

        job.finish(token.is_cancelled(), self.clock.now());
        self.jobs.save(&job).await?;
        logging::print_final_stats(&job);
        Ok(job)
    }

    /// 分波处理：每波最多 `max_concurrent_units` 个单元，一波结束再开始下一波
    async fn run_waves(
        &self,
        job: &mut Job,
        unit_ids: Vec<String>,
        resume: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        let wave_size = job.params.max_concurrent_units.max(1);
        let semaphore = Arc::new(Semaphore::new(wave_size));
        let total = unit_ids.len();
        let total_waves = total.div_ceil(wave_size);

        logging::log_startup(&job.job_id, &job.params.target, wave_size);
        logging::log_units_loaded(total, wave_size);

        for wave_start in (0..total).step_by(wave_size) {
            if self.cancel_observed(job, token).await? {
                break;
            }

            let wave_end = (wave_start + wave_size).min(total);
            let wave_num = wave_start / wave_size + 1;
            logging::log_wave_start(wave_num, total_waves, wave_start + 1, wave_end, total);

            let mut handles = Vec::new();
            for unit_id in &unit_ids[wave_start..wave_end] {
                if self.cancel_observed(job, token).await? {
                    break;
                }

                let unit_index = job
                    .params
                    .unit_ids
                    .iter()
                    .position(|id| id == unit_id)
                    .map_or(0, |i| i + 1);

                let Some(atom) = self.atoms.get(unit_id).cloned() else {
                    error!("[任务 {}] 知识点 {} 未加载", job.job_id, unit_id);
                    job.record_failed(FailedItem {
                        id: unit_id.clone(),
                        error: format!("知识点 {} 未加载", unit_id),
                        phase: None,
                        retryable: true,
                    });
                    self.persist(job).await?;
                    continue;
                };

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Config(e.to_string()))?;
                let ctx = UnitCtx::new(job.job_id.clone(), unit_index, atom, token.child_token());
                let orchestrator = self.orchestrator.clone();
                let target = job.params.target;

                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    orchestrator.run(&ctx, target, resume).await
                });
                handles.push((unit_id.clone(), handle));
            }

            // 等待本波所有单元，按结束先后逐个落盘
            let mut wave_ok = 0;
            let wave_len = handles.len();
            let mut pending: FuturesUnordered<_> = handles
                .into_iter()
                .map(|(unit_id, handle)| async move { (unit_id, handle.await) })
                .collect();
            while let Some((unit_id, joined)) = pending.next().await {
                let result = match joined {
                    Ok(run) => classify(&unit_id, run),
                    Err(e) => {
                        error!("[任务 {}] 知识点 {} 任务执行失败: {}", job.job_id, unit_id, e);
                        UnitResult::Failed(FailedItem {
                            id: unit_id.clone(),
                            error: e.to_string(),
                            phase: None,
                            retryable: true,
                        })
                    }
                };

                match result {
                    UnitResult::Completed => {
                        wave_ok += 1;
                        job.record_completed(&unit_id);
                    }
                    UnitResult::Failed(item) => {
                        warn!(
                            "[任务 {}] 知识点 {} 失败 (阶段 {}，续跑{}重试): {}",
                            job.job_id,
                            unit_id,
                            item.phase.map_or("-".to_string(), |p| p.to_string()),
                            if item.retryable { "会" } else { "不会" },
                            item.error
                        );
                        job.record_failed(item);
                    }
                    UnitResult::Cancelled => {
                        warn!("[任务 {}] 知识点 {} 已取消", job.job_id, unit_id);
                    }
                }
                self.persist(job).await?;
            }

            logging::log_wave_complete(wave_num, wave_ok, wave_len);
        }

        Ok(())
    }

    /// 取消检查：进程内信号或者其他进程写入的取消标记
    async fn cancel_observed(&self, job: &mut Job, token: &CancellationToken) -> Result<bool> {
        if token.is_cancelled() {
            return Ok(true);
        }
        let stored = self.jobs.load(&job.job_id).await?;
        if stored.cancel_requested {
            job.cancel_requested = true;
            token.cancel();
            warn!("[任务 {}] 检测到取消标记，不再启动新的知识点", job.job_id);
            return Ok(true);
        }
        Ok(false)
    }

    /// 保存任务记录，保留其他进程写入的取消标记
    async fn persist(&self, job: &mut Job) -> Result<()> {
        if let Ok(stored) = self.jobs.load(&job.job_id).await {
            job.cancel_requested |= stored.cancel_requested;
        }
        self.jobs.save(job).await
    }
}

fn classify(unit_id: &str, run: Result<UnitRun>) -> UnitResult {
    match run {
        Ok(run) => match run.failure {
            None => UnitResult::Completed,
            Some(failure) => UnitResult::Failed(FailedItem {
                id: unit_id.to_string(),
                error: failure.error.to_string(),
                phase: Some(failure.phase),
                retryable: failure.error.resumable(),
            }),
        },
        Err(PipelineError::Cancelled) => UnitResult::Cancelled,
        Err(e) => UnitResult::Failed(FailedItem {
            id: unit_id.to_string(),
            error: e.to_string(),
            phase: e.phase(),
            retryable: e.resumable(),
        }),
    }
}
