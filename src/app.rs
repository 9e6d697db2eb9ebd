//! 应用装配
//!
//! 从配置组装各层组件，并实现命令行的各个子命令。

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::clients::{
    BatchService, FileSink, InferenceProvider, InvokeOptions, ItemSink, OpenAiBatchClient,
    OpenAiProvider,
};
use crate::config::Config;
use crate::infrastructure::{BatchStore, CheckpointStore, Clock, JobStore, SystemClock};
use crate::models::job::{Job, JobParams, ResumeMode};
use crate::models::phase::PhaseTarget;
use crate::models::KnowledgeAtom;
use crate::orchestrator::JobRunner;
use crate::services::{
    BatchLifecycleManager, DefaultPrompts, DuplicateGate, FallbackInference, PollSettings,
    PromptSource, RejectLog, RetryPolicy,
};
use crate::workflow::{
    EnrichHandler, FinalizeHandler, GenerateHandler, PhaseHandler, PhaseOrchestrator, PlanHandler,
    ValidateHandler,
};

/// `run` 子命令的参数
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// 为空时处理知识点目录下的全部知识点
    pub unit_ids: Vec<String>,
    pub target: PhaseTarget,
    pub resume: bool,
    pub max_concurrent_units: Option<usize>,
    pub atoms_dir: Option<String>,
}

/// 应用主结构
pub struct App {
    config: Config,
    orchestrator: Arc<PhaseOrchestrator>,
    clock: Arc<dyn Clock>,
}

impl App {
    /// 按配置组装客户端、服务和阶段实现
    pub fn initialize(config: Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let retry = RetryPolicy::from_config(&config);

        let mut providers: Vec<Arc<dyn InferenceProvider>> =
            vec![Arc::new(OpenAiProvider::new(&config))];
        for model in &config.llm_fallback_models {
            providers.push(Arc::new(OpenAiProvider::with_model(&config, model.clone())));
        }
        let inference = Arc::new(FallbackInference::new(
            providers,
            retry,
            InvokeOptions::from_config(&config),
            clock.clone(),
        ));

        let batch_service: Arc<dyn BatchService> =
            Arc::new(OpenAiBatchClient::new(&config).context("创建批量接口客户端失败")?);
        let batches = Arc::new(BatchLifecycleManager::new(
            batch_service,
            BatchStore::new(config.batches_dir()),
            clock.clone(),
            retry,
            PollSettings::from_config(&config),
        ));

        let prompts: Arc<dyn PromptSource> = Arc::new(DefaultPrompts);
        let sink: Arc<dyn ItemSink> = Arc::new(FileSink::new(config.items_dir()));
        let reject_log = Arc::new(RejectLog::new(config.reject_log_path()));

        let handlers: Vec<Arc<dyn PhaseHandler>> = vec![
            Arc::new(EnrichHandler::new(inference.clone(), prompts.clone())),
            Arc::new(PlanHandler::new(inference.clone(), prompts.clone())),
            Arc::new(GenerateHandler::new(
                batches,
                DuplicateGate::new(config.gate.clone()),
                prompts.clone(),
                reject_log,
            )),
            Arc::new(ValidateHandler::new(inference, prompts)),
            Arc::new(FinalizeHandler::new(sink)),
        ];

        let orchestrator = Arc::new(PhaseOrchestrator::new(
            CheckpointStore::new(config.checkpoints_dir()),
            handlers,
        ));

        Ok(Self {
            config,
            orchestrator,
            clock,
        })
    }

    fn runner(&self, atoms: Vec<KnowledgeAtom>) -> Arc<JobRunner> {
        Arc::new(
            JobRunner::new(
                JobStore::new(self.config.jobs_dir()),
                BatchStore::new(self.config.batches_dir()),
                self.orchestrator.clone(),
                self.clock.clone(),
            )
            .with_atoms(atoms),
        )
    }

    async fn load_atoms(&self, atoms_dir: &str) -> Result<Vec<KnowledgeAtom>> {
        info!("\n📁 正在扫描知识点目录: {}", atoms_dir);
        let atoms = crate::models::load_all_atoms(atoms_dir).await?;
        info!("✓ 找到 {} 个知识点", atoms.len());
        Ok(atoms)
    }

    /// 新建任务并运行
    pub async fn run(&self, request: RunRequest) -> Result<Job> {
        let atoms_dir = request
            .atoms_dir
            .clone()
            .unwrap_or_else(|| self.config.atoms_dir.clone());
        let atoms = self.load_atoms(&atoms_dir).await?;

        let unit_ids = if request.unit_ids.is_empty() {
            atoms.iter().map(|a| a.atom_id.clone()).collect()
        } else {
            request.unit_ids.clone()
        };
        if unit_ids.is_empty() {
            bail!("⚠️ 没有找到待处理的知识点: {}", atoms_dir);
        }

        let runner = self.runner(atoms);
        let job = runner
            .create(JobParams {
                unit_ids,
                target: request.target,
                max_concurrent_units: request
                    .max_concurrent_units
                    .unwrap_or(self.config.max_concurrent_units),
                source_dir: Some(atoms_dir),
            })
            .await?;

        let watcher = spawn_ctrl_c_watcher(runner.clone(), job.job_id.clone());
        let result = runner.execute(&job.job_id, request.resume).await;
        watcher.abort();
        Ok(result?)
    }

    /// 续跑已有任务
    pub async fn resume(&self, job_id: &str, mode: ResumeMode) -> Result<Job> {
        let job = self.runner(Vec::new()).status(job_id).await?;
        let atoms_dir = job
            .params
            .source_dir
            .clone()
            .unwrap_or_else(|| self.config.atoms_dir.clone());
        let runner = self.runner(self.load_atoms(&atoms_dir).await?);

        let watcher = spawn_ctrl_c_watcher(runner.clone(), job_id.to_string());
        let result = runner.resume(job_id, mode).await;
        watcher.abort();
        Ok(result?)
    }

    pub async fn status(&self, job_id: &str) -> Result<Job> {
        Ok(self.runner(Vec::new()).status(job_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        Ok(self.runner(Vec::new()).list().await?)
    }

    /// 写入取消标记，运行该任务的进程会在下一个单元开始前停下
    pub async fn cancel(&self, job_id: &str) -> Result<Job> {
        Ok(self.runner(Vec::new()).cancel(job_id).await?)
    }

    pub async fn delete(&self, job_id: &str, purge_checkpoints: bool) -> Result<()> {
        Ok(self
            .runner(Vec::new())
            .delete(job_id, purge_checkpoints)
            .await?)
    }
}

/// Ctrl-C 时请求取消当前任务
fn spawn_ctrl_c_watcher(runner: Arc<JobRunner>, job_id: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到 Ctrl-C，正在取消任务 {}", job_id);
            if let Err(e) = runner.cancel(&job_id).await {
                warn!("取消任务 {} 失败: {}", job_id, e);
            }
        }
    })
}
