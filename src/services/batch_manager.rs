//! 批量提交生命周期 - 业务能力层
//!
//! 驱动一次异步批处理：pending → file_uploaded → submitted → results_downloaded → completed。
//! 每次状态转换后立即落盘，进程在任意两个状态之间崩溃都能从最后确认的状态继续。
//!
//! ## 崩溃恢复
//! 新建提交之前先调用 [`BatchLifecycleManager::recover`]：
//! - `pending` / `results_downloaded`：本地即可继续
//! - `file_uploaded` / `submitted`：已知外部作业 ID 时先直接查状态；
//!   否则到外部作业列表里按作业 ID、文件 ID 或 `submission_id` 标签匹配；
//!   匹配上则重新挂接，匹配不上则判为失败

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::BatchService;
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::infrastructure::batch_store::BatchStore;
use crate::infrastructure::clock::Clock;
use crate::models::batch::{
    BatchRequest, BatchResultLine, BatchScope, BatchState, BatchSubmission, ExternalJob,
    ExternalJobState,
};
use crate::models::item::ItemFailure;
use crate::services::retry::RetryPolicy;

const SERVICE: &str = "batch";

/// 轮询参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    /// 整体超时，超时后状态保持 submitted
    pub timeout: Duration,
    /// 单次状态查询/下载的超时
    pub call_timeout: Duration,
}

impl PollSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.poll_interval_secs),
            timeout: Duration::from_secs(config.poll_timeout_secs),
            call_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(24 * 60 * 60),
            call_timeout: Duration::from_secs(120),
        }
    }
}

/// 一次批处理的最终产出
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRun<T> {
    pub submission_id: String,
    pub items: Vec<T>,
    pub failures: Vec<ItemFailure>,
    /// 是否复用了之前已完成的提交
    pub reused: bool,
}

pub struct BatchLifecycleManager {
    service: Arc<dyn BatchService>,
    store: BatchStore,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    poll: PollSettings,
}

impl BatchLifecycleManager {
    pub fn new(
        service: Arc<dyn BatchService>,
        store: BatchStore,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        poll: PollSettings,
    ) -> Self {
        Self {
            service,
            store,
            clock,
            retry,
            poll,
        }
    }

    pub fn store(&self) -> &BatchStore {
        &self.store
    }

    async fn persist(&self, sub: &BatchSubmission) -> Result<()> {
        self.store.save(sub).await
    }

    /// 新建提交（pending），同一范围内已有非终态提交时返回 `SubmissionConflict`
    pub async fn create(
        &self,
        scope: BatchScope,
        requests: Vec<BatchRequest>,
    ) -> Result<BatchSubmission> {
        if let Some(active) = self.store.find_active(&scope).await? {
            return Err(PipelineError::SubmissionConflict {
                scope: scope.to_string(),
                submission_id: active.submission_id,
            });
        }

        let submission_id = uuid::Uuid::new_v4().to_string();
        let sub = BatchSubmission::new(submission_id, scope, requests, self.clock.now());
        self.persist(&sub).await?;
        info!(
            "[提交 {}] 已创建 ({}, {} 条请求)",
            sub.submission_id,
            sub.scope,
            sub.requests.len()
        );
        Ok(sub)
    }

    /// 上传请求文件
    ///
    /// 已有 `external_file_id` 时不再重复上传；上传失败保持 pending，可安全重试。
    pub async fn upload(&self, sub: &mut BatchSubmission) -> Result<()> {
        if sub.external_file_id.is_none() {
            let requests = sub.requests.clone();
            let file_id = self
                .retry
                .run(self.clock.as_ref(), "批处理上传", || self.service.upload(&requests))
                .await?;
            sub.external_file_id = Some(file_id);
        } else {
            debug!("[提交 {}] 已有外部文件，跳过上传", sub.submission_id);
        }

        sub.transition(BatchState::FileUploaded, self.clock.now())?;
        self.persist(sub).await?;
        info!(
            "[提交 {}] 文件已上传: {}",
            sub.submission_id,
            sub.external_file_id.as_deref().unwrap_or_default()
        );
        Ok(())
    }

    /// 以已上传文件发起外部批处理
    pub async fn submit(&self, sub: &mut BatchSubmission) -> Result<()> {
        let file_id = sub.external_file_id.clone().ok_or_else(|| {
            PipelineError::external(SERVICE, format!("提交 {} 缺少外部文件 ID", sub.submission_id))
        })?;
        if sub.state != BatchState::FileUploaded {
            return Err(PipelineError::InvalidTransition {
                submission_id: sub.submission_id.clone(),
                from: sub.state,
                to: BatchState::Submitted,
            });
        }

        let metadata = sub.metadata.clone();
        let job_id = self
            .retry
            .run(self.clock.as_ref(), "批处理提交", || {
                self.service.submit(&file_id, &metadata)
            })
            .await?;

        sub.external_job_id = Some(job_id);
        sub.transition(BatchState::Submitted, self.clock.now())?;
        self.persist(sub).await?;
        info!(
            "[提交 {}] 已提交外部作业: {}",
            sub.submission_id,
            sub.external_job_id.as_deref().unwrap_or_default()
        );
        Ok(())
    }

    async fn call_with_timeout<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.poll.call_timeout, fut)
            .await
            .map_err(|_| PipelineError::ExternalTimeout {
                service: SERVICE.to_string(),
                timeout_ms: self.poll.call_timeout.as_millis() as u64,
            })?
    }

    /// 等待一个轮询间隔；被取消返回 `Cancelled`
    async fn wait_tick(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            _ = self.clock.sleep(self.poll.interval) => Ok(()),
        }
    }

    /// 轮询外部作业直到结果下载完成
    ///
    /// - 瞬时错误与单次调用超时只记录日志，下个间隔再查
    /// - 取消或整体超时不改变状态
    /// - 外部作业失败/过期/被取消时提交判为失败
    pub async fn poll(&self, sub: &mut BatchSubmission, cancel: &CancellationToken) -> Result<()> {
        let external_job_id = match (&sub.state, &sub.external_job_id) {
            (BatchState::Submitted, Some(id)) => id.clone(),
            _ => {
                return Err(PipelineError::InvalidTransition {
                    submission_id: sub.submission_id.clone(),
                    from: sub.state,
                    to: BatchState::ResultsDownloaded,
                })
            }
        };

        let started = self.clock.now();
        let overall = chrono::Duration::from_std(self.poll.timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if self.clock.now() - started >= overall {
                warn!("[提交 {}] 轮询超时", sub.submission_id);
                return Err(PipelineError::ExternalTimeout {
                    service: SERVICE.to_string(),
                    timeout_ms: self.poll.timeout.as_millis() as u64,
                });
            }

            let status = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                r = self.call_with_timeout(self.service.status(&external_job_id)) => r,
            };

            match status {
                Ok(job) if job.state == ExternalJobState::Completed => {
                    let downloaded = tokio::select! {
                        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                        r = self.call_with_timeout(self.service.download(&external_job_id)) => r,
                    };
                    match downloaded {
                        Ok(results) => {
                            sub.results = results;
                            sub.transition(BatchState::ResultsDownloaded, self.clock.now())?;
                            self.persist(sub).await?;
                            info!(
                                "[提交 {}] 结果已下载: {} 行",
                                sub.submission_id,
                                sub.results.len()
                            );
                            return Ok(());
                        }
                        Err(e) if e.is_retryable() => {
                            warn!("[提交 {}] 下载结果失败，稍后重试: {}", sub.submission_id, e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(job) if job.state.is_dead() => {
                    let reason = format!("外部作业 {} 状态为 {:?}", external_job_id, job.state);
                    self.fail(sub, &reason).await?;
                    return Err(PipelineError::external(SERVICE, reason));
                }
                Ok(job) => {
                    debug!("[提交 {}] 外部状态: {:?}", sub.submission_id, job.state);
                }
                Err(e) if e.is_retryable() => {
                    warn!("[提交 {}] 查询状态失败，稍后重试: {}", sub.submission_id, e);
                }
                Err(e) => return Err(e),
            }

            self.wait_tick(cancel).await?;
        }
    }

    /// 解析已下载的结果，提交进入 completed
    ///
    /// 单行解析失败只记入失败列表。
    pub async fn ingest<T, F>(
        &self,
        sub: &mut BatchSubmission,
        parse: F,
    ) -> Result<(Vec<T>, Vec<ItemFailure>)>
    where
        F: Fn(&BatchResultLine) -> Result<T>,
    {
        if sub.state != BatchState::ResultsDownloaded {
            return Err(PipelineError::InvalidTransition {
                submission_id: sub.submission_id.clone(),
                from: sub.state,
                to: BatchState::Completed,
            });
        }

        let parsed = parse_results(&sub.results, &parse);
        sub.transition(BatchState::Completed, self.clock.now())?;
        self.persist(sub).await?;
        info!(
            "[提交 {}] 已完成: 解析成功 {} / 失败 {}",
            sub.submission_id,
            parsed.0.len(),
            parsed.1.len()
        );
        Ok(parsed)
    }

    /// 判为失败（终态），之后必须新建提交
    pub async fn fail(&self, sub: &mut BatchSubmission, reason: &str) -> Result<()> {
        sub.transition(BatchState::Failed, self.clock.now())?;
        sub.error = Some(reason.to_string());
        self.persist(sub).await?;
        warn!("[提交 {}] 已失败: {}", sub.submission_id, reason);
        Ok(())
    }

    /// 弃用一次已完成提交的结果
    ///
    /// 阶段拿到结果后仍然失败时调用，下一次同范围的运行会新建提交而不是复用它。
    pub async fn discard(&self, submission_id: &str, reason: &str) -> Result<()> {
        let mut sub = self.store.load(submission_id).await?;
        if !sub.is_reusable() {
            return Ok(());
        }
        sub.discarded = true;
        sub.error = Some(reason.to_string());
        sub.updated_at = self.clock.now();
        self.persist(&sub).await?;
        warn!("[提交 {}] 结果已弃用: {}", sub.submission_id, reason);
        Ok(())
    }

    /// 崩溃恢复：找回范围内的非终态提交
    ///
    /// # 返回
    /// - `Some(sub)`：可以从该提交的当前状态继续
    /// - `None`：没有可继续的提交（从未创建，或无法挂接已判失败）
    pub async fn recover(&self, scope: &BatchScope) -> Result<Option<BatchSubmission>> {
        let Some(mut sub) = self.store.find_active(scope).await? else {
            return Ok(None);
        };

        match sub.state {
            BatchState::Pending | BatchState::ResultsDownloaded => {
                info!("[提交 {}] 从 {} 本地继续", sub.submission_id, sub.state);
                Ok(Some(sub))
            }
            BatchState::FileUploaded | BatchState::Submitted => {
                let matched = match self.lookup_known_job(&sub).await {
                    Some(job) => Some(job),
                    None => {
                        let filter = scope_filter(scope);
                        let listed = self
                            .retry
                            .run(self.clock.as_ref(), "批处理列表", || {
                                self.service.list_in_flight(&filter)
                            })
                            .await?;
                        find_match(&sub, &listed).cloned()
                    }
                };

                match matched {
                    Some(job) if job.state.is_dead() => {
                        let reason = format!("外部作业 {} 已结束: {:?}", job.external_job_id, job.state);
                        self.fail(&mut sub, &reason).await?;
                        Ok(None)
                    }
                    Some(job) => {
                        sub.external_job_id = Some(job.external_job_id.clone());
                        if sub.external_file_id.is_none() {
                            sub.external_file_id = Some(job.external_file_id.clone());
                        }
                        if sub.state == BatchState::FileUploaded {
                            sub.transition(BatchState::Submitted, self.clock.now())?;
                        }
                        self.persist(&sub).await?;
                        info!(
                            "[提交 {}] 已重新挂接外部作业 {} ({:?})",
                            sub.submission_id, job.external_job_id, job.state
                        );
                        Ok(Some(sub))
                    }
                    None => {
                        self.fail(&mut sub, "崩溃恢复时未找到对应的外部作业").await?;
                        Ok(None)
                    }
                }
            }
            BatchState::Completed | BatchState::Failed => Ok(None),
        }
    }

    /// 已知外部作业 ID 时直接查询其状态，不依赖列表的分页窗口
    async fn lookup_known_job(&self, sub: &BatchSubmission) -> Option<ExternalJob> {
        let external_job_id = sub.external_job_id.as_deref()?;
        match self.call_with_timeout(self.service.status(external_job_id)).await {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(
                    "[提交 {}] 直接查询外部作业 {} 失败，改查列表: {}",
                    sub.submission_id, external_job_id, e
                );
                None
            }
        }
    }

    /// 完整跑完一次批处理
    ///
    /// 顺序：已完成的提交直接复用 → 恢复进行中的提交 → 新建提交；
    /// 然后从当前状态一路推进到 completed。
    pub async fn run_to_completion<T, F>(
        &self,
        scope: &BatchScope,
        build_requests: impl FnOnce() -> Vec<BatchRequest>,
        cancel: &CancellationToken,
        parse: F,
    ) -> Result<BatchRun<T>>
    where
        F: Fn(&BatchResultLine) -> Result<T>,
    {
        let mut sub = match self.recover(scope).await? {
            Some(sub) => sub,
            None => match self.latest_completed(scope).await? {
                Some(done) => {
                    info!("[提交 {}] 复用已完成的结果", done.submission_id);
                    let (items, failures) = parse_results(&done.results, &parse);
                    return Ok(BatchRun {
                        submission_id: done.submission_id,
                        items,
                        failures,
                        reused: true,
                    });
                }
                None => self.create(scope.clone(), build_requests()).await?,
            },
        };

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            match sub.state {
                BatchState::Pending => self.upload(&mut sub).await?,
                BatchState::FileUploaded => self.submit(&mut sub).await?,
                BatchState::Submitted => self.poll(&mut sub, cancel).await?,
                BatchState::ResultsDownloaded => {
                    let (items, failures) = self.ingest(&mut sub, &parse).await?;
                    return Ok(BatchRun {
                        submission_id: sub.submission_id,
                        items,
                        failures,
                        reused: false,
                    });
                }
                BatchState::Completed | BatchState::Failed => {
                    return Err(PipelineError::InvalidTransition {
                        submission_id: sub.submission_id.clone(),
                        from: sub.state,
                        to: BatchState::Completed,
                    })
                }
            }
        }
    }

    /// 范围内最近一次已完成且未被弃用的提交
    async fn latest_completed(&self, scope: &BatchScope) -> Result<Option<BatchSubmission>> {
        Ok(self
            .store
            .list_for_scope(scope)
            .await?
            .into_iter()
            .rev()
            .find(|s| s.is_reusable()))
    }
}

fn parse_results<T, F>(results: &[BatchResultLine], parse: &F) -> (Vec<T>, Vec<ItemFailure>)
where
    F: Fn(&BatchResultLine) -> Result<T>,
{
    let mut items = Vec::new();
    let mut failures = Vec::new();
    for line in results {
        if let Some(err) = &line.error {
            failures.push(ItemFailure::new(&line.custom_id, err));
            continue;
        }
        match parse(line) {
            Ok(item) => items.push(item),
            Err(e) => failures.push(ItemFailure::new(&line.custom_id, e)),
        }
    }
    (items, failures)
}

/// 外部作业列表的过滤标签
fn scope_filter(scope: &BatchScope) -> BTreeMap<String, String> {
    let mut filter = BTreeMap::new();
    filter.insert("job_id".to_string(), scope.job_id.clone());
    filter.insert("unit_id".to_string(), scope.unit_id.clone());
    filter.insert("phase".to_string(), scope.phase.to_string());
    filter
}

/// 作业 ID > 文件 ID > submission_id 标签
fn find_match<'a>(sub: &BatchSubmission, listed: &'a [ExternalJob]) -> Option<&'a ExternalJob> {
    if let Some(job_id) = &sub.external_job_id {
        if let Some(job) = listed.iter().find(|j| &j.external_job_id == job_id) {
            return Some(job);
        }
    }
    if let Some(file_id) = &sub.external_file_id {
        if let Some(job) = listed.iter().find(|j| &j.external_file_id == file_id) {
            return Some(job);
        }
    }
    listed
        .iter()
        .find(|j| j.metadata.get("submission_id") == Some(&sub.submission_id))
}
