//! 集成测试共用的 mock 协作方
//!
//! 所有 mock 都记录调用次数，用来断言续跑时没有重复调用外部服务。

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

use question_forge::clients::{
    metadata_matches, BatchService, InferenceProvider, InvokeOptions, ItemSink, Prompt,
};
use question_forge::error::{PipelineError, Result};
use question_forge::infrastructure::{BatchStore, CheckpointStore, Clock, InstantClock, JobStore};
use question_forge::models::batch::{BatchRequest, BatchResultLine, ExternalJob, ExternalJobState};
use question_forge::models::checkpoint::PlanSlot;
use question_forge::models::item::{Exemplar, GeneratedItem};
use question_forge::models::{JobParams, KnowledgeAtom, PhaseTarget};
use question_forge::orchestrator::JobRunner;
use question_forge::services::{
    BatchLifecycleManager, DuplicateGate, FallbackInference, GatePolicy, PollSettings,
    PromptSource, RejectLog, RetryPolicy,
};
use question_forge::workflow::{
    EnrichHandler, FinalizeHandler, GenerateHandler, PhaseHandler, PhaseOrchestrator, PlanHandler,
    ValidateHandler,
};

// ========== 提示词 ==========

/// 用户提示词以 `阶段:` 开头，方便 mock 按阶段应答
pub struct TaggedPrompts;

impl PromptSource for TaggedPrompts {
    fn enrich(&self, atom: &KnowledgeAtom) -> Prompt {
        Prompt::new(None, format!("enrich:{}", atom.atom_id))
    }

    fn plan(&self, atom: &KnowledgeAtom, _knowledge: &serde_json::Value) -> Prompt {
        Prompt::new(None, format!("plan:{}", atom.atom_id))
    }

    fn generate(
        &self,
        atom: &KnowledgeAtom,
        _knowledge: &serde_json::Value,
        slot: &PlanSlot,
        _exemplar: Option<&Exemplar>,
    ) -> Prompt {
        Prompt::new(Some("system"), format!("generate:{}:{}", atom.atom_id, slot.slot_id))
    }

    fn validate(&self, atom: &KnowledgeAtom, item: &GeneratedItem) -> Prompt {
        Prompt::new(None, format!("validate:{}:{}", atom.atom_id, item.item_id))
    }
}

// ========== 同步推理 ==========

/// 按阶段应答的推理服务
#[derive(Default)]
pub struct MockLlm {
    calls: Mutex<HashMap<String, usize>>,
    /// 这些阶段的调用一律返回可重试的服务错误
    broken: Mutex<HashSet<String>>,
    /// 设置后，第一次调用会先通知 `entered`，再等待 `release`
    gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl MockLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self, phase: &str) -> usize {
        self.calls.lock().unwrap().get(phase).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn break_phase(&self, phase: &str) {
        self.broken.lock().unwrap().insert(phase.to_string());
    }

    pub fn heal(&self) {
        self.broken.lock().unwrap().clear();
    }

    /// 让下一次调用停住，返回 (entered, release)
    pub fn pause_next_call(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((entered.clone(), release.clone()));
        (entered, release)
    }
}

#[async_trait]
impl InferenceProvider for MockLlm {
    fn name(&self) -> &str {
        "mock-llm"
    }

    async fn invoke(&self, prompt: &Prompt, _options: &InvokeOptions) -> Result<String> {
        let phase = prompt.user.split(':').next().unwrap_or_default().to_string();
        *self.calls.lock().unwrap().entry(phase.clone()).or_insert(0) += 1;

        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }

        if self.broken.lock().unwrap().contains(&phase) {
            return Err(PipelineError::external("mock-llm", "503 service unavailable"));
        }

        Ok(match phase.as_str() {
            "enrich" => r#"{"concepts": ["面积"], "patterns": [], "pitfalls": []}"#.to_string(),
            "plan" => "```json\n{\"slots\": [\
                {\"slot_id\": \"alpha\", \"intent\": \"基础\", \"distance_level\": \"near\"},\
                {\"slot_id\": \"beta\", \"intent\": \"提高\", \"distance_level\": \"far\"}\
                ]}\n```"
                .to_string(),
            "validate" => r#"{"valid": true, "reason": ""}"#.to_string(),
            other => {
                return Err(PipelineError::parse("mock-llm", format!("未知阶段 {}", other)));
            }
        })
    }
}

// ========== 异步批处理 ==========

struct MockJob {
    job: ExternalJob,
    requests: Vec<BatchRequest>,
}

/// 内存里的批处理服务
#[derive(Default)]
pub struct MockBatchService {
    pub uploads: AtomicUsize,
    pub submits: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub downloads: AtomicUsize,
    pub listings: AtomicUsize,
    files: Mutex<HashMap<String, Vec<BatchRequest>>>,
    jobs: Mutex<BTreeMap<String, MockJob>>,
    /// 接下来的 N 次上传失败
    upload_failures: AtomicUsize,
    /// 状态查询的脚本，用完之后一律返回 completed
    status_script: Mutex<VecDeque<Result<ExternalJobState>>>,
    /// 下载的结果题干为空，全部解析失败
    blank: AtomicBool,
    /// 列表接口看不到任何作业（模拟被分页挤出）
    unlisted: AtomicBool,
}

impl MockBatchService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn fail_next_uploads(&self, n: usize) {
        self.upload_failures.store(n, Ordering::SeqCst);
    }

    pub fn script_status(&self, script: Vec<Result<ExternalJobState>>) {
        *self.status_script.lock().unwrap() = script.into();
    }

    pub fn blank_answers(&self, on: bool) {
        self.blank.store(on, Ordering::SeqCst);
    }

    pub fn hide_from_listing(&self) {
        self.unlisted.store(true, Ordering::SeqCst);
    }

    pub fn external_job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn set_state(&self, external_job_id: &str, state: ExternalJobState) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(external_job_id) {
            job.job.state = state;
        }
    }

    /// 对每个请求返回一道题干互不相同的题
    fn answer(request: &BatchRequest, blank: bool) -> BatchResultLine {
        let slot = request.prompt.rsplit(':').next().unwrap_or_default();
        let stem = if blank {
            String::new()
        } else {
            format!("关于{}的题目", slot)
        };
        let body = serde_json::json!({
            "stem": stem,
            "choices": [],
            "answer": slot,
            "analysis": "",
        });
        BatchResultLine {
            custom_id: request.custom_id.clone(),
            body: Some(body.to_string()),
            error: None,
        }
    }
}

#[async_trait]
impl BatchService for MockBatchService {
    async fn upload(&self, requests: &[BatchRequest]) -> Result<String> {
        let pending_failures = self.upload_failures.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.upload_failures.store(pending_failures - 1, Ordering::SeqCst);
            return Err(PipelineError::external("mock-batch", "upload 502"));
        }
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        let file_id = format!("file-{}", n);
        self.files
            .lock()
            .unwrap()
            .insert(file_id.clone(), requests.to_vec());
        Ok(file_id)
    }

    async fn submit(&self, file_id: &str, metadata: &BTreeMap<String, String>) -> Result<String> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        let requests = self
            .files
            .lock()
            .unwrap()
            .get(file_id)
            .cloned()
            .ok_or_else(|| PipelineError::external("mock-batch", format!("no file {}", file_id)))?;
        let external_job_id = format!("batch-{}", n);
        self.jobs.lock().unwrap().insert(
            external_job_id.clone(),
            MockJob {
                job: ExternalJob {
                    external_job_id: external_job_id.clone(),
                    external_file_id: file_id.to_string(),
                    state: ExternalJobState::Validating,
                    metadata: metadata.clone(),
                },
                requests,
            },
        );
        Ok(external_job_id)
    }

    async fn status(&self, external_job_id: &str) -> Result<ExternalJob> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.status_script.lock().unwrap().pop_front();
        let mut jobs = self.jobs.lock().unwrap();
        let entry = jobs
            .get_mut(external_job_id)
            .ok_or_else(|| PipelineError::external("mock-batch", "no such job"))?;
        match scripted {
            Some(Ok(state)) => entry.job.state = state,
            Some(Err(e)) => return Err(e),
            None => {
                if !entry.job.state.is_dead() {
                    entry.job.state = ExternalJobState::Completed;
                }
            }
        }
        Ok(entry.job.clone())
    }

    async fn download(&self, external_job_id: &str) -> Result<Vec<BatchResultLine>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let jobs = self.jobs.lock().unwrap();
        let entry = jobs
            .get(external_job_id)
            .ok_or_else(|| PipelineError::external("mock-batch", "no such job"))?;
        let blank = self.blank.load(Ordering::SeqCst);
        Ok(entry
            .requests
            .iter()
            .map(|r| Self::answer(r, blank))
            .collect())
    }

    async fn list_in_flight(&self, filter: &BTreeMap<String, String>) -> Result<Vec<ExternalJob>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        if self.unlisted.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| metadata_matches(&j.job.metadata, filter))
            .map(|j| j.job.clone())
            .collect())
    }
}

// ========== 题目存储 ==========

#[derive(Default)]
pub struct MemorySink {
    pub stored: Mutex<Vec<(String, String)>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.stored.lock().unwrap().len()
    }
}

#[async_trait]
impl ItemSink for MemorySink {
    async fn store(&self, unit_id: &str, item: &GeneratedItem) -> Result<String> {
        let key = format!("{}/{}", unit_id, item.item_id);
        let mut stored = self.stored.lock().unwrap();
        if !stored.iter().any(|(u, i)| u == unit_id && i == &item.item_id) {
            stored.push((unit_id.to_string(), item.item_id.clone()));
        }
        Ok(key)
    }
}

// ========== 组装 ==========

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    }
}

pub fn fast_poll() -> PollSettings {
    PollSettings {
        interval: Duration::from_secs(5),
        timeout: Duration::from_secs(60),
        call_timeout: Duration::from_secs(5),
    }
}

pub fn atom(id: &str) -> KnowledgeAtom {
    toml::from_str(&format!(
        r#"
        atom_id = "{id}"
        subject = "数学"
        grade = "五年级"
        title = "长方形面积 {id}"
        content = "长方形的面积等于长乘宽"
        "#
    ))
    .expect("atom toml")
}

pub fn params(ids: &[&str], target: PhaseTarget) -> JobParams {
    JobParams {
        unit_ids: ids.iter().map(|s| s.to_string()).collect(),
        target,
        max_concurrent_units: 2,
        source_dir: None,
    }
}

/// 整条流水线的测试装配
pub struct Harness {
    pub dir: TempDir,
    pub llm: Arc<MockLlm>,
    pub batch: Arc<MockBatchService>,
    pub sink: Arc<MemorySink>,
    pub clock: Arc<InstantClock>,
    pub batches: Arc<BatchLifecycleManager>,
    pub orchestrator: Arc<PhaseOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let llm = MockLlm::new();
        let batch = MockBatchService::new();
        let sink = MemorySink::new();
        let clock = Arc::new(InstantClock::new());
        let dyn_clock: Arc<dyn Clock> = clock.clone();

        let inference = Arc::new(FallbackInference::new(
            vec![llm.clone() as Arc<dyn InferenceProvider>],
            fast_retry(),
            InvokeOptions::default(),
            dyn_clock.clone(),
        ));
        let batches = Arc::new(BatchLifecycleManager::new(
            batch.clone() as Arc<dyn BatchService>,
            BatchStore::new(dir.path().join("batches")),
            dyn_clock.clone(),
            fast_retry(),
            fast_poll(),
        ));
        let prompts: Arc<dyn PromptSource> = Arc::new(TaggedPrompts);

        let handlers: Vec<Arc<dyn PhaseHandler>> = vec![
            Arc::new(EnrichHandler::new(inference.clone(), prompts.clone())),
            Arc::new(PlanHandler::new(inference.clone(), prompts.clone())),
            Arc::new(GenerateHandler::new(
                batches.clone(),
                DuplicateGate::new(GatePolicy::default()),
                prompts.clone(),
                Arc::new(RejectLog::new(dir.path().join("rejected.log"))),
            )),
            Arc::new(ValidateHandler::new(inference, prompts)),
            Arc::new(FinalizeHandler::new(sink.clone() as Arc<dyn ItemSink>)),
        ];
        let orchestrator = Arc::new(PhaseOrchestrator::new(
            CheckpointStore::new(dir.path().join("checkpoints")),
            handlers,
        ));

        Self {
            dir,
            llm,
            batch,
            sink,
            clock,
            batches,
            orchestrator,
        }
    }

    pub fn runner(&self, atoms: Vec<KnowledgeAtom>) -> Arc<JobRunner> {
        Arc::new(
            JobRunner::new(
                JobStore::new(self.dir.path().join("jobs")),
                BatchStore::new(self.dir.path().join("batches")),
                self.orchestrator.clone(),
                self.clock.clone(),
            )
            .with_atoms(atoms),
        )
    }
}
