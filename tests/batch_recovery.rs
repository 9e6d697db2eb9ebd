//! 批量提交的生命周期与崩溃后重新挂接

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_poll, fast_retry, Harness, MockBatchService};
use question_forge::clients::BatchService;
use question_forge::error::{PipelineError, Result};
use question_forge::infrastructure::{BatchStore, Clock};
use question_forge::models::batch::{BatchRequest, BatchResultLine, BatchScope, BatchState, ExternalJobState};
use question_forge::models::Phase;
use question_forge::services::BatchLifecycleManager;
use tokio_test::assert_err;
use tokio_util::sync::CancellationToken;

fn scope() -> BatchScope {
    BatchScope::new("job-1", "atom-1", Phase::Generate)
}

fn requests() -> Vec<BatchRequest> {
    ["alpha", "beta"]
        .iter()
        .map(|slot| BatchRequest {
            custom_id: slot.to_string(),
            system: None,
            prompt: format!("generate:atom-1:{}", slot),
        })
        .collect()
}

fn parse(line: &BatchResultLine) -> Result<String> {
    line.body
        .clone()
        .ok_or_else(|| PipelineError::parse(&line.custom_id, "empty body"))
}

/// 模拟进程重启：同一份磁盘记录、同一个外部服务，全新的管理器
fn restarted(h: &Harness) -> BatchLifecycleManager {
    let clock: Arc<dyn Clock> = h.clock.clone();
    BatchLifecycleManager::new(
        h.batch.clone() as Arc<dyn BatchService>,
        BatchStore::new(h.dir.path().join("batches")),
        clock,
        fast_retry(),
        fast_poll(),
    )
}

async fn stored_state(h: &Harness, submission_id: &str) -> BatchState {
    h.batches.store().load(submission_id).await.unwrap().state
}

#[tokio::test]
async fn test_full_lifecycle_and_reuse_of_completed_results() {
    let h = Harness::new();
    let cancel = CancellationToken::new();

    let run = h
        .batches
        .run_to_completion(&scope(), requests, &cancel, parse)
        .await
        .unwrap();

    assert_eq!(run.items.len(), 2);
    assert!(run.failures.is_empty());
    assert!(!run.reused);
    assert_eq!(stored_state(&h, &run.submission_id).await, BatchState::Completed);
    assert_eq!(MockBatchService::count(&h.batch.uploads), 1);
    assert_eq!(MockBatchService::count(&h.batch.submits), 1);

    // 同一范围再跑一次：直接复用，不再产生外部费用
    let again = h
        .batches
        .run_to_completion(&scope(), requests, &cancel, parse)
        .await
        .unwrap();
    assert!(again.reused);
    assert_eq!(again.submission_id, run.submission_id);
    assert_eq!(again.items, run.items);
    assert_eq!(MockBatchService::count(&h.batch.submits), 1);
}

#[tokio::test]
async fn test_second_active_submission_in_scope_conflicts() {
    let h = Harness::new();
    h.batches.create(scope(), requests()).await.unwrap();

    let err = assert_err!(h.batches.create(scope(), requests()).await);
    assert!(matches!(err, PipelineError::SubmissionConflict { .. }));

    // 其他单元不受影响
    let other = BatchScope::new("job-1", "atom-2", Phase::Generate);
    h.batches.create(other, requests()).await.unwrap();
}

#[tokio::test]
async fn test_orphan_submitted_reattaches_without_second_submit() {
    let h = Harness::new();
    let mut sub = h.batches.create(scope(), requests()).await.unwrap();
    h.batches.upload(&mut sub).await.unwrap();
    h.batches.submit(&mut sub).await.unwrap();
    let external_id = sub.external_job_id.clone().unwrap();

    // 崩溃发生在提交之后、轮询之前；外部作业在此期间已经完成
    h.batch.set_state(&external_id, ExternalJobState::Completed);
    drop(sub);

    let manager = restarted(&h);
    let run = manager
        .run_to_completion(&scope(), requests, &CancellationToken::new(), parse)
        .await
        .unwrap();

    assert_eq!(run.items.len(), 2);
    assert_eq!(MockBatchService::count(&h.batch.submits), 1);
    assert_eq!(h.batch.external_job_count(), 1);
    // 已知外部作业 ID，直接查状态即可
    assert_eq!(MockBatchService::count(&h.batch.listings), 0);
    let stored = manager.store().load(&run.submission_id).await.unwrap();
    assert_eq!(stored.state, BatchState::Completed);
    assert_eq!(stored.external_job_id.as_deref(), Some(external_id.as_str()));
}

#[tokio::test]
async fn test_known_job_reattaches_when_missing_from_listing() {
    let h = Harness::new();
    let mut sub = h.batches.create(scope(), requests()).await.unwrap();
    h.batches.upload(&mut sub).await.unwrap();
    h.batches.submit(&mut sub).await.unwrap();

    // 账号上作业太多，这一条已不在列表窗口内
    h.batch.hide_from_listing();

    let recovered = restarted(&h).recover(&scope()).await.unwrap().unwrap();
    assert_eq!(recovered.submission_id, sub.submission_id);
    assert_eq!(recovered.state, BatchState::Submitted);
    assert_eq!(MockBatchService::count(&h.batch.status_calls), 1);
    assert_eq!(MockBatchService::count(&h.batch.listings), 0);
    assert_eq!(MockBatchService::count(&h.batch.submits), 1);
}

#[tokio::test]
async fn test_discarded_results_are_not_reused() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    let first = h
        .batches
        .run_to_completion(&scope(), requests, &cancel, parse)
        .await
        .unwrap();

    h.batches.discard(&first.submission_id, "没有可用的题目").await.unwrap();
    let stored = h.batches.store().load(&first.submission_id).await.unwrap();
    assert_eq!(stored.state, BatchState::Completed);
    assert!(stored.discarded);

    let second = h
        .batches
        .run_to_completion(&scope(), requests, &cancel, parse)
        .await
        .unwrap();
    assert!(!second.reused);
    assert_ne!(second.submission_id, first.submission_id);
    assert_eq!(MockBatchService::count(&h.batch.submits), 2);
}

#[tokio::test]
async fn test_file_uploaded_finds_job_created_before_crash() {
    let h = Harness::new();
    let mut sub = h.batches.create(scope(), requests()).await.unwrap();
    h.batches.upload(&mut sub).await.unwrap();

    // 外部作业已经建好，但本地还没来得及记录 submitted
    let file_id = sub.external_file_id.clone().unwrap();
    h.batch.submit(&file_id, &sub.metadata).await.unwrap();

    let recovered = restarted(&h).recover(&scope()).await.unwrap().unwrap();
    assert_eq!(recovered.state, BatchState::Submitted);
    assert_eq!(recovered.external_job_id.as_deref(), Some("batch-1"));

    let run = h
        .batches
        .run_to_completion(&scope(), requests, &CancellationToken::new(), parse)
        .await
        .unwrap();
    assert_eq!(run.submission_id, sub.submission_id);
    assert_eq!(MockBatchService::count(&h.batch.submits), 1);
}

#[tokio::test]
async fn test_unmatched_orphan_is_failed_and_replaced() {
    let h = Harness::new();
    let mut sub = h.batches.create(scope(), requests()).await.unwrap();
    h.batches.upload(&mut sub).await.unwrap();

    let run = restarted(&h)
        .run_to_completion(&scope(), requests, &CancellationToken::new(), parse)
        .await
        .unwrap();

    assert_ne!(run.submission_id, sub.submission_id);
    let old = h.batches.store().load(&sub.submission_id).await.unwrap();
    assert_eq!(old.state, BatchState::Failed);
    assert!(old.error.is_some());
    assert_eq!(MockBatchService::count(&h.batch.uploads), 2);
    assert_eq!(MockBatchService::count(&h.batch.submits), 1);
}

#[tokio::test]
async fn test_upload_failure_keeps_pending() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    h.batch.fail_next_uploads(2);

    let err = assert_err!(
        h.batches
            .run_to_completion(&scope(), requests, &cancel, parse)
            .await
    );
    assert!(err.is_retryable());

    let active = h.batches.store().find_active(&scope()).await.unwrap().unwrap();
    assert_eq!(active.state, BatchState::Pending);
    assert!(active.external_file_id.is_none());

    let run = h
        .batches
        .run_to_completion(&scope(), requests, &cancel, parse)
        .await
        .unwrap();
    assert_eq!(run.submission_id, active.submission_id);
    assert_eq!(MockBatchService::count(&h.batch.uploads), 1);
}

#[tokio::test]
async fn test_transient_poll_errors_are_tolerated() {
    let h = Harness::new();
    h.batch.script_status(vec![
        Err(PipelineError::external("mock-batch", "502")),
        Ok(ExternalJobState::InProgress),
        Err(PipelineError::ExternalTimeout {
            service: "mock-batch".to_string(),
            timeout_ms: 5000,
        }),
    ]);

    let run = h
        .batches
        .run_to_completion(&scope(), requests, &CancellationToken::new(), parse)
        .await
        .unwrap();

    assert_eq!(run.items.len(), 2);
    assert_eq!(MockBatchService::count(&h.batch.status_calls), 4);
    assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(5); 3]);
}

#[tokio::test]
async fn test_overall_poll_timeout_leaves_submitted() {
    let h = Harness::new();
    h.batch
        .script_status((0..30).map(|_| Ok(ExternalJobState::InProgress)).collect());

    let err = assert_err!(
        h.batches
            .run_to_completion(&scope(), requests, &CancellationToken::new(), parse)
            .await
    );
    assert!(matches!(err, PipelineError::ExternalTimeout { .. }));
    assert!(err.is_retryable());

    let active = h.batches.store().find_active(&scope()).await.unwrap().unwrap();
    assert_eq!(active.state, BatchState::Submitted);
    assert!(h.clock.elapsed() >= fast_poll().timeout);
}

#[tokio::test]
async fn test_cancel_aborts_poll_without_state_change() {
    let h = Harness::new();
    let mut sub = h.batches.create(scope(), requests()).await.unwrap();
    h.batches.upload(&mut sub).await.unwrap();
    h.batches.submit(&mut sub).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = assert_err!(h.batches.poll(&mut sub, &cancel).await);

    assert!(matches!(err, PipelineError::Cancelled));
    assert_eq!(sub.state, BatchState::Submitted);
    assert_eq!(stored_state(&h, &sub.submission_id).await, BatchState::Submitted);
    assert_eq!(MockBatchService::count(&h.batch.status_calls), 0);
}

#[tokio::test]
async fn test_dead_external_job_fails_submission() {
    let h = Harness::new();
    h.batch.script_status(vec![Ok(ExternalJobState::Expired)]);
    let cancel = CancellationToken::new();

    let err = assert_err!(
        h.batches
            .run_to_completion(&scope(), requests, &cancel, parse)
            .await
    );
    assert!(matches!(err, PipelineError::ExternalService { .. }));
    let history = h.batches.store().list_for_scope(&scope()).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, BatchState::Failed);

    // 失败的提交不会被复用，下一次新建
    let run = h
        .batches
        .run_to_completion(&scope(), requests, &cancel, parse)
        .await
        .unwrap();
    assert_ne!(run.submission_id, history[0].submission_id);
    assert_eq!(MockBatchService::count(&h.batch.submits), 2);
}
