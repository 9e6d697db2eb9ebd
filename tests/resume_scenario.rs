//! 任务级场景：失败后续跑、取消、前置缺失、删除

mod common;

use common::{atom, params, Harness, MockBatchService};
use question_forge::error::PipelineError;
use question_forge::models::{BatchScope, JobStatus, Phase, PhaseTarget, ResumeMode};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_full_pipeline_completes() {
    let h = Harness::new();
    let runner = h.runner(vec![atom("A")]);

    let job = assert_ok!(runner.start(params(&["A"], PhaseTarget::All), false).await);

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_item_ids, vec!["A"]);
    assert!(job.completed_at.is_some());
    assert_eq!(h.sink.count(), 2);
    assert_eq!(
        h.orchestrator.store().completed_phases("A").await.unwrap(),
        Phase::ALL.to_vec()
    );
}

#[tokio::test]
async fn test_phase_two_failure_then_resume_remaining() {
    let h = Harness::new();
    let runner = h.runner(vec![atom("A")]);

    h.llm.break_phase("plan");
    let failed = runner
        .start(params(&["A"], PhaseTarget::Through(Phase::Generate)), false)
        .await
        .unwrap();

    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.failed_at.is_some());
    assert_eq!(failed.failed_items.len(), 1);
    assert_eq!(failed.failed_items[0].id, "A");
    assert_eq!(failed.failed_items[0].phase, Some(Phase::Plan));
    assert!(failed.failed_items[0].retryable);
    assert_eq!(h.llm.calls("enrich"), 1);

    h.llm.heal();
    let job = runner.resume(&failed.job_id, ResumeMode::Remaining).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_item_ids, vec!["A"]);
    assert!(job.failed_items.is_empty());
    // enrich 的检查点被复用，没有再次调用
    assert_eq!(h.llm.calls("enrich"), 1);
    assert_eq!(MockBatchService::count(&h.batch.submits), 1);
    // 目标只到 generate
    assert_eq!(h.llm.calls("validate"), 0);
    assert!(!h.orchestrator.store().exists("A", Phase::Validate).await);
}

#[tokio::test]
async fn test_resume_makes_no_calls_below_failed_phase() {
    let h = Harness::new();
    let runner = h.runner(vec![atom("A")]);

    h.llm.break_phase("validate");
    let failed = runner.start(params(&["A"], PhaseTarget::All), false).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failed_items[0].phase, Some(Phase::Validate));
    assert!(failed.failed_items[0].retryable);

    let enrich = h.llm.calls("enrich");
    let plan = h.llm.calls("plan");
    let uploads = MockBatchService::count(&h.batch.uploads);
    let submits = MockBatchService::count(&h.batch.submits);
    let downloads = MockBatchService::count(&h.batch.downloads);

    h.llm.heal();
    let job = runner.resume(&failed.job_id, ResumeMode::Remaining).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(h.llm.calls("enrich"), enrich);
    assert_eq!(h.llm.calls("plan"), plan);
    assert_eq!(MockBatchService::count(&h.batch.uploads), uploads);
    assert_eq!(MockBatchService::count(&h.batch.submits), submits);
    assert_eq!(MockBatchService::count(&h.batch.downloads), downloads);
    assert_eq!(h.sink.count(), 2);
}

#[tokio::test]
async fn test_failed_only_retries_just_the_failed_unit() {
    let h = Harness::new();

    // ghost 尚未加载，第一次运行必然失败
    let first = h.runner(vec![atom("A")]);
    let failed = first
        .start(params(&["A", "ghost"], PhaseTarget::Through(Phase::Enrich)), false)
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.completed_item_ids, vec!["A"]);
    assert_eq!(failed.failed_items[0].id, "ghost");
    assert_eq!(failed.failed_items[0].phase, None);
    assert_eq!(h.llm.calls("enrich"), 1);

    let second = h.runner(vec![atom("A"), atom("ghost")]);
    let job = second.resume(&failed.job_id, ResumeMode::FailedOnly).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.completed, 2);
    assert_eq!(h.llm.calls("enrich"), 2);
}

#[tokio::test]
async fn test_only_without_prerequisite_is_not_retried() {
    let h = Harness::new();
    let runner = h.runner(vec![atom("A")]);

    let failed = runner
        .start(params(&["A"], PhaseTarget::Only(Phase::Generate)), false)
        .await
        .unwrap();

    assert_eq!(failed.status, JobStatus::Failed);
    let item = &failed.failed_items[0];
    assert_eq!(item.phase, Some(Phase::Generate));
    assert!(!item.retryable);
    assert!(item.error.contains("enrich"));
    assert_eq!(h.llm.total_calls(), 0);
    assert_eq!(MockBatchService::count(&h.batch.uploads), 0);

    // 续跑不会自动重试前置缺失的单元
    let again = runner.resume(&failed.job_id, ResumeMode::Remaining).await.unwrap();
    assert_eq!(again.status, JobStatus::Failed);
    assert_eq!(h.llm.total_calls(), 0);
}

#[tokio::test]
async fn test_cancel_stops_new_units_and_keeps_checkpoints() {
    let h = Harness::new();
    let runner = h.runner(vec![atom("A"), atom("B")]);

    let mut p = params(&["A", "B"], PhaseTarget::All);
    p.max_concurrent_units = 1;
    let job = runner.create(p).await.unwrap();

    let (entered, release) = h.llm.pause_next_call();
    let handle = {
        let runner = runner.clone();
        let job_id = job.job_id.clone();
        tokio::spawn(async move { runner.execute(&job_id, false).await })
    };

    entered.notified().await;
    assert!(runner.is_active(&job.job_id));
    let requested = runner.cancel(&job.job_id).await.unwrap();
    assert!(requested.cancel_requested);
    release.notify_one();

    let cancelled = handle.await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());
    assert!(cancelled.completed_item_ids.is_empty());
    assert!(cancelled.failed_items.is_empty());
    assert_eq!(cancelled.progress.remaining, 2);
    assert!(!runner.is_active(&job.job_id));

    // 已提交的 enrich 检查点完好，B 没有开始
    assert_eq!(
        h.orchestrator.store().completed_phases("A").await.unwrap(),
        vec![Phase::Enrich]
    );
    assert_eq!(h.llm.calls("enrich"), 1);

    let resumed = runner.resume(&job.job_id, ResumeMode::Remaining).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Completed);
    assert!(!resumed.cancel_requested);
    assert_eq!(h.llm.calls("enrich"), 2);
}

#[tokio::test]
async fn test_cancel_requires_running_job() {
    let h = Harness::new();
    let runner = h.runner(vec![atom("A")]);
    let job = runner
        .start(params(&["A"], PhaseTarget::Through(Phase::Enrich)), false)
        .await
        .unwrap();

    let err = assert_err!(runner.cancel(&job.job_id).await);
    assert!(matches!(err, PipelineError::InvalidJobState { .. }));

    let err = assert_err!(runner.resume(&job.job_id, ResumeMode::Remaining).await);
    assert!(matches!(err, PipelineError::InvalidJobState { .. }));
}

#[tokio::test]
async fn test_crashed_running_job_can_be_resumed() {
    let h = Harness::new();
    let runner = h.runner(vec![atom("A")]);

    // 只建了记录，进程"崩溃"前没来得及执行
    let job = runner
        .create(params(&["A"], PhaseTarget::Through(Phase::Plan)))
        .await
        .unwrap();
    assert_eq!(runner.status(&job.job_id).await.unwrap().status, JobStatus::Running);

    let resumed = runner.resume(&job.job_id, ResumeMode::Remaining).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Completed);
    assert_eq!(h.llm.calls("plan"), 1);
}

#[tokio::test]
async fn test_start_with_resume_reuses_checkpoints_of_earlier_job() {
    let h = Harness::new();
    let runner = h.runner(vec![atom("A")]);

    runner
        .start(params(&["A"], PhaseTarget::Through(Phase::Plan)), false)
        .await
        .unwrap();
    let job = runner.start(params(&["A"], PhaseTarget::All), true).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(h.llm.calls("enrich"), 1);
    assert_eq!(h.llm.calls("plan"), 1);
    assert_eq!(runner.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_delete_with_purge_removes_checkpoints() {
    let h = Harness::new();
    let runner = h.runner(vec![atom("A")]);
    let job = runner.start(params(&["A"], PhaseTarget::All), false).await.unwrap();

    runner.delete(&job.job_id, true).await.unwrap();

    assert!(matches!(
        runner.status(&job.job_id).await,
        Err(PipelineError::JobNotFound(_))
    ));
    assert!(h
        .orchestrator
        .store()
        .completed_phases("A")
        .await
        .unwrap()
        .is_empty());
    let scope = BatchScope::new(&job.job_id, "A", Phase::Generate);
    assert!(h.batches.store().list_for_scope(&scope).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_without_purge_keeps_checkpoints() {
    let h = Harness::new();
    let runner = h.runner(vec![atom("A")]);
    let job = runner
        .start(params(&["A"], PhaseTarget::Through(Phase::Enrich)), false)
        .await
        .unwrap();

    runner.delete(&job.job_id, false).await.unwrap();

    assert!(h.orchestrator.store().exists("A", Phase::Enrich).await);
    assert!(runner.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_non_ascii_units_keep_separate_checkpoints() {
    let h = Harness::new();
    let runner = h.runner(vec![atom("一次函数"), atom("二次函数")]);

    runner
        .start(params(&["一次函数"], PhaseTarget::All), false)
        .await
        .unwrap();
    assert!(h
        .orchestrator
        .store()
        .completed_phases("二次函数")
        .await
        .unwrap()
        .is_empty());

    let job = runner
        .start(params(&["二次函数"], PhaseTarget::All), true)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(h.llm.calls("enrich"), 2);
    let record = h
        .orchestrator
        .store()
        .load("二次函数", Phase::Enrich)
        .await
        .unwrap();
    assert_eq!(record.unit_of_work_id, "二次函数");
    assert_eq!(h.sink.count(), 4);
}

#[tokio::test]
async fn test_duplicate_unit_ids_run_once() {
    let h = Harness::new();
    let runner = h.runner(vec![atom("A")]);

    let job = runner
        .start(params(&["A", "A"], PhaseTarget::Through(Phase::Enrich)), false)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.total, 1);
    assert_eq!(job.progress.remaining, 0);
    assert_eq!(job.completed_item_ids, vec!["A"]);
    assert_eq!(h.llm.calls("enrich"), 1);
}

#[tokio::test]
async fn test_resume_after_zero_yield_generate_resubmits() {
    let h = Harness::new();
    let runner = h.runner(vec![atom("A")]);

    h.batch.blank_answers(true);
    let failed = runner
        .start(params(&["A"], PhaseTarget::Through(Phase::Generate)), false)
        .await
        .unwrap();

    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failed_items[0].phase, Some(Phase::Generate));
    assert!(failed.failed_items[0].retryable);
    let scope = BatchScope::new(&failed.job_id, "A", Phase::Generate);
    let history = h.batches.store().list_for_scope(&scope).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].discarded);

    // 续跑真的会重新生成，而不是重放同一批无效结果
    h.batch.blank_answers(false);
    let job = runner.resume(&failed.job_id, ResumeMode::Remaining).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(MockBatchService::count(&h.batch.submits), 2);
    assert!(h.orchestrator.store().exists("A", Phase::Generate).await);
}
