mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Fixture, Script, ScriptedEngine};
use tokio_util::sync::CancellationToken;
use vconv_core::{AckPolicy, IdempotencyStore, SpoolDirectorySource, TaskSource, UploadTask, WorkerPool};

async fn spool(fixture: &Fixture) -> SpoolDirectorySource {
    let spool = SpoolDirectorySource::new(fixture.dir.path().join("spool"));
    spool.initialize().await.unwrap();
    spool
}

fn count_files(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[tokio::test]
async fn drains_the_spool_and_acknowledges_everything() {
    let fixture = Fixture::new();
    fixture.write_chunks(1, &[("1.chunk", b"A")]);
    fixture.write_chunks(2, &[("1.chunk", b"B")]);
    let spool = spool(&fixture).await;
    spool.enqueue(&UploadTask::new(1, "").to_payload()).await.unwrap();
    spool.enqueue(b"garbage").await.unwrap();
    spool.enqueue(&UploadTask::new(2, "").to_payload()).await.unwrap();

    let engine = ScriptedEngine::new(Script::Succeed);
    let handler = Arc::new(fixture.handler(engine.clone()));
    let pool = WorkerPool::new(handler, Arc::new(spool.clone())).with_concurrency(2);

    let report = pool.run_until_idle(CancellationToken::new()).await;

    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.requeued, 0);
    assert_eq!(report.panicked, 0);
    assert_eq!(spool.pending().await.unwrap(), 0);
    assert_eq!(count_files(&spool.done()), 3);
    assert_eq!(count_files(&spool.processing()), 0);
    assert!(fixture.store.is_processed(1).unwrap());
    assert!(fixture.store.is_processed(2).unwrap());
}

#[tokio::test]
async fn requeue_policy_hands_failures_back() {
    let fixture = Fixture::new();
    fixture.write_chunks(3, &[("1.chunk", b"A")]);
    let spool = spool(&fixture).await;
    spool.enqueue(&UploadTask::new(3, "").to_payload()).await.unwrap();

    let engine = ScriptedEngine::new(Script::Fail("moov atom not found"));
    let handler = Arc::new(fixture.handler(engine.clone()));
    let pool = WorkerPool::new(handler, Arc::new(spool.clone()))
        .with_ack_policy(AckPolicy::RequeueOnFailure);

    let report = pool.run_until_idle(CancellationToken::new()).await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(engine.calls(), 1);
    assert_eq!(spool.pending().await.unwrap(), 1);
    assert_eq!(count_files(&spool.done()), 0);
}

#[tokio::test]
async fn ack_policy_drops_failures() {
    let fixture = Fixture::new();
    let spool = spool(&fixture).await;
    spool.enqueue(&UploadTask::new(4, "").to_payload()).await.unwrap();

    let engine = ScriptedEngine::new(Script::Succeed);
    let handler = Arc::new(fixture.handler(engine));
    let pool = WorkerPool::new(handler, Arc::new(spool.clone()));

    let report = pool.run_until_idle(CancellationToken::new()).await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.requeued, 0);
    assert_eq!(spool.pending().await.unwrap(), 0);
    assert_eq!(fixture.errors.list_for_video(4, 10).unwrap().len(), 1);
}

#[tokio::test]
async fn long_running_pool_picks_up_new_work_until_shutdown() {
    let fixture = Fixture::new();
    fixture.write_chunks(5, &[("1.chunk", b"A")]);
    let spool = spool(&fixture).await;

    let engine = ScriptedEngine::new(Script::Succeed);
    let handler = Arc::new(fixture.handler(engine));
    let pool = WorkerPool::new(handler, Arc::new(spool.clone()))
        .with_poll_interval(Duration::from_millis(10));
    let shutdown = CancellationToken::new();
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };

    spool.enqueue(&UploadTask::new(5, "").to_payload()).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !fixture.store.is_processed(5).unwrap() {
        assert!(tokio::time::Instant::now() < deadline, "task was never processed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    let report = running.await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(spool.pending().await.unwrap(), 0);
}

#[tokio::test]
async fn shutdown_requeues_conversions_in_flight() {
    let fixture = Fixture::new();
    fixture.write_chunks(6, &[("1.chunk", b"A")]);
    let spool = spool(&fixture).await;
    spool.enqueue(&UploadTask::new(6, "").to_payload()).await.unwrap();

    let engine = ScriptedEngine::new(Script::WaitForCancel);
    let handler = Arc::new(fixture.handler(engine.clone()));
    let pool = WorkerPool::new(handler, Arc::new(spool.clone()))
        .with_poll_interval(Duration::from_millis(10));
    let shutdown = CancellationToken::new();
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };

    while engine.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown.cancel();
    let report = running.await.unwrap();

    assert_eq!(report.cancelled, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(spool.pending().await.unwrap(), 1);
    assert!(!fixture.store.is_processed(6).unwrap());
}

#[tokio::test]
async fn restarted_worker_resumes_its_own_stranded_task() {
    let fixture = Fixture::new();
    fixture.write_chunks(21, &[("1.chunk", b"A"), ("2.chunk", b"B")]);
    let spool = spool(&fixture).await;
    spool.enqueue(&UploadTask::new(21, "").to_payload()).await.unwrap();

    // The previous process claimed the upload and died mid-conversion.
    fixture
        .store
        .try_claim(21, "converter@encoder-01", Duration::from_secs(3600))
        .unwrap();
    let stranded = spool.next_delivery().await.unwrap().unwrap();
    drop(stranded);
    assert_eq!(spool.recover().await.unwrap(), 1);

    let engine = ScriptedEngine::new(Script::Succeed);
    let handler = Arc::new(
        fixture
            .handler(engine.clone())
            .with_worker_id("converter@encoder-01"),
    );
    let pool = WorkerPool::new(handler, Arc::new(spool.clone()));

    let report = pool.run_until_idle(CancellationToken::new()).await;

    assert_eq!(report.completed, 1);
    assert_eq!(report.claimed_elsewhere, 0);
    assert_eq!(engine.calls(), 1);
    assert_eq!(engine.last_input().as_deref(), Some(&b"AB"[..]));
    assert!(fixture.store.is_processed(21).unwrap());
    assert_eq!(count_files(&spool.done()), 1);
}

#[tokio::test]
async fn upload_claimed_by_another_worker_stays_queued() {
    let fixture = Fixture::new();
    fixture.write_chunks(22, &[("1.chunk", b"A")]);
    let spool = spool(&fixture).await;
    spool.enqueue(&UploadTask::new(22, "").to_payload()).await.unwrap();
    fixture
        .store
        .try_claim(22, "converter@encoder-02", Duration::from_secs(3600))
        .unwrap();

    let engine = ScriptedEngine::new(Script::Succeed);
    let handler = Arc::new(fixture.handler(engine.clone()).with_worker_id("converter@encoder-01"));
    let pool = WorkerPool::new(handler, Arc::new(spool.clone()));

    let report = pool.run_until_idle(CancellationToken::new()).await;

    assert_eq!(report.claimed_elsewhere, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(engine.calls(), 0);
    assert_eq!(spool.pending().await.unwrap(), 1);
    assert_eq!(count_files(&spool.done()), 0);
}

#[tokio::test]
async fn persistent_failure_is_retried_at_the_poll_interval() {
    let fixture = Fixture::new();
    fixture.write_chunks(23, &[("1.chunk", b"A")]);
    let spool = spool(&fixture).await;
    spool.enqueue(&UploadTask::new(23, "").to_payload()).await.unwrap();

    let engine = ScriptedEngine::new(Script::Fail("moov atom not found"));
    let handler = Arc::new(fixture.handler(engine.clone()));
    let pool = WorkerPool::new(handler, Arc::new(spool.clone()))
        .with_ack_policy(AckPolicy::RequeueOnFailure)
        .with_poll_interval(Duration::from_millis(100));
    let shutdown = CancellationToken::new();
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(450)).await;
    shutdown.cancel();
    let report = running.await.unwrap();

    let calls = engine.calls();
    assert!((1..=6).contains(&calls), "engine ran {calls} times");
    assert_eq!(report.failed, calls);
    assert_eq!(fixture.errors.list_for_video(23, 100).unwrap().len(), calls);
    assert_eq!(spool.pending().await.unwrap(), 1);
}
