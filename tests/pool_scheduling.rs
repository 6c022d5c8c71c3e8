// Integration tests for pool scheduling
//
// These tests verify the scheduling decision chain end to end:
// - Idle-worker reuse before worker creation
// - The pool-size capacity bound and FIFO queueing beyond it
// - Worker affinity, including synchronous rejection of unknown ids
// - Per-task message ordering on the returned stream
// - Failure handling and pool termination

use scriptpool::context::Context;
use scriptpool::pool::{PoolError, TaskError, TaskRequest, WorkerPool};
use scriptpool::registry::{EntryPointArguments, EntryPointError, EntryPointRegistry, TaskOutcome};
use scriptpool::{PoolConfig, WorkerMessage};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};

/// Registry with the entry points the scheduling tests drive.
///
/// `gate` parks until a permit is released, `record` appends its argument to
/// the shared journal, `emit` produces a log and a data message before its
/// result, and `fail` always errors.
fn test_registry(gate: Arc<Semaphore>, journal: Arc<Mutex<Vec<Value>>>) -> Arc<EntryPointRegistry> {
    let mut registry = EntryPointRegistry::new();

    registry.register_entry_point("literal", |input: EntryPointArguments| {
        Ok(TaskOutcome::Value(input.args))
    });

    registry.register_entry_point("gate", move |input: EntryPointArguments| {
        let gate = gate.clone();
        Ok(TaskOutcome::pending(async move {
            let permit = gate
                .acquire_owned()
                .await
                .map_err(|_| EntryPointError::new("gate closed"))?;
            permit.forget();
            Ok(input.args)
        }))
    });

    registry.register_entry_point("record", move |input: EntryPointArguments| {
        journal.lock().unwrap().push(input.args.clone());
        Ok(TaskOutcome::Value(input.args))
    });

    registry.register_entry_point("emit", |input: EntryPointArguments| {
        input.context.info("halfway", None);
        let mut payload = serde_json::Map::new();
        payload.insert("progress".to_string(), json!(0.5));
        input.context.send_data(payload);
        Ok(TaskOutcome::Value(input.args))
    });

    registry.register_entry_point("fail", |_input: EntryPointArguments| {
        Err(EntryPointError::new("entry point refused"))
    });

    Arc::new(registry)
}

fn pool_of(size: usize, gate: &Arc<Semaphore>, journal: &Arc<Mutex<Vec<Value>>>) -> WorkerPool {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    WorkerPool::new(
        PoolConfig::with_pool_size(size),
        test_registry(gate.clone(), journal.clone()),
    )
}

/// Poll a condition until it holds, failing after two seconds
async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_count_never_exceeds_pool_size() {
    let gate = Arc::new(Semaphore::new(0));
    let journal = Arc::new(Mutex::new(Vec::new()));
    let pool = pool_of(2, &gate, &journal);
    let context = Context::new("test");

    let streams: Vec<_> = (1..=3)
        .map(|n| {
            pool.schedule(TaskRequest::new("blocked", "gate", json!(n)), &context)
                .unwrap()
        })
        .collect();

    eventually("two running, one queued", || {
        pool.busy_workers().len() == 2 && pool.queued_tasks() == 1
    })
    .await;
    assert_eq!(pool.worker_ids().len(), 2);
    assert_eq!(pool.running_tasks().len(), 2);

    gate.add_permits(3);
    for (stream, n) in streams.into_iter().zip(1..=3) {
        assert_eq!(stream.wait().await.unwrap(), json!(n));
    }
    // The third task reused a freed worker instead of creating a new one
    assert_eq!(pool.worker_ids().len(), 2);
    pool.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queued_tasks_run_in_submission_order() {
    let gate = Arc::new(Semaphore::new(0));
    let journal = Arc::new(Mutex::new(Vec::new()));
    let pool = pool_of(1, &gate, &journal);
    let context = Context::new("test");

    let blocker = pool
        .schedule(TaskRequest::new("blocked", "gate", json!(0)), &context)
        .unwrap();
    eventually("worker busy on the blocker", || {
        pool.busy_workers().len() == 1
    })
    .await;

    let streams: Vec<_> = (1..=3)
        .map(|n| {
            pool.schedule(TaskRequest::new("queued", "record", json!(n)), &context)
                .unwrap()
        })
        .collect();
    assert_eq!(pool.queued_tasks(), 3);

    gate.add_permits(1);
    blocker.wait().await.unwrap();
    for stream in streams {
        stream.wait().await.unwrap();
    }

    assert_eq!(*journal.lock().unwrap(), vec![json!(1), json!(2), json!(3)]);
    // A single worker served everything
    assert_eq!(pool.worker_ids().len(), 1);
    pool.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_worker_reused_across_tasks() {
    let gate = Arc::new(Semaphore::new(0));
    let journal = Arc::new(Mutex::new(Vec::new()));
    let pool = pool_of(4, &gate, &journal);
    let context = Context::new("test");

    for n in 0..3 {
        let stream = pool
            .schedule(TaskRequest::new("sequential", "literal", json!(n)), &context)
            .unwrap();
        assert_eq!(stream.wait().await.unwrap(), json!(n));
    }
    // Sequential tasks never warrant a second worker
    assert_eq!(pool.worker_ids().len(), 1);
    pool.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pinned_task_waits_for_its_busy_worker() {
    let gate = Arc::new(Semaphore::new(0));
    let journal = Arc::new(Mutex::new(Vec::new()));
    let pool = pool_of(2, &gate, &journal);
    let context = Context::new("test");

    let blocker = pool
        .schedule(TaskRequest::new("blocked", "gate", json!(0)), &context)
        .unwrap();
    eventually("worker busy on the blocker", || {
        pool.busy_workers().len() == 1
    })
    .await;
    let target = pool.busy_workers().remove(0);

    let pinned = pool
        .schedule(
            TaskRequest::new("pinned", "literal", json!("affinity")).on_worker(&target),
            &context,
        )
        .unwrap();

    // Capacity remains, yet the pinned task must not spawn a second worker
    sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.queued_tasks(), 1);
    assert_eq!(pool.worker_ids().len(), 1);

    gate.add_permits(1);
    blocker.wait().await.unwrap();
    assert_eq!(pinned.wait().await.unwrap(), json!("affinity"));
    assert_eq!(pool.worker_ids(), vec![target]);
    pool.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_worker_fails_before_queueing() {
    let gate = Arc::new(Semaphore::new(0));
    let journal = Arc::new(Mutex::new(Vec::new()));
    let pool = pool_of(2, &gate, &journal);
    let context = Context::new("test");

    let result = pool.schedule(
        TaskRequest::new("pinned", "literal", json!(null)).on_worker("w424242"),
        &context,
    );
    assert_eq!(
        result.err(),
        Some(PoolError::UnknownWorker("w424242".to_string()))
    );
    assert_eq!(pool.queued_tasks(), 0);
    assert!(pool.worker_ids().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_yields_start_logs_data_then_exit() {
    let gate = Arc::new(Semaphore::new(0));
    let journal = Arc::new(Mutex::new(Vec::new()));
    let pool = pool_of(1, &gate, &journal);
    let context = Context::new("test");

    let mut stream = pool
        .schedule(TaskRequest::new("emitting", "emit", json!("done")), &context)
        .unwrap();

    assert!(matches!(
        stream.recv().await.unwrap().unwrap(),
        WorkerMessage::Start { .. }
    ));
    match stream.recv().await.unwrap().unwrap() {
        WorkerMessage::Log { text, .. } => assert_eq!(text, "halfway"),
        other => panic!("expected Log, got {:?}", other),
    }
    match stream.recv().await.unwrap().unwrap() {
        WorkerMessage::Data { payload, .. } => assert_eq!(payload["progress"], json!(0.5)),
        other => panic!("expected Data, got {:?}", other),
    }
    match stream.recv().await.unwrap().unwrap() {
        WorkerMessage::Exit { error, result, .. } => {
            assert!(!error);
            assert_eq!(result, json!("done"));
        }
        other => panic!("expected Exit, got {:?}", other),
    }
    assert!(stream.recv().await.is_none());
    pool.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_task_reports_error_and_frees_worker() {
    let gate = Arc::new(Semaphore::new(0));
    let journal = Arc::new(Mutex::new(Vec::new()));
    let pool = pool_of(1, &gate, &journal);
    let context = Context::new("test");

    let failing = pool
        .schedule(TaskRequest::new("doomed", "fail", json!(null)), &context)
        .unwrap();
    let failing_id = failing.task_id().to_string();
    match failing.wait().await {
        Err(TaskError::Failed { task_id, result }) => {
            assert_eq!(task_id, failing_id);
            assert_eq!(result, json!("entry point refused"));
        }
        other => panic!("expected Failed, got {:?}", other),
    }

    // The worker survives the failure and serves the next task
    let next = pool
        .schedule(TaskRequest::new("recovery", "literal", json!(9)), &context)
        .unwrap();
    assert_eq!(next.wait().await.unwrap(), json!(9));
    assert_eq!(pool.worker_ids().len(), 1);
    pool.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminate_abandons_running_and_queued_tasks() {
    let gate = Arc::new(Semaphore::new(0));
    let journal = Arc::new(Mutex::new(Vec::new()));
    let pool = pool_of(1, &gate, &journal);
    let context = Context::new("test");

    let running = pool
        .schedule(TaskRequest::new("blocked", "gate", json!(0)), &context)
        .unwrap();
    eventually("worker busy on the blocker", || {
        pool.busy_workers().len() == 1
    })
    .await;
    let queued = pool
        .schedule(TaskRequest::new("never runs", "literal", json!(1)), &context)
        .unwrap();

    pool.terminate();
    assert!(pool.worker_ids().is_empty());
    assert_eq!(pool.queued_tasks(), 0);

    assert!(matches!(
        running.wait().await,
        Err(TaskError::Abandoned { .. })
    ));
    assert!(matches!(
        queued.wait().await,
        Err(TaskError::Abandoned { .. })
    ));
}
