use super::*;
use std::sync::atomic::{AtomicU32, Ordering};

#[rstest]
#[tokio::test(start_paused = true)]
async fn worker_acknowledges_success(context: Context) {
    let id = context
        .queue
        .push("SendReport", report_payload(1), None)
        .await
        .unwrap();
    let worker = context.worker(3);

    assert!(worker.run_once().await);
    assert!(!worker.run_once().await);

    let handled = context.recorder.handled();
    assert_eq!(handled.len(), 1);
    assert_eq!(handled[0].id, id);
    assert_eq!(context.committed(0), Some(1));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn worker_retries_until_max_tries() {
    let recorder = Recorder::new(|_| Err(HandlerError::Retry("report service busy".to_string())));
    let context = Context::new(1, connection(), recorder);
    let id = context
        .queue
        .push("SendReport", report_payload(1), None)
        .await
        .unwrap();
    let worker = context.worker(3);

    for _ in 0..3 {
        assert!(worker.run_once().await);
    }
    assert!(!worker.run_once().await);

    let attempts: Vec<u32> = context
        .recorder
        .handled()
        .iter()
        .map(|e| e.attempts)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(context.recorder.handled().iter().all(|e| e.id == id));

    let failed = context.recorder.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0.attempts, 3);
    assert_eq!(context.log.len(TOPIC), 3);
    assert_eq!(context.committed(0), Some(2));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn worker_releases_on_request() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let recorder = Recorder::new(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(HandlerError::Release(Duration::from_secs(5)))
        } else {
            Ok(())
        }
    });
    let context = Context::new(1, connection(), recorder);
    context
        .queue
        .push("SendReport", report_payload(1), None)
        .await
        .unwrap();
    let worker = context.worker(3);

    assert!(worker.run_once().await);
    assert_eq!(context.committed(0), None);
    assert!(!worker.run_once().await);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(worker.run_once().await);

    let attempts: Vec<u32> = context
        .recorder
        .handled()
        .iter()
        .map(|e| e.attempts)
        .collect();
    assert_eq!(attempts, vec![1, 1]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(context.committed(0), Some(1));
    assert_eq!(context.log.len(TOPIC), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn worker_fails_fatal_error_at_once() {
    let recorder = Recorder::new(|_| Err(HandlerError::Fatal("malformed report id".to_string())));
    let context = Context::new(1, connection(), recorder);
    let mut failures = context.queue.subscribe_failures();
    let id = context
        .queue
        .push("SendReport", report_payload(1), None)
        .await
        .unwrap();

    assert!(context.worker(3).run_once().await);

    assert_eq!(context.recorder.handled().len(), 1);
    let failed = context.recorder.failed();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].1.contains("malformed report id"));
    let report = failures.try_recv().unwrap();
    assert_eq!(report.kind, FailureKind::Job);
    assert_eq!(report.job_id, Some(id));
    assert_eq!(context.log.len(TOPIC), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn worker_fails_unknown_handler(context: Context) {
    let mut failures = context.queue.subscribe_failures();
    let id = context
        .queue
        .push("App\\Jobs\\Unknown", report_payload(1), None)
        .await
        .unwrap();

    assert!(context.worker(3).run_once().await);

    assert!(context.recorder.handled().is_empty());
    let report = failures.try_recv().unwrap();
    assert_eq!(report.kind, FailureKind::Job);
    assert_eq!(report.job_id, Some(id));
    assert!(report.error.contains("App\\Jobs\\Unknown"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn worker_fails_exhausted_job_without_handling(context: Context) {
    let mut envelope = Envelope::new("SendReport", report_payload(1));
    envelope.attempts = 5;
    context
        .queue
        .push_raw(&envelope.to_bytes().unwrap(), None)
        .await
        .unwrap();

    assert!(context.worker(3).run_once().await);

    assert!(context.recorder.handled().is_empty());
    let failed = context.recorder.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0.attempts, 5);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn worker_releases_when_retry_cannot_be_published() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let recorder = Recorder::new(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(HandlerError::Retry("report service busy".to_string()))
        } else {
            Ok(())
        }
    });
    let context = Context::new(1, connection(), recorder);
    context
        .queue
        .push("SendReport", report_payload(1), None)
        .await
        .unwrap();
    let worker = context.worker(3);

    context.queue.broker().fail_next_publish("leader not available");
    assert!(worker.run_once().await);
    assert_eq!(context.log.len(TOPIC), 1);

    assert!(worker.run_once().await);
    let attempts: Vec<u32> = context
        .recorder
        .handled()
        .iter()
        .map(|e| e.attempts)
        .collect();
    assert_eq!(attempts, vec![1, 1]);
    assert_eq!(context.committed(0), Some(1));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn worker_on_named_topic(context: Context) {
    context
        .queue
        .push("SendReport", report_payload(1), Some("reports"))
        .await
        .unwrap();
    let worker = context.worker(3).on_topic("reports");

    assert!(worker.run_once().await);
    assert_eq!(context.log.committed(GROUP, "reports", 0), Some(1));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn pool_processes_then_shuts_down(context: Context) {
    for i in 0..6 {
        context
            .queue
            .push("SendReport", report_payload(i), None)
            .await
            .unwrap();
    }
    let pool = WorkerPool::new(context.dyn_queue());
    pool.spawn_many(2, Arc::clone(&context.handlers), WorkerOptions::default())
        .await;

    let wait = async {
        while context.recorder.handled().len() < 6 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(30), pool.shutdown())
        .await
        .unwrap();

    assert_eq!(context.committed(0), Some(6));
    pool.shutdown().await;
}
