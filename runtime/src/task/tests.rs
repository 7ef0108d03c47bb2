use super::{CompletionQueue, Executor};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

type Log = Vec<String>;

async fn run_next(queue: &mut CompletionQueue<Log>, log: &mut Log) {
    let completion = timeout(Duration::from_secs(2), queue.recv())
        .await
        .expect("completion timed out")
        .expect("completion queue closed");
    queue.run(completion, log);
}

#[tokio::test]
async fn test_go_runs_completion_on_owner() {
    let (executor, mut queue) = Executor::<Log>::new(4);
    let mut log = Log::new();
    let worked = Arc::new(Mutex::new(false));

    let flag = worked.clone();
    executor.go(
        move || *flag.lock() = true,
        |log: &mut Log| log.push("done".to_string()),
    );
    assert_eq!(executor.pending(), 1);

    run_next(&mut queue, &mut log).await;
    assert!(*worked.lock());
    assert_eq!(log, vec!["done".to_string()]);
    assert!(executor.idle());
}

#[tokio::test]
async fn test_panicking_work_still_completes() {
    let (executor, mut queue) = Executor::<Log>::new(4);
    let mut log = Log::new();

    executor.go(|| panic!("work"), |log: &mut Log| log.push("cb".to_string()));
    run_next(&mut queue, &mut log).await;

    assert_eq!(log, vec!["cb".to_string()]);
    assert!(executor.idle());
}

#[tokio::test]
async fn test_panicking_completion_is_contained() {
    let (executor, mut queue) = Executor::<Log>::new(4);
    let mut log = Log::new();

    executor.go(|| {}, |_: &mut Log| panic!("completion"));
    run_next(&mut queue, &mut log).await;

    assert!(log.is_empty());
    assert_eq!(queue.pending(), 0);
}

#[tokio::test]
async fn test_linear_context_runs_in_submission_order() {
    let (executor, mut queue) = Executor::<Log>::new(8);
    let linear = executor.linear_context();
    let mut log = Log::new();
    let work_order = Arc::new(Mutex::new(Vec::new()));

    // Earlier items take longer, so any overlap would reorder the log.
    for (label, delay_ms) in [("T1", 60u64), ("T2", 20), ("T3", 0)] {
        let order = work_order.clone();
        linear.go(
            move || {
                std::thread::sleep(Duration::from_millis(delay_ms));
                order.lock().push(label);
            },
            move |log: &mut Log| log.push(label.to_string()),
        );
    }

    for _ in 0..3 {
        run_next(&mut queue, &mut log).await;
    }

    assert_eq!(*work_order.lock(), vec!["T1", "T2", "T3"]);
    assert_eq!(log, vec!["T1", "T2", "T3"]);
    assert!(executor.idle());
    assert_eq!(linear.queued(), 0);
}

#[tokio::test]
async fn test_close_drains_outstanding_completions() {
    let (executor, mut queue) = Executor::<Log>::new(1);
    let mut log = Log::new();

    for i in 0..3 {
        executor.go(
            move || std::thread::sleep(Duration::from_millis(10 * i)),
            move |log: &mut Log| log.push(format!("task {}", i)),
        );
    }

    timeout(Duration::from_secs(2), queue.close(&mut log))
        .await
        .expect("close timed out");

    assert_eq!(log.len(), 3);
    assert!(executor.idle());
}

#[test]
fn test_linear_backlog_leaves_pool_for_plain_go() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(2)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let (executor, mut queue) = Executor::<Log>::new(8);
        let linear = executor.linear_context();
        let mut log = Log::new();

        for i in 0..4 {
            linear.go(
                || std::thread::sleep(Duration::from_millis(100)),
                move |log: &mut Log| log.push(format!("linear {}", i)),
            );
        }

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        executor.go(
            move || {
                let _ = started_tx.send(());
            },
            |log: &mut Log| log.push("plain".to_string()),
        );

        // The backlog needs 400ms on its single worker; plain work must not
        // queue behind it.
        timeout(Duration::from_millis(250), started_rx)
            .await
            .expect("plain work waited behind the linear backlog")
            .unwrap();

        timeout(Duration::from_secs(2), queue.close(&mut log))
            .await
            .expect("close timed out");

        assert_eq!(log.len(), 5);
        let linear_order: Vec<_> = log.iter().filter(|l| l.starts_with("linear")).collect();
        assert_eq!(
            linear_order,
            vec!["linear 0", "linear 1", "linear 2", "linear 3"]
        );
        assert_eq!(linear.queued(), 0);
    });
}
