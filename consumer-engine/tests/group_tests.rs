use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use consumer_engine::group::ConsumerGroupFactory;
use consumer_engine::test_utils::{FakeGroupFactory, FnBatchProcessor};
use consumer_engine::{FailStrategy, GroupComponent, GroupOptions, RetryPolicy, RunError, Stage};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod common;
use common::{gaps, wait_until};

fn component(
    factory: Arc<FakeGroupFactory>,
    processor: Arc<FnBatchProcessor>,
    options: GroupOptions,
) -> GroupComponent {
    let group_factory: Arc<dyn ConsumerGroupFactory> = factory;
    GroupComponent::new(
        "orders",
        "orders-group",
        vec!["localhost:9092".to_string()],
        vec!["orders".to_string()],
        processor,
        GroupOptions {
            group_factory: Some(group_factory),
            ..options
        },
    )
    .unwrap()
}

fn batching(batch_size: usize, batch_timeout: Duration) -> GroupOptions {
    GroupOptions {
        batch_size,
        batch_timeout,
        ..Default::default()
    }
}

fn start(component: GroupComponent) -> (CancellationToken, JoinHandle<Result<(), RunError>>) {
    let shutdown = CancellationToken::new();
    let run = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { component.run(shutdown).await }
    });
    (shutdown, run)
}

#[tokio::test(start_paused = true)]
async fn test_full_batch_flushes_once() {
    let factory = Arc::new(FakeGroupFactory::new(vec![vec!["a", "b", "c", "d", "e"]]));
    let processor = Arc::new(FnBatchProcessor::new(|_| Ok(())));
    let (shutdown, run) = start(component(
        factory.clone(),
        processor.clone(),
        batching(5, Duration::from_secs(60)),
    ));

    wait_until(|| !processor.batch_offsets().is_empty()).await;
    shutdown.cancel();

    assert!(run.await.unwrap().is_ok());
    assert_eq!(processor.batch_offsets(), vec![vec![0, 1, 2, 3, 4]]);
    assert_eq!(factory.log().committed(0), Some(5));
}

#[tokio::test(start_paused = true)]
async fn test_partial_batch_flushes_on_timeout() {
    let factory = Arc::new(FakeGroupFactory::new(vec![vec!["a", "b", "c", "d"]]));
    let processor = Arc::new(FnBatchProcessor::new(|_| Ok(())));
    let (shutdown, run) = start(component(
        factory,
        processor.clone(),
        batching(5, Duration::from_millis(100)),
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(processor.batch_offsets().is_empty());

    wait_until(|| !processor.batch_offsets().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();

    assert!(run.await.unwrap().is_ok());
    assert_eq!(processor.batch_offsets(), vec![vec![0, 1, 2, 3]]);
}

#[tokio::test(start_paused = true)]
async fn test_small_batch_keeps_send_order() {
    let factory = Arc::new(FakeGroupFactory::new(vec![vec!["one", "two", "three"]]));
    let processor = Arc::new(FnBatchProcessor::new(|_| Ok(())));
    let (shutdown, run) = start(component(
        factory,
        processor.clone(),
        batching(10, Duration::from_millis(100)),
    ));

    wait_until(|| !processor.batch_payloads().is_empty()).await;
    shutdown.cancel();

    assert!(run.await.unwrap().is_ok());
    assert_eq!(processor.batch_payloads(), vec![vec!["one", "two", "three"]]);
}

#[tokio::test(start_paused = true)]
async fn test_partitions_are_batched_separately() {
    let factory = Arc::new(FakeGroupFactory::new(vec![
        vec!["p0-a", "p0-b"],
        vec!["p1-a", "p1-b"],
    ]));
    let processor = Arc::new(FnBatchProcessor::new(|batch| {
        let partition = batch.partition().partition_number();
        for message in batch.messages() {
            let payload = String::from_utf8_lossy(message.payload().unwrap_or_default());
            assert!(payload.starts_with(&format!("p{partition}-")));
        }
        Ok(())
    }));
    let (shutdown, run) = start(component(
        factory.clone(),
        processor.clone(),
        batching(2, Duration::from_secs(60)),
    ));

    wait_until(|| processor.batch_offsets().len() == 2).await;
    shutdown.cancel();

    assert!(run.await.unwrap().is_ok());
    assert_eq!(factory.log().committed(0), Some(2));
    assert_eq!(factory.log().committed(1), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_skip_marks_failing_batch_and_keeps_consuming() {
    let factory = Arc::new(FakeGroupFactory::new(vec![vec!["bad", "x", "y", "z"]]));
    let processor = Arc::new(FnBatchProcessor::new(|batch| {
        let failing = batch
            .messages()
            .iter()
            .any(|m| m.payload() == Some(b"bad".as_slice()));
        if failing {
            anyhow::bail!("poison message");
        }
        Ok(())
    }));
    let (shutdown, run) = start(component(
        factory.clone(),
        processor.clone(),
        GroupOptions {
            fail_strategy: FailStrategy::Skip,
            ..batching(2, Duration::from_secs(60))
        },
    ));

    wait_until(|| processor.batch_offsets().len() == 2).await;
    shutdown.cancel();

    assert!(run.await.unwrap().is_ok());
    assert_eq!(processor.batch_offsets(), vec![vec![0, 1], vec![2, 3]]);
    assert_eq!(factory.log().committed(0), Some(4));
    assert_eq!(factory.log().joins(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exit_redelivers_failing_batch_after_reconnect() {
    let calls = Arc::new(AtomicUsize::new(0));
    let factory = Arc::new(FakeGroupFactory::new(vec![vec!["a", "b"]]));
    let processor = Arc::new(FnBatchProcessor::new({
        let calls = calls.clone();
        move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("downstream unavailable");
            }
            Ok(())
        }
    }));
    let (shutdown, run) = start(component(
        factory.clone(),
        processor.clone(),
        GroupOptions {
            fail_strategy: FailStrategy::Exit,
            retry: RetryPolicy::build(2, Duration::from_millis(100)).provide(),
            ..batching(2, Duration::from_secs(60))
        },
    ));

    wait_until(|| processor.batch_offsets().len() == 2).await;
    shutdown.cancel();

    assert!(run.await.unwrap().is_ok());
    assert_eq!(processor.batch_payloads(), vec![vec!["a", "b"], vec!["a", "b"]]);
    assert_eq!(factory.log().joins(), 2);
    assert_eq!(factory.log().closes(), 2);
    assert_eq!(factory.log().committed(0), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_exit_exhausts_retries_without_marking() {
    let factory = Arc::new(FakeGroupFactory::new(vec![vec!["a"]]));
    let processor = Arc::new(FnBatchProcessor::new(|_| anyhow::bail!("always failing")));
    let component = component(
        factory.clone(),
        processor.clone(),
        GroupOptions {
            retry: RetryPolicy::build(1, Duration::from_millis(100)).provide(),
            ..batching(1, Duration::from_secs(60))
        },
    );

    let err = component.run(CancellationToken::new()).await.unwrap_err();

    assert_eq!(err.stage(), Stage::Process);
    assert_eq!(err.retries(), 1);
    assert_eq!(processor.batch_offsets(), vec![vec![0], vec![0]]);
    assert_eq!(factory.log().committed(0), None);
    assert_eq!(factory.log().joins(), 2);
    assert_eq!(factory.log().closes(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sync_commit_failure_is_fatal() {
    let factory = Arc::new(FakeGroupFactory::new(vec![vec!["a"]]).failing_commits());
    let processor = Arc::new(FnBatchProcessor::new(|_| Ok(())));
    let component = component(
        factory.clone(),
        processor,
        GroupOptions {
            commit_sync: true,
            retry: RetryPolicy::build(3, Duration::from_millis(100)).provide(),
            ..batching(1, Duration::from_secs(60))
        },
    );

    let err = component.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, RunError::Commit { retries: 0, .. }));
    assert_eq!(factory.log().joins(), 1);
    assert_eq!(factory.log().commits(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_join_failures_are_retried_after_the_wait() {
    let factory = Arc::new(FakeGroupFactory::new(vec![vec!["a"]]).failing_joins(2));
    let processor = Arc::new(FnBatchProcessor::new(|_| Ok(())));
    let (shutdown, run) = start(component(
        factory.clone(),
        processor.clone(),
        GroupOptions {
            retry: RetryPolicy::build(2, Duration::from_millis(200)).provide(),
            ..batching(1, Duration::from_secs(60))
        },
    ));

    wait_until(|| !processor.batch_offsets().is_empty()).await;
    shutdown.cancel();

    assert!(run.await.unwrap().is_ok());
    assert_eq!(factory.log().joins(), 3);
    assert_eq!(factory.log().sessions(), 1);
    for gap in gaps(&factory.log().join_instants()) {
        assert!(gap >= Duration::from_millis(200), "rejoined after {gap:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_join_failures_exhaust_the_budget() {
    let factory = Arc::new(FakeGroupFactory::new(vec![]).failing_joins(10));
    let component = component(
        factory.clone(),
        Arc::new(FnBatchProcessor::new(|_| Ok(()))),
        GroupOptions {
            retry: RetryPolicy::build(2, Duration::from_millis(100)).provide(),
            ..Default::default()
        },
    );

    let err = component.run(CancellationToken::new()).await.unwrap_err();

    assert_eq!(err.stage(), Stage::Connect);
    assert_eq!(err.retries(), 2);
    assert_eq!(factory.log().joins(), 3);
    assert_eq!(factory.log().closes(), 0);
}
