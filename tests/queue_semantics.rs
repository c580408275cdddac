//! End-to-end queue behaviour against the in-process store.
//!
//! Run with: cargo test --test queue_semantics

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use redjob::{RetryBackoff, StoreHandle, WorkerOptions, WorkerPool};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Task {
    id: u32,
    label: String,
}

fn task(id: u32, label: &str) -> Task {
    Task {
        id,
        label: label.to_string(),
    }
}

fn options() -> WorkerOptions {
    WorkerOptions::default().with_poll_interval(Duration::from_millis(10))
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

#[tokio::test]
async fn test_priority_then_fifo_order() {
    let store = StoreHandle::in_memory();
    let pool = WorkerPool::<Task>::configure(store.clone(), "ordered", options().with_max_concurrency(1)).unwrap();

    for (priority, label) in [(5, "a"), (1, "b"), (5, "c"), (3, "d")] {
        let mut dispatcher = redjob::Dispatcher::bind(store.clone(), "ordered")
            .unwrap()
            .with_priority(priority);
        dispatcher.set_payload(task(priority, label));
        dispatcher.dispatch().await.unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let order = Arc::clone(&seen);
    pool.run(move |_ctx, task: Task| {
        let order = Arc::clone(&order);
        async move {
            order.lock().push(task.label);
            Ok(())
        }
    })
    .await
    .unwrap();

    wait_until("all four acked", || pool.stats().acked == 4).await;
    pool.stop().await;

    assert_eq!(*seen.lock(), vec!["a", "c", "d", "b"]);
}

#[tokio::test]
async fn test_successful_job_is_removed() {
    let store = StoreHandle::in_memory();
    let pool = WorkerPool::<Task>::configure(store.clone(), "simple", options()).unwrap();

    pool.run(|_ctx, _task: Task| async { Ok(()) }).await.unwrap();

    let mut dispatcher = pool.dispatcher();
    dispatcher.set_payload(task(1, "one"));
    dispatcher.dispatch().await.unwrap();

    wait_until("acked", || pool.stats().acked == 1).await;
    pool.stop().await;

    let stats = store.stats("simple").await.unwrap();
    assert_eq!(stats.pending_jobs, 0);
    assert_eq!(stats.in_progress_jobs, 0);
    assert_eq!(stats.dead_letter_jobs, 0);
}

#[tokio::test]
async fn test_exhausted_job_is_dead_lettered_after_max_fails() {
    let store = StoreHandle::in_memory();
    let pool = WorkerPool::<Task>::configure(store.clone(), "failing", options().with_max_fails(2)).unwrap();
    let invocations = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&invocations);
    pool.run(move |_ctx, _task: Task| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow::anyhow!("smtp refused"))
        }
    })
    .await
    .unwrap();

    let mut dispatcher = pool.dispatcher();
    dispatcher.set_payload(task(1, "mail"));
    dispatcher.dispatch().await.unwrap();

    wait_until("dead-lettered", || pool.stats().dead_lettered == 1).await;
    pool.stop().await;

    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().retried, 1);

    let stats = store.stats("failing").await.unwrap();
    assert_eq!(stats.pending_jobs, 0);
    assert_eq!(stats.dead_letter_jobs, 1);

    let dead = store.dead_letters("failing", 10).await.unwrap();
    assert_eq!(dead[0].envelope.fail_count, 2);
    assert_eq!(dead[0].envelope.queue, "failing");
    assert!(dead[0].error.contains("smtp refused"));
}

#[tokio::test]
async fn test_skip_dead_letter_discards() {
    let store = StoreHandle::in_memory();
    let pool = WorkerPool::<Task>::configure(
        store.clone(),
        "discarding",
        options().with_max_fails(1).with_skip_dead(),
    )
    .unwrap();

    pool.run(|_ctx, _task: Task| async { Err::<(), _>(anyhow::anyhow!("nope")) })
        .await
        .unwrap();

    let mut dispatcher = pool.dispatcher();
    dispatcher.set_payload(task(1, "gone"));
    dispatcher.dispatch().await.unwrap();

    wait_until("discarded", || pool.stats().discarded == 1).await;
    pool.stop().await;

    let stats = store.stats("discarding").await.unwrap();
    assert_eq!(stats.total_jobs(), 0);
}

#[tokio::test]
async fn test_retry_then_success_sees_attempt_number() {
    let store = StoreHandle::in_memory();
    let pool = WorkerPool::<Task>::configure(store.clone(), "flaky", options()).unwrap();
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&attempts);
    pool.run(move |ctx, _task: Task| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().push(ctx.attempt());
            if ctx.attempt() == 1 {
                anyhow::bail!("transient");
            }
            Ok(())
        }
    })
    .await
    .unwrap();

    let mut dispatcher = pool.dispatcher();
    dispatcher.set_payload(task(1, "flaky"));
    dispatcher.dispatch().await.unwrap();

    wait_until("acked on retry", || pool.stats().acked == 1).await;
    pool.stop().await;

    assert_eq!(*attempts.lock(), vec![1, 2]);
    assert_eq!(pool.stats().retried, 1);
}

#[tokio::test]
async fn test_fixed_backoff_delays_retry() {
    let store = StoreHandle::in_memory();
    let pool = WorkerPool::<Task>::configure(
        store.clone(),
        "backoff",
        options().with_retry_backoff(RetryBackoff::Fixed(Duration::from_millis(300))),
    )
    .unwrap();
    let first_failed = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&first_failed);
    pool.run(move |ctx, _task: Task| {
        let flag = Arc::clone(&flag);
        async move {
            if ctx.attempt() == 1 {
                flag.store(true, Ordering::SeqCst);
                anyhow::bail!("later");
            }
            Ok(())
        }
    })
    .await
    .unwrap();

    let mut dispatcher = pool.dispatcher();
    dispatcher.set_payload(task(1, "later"));
    dispatcher.dispatch().await.unwrap();

    wait_until("first failure", || pool.stats().retried == 1).await;
    assert_eq!(store.stats("backoff").await.unwrap().scheduled_retries, 1);

    wait_until("acked after delay", || pool.stats().acked == 1).await;
    pool.stop().await;
    assert!(first_failed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_panic_is_contained_to_its_slot() {
    let store = StoreHandle::in_memory();
    let pool = WorkerPool::<Task>::configure(store.clone(), "panicky", options().with_max_fails(1)).unwrap();

    pool.run(|_ctx, task: Task| async move {
        if task.label == "bad" {
            panic!("handler blew up on {}", task.id);
        }
        Ok(())
    })
    .await
    .unwrap();

    let mut dispatcher = pool.dispatcher();
    dispatcher.set_payload(task(1, "bad"));
    dispatcher.dispatch().await.unwrap();
    dispatcher.set_payload(task(2, "good"));
    dispatcher.dispatch().await.unwrap();

    wait_until("both settled", || {
        let stats = pool.stats();
        stats.acked == 1 && stats.dead_lettered == 1
    })
    .await;
    assert!(pool.is_running());

    // pool keeps serving after the panic
    dispatcher.set_payload(task(3, "good"));
    dispatcher.dispatch().await.unwrap();
    wait_until("third acked", || pool.stats().acked == 2).await;
    pool.stop().await;

    let dead = store.dead_letters("panicky", 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].error.contains("handler blew up on 1"));
}

#[tokio::test]
async fn test_timeout_fails_only_the_slow_job() {
    let store = StoreHandle::in_memory();
    let pool = WorkerPool::<Task>::configure(
        store.clone(),
        "timed",
        options()
            .with_max_timeout(1)
            .with_max_fails(1)
            .with_max_concurrency(2),
    )
    .unwrap();
    let fast_done = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&fast_done);
    pool.run(move |_ctx, task: Task| {
        let flag = Arc::clone(&flag);
        async move {
            if task.label == "slow" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            } else {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    })
    .await
    .unwrap();

    let mut dispatcher = pool.dispatcher();
    dispatcher.set_payload(task(1, "slow"));
    dispatcher.dispatch().await.unwrap();
    dispatcher.set_payload(task(2, "fast"));
    dispatcher.dispatch().await.unwrap();

    wait_until("fast acked", || pool.stats().acked == 1).await;
    assert!(fast_done.load(Ordering::SeqCst));

    wait_until("slow timed out", || pool.stats().dead_lettered == 1).await;
    pool.stop().await;

    let dead = store.dead_letters("timed", 10).await.unwrap();
    assert_eq!(dead[0].envelope.payload, serde_json::to_string(&task(1, "slow")).unwrap());
    assert!(dead[0].error.contains("timed out"));
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let store = StoreHandle::in_memory();
    let pool = WorkerPool::<Task>::configure(store.clone(), "bounded", options().with_max_concurrency(3)).unwrap();
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut dispatcher = pool.dispatcher();
    for i in 0..10 {
        dispatcher.set_payload(task(i, "work"));
        dispatcher.dispatch().await.unwrap();
    }

    let (now, max) = (Arc::clone(&current), Arc::clone(&peak));
    pool.run(move |_ctx, _task: Task| {
        let (now, max) = (Arc::clone(&now), Arc::clone(&max));
        async move {
            let running = now.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            now.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await
    .unwrap();

    wait_until("all acked", || pool.stats().acked == 10).await;
    pool.stop().await;

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_unique_dispatch_runs_once() {
    let store = StoreHandle::in_memory();
    let pool = WorkerPool::<Task>::configure(store.clone(), "unique", options()).unwrap();

    let mut dispatcher = pool.dispatcher();
    dispatcher.set_payload(task(1, "same"));
    assert!(dispatcher.dispatch_unique().await.unwrap().is_some());
    assert!(dispatcher.dispatch_unique().await.unwrap().is_none());
    assert_eq!(store.stats("unique").await.unwrap().pending_jobs, 1);

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    pool.run(move |_ctx, _task: Task| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await
    .unwrap();

    wait_until("acked", || pool.stats().acked == 1).await;

    // key is free again after the first copy was claimed
    assert!(dispatcher.dispatch_unique().await.unwrap().is_some());
    wait_until("second acked", || pool.stats().acked == 2).await;
    pool.stop().await;

    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unique_dispatch_accepted_while_first_runs() {
    let store = StoreHandle::in_memory();
    let pool = WorkerPool::<Task>::configure(store.clone(), "refresh", options()).unwrap();
    let release = Arc::new(tokio::sync::Notify::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (gate, log) = (Arc::clone(&release), Arc::clone(&seen));
    pool.run(move |_ctx, task: Task| {
        let (gate, log) = (Arc::clone(&gate), Arc::clone(&log));
        async move {
            log.lock().push(task.id);
            if task.id == 1 {
                gate.notified().await;
            }
            Ok(())
        }
    })
    .await
    .unwrap();

    let mut dispatcher = pool.dispatcher().with_unique_key("account-7");
    dispatcher.set_payload(task(1, "first"));
    assert!(dispatcher.dispatch_unique().await.unwrap().is_some());
    wait_until("first running", || seen.lock().len() == 1).await;

    // newer data while the first copy runs is not lost
    dispatcher.set_payload(task(2, "update"));
    assert!(dispatcher.dispatch_unique().await.unwrap().is_some());

    release.notify_one();
    wait_until("both acked", || pool.stats().acked == 2).await;
    pool.stop().await;

    assert_eq!(*seen.lock(), vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_claims_lease_each_envelope_once() {
    let store = StoreHandle::in_memory();
    let mut dispatcher = redjob::Dispatcher::bind(store.clone(), "contended").unwrap();
    for i in 0..300 {
        dispatcher.set_payload(task(i, "item"));
        dispatcher.dispatch().await.unwrap();
    }

    let mut claimers = Vec::new();
    for _ in 0..12 {
        let store = store.clone();
        claimers.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(lease) = store.claim("contended").await.unwrap() {
                ids.push(lease.envelope.id);
                tokio::task::yield_now().await;
                assert!(store.ack(&lease).await.unwrap());
            }
            ids
        }));
    }

    let mut leased = std::collections::HashMap::new();
    for claimer in claimers {
        for id in claimer.await.unwrap() {
            *leased.entry(id).or_insert(0usize) += 1;
        }
    }

    assert_eq!(leased.len(), 300);
    assert!(leased.values().all(|count| *count == 1));
    assert_eq!(store.stats("contended").await.unwrap().total_jobs(), 0);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_and_is_idempotent() {
    let store = StoreHandle::in_memory();
    let pool = Arc::new(WorkerPool::<Task>::configure(store.clone(), "graceful", options()).unwrap());
    let started = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&started);
    pool.run(move |_ctx, _task: Task| {
        let flag = Arc::clone(&flag);
        async move {
            flag.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    })
    .await
    .unwrap();

    let mut dispatcher = pool.dispatcher();
    dispatcher.set_payload(task(1, "long"));
    dispatcher.dispatch().await.unwrap();

    wait_until("handler started", || started.load(Ordering::SeqCst)).await;

    let other = Arc::clone(&pool);
    tokio::join!(pool.stop(), other.stop());

    assert!(!pool.is_running());
    assert_eq!(pool.stats().acked, 1);
    assert_eq!(pool.stats().in_flight, 0);

    pool.stop().await;

    // nothing is claimed after stop
    dispatcher.set_payload(task(2, "after"));
    dispatcher.dispatch().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.stats("graceful").await.unwrap().pending_jobs, 1);
}

#[tokio::test]
async fn test_recovers_abandoned_leases_on_start() {
    let store = StoreHandle::in_memory();

    let mut dispatcher = redjob::Dispatcher::bind(store.clone(), "recovery").unwrap();
    dispatcher.set_payload(task(1, "orphan"));
    dispatcher.dispatch().await.unwrap();

    // a worker that claimed and then vanished
    let abandoned = store.claim("recovery").await.unwrap();
    assert!(abandoned.is_some());

    let pool = WorkerPool::<Task>::configure(
        store.clone(),
        "recovery",
        options().with_recover_after(Duration::ZERO),
    )
    .unwrap();
    pool.run(|_ctx, _task: Task| async { Ok(()) }).await.unwrap();

    wait_until("orphan acked", || pool.stats().acked == 1).await;
    pool.stop().await;

    let stats = store.stats("recovery").await.unwrap();
    assert_eq!(stats.total_jobs(), 0);
}

#[tokio::test]
async fn test_pools_on_different_queues_are_independent() {
    let store = StoreHandle::in_memory();
    let emails = WorkerPool::<Task>::configure(store.clone(), "emails", options()).unwrap();
    let reports = WorkerPool::<Task>::configure(store.clone(), "reports", options()).unwrap();

    emails.run(|_ctx, _task: Task| async { Ok(()) }).await.unwrap();

    let mut dispatcher = reports.dispatcher();
    dispatcher.set_payload(task(1, "report"));
    dispatcher.dispatch().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.stats("reports").await.unwrap().pending_jobs, 1);
    assert_eq!(emails.stats().acked, 0);

    emails.stop().await;
    reports.stop().await;
}
