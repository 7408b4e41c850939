//! 重试阶段：重新订阅次数、计数语义、退避等待、钩子门控与需求继承。

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use spark_flux::{
    FlowError,
    flux::Flux,
    retry::{RetrySignal, RetrySpec},
    testing::TestSubscriber,
};
use tracing_test::traced_test;

/// 每次订阅计数一次并立即失败。
fn always_failing(subscriptions: &Arc<AtomicUsize>) -> Flux<i64> {
    let counter = subscriptions.clone();
    Flux::defer(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Flux::error(FlowError::message("boom"))
    })
}

/// 先投递一个元素再失败；第 `recover_at` 次订阅起改为正常的区间流。
fn flaky(subscriptions: &Arc<AtomicUsize>, recover_at: usize) -> Flux<i64> {
    let counter = subscriptions.clone();
    Flux::defer(move || {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt >= recover_at {
            return Flux::range(10, 100);
        }
        Flux::from_iter([Some(attempt as i64), None]).concat_map(|step| match step {
            Some(value) => Flux::just([value]),
            None => Flux::error(FlowError::message("flaky")),
        })
    })
}

#[traced_test]
#[test]
fn max_subscribes_n_plus_one_times_then_exhausts() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let error = always_failing(&subscriptions)
        .retry(3)
        .collect_blocking()
        .unwrap_err();
    assert_eq!(subscriptions.load(Ordering::SeqCst), 4);
    assert!(matches!(error, FlowError::RetryExhausted { retries: 3, .. }));
    assert_eq!(error.root().to_string(), "upstream error: boom");
    assert!(logs_contain("retries exhausted"));
}

#[test]
fn zero_retries_propagates_after_a_single_attempt() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let error = always_failing(&subscriptions)
        .retry(0)
        .collect_blocking()
        .unwrap_err();
    assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
    assert!(error.is_retry_exhausted());
}

#[test]
fn recovered_source_completes_normally() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let counter = subscriptions.clone();
    let values = Flux::defer(move || {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Flux::error(FlowError::message("not yet"))
        } else {
            Flux::just([42])
        }
    })
    .retry(5)
    .collect_blocking()
    .unwrap();
    assert_eq!(values, vec![42]);
    assert_eq!(subscriptions.load(Ordering::SeqCst), 3);
}

#[test]
fn rejected_errors_propagate_verbatim() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let error = always_failing(&subscriptions)
        .retry_when(RetrySpec::max(5).filter(|error| !error.is_upstream()))
        .collect_blocking()
        .unwrap_err();
    assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
    assert!(error.is_upstream());
    assert!(!error.is_retry_exhausted());
}

/// 从未投递元素时，两种计数完全一致。
#[test]
fn counters_match_when_no_attempt_delivers() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = seen.clone();
    let _ = always_failing(&subscriptions)
        .retry_when(RetrySpec::max(3).do_before_retry(move |signal: &RetrySignal| {
            recorded
                .lock()
                .push((signal.total_retries(), signal.total_retries_in_a_row()));
        }))
        .collect_blocking();
    assert_eq!(*seen.lock(), vec![(0, 0), (1, 1), (2, 2)]);
}

/// 每次尝试都投递过元素：连续失败计数清零，因此 `max_in_a_row(1)` 永不耗尽。
#[test]
fn transient_errors_reset_after_progress() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let values = flaky(&subscriptions, 5)
        .retry_when(RetrySpec::max_in_a_row(1))
        .take(6)
        .collect_blocking()
        .unwrap();
    assert_eq!(values, vec![1, 2, 3, 4, 10, 11]);

    let flat = Arc::new(AtomicUsize::new(0));
    let error = flaky(&flat, 5)
        .retry_when(RetrySpec::max(1))
        .collect_blocking()
        .unwrap_err();
    assert_eq!(flat.load(Ordering::SeqCst), 2);
    assert!(error.is_retry_exhausted());
}

#[test]
fn outstanding_demand_survives_resubscription() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let probe = TestSubscriber::with_demand(3);
    flaky(&subscriptions, 3).retry(5).subscribe(probe.clone());
    assert_eq!(probe.values(), vec![1, 2, 10]);
    probe.request(2);
    assert_eq!(probe.values(), vec![1, 2, 10, 11, 12]);
    assert!(!probe.is_terminated());
}

#[test]
fn fixed_delay_waits_between_attempts() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();
    let error = always_failing(&subscriptions)
        .retry_when(RetrySpec::fixed_delay(2, Duration::from_millis(25)))
        .collect_blocking_timeout(Duration::from_secs(5))
        .unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(subscriptions.load(Ordering::SeqCst), 3);
    assert!(matches!(error, FlowError::RetryExhausted { retries: 2, .. }));
}

#[test]
fn cancelling_during_backoff_stops_resubscription() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let probe = TestSubscriber::unbounded();
    always_failing(&subscriptions)
        .retry_when(RetrySpec::fixed_delay(5, Duration::from_millis(100)))
        .subscribe(probe.clone());
    std::thread::sleep(Duration::from_millis(20));
    probe.cancel();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
    assert!(!probe.is_terminated());
}

#[test]
fn hooks_run_in_order_around_each_retry() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let events = Arc::new(Mutex::new(Vec::new()));
    let (before, before_async, after) = (events.clone(), events.clone(), events.clone());
    let spec = RetrySpec::max(1)
        .do_before_retry(move |_| before.lock().push("before"))
        .do_before_retry_async(move |_| {
            before_async.lock().push("before_async");
            Flux::empty()
        })
        .do_after_retry(move |_| after.lock().push("after"));
    let _ = always_failing(&subscriptions)
        .retry_when(spec)
        .collect_blocking();
    assert_eq!(*events.lock(), vec!["before", "before_async", "after"]);
    assert_eq!(subscriptions.load(Ordering::SeqCst), 2);
}

#[test]
fn failing_async_hook_terminates_with_its_error() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let error = always_failing(&subscriptions)
        .retry_when(
            RetrySpec::max(3)
                .do_after_retry_async(|_| Flux::error(FlowError::message("gate closed"))),
        )
        .collect_blocking()
        .unwrap_err();
    assert_eq!(error.to_string(), "upstream error: gate closed");
    assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
}

#[test]
fn custom_exhaustion_error_replaces_the_default() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let error = always_failing(&subscriptions)
        .retry_when(RetrySpec::max(2).on_retry_exhausted(|signal| {
            FlowError::message(format!("gave up after {}", signal.total_retries()))
        }))
        .collect_blocking()
        .unwrap_err();
    assert_eq!(error.to_string(), "upstream error: gave up after 2");
}

#[test]
fn exponential_delays_double_until_the_cap() {
    let spec = RetrySpec::backoff(10, Duration::from_millis(10)).max_backoff(Duration::from_millis(70));
    let delays: Vec<_> = (0..5)
        .map(|n| spec.delay_for(&RetrySignal::new(n, n, FlowError::message("x"))))
        .collect();
    assert_eq!(
        delays,
        [10, 20, 40, 70, 70].map(Duration::from_millis).to_vec()
    );
}
