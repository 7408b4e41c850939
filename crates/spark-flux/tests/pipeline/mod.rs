//! 算子流水线的端到端行为：需求换算、重塑、错误回退与终端桥接。

mod error_handling;
mod reshaping;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use spark_flux::{FlowError, flux::Flux, hooks, testing::TestSubscriber};

/// `range(1,10) -> map(x*2) -> buffer(3)` 在无界需求下的输出。
///
/// # 教案式说明
/// - **测试目标（Why）**：覆盖“直通 + 重塑”两类阶段串联时的顺序与分组边界；
/// - **验收契约（What）**：输出 `[[2,4,6],[8,10,12],[14,16,18],[20]]` 且随后完成。
#[test]
fn range_map_buffer_scenario() {
    let probe = TestSubscriber::unbounded();
    Flux::range(1, 10)
        .map(|value| value * 2)
        .buffer(3)
        .subscribe(probe.clone());
    assert_eq!(
        probe.values(),
        vec![vec![2, 4, 6], vec![8, 10, 12], vec![14, 16, 18], vec![20]]
    );
    assert!(probe.is_completed());
}

#[test]
fn producer_never_exceeds_requested_demand() {
    let probe = TestSubscriber::with_demand(3);
    Flux::range(1, 100).subscribe(probe.clone());
    assert_eq!(probe.values(), vec![1, 2, 3]);
    probe.request(2);
    assert_eq!(probe.values(), vec![1, 2, 3, 4, 5]);
    assert!(!probe.is_terminated());
}

#[test]
fn filter_replenishes_dropped_elements() {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();
    let probe = TestSubscriber::with_demand(2);
    Flux::range(1, 10)
        .do_on_request(move |n| recorded.lock().push(n))
        .filter(|value| value % 2 == 0)
        .subscribe(probe.clone());
    assert_eq!(probe.values(), vec![2, 4]);
    assert_eq!(probe.outstanding(), 0);
    let total: u64 = requests.lock().iter().sum();
    assert!(total >= 4, "upstream saw {total} units of demand");
}

#[test]
fn take_cancels_upstream_once_satisfied() {
    let cancels = Arc::new(AtomicUsize::new(0));
    let counter = cancels.clone();
    let values = Flux::range(1, 1_000_000)
        .do_on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .take(3)
        .collect_blocking()
        .unwrap();
    assert_eq!(values, vec![1, 2, 3]);
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
}

#[test]
fn try_map_error_terminates_the_stream() {
    let probe = TestSubscriber::unbounded();
    Flux::range(1, 5)
        .try_map(|value| {
            if value == 3 {
                Err(FlowError::message("three"))
            } else {
                Ok(value)
            }
        })
        .subscribe(probe.clone());
    assert_eq!(probe.values(), vec![1, 2]);
    assert_eq!(
        probe.error().map(|error| error.to_string()),
        Some("upstream error: three".to_owned())
    );
}

#[test]
fn limit_rate_requests_in_tides() {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();
    let values = Flux::range(0, 100)
        .do_on_request(move |n| recorded.lock().push(n))
        .limit_rate(10)
        .collect_blocking()
        .unwrap();
    assert_eq!(values.len(), 100);
    let requests = requests.lock();
    assert_eq!(requests[0], 10);
    assert!(requests[1..].iter().all(|&n| n == 8), "{requests:?}");
}

#[test]
fn limit_rate_with_zero_low_tide_waits_for_the_full_batch() {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();
    Flux::range(0, 20)
        .do_on_request(move |n| recorded.lock().push(n))
        .limit_rate_tides(5, 0)
        .collect_blocking()
        .unwrap();
    assert!(requests.lock().iter().all(|&n| n == 5));
}

/// 取消的幂等性：重复取消与一次取消的可观察效果相同。
#[test]
fn cancel_twice_behaves_like_cancel_once() {
    let cancels = Arc::new(AtomicUsize::new(0));
    let counter = cancels.clone();
    let probe = TestSubscriber::<i64>::new();
    let disposable = Flux::never()
        .do_on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .subscribe(probe.clone());
    probe.cancel();
    probe.cancel();
    disposable.dispose();
    disposable.dispose();
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
    assert!(disposable.is_disposed());
    assert!(!probe.is_terminated());
}

#[test]
fn flat_map_merges_and_concat_map_preserves_order() {
    let mut merged = Flux::range(1, 3)
        .flat_map(|value| Flux::range(value * 10, 2))
        .collect_blocking()
        .unwrap();
    merged.sort_unstable();
    assert_eq!(merged, vec![10, 11, 20, 21, 30, 31]);

    let ordered = Flux::range(1, 3)
        .concat_map(|value| Flux::just([value, -value]))
        .collect_blocking()
        .unwrap();
    assert_eq!(ordered, vec![1, -1, 2, -2, 3, -3]);
}

#[test]
fn flat_map_respects_downstream_demand() {
    let probe = TestSubscriber::with_demand(3);
    Flux::range(1, 10)
        .flat_map_with(|value| Flux::range(value * 100, 5), 2, 4)
        .subscribe(probe.clone());
    assert_eq!(probe.value_count(), 3);
    probe.request(u64::MAX);
    assert!(probe.await_terminal(Duration::from_secs(5)));
    assert_eq!(probe.value_count(), 50);
}

#[test]
fn generate_stops_when_the_sink_completes() {
    let values = Flux::generate(
        || 0u32,
        |state, sink| {
            sink.next(state);
            if state == 2 {
                sink.complete();
            }
            state + 1
        },
    )
    .collect_blocking()
    .unwrap();
    assert_eq!(values, vec![0, 1, 2]);
}

#[test]
fn create_buffers_values_beyond_demand() {
    use spark_flux::sink::ManySink;

    let probe = TestSubscriber::with_demand(1);
    Flux::create(|sink| {
        for value in ["a", "b", "c"] {
            let _ = sink.emit_next(value);
        }
        let _ = sink.emit_complete();
    })
    .subscribe(probe.clone());
    assert_eq!(probe.values(), vec!["a"]);
    probe.request(5);
    assert_eq!(probe.values(), vec!["a", "b", "c"]);
    assert!(probe.is_completed());
}

#[test]
fn block_first_cancels_after_the_first_element() {
    let cancels = Arc::new(AtomicUsize::new(0));
    let counter = cancels.clone();
    let first = Flux::range(7, 100)
        .do_on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .block_first()
        .unwrap();
    assert_eq!(first, Some(7));
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
    assert_eq!(Flux::range(1, 4).block_last().unwrap(), Some(4));
    assert_eq!(Flux::<i64>::empty().block_last().unwrap(), None);
}

#[test]
fn blocking_bridge_times_out_on_silent_streams() {
    let result = Flux::<u8>::never().collect_blocking_timeout(Duration::from_millis(30));
    assert!(matches!(result, Err(FlowError::Timeout { .. })));
}

#[test]
fn unhandled_errors_end_only_their_subscription() {
    let before = hooks::snapshot().unhandled_errors;
    let disposable = Flux::<u8>::error(FlowError::message("lost")).subscribe_with(|_| {});
    assert!(disposable.is_disposed());
    assert!(hooks::snapshot().unhandled_errors > before);

    assert_eq!(Flux::range(1, 2).collect_blocking().unwrap(), vec![1, 2]);
}
