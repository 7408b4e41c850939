use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use spark_flux::{
    config::{DEFAULT_PREFETCH, FluxConfig},
    flux::Flux,
    hooks,
    testing::TestSubscriber,
};

fn collect_windows(windows: Flux<Flux<i64>>) -> Vec<Vec<i64>> {
    windows
        .concat_map(|window| window.collect_list())
        .collect_blocking()
        .unwrap()
}

#[test]
fn buffer_skip_covers_overlapping_and_sparse_modes() {
    let overlapping = Flux::range(1, 5).buffer_skip(3, 1).collect_blocking().unwrap();
    assert_eq!(
        overlapping,
        vec![
            vec![1, 2, 3],
            vec![2, 3, 4],
            vec![3, 4, 5],
            vec![4, 5],
            vec![5]
        ]
    );

    let sparse = Flux::range(1, 7).buffer_skip(2, 3).collect_blocking().unwrap();
    assert_eq!(sparse, vec![vec![1, 2], vec![4, 5], vec![7]]);
}

#[test]
fn buffer_translates_demand_into_whole_batches() {
    let probe = TestSubscriber::with_demand(2);
    Flux::range(1, 100).buffer(4).subscribe(probe.clone());
    assert_eq!(probe.values(), vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
}

#[test]
fn fixed_windows_split_like_buffers() {
    let windows = collect_windows(Flux::range(1, 7).window(3));
    assert_eq!(windows, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
}

/// 边界元素开启新窗口并归属新窗口。
#[test]
fn window_until_starts_a_new_window_at_each_boundary() {
    let windows = collect_windows(Flux::range(1, 7).window_until(|value| value % 3 == 0));
    assert_eq!(windows, vec![vec![1, 2], vec![3, 4, 5], vec![6, 7]]);
}

#[test]
fn window_until_inclusive_closes_on_the_boundary() {
    let windows =
        collect_windows(Flux::range(1, 7).window_until_inclusive(|value| value % 3 == 0));
    assert_eq!(windows, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
}

/// 不匹配的元素被丢弃，并在下一个元素处开启新窗口。
#[test]
fn window_while_drops_the_separator() {
    let windows = collect_windows(Flux::range(1, 7).window_while(|value| value % 3 != 0));
    assert_eq!(windows, vec![vec![1, 2], vec![4, 5], vec![7]]);
}

type Windowing = fn(Flux<i64>) -> Flux<Flux<i64>>;

/// 外层只要一个窗口且从不订阅它时，谓词窗口不再向上游补货。
///
/// # 教案式说明
/// - **测试目标（Why）**：谓词窗口的补货必须以窗口消费者实际取走的元素为准，
///   否则一个无人消费的窗口会把整条上游缓存进内存；
/// - **验收契约（What）**：三种谓词窗口下，上游累计请求与实际发射都恰好停在默认预取量。
#[test]
fn unconsumed_predicate_windows_stop_at_the_prefetch() {
    let shapes: [(&str, Windowing); 3] = [
        ("window_until", |flux| flux.window_until(|value| value % 10 == 0)),
        ("window_until_inclusive", |flux| {
            flux.window_until_inclusive(|value| value % 10 == 0)
        }),
        ("window_while", |flux| flux.window_while(|_| true)),
    ];
    for (name, shape) in shapes {
        let requested = Arc::new(AtomicU64::new(0));
        let emitted = Arc::new(AtomicU64::new(0));
        let (on_request, on_next) = (requested.clone(), emitted.clone());
        let source = Flux::range(1, 10_000)
            .do_on_request(move |n| {
                on_request.fetch_add(n, Ordering::SeqCst);
            })
            .do_on_next(move |_| {
                on_next.fetch_add(1, Ordering::SeqCst);
            });

        let windows = TestSubscriber::with_demand(1);
        shape(source).subscribe(windows.clone());

        assert_eq!(windows.value_count(), 1, "{name}");
        let prefetch = DEFAULT_PREFETCH as u64;
        assert_eq!(requested.load(Ordering::SeqCst), prefetch, "{name}");
        assert!(emitted.load(Ordering::SeqCst) <= prefetch, "{name}");
        assert!(!windows.is_terminated(), "{name}");
    }
}

#[test]
fn consuming_a_predicate_window_replenishes_upstream() {
    let cfg =
        FluxConfig::from_toml_str("[pipeline]\nprefetch = 8\nreplenish_ratio = 0.5\n").unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();
    let windows = TestSubscriber::with_demand(1);
    Flux::range(1, 100)
        .do_on_request(move |n| recorded.lock().push(n))
        .window_while_configured(|_| true, &cfg.pipeline)
        .subscribe(windows.clone());
    assert_eq!(*requests.lock(), vec![8]);

    let window = windows.take_values().pop().unwrap();
    let inner = TestSubscriber::with_demand(5);
    window.subscribe(inner.clone());
    assert_eq!(inner.values(), vec![1, 2, 3, 4, 5]);
    assert_eq!(*requests.lock(), vec![8, 5]);
}

/// 窗口被取消后，后续元素作为丢弃信号上报，并继续计入补货，上游不会停滞。
#[test]
fn cancelled_window_reports_drops_and_lets_upstream_finish() {
    let cfg = FluxConfig::from_toml_str("[pipeline]\nprefetch = 8\n").unwrap();
    let before = hooks::snapshot().next_dropped;
    let windows = TestSubscriber::with_demand(1);
    Flux::range(1, 100)
        .window_until_configured(|value| *value == 1, &cfg.pipeline)
        .subscribe(windows.clone());

    let window = windows.take_values().pop().unwrap();
    let inner = TestSubscriber::<i64>::new();
    window.subscribe(inner.clone());
    inner.cancel();

    assert!(windows.is_completed());
    assert_eq!(inner.value_count(), 0);
    assert!(hooks::snapshot().next_dropped - before >= 92);
}

#[test]
fn group_by_configured_prefetches_from_the_pipeline_section() {
    let cfg =
        FluxConfig::from_toml_str("[pipeline]\nprefetch = 6\nreplenish_ratio = 0.5\n").unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();
    let groups = TestSubscriber::new();
    Flux::range(0, 50)
        .do_on_request(move |n| recorded.lock().push(n))
        .group_by_configured(|value| value % 2, &cfg.pipeline)
        .subscribe(groups.clone());
    assert_eq!(*requests.lock(), vec![6]);

    let total: usize = Flux::range(0, 50)
        .group_by_configured(|value| value % 2, &cfg.pipeline)
        .flat_map(|group| group.into_flux().collect_list())
        .map(|values| values.len())
        .collect_blocking_timeout(Duration::from_secs(5))
        .unwrap()
        .into_iter()
        .sum();
    assert_eq!(total, 50);
}

#[test]
fn group_by_routes_elements_to_their_groups() {
    let mut groups = Flux::range(1, 10)
        .group_by(|value| value % 3)
        .flat_map(|group| {
            let key = *group.key();
            group
                .into_flux()
                .collect_list()
                .map(move |values| (key, values))
        })
        .collect_blocking()
        .unwrap();
    groups.sort_by_key(|(key, _)| *key);
    assert_eq!(
        groups,
        vec![
            (0, vec![3, 6, 9]),
            (1, vec![1, 4, 7, 10]),
            (2, vec![2, 5, 8])
        ]
    );
}

#[test]
fn group_by_with_small_prefetch_still_drains_everything() {
    let total: usize = Flux::range(0, 200)
        .group_by_with_prefetch(|value| value % 4, 8)
        .flat_map(|group| group.into_flux().collect_list())
        .map(|values| values.len())
        .collect_blocking_timeout(Duration::from_secs(5))
        .unwrap()
        .into_iter()
        .sum();
    assert_eq!(total, 200);
}

#[test]
fn collect_list_of_empty_stream_is_a_single_empty_vec() {
    let lists = Flux::<i64>::empty().collect_list().collect_blocking().unwrap();
    assert_eq!(lists, vec![Vec::<i64>::new()]);
}
