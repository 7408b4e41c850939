//! 调度器：容量拒绝、延迟取消、释放语义，以及两个调度切换点对执行线程的影响。

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use spark_flux::{
    FlowError, SchedulerError,
    config::FluxConfig,
    flux::Flux,
    scheduler::{
        self, BoundedElasticScheduler, ParallelScheduler, Scheduler, SchedulerRef,
        SingleScheduler,
    },
    testing::TestSubscriber,
};

const WAIT: Duration = Duration::from_secs(5);

/// 线程与排队容量都耗尽后，提交同步返回 `Saturated`，而不是排队或丢弃。
///
/// # 教案式说明
/// - **测试目标（Why）**：确认有界弹性池把“容量不足”作为显式错误交给调用方；
/// - **验收契约（What）**：上限 1 线程 + 1 排队，第三个提交返回 `Saturated { capacity: 2 }`，
///   释放阻塞任务后两个已接受的任务都执行完毕。
#[test]
fn bounded_elastic_rejects_beyond_capacity() {
    let pool = BoundedElasticScheduler::with_limits("tiny", 1, 1, Duration::from_secs(1));
    let (release, gate) = mpsc::channel::<()>();
    let ran = Arc::new(AtomicUsize::new(0));

    let blocker_ran = ran.clone();
    let blocker = pool
        .schedule(
            Box::new(move || {
                let _ = gate.recv_timeout(WAIT);
                blocker_ran.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        )
        .unwrap();
    let queued_ran = ran.clone();
    let queued = pool
        .schedule(
            Box::new(move || {
                queued_ran.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        )
        .unwrap();

    let rejected = pool.schedule(Box::new(|| {}), None).unwrap_err();
    assert_eq!(
        rejected,
        SchedulerError::Saturated {
            scheduler: "tiny".into(),
            capacity: 2,
        }
    );

    release.send(()).unwrap();
    while !(blocker.is_finished() && queued.is_finished()) {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(ran.load(Ordering::SeqCst), 2);
    assert!(pool.live_workers() <= 1);
}

#[test]
fn cancelled_delayed_task_never_runs() {
    let single = SingleScheduler::new("delay-single");
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    let handle = single
        .schedule(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Some(Duration::from_millis(100)),
        )
        .unwrap();
    assert!(handle.cancel());
    assert!(!handle.cancel());
    thread::sleep(Duration::from_millis(200));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert!(!handle.is_finished());
}

#[test]
fn disposed_schedulers_refuse_new_work() {
    let parallel = ParallelScheduler::new("gone", 2);
    parallel.dispose();
    assert!(parallel.is_disposed());
    assert!(matches!(
        parallel.schedule(Box::new(|| {}), None),
        Err(SchedulerError::Disposed { .. })
    ));

    let disposed: SchedulerRef = Arc::new(parallel);
    let probe = TestSubscriber::unbounded();
    Flux::range(1, 3).publish_on(disposed).subscribe(probe.clone());
    assert!(probe.await_terminal(WAIT));
    assert!(matches!(
        probe.error(),
        Some(FlowError::SchedulerDisposed { .. })
    ));
}

fn explode() {
    panic!("task failure");
}

#[test]
fn panicking_task_leaves_the_worker_alive() {
    let single = SingleScheduler::new("sturdy");
    let _ = single.schedule(Box::new(explode), None);
    let (done, finished) = mpsc::channel();
    single
        .schedule(
            Box::new(move || {
                let _ = done.send(());
            }),
            None,
        )
        .unwrap();
    assert!(finished.recv_timeout(WAIT).is_ok());
}

/// 同步调度器同样隔离任务 panic：调用方不被展开，句柄进入完成状态。
#[test]
fn immediate_contains_panicking_tasks() {
    let handle = scheduler::immediate()
        .schedule(Box::new(explode), None)
        .unwrap();
    assert!(handle.is_finished());
    assert!(!handle.is_cancelled());
}

#[test]
fn immediate_runs_on_the_calling_thread() {
    let caller = thread::current().id();
    let (tx, rx) = mpsc::channel();
    let handle = scheduler::immediate()
        .schedule(
            Box::new(move || {
                let _ = tx.send(thread::current().id());
            }),
            None,
        )
        .unwrap();
    assert!(handle.is_finished());
    assert_eq!(rx.try_recv().unwrap(), caller);
}

/// 下游回调迁移到调度器工作线程，顺序不变。
#[test]
fn publish_on_moves_delivery_to_worker_threads() {
    let workers: SchedulerRef = Arc::new(ParallelScheduler::new("emit", 2));
    let probe = TestSubscriber::unbounded();
    Flux::range(1, 50).publish_on(workers).subscribe(probe.clone());
    assert!(probe.await_terminal(WAIT));
    assert_eq!(probe.values(), (1..=50).collect::<Vec<_>>());
    assert!(
        probe
            .thread_names()
            .iter()
            .all(|name| name.as_deref().is_some_and(|name| name.starts_with("emit-")))
    );
}

#[test]
fn publish_on_honours_downstream_demand() {
    let workers: SchedulerRef = Arc::new(SingleScheduler::new("paced"));
    let probe = TestSubscriber::with_demand(4);
    Flux::range(1, 1_000)
        .publish_on_with(workers, 16)
        .subscribe(probe.clone());
    assert!(probe.await_values(4, WAIT));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(probe.value_count(), 4);
    probe.request(2);
    assert!(probe.await_values(6, WAIT));
    assert_eq!(probe.values(), vec![1, 2, 3, 4, 5, 6]);
}

/// 订阅动作迁移后，同步源在调度器线程上生产并投递。
#[test]
fn subscribe_on_moves_the_source_to_the_scheduler() {
    let single: SchedulerRef = Arc::new(SingleScheduler::new("subscriber-side"));
    let probe = TestSubscriber::unbounded();
    Flux::range(1, 3).subscribe_on(single).subscribe(probe.clone());
    assert!(probe.await_terminal(WAIT));
    assert_eq!(probe.values(), vec![1, 2, 3]);
    assert!(
        probe
            .thread_names()
            .iter()
            .all(|name| name.as_deref() == Some("subscriber-side"))
    );
}

/// 上游挂接前后的请求都在调度器线程上到达上游，而不是在发起请求的线程上内联转发。
#[test]
fn subscribe_on_forwards_every_request_on_the_scheduler() {
    let single: SchedulerRef = Arc::new(SingleScheduler::new("request-side"));
    let threads = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorded = threads.clone();
    let probe = TestSubscriber::with_demand(2);
    Flux::range(1, 10)
        .do_on_request(move |_| {
            recorded
                .lock()
                .push(thread::current().name().map(str::to_owned))
        })
        .subscribe_on(single)
        .subscribe(probe.clone());
    assert!(probe.await_values(2, WAIT));

    probe.request(3);
    assert!(probe.await_values(5, WAIT));
    assert_eq!(probe.values(), vec![1, 2, 3, 4, 5]);
    let threads = threads.lock();
    assert_eq!(threads.len(), 2);
    assert!(
        threads
            .iter()
            .all(|name| name.as_deref() == Some("request-side")),
        "{threads:?}"
    );
}

#[test]
fn elastic_pool_from_config_uses_configured_limits() {
    let cfg = FluxConfig::from_toml_str(
        "[bounded_elastic]\nmax_threads = 2\nqueue_capacity = 3\nidle_ttl_ms = 50\n",
    )
    .unwrap();
    let pool = BoundedElasticScheduler::from_config("configured", &cfg.bounded_elastic);
    assert_eq!(pool.capacity(), 5);

    let (done, finished) = mpsc::channel();
    pool.schedule(
        Box::new(move || {
            let _ = done.send(());
        }),
        None,
    )
    .unwrap();
    assert!(finished.recv_timeout(WAIT).is_ok());
    let deadline = Instant::now() + WAIT;
    while pool.live_workers() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(pool.live_workers(), 0);
}

#[test]
fn configured_publish_on_requests_in_configured_batches() {
    let cfg = FluxConfig::from_toml_str("[pipeline]\nsmall_prefetch = 4\nreplenish_ratio = 0.5\n")
        .unwrap();
    let requests = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorded = requests.clone();
    let single: SchedulerRef = Arc::new(SingleScheduler::new("configured-emit"));
    let values = Flux::range(0, 10)
        .do_on_request(move |n| recorded.lock().push(n))
        .publish_on_configured(single, &cfg.pipeline)
        .collect_blocking_timeout(WAIT)
        .unwrap();
    assert_eq!(values.len(), 10);
    let requests = requests.lock();
    assert_eq!(requests[0], 4);
    assert!(requests[1..].iter().all(|&n| (2..=4).contains(&n)), "{requests:?}");
}
