//! 订阅期上下文的可见性规则，以及线程局部状态跨调度切换点的传播。

use std::{cell::RefCell, sync::Arc};

use spark_flux::{
    context::{
        Context,
        propagation::{LocalKeyAccessor, register_accessor, unregister_accessor},
    },
    flux::Flux,
    scheduler::{Scheduler, SchedulerRef, SingleScheduler},
    testing::TestSubscriber,
};
use tracing_test::traced_test;

fn read_tag() -> Flux<String> {
    Flux::defer_contextual(|ctx| Flux::just([ctx.get_or("tag", "none".to_owned())]))
}

/// 多个写入点包围同一个读取点时，离读取点最近的写入生效。
#[test]
fn nearest_enclosing_write_wins() {
    let seen = read_tag()
        .context_write(|ctx| ctx.put("tag", "inner".to_owned()))
        .context_write(|ctx| ctx.put("tag", "outer".to_owned()))
        .block_last()
        .unwrap();
    assert_eq!(seen.as_deref(), Some("inner"));
}

/// 写入只对上游可见：位于写入点下游的读取仍然看到订阅者提供的上下文。
#[test]
fn writes_are_invisible_downstream() {
    let probe = TestSubscriber::with_context(
        u64::MAX,
        Context::of("tag", "subscriber".to_owned()),
    );
    Flux::range(1, 1)
        .context_write(|ctx| ctx.put("tag", "upstream-only".to_owned()))
        .concat_map(|_| read_tag())
        .subscribe(probe.clone());
    assert_eq!(probe.values(), vec!["subscriber".to_owned()]);
}

#[test]
fn upstream_writes_can_build_on_the_subscriber_context() {
    let probe = TestSubscriber::with_context(u64::MAX, Context::of("user", "ada".to_owned()));
    Flux::defer_contextual(|ctx| {
        Flux::just([format!(
            "{}@{}",
            ctx.get_or("user", String::new()),
            ctx.get_or("tenant", String::new())
        )])
    })
    .context_write(|ctx| ctx.put("tenant", "acme".to_owned()))
    .subscribe(probe.clone());
    assert_eq!(probe.values(), vec!["ada@acme".to_owned()]);
}

/// 同一个流的两次订阅各自携带自己的上下文，互不可见。
#[test]
fn sibling_subscriptions_are_isolated() {
    let flux = read_tag();
    let left = TestSubscriber::with_context(u64::MAX, Context::of("tag", "left".to_owned()));
    let right = TestSubscriber::with_context(u64::MAX, Context::of("tag", "right".to_owned()));
    let bare = TestSubscriber::unbounded();
    flux.subscribe(left.clone());
    flux.subscribe(right.clone());
    flux.subscribe(bare.clone());
    assert_eq!(left.values(), vec!["left".to_owned()]);
    assert_eq!(right.values(), vec!["right".to_owned()]);
    assert_eq!(bare.values(), vec!["none".to_owned()]);
}

thread_local! {
    static REQUEST_ID: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn current_request_id() -> Option<String> {
    REQUEST_ID.with(|cell| cell.borrow().clone())
}

/// 调度切换点把调用线程上的线程局部值带到工作线程，投递结束后从工作线程上拆除。
#[traced_test]
#[test]
fn thread_locals_follow_the_signal_across_publish_on() {
    register_accessor(LocalKeyAccessor::new("context-test-request-id", &REQUEST_ID));
    assert!(logs_contain("thread-local accessor registered"));
    REQUEST_ID.with(|cell| *cell.borrow_mut() = Some("req-7".to_owned()));

    let single = Arc::new(SingleScheduler::new("propagation-worker"));
    let scheduler: SchedulerRef = single.clone();
    let observed = Flux::range(1, 3)
        .publish_on(scheduler)
        .map(|value| (value, current_request_id()))
        .collect_blocking()
        .unwrap();
    assert_eq!(
        observed,
        (1..=3)
            .map(|value| (value, Some("req-7".to_owned())))
            .collect::<Vec<_>>()
    );

    let (tx, rx) = std::sync::mpsc::channel();
    single
        .schedule(
            Box::new(move || {
                let _ = tx.send(current_request_id());
            }),
            None,
        )
        .unwrap();
    assert_eq!(
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(),
        None
    );

    REQUEST_ID.with(|cell| cell.borrow_mut().take());
    assert!(unregister_accessor("context-test-request-id"));
}
