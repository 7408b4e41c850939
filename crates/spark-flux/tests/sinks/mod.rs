//! 汇点：发射结果、多消费者投递策略、回放与所有者句柄生命周期。

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use spark_flux::{
    FlowError,
    error::EmitError,
    sink::{EmitResult, ManySink, Sinks},
    testing::TestSubscriber,
};

#[test]
fn replay_hands_history_to_late_subscribers() {
    let sink = Sinks::replay_all::<u32>();
    for value in [1, 2, 3] {
        assert_eq!(sink.emit_next(value), EmitResult::Ok);
    }
    let late = TestSubscriber::with_demand(2);
    sink.as_producer().subscribe(late.clone());
    assert_eq!(late.values(), vec![1, 2]);

    assert_eq!(sink.emit_next(4), EmitResult::Ok);
    late.request(10);
    assert_eq!(late.values(), vec![1, 2, 3, 4]);
    assert_eq!(sink.emit_complete(), EmitResult::Ok);
    assert!(late.is_completed());
}

#[test]
fn replay_limit_keeps_only_the_newest_values() {
    let sink = Sinks::replay_limit::<u32>(2);
    for value in 1..=5 {
        let _ = sink.emit_next(value);
    }
    assert_eq!(sink.retained(), 2);
    assert_eq!(
        sink.as_producer().take(2).collect_blocking().unwrap(),
        vec![4, 5]
    );
}

/// 任一消费者没有需求时整次发射失败，任何消费者都收不到该元素。
#[test]
fn all_or_nothing_never_delivers_partially() {
    let sink = Sinks::multicast_all_or_nothing::<u32>();
    let eager = TestSubscriber::with_demand(1);
    let idle = TestSubscriber::new();
    sink.as_producer().subscribe(eager.clone());
    sink.as_producer().subscribe(idle.clone());
    assert_eq!(sink.subscriber_count(), 2);

    assert_eq!(sink.emit_next(1), EmitResult::FailOverflow);
    assert_eq!(eager.value_count(), 0);
    assert_eq!(idle.value_count(), 0);

    idle.request(1);
    assert_eq!(sink.emit_next(1), EmitResult::Ok);
    assert_eq!(eager.values(), vec![1]);
    assert_eq!(idle.values(), vec![1]);
}

#[test]
fn zero_subscriber_outcomes_differ_by_mode() {
    let best_effort = Sinks::multicast_best_effort::<u8>();
    assert_eq!(best_effort.emit_next(1), EmitResult::Ok);

    let strict = Sinks::multicast_all_or_nothing::<u8>();
    assert_eq!(strict.emit_next(1), EmitResult::FailZeroSubscriber);
    assert_eq!(
        strict.emit_next(1).into_result(),
        Err(EmitError::ZeroSubscriber)
    );
}

#[test]
fn best_effort_skips_consumers_without_demand() {
    let sink = Sinks::multicast_best_effort::<u32>();
    let fast = TestSubscriber::unbounded();
    let slow = TestSubscriber::with_demand(1);
    sink.as_producer().subscribe(fast.clone());
    sink.as_producer().subscribe(slow.clone());
    for value in 1..=3 {
        assert_eq!(sink.emit_next(value), EmitResult::Ok);
    }
    assert_eq!(fast.values(), vec![1, 2, 3]);
    assert_eq!(slow.values(), vec![1]);
}

#[test]
fn blocking_emit_waits_for_demand_from_another_thread() {
    let sink = Sinks::multicast_all_or_nothing::<u32>();
    let probe = TestSubscriber::new();
    sink.as_producer().subscribe(probe.clone());

    let requester = probe.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        requester.request(1);
    });
    assert_eq!(
        sink.emit_next_blocking(7, Duration::from_secs(5)),
        EmitResult::Ok
    );
    handle.join().unwrap();
    assert_eq!(probe.values(), vec![7]);

    assert_eq!(
        sink.emit_next_blocking(8, Duration::from_millis(20)),
        EmitResult::FailOverflow
    );
}

#[test]
fn unicast_rejects_a_second_subscriber() {
    let sink = Sinks::unicast::<u8>();
    let first = TestSubscriber::unbounded();
    let second = TestSubscriber::unbounded();
    sink.as_producer().subscribe(first.clone());
    sink.as_producer().subscribe(second.clone());
    assert!(matches!(
        second.error(),
        Some(FlowError::TooManySubscribers { .. })
    ));
    assert_eq!(sink.emit_next(1), EmitResult::Ok);
    assert_eq!(first.values(), vec![1]);
}

#[test]
fn bounded_unicast_overflows_when_nobody_drains() {
    let sink = Sinks::unicast_bounded::<u8>(2);
    assert_eq!(sink.emit_next(1), EmitResult::Ok);
    assert_eq!(sink.emit_next(2), EmitResult::Ok);
    assert_eq!(sink.emit_next(3), EmitResult::FailOverflow);
}

/// 消费者在 `on_next` 中回调同一个汇点，撞上正在进行的发射。
#[test]
fn reentrant_emission_is_reported_as_non_serialized() {
    let sink = Arc::new(Sinks::multicast_best_effort::<u32>());
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let (inner, recorded) = (sink.clone(), outcomes.clone());
    let _disposable = sink.as_producer().subscribe_with(move |value| {
        if value == 1 {
            recorded.lock().push(inner.emit_next(99));
        }
    });
    assert_eq!(sink.emit_next(1), EmitResult::Ok);
    assert_eq!(*outcomes.lock(), vec![EmitResult::FailNonSerialized]);
    assert_eq!(sink.emit_complete(), EmitResult::Ok);
}

#[test]
fn concurrent_producers_serialize_through_busy_looping() {
    let sink = Arc::new(Sinks::replay_all::<usize>());
    let probe = TestSubscriber::unbounded();
    sink.as_producer().subscribe(probe.clone());
    let failures = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..4)
        .map(|worker| {
            let (sink, failures) = (sink.clone(), failures.clone());
            thread::spawn(move || {
                for i in 0..250 {
                    let result = sink.emit_next_busy_looping(worker * 1000 + i, Duration::from_secs(5));
                    if result.is_failure() {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    assert_eq!(probe.value_count(), 1000);
}

#[test]
fn terminated_sinks_reject_emissions_and_replay_the_terminal() {
    let sink = Sinks::multicast_best_effort::<u8>();
    assert_eq!(
        sink.emit_error(FlowError::message("closed")),
        EmitResult::Ok
    );
    assert_eq!(sink.emit_next(1), EmitResult::FailTerminated);
    assert_eq!(sink.emit_complete(), EmitResult::FailTerminated);

    let late = TestSubscriber::<u8>::unbounded();
    sink.as_producer().subscribe(late.clone());
    assert_eq!(
        late.error().map(|error| error.to_string()),
        Some("upstream error: closed".to_owned())
    );
}

#[test]
fn dropping_the_owner_completes_consumers() {
    let probe = TestSubscriber::<u8>::unbounded();
    {
        let sink = Sinks::multicast_buffer::<u8>();
        sink.as_producer().subscribe(probe.clone());
        let _ = sink.emit_next(5);
    }
    assert_eq!(probe.values(), vec![5]);
    assert!(probe.is_completed());
}

#[test]
fn buffered_sink_paces_to_the_slowest_consumer() {
    let sink = Sinks::multicast_buffer_bounded::<u32>(8);
    let fast = TestSubscriber::unbounded();
    let slow = TestSubscriber::with_demand(1);
    sink.as_producer().subscribe(fast.clone());
    sink.as_producer().subscribe(slow.clone());
    for value in 1..=3 {
        assert_eq!(sink.emit_next(value), EmitResult::Ok);
    }
    assert_eq!(fast.values(), vec![1]);
    assert_eq!(sink.pending(), 2);

    slow.request(2);
    assert_eq!(fast.values(), vec![1, 2, 3]);
    assert_eq!(slow.values(), vec![1, 2, 3]);
    assert_eq!(sink.pending(), 0);
}
