use spark_flux::{FlowError, flux::Flux, testing::TestSubscriber};

fn failing_after(values: &'static [i64]) -> Flux<i64> {
    Flux::from_iter(values.iter().copied()).concat_map(|value| {
        if value < 0 {
            Flux::error(FlowError::message("negative"))
        } else {
            Flux::just([value])
        }
    })
}

#[test]
fn on_error_return_appends_the_fallback_value() {
    let values = failing_after(&[1, 2, -1, 3])
        .on_error_return(0)
        .collect_blocking()
        .unwrap();
    assert_eq!(values, vec![1, 2, 0]);
}

#[test]
fn on_error_resume_switches_to_the_substitute_stream() {
    let values = failing_after(&[1, -1])
        .on_error_resume(|_| Flux::range(10, 2))
        .collect_blocking()
        .unwrap();
    assert_eq!(values, vec![1, 10, 11]);
}

#[test]
fn on_error_map_transforms_without_swallowing() {
    let error = failing_after(&[-1])
        .on_error_map(|error| FlowError::message(format!("wrapped: {error}")))
        .collect_blocking()
        .unwrap_err();
    assert_eq!(
        error.to_string(),
        "upstream error: wrapped: upstream error: negative"
    );
}

#[test]
fn on_error_complete_honours_its_predicate() {
    let swallowed = failing_after(&[4, -1])
        .on_error_complete(FlowError::is_upstream)
        .collect_blocking()
        .unwrap();
    assert_eq!(swallowed, vec![4]);

    let kept = failing_after(&[-1])
        .on_error_complete(|error| !error.is_upstream())
        .collect_blocking();
    assert!(kept.is_err());
}

#[test]
fn switch_if_empty_only_applies_to_empty_sources() {
    let fallback = Flux::<i64>::empty()
        .switch_if_empty(Flux::just([9]))
        .collect_blocking()
        .unwrap();
    assert_eq!(fallback, vec![9]);

    let untouched = Flux::range(1, 2)
        .switch_if_empty(Flux::just([9]))
        .collect_blocking()
        .unwrap();
    assert_eq!(untouched, vec![1, 2]);
}

/// 切换到替代流时，下游尚未满足的需求被完整继承。
#[test]
fn fallback_carries_outstanding_demand_to_the_substitute() {
    let probe = TestSubscriber::with_demand(3);
    failing_after(&[1, -1])
        .on_error_resume(|_| Flux::range(100, 10))
        .subscribe(probe.clone());
    assert_eq!(probe.values(), vec![1, 100, 101]);
    probe.request(1);
    assert_eq!(probe.values(), vec![1, 100, 101, 102]);
}

#[test]
fn errors_reach_the_consumer_exactly_once() {
    let probe = TestSubscriber::unbounded();
    failing_after(&[1, -1, 2]).subscribe(probe.clone());
    assert_eq!(probe.values(), vec![1]);
    assert!(probe.error().is_some());
    assert_eq!(probe.late_signals(), 0);
}
