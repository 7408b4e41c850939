use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

use crate::{
    context::Context,
    error::FlowError,
    flux::Flux,
    hooks,
    protocol::{
        BoxSubscriber, DrainGate, Publisher, Subscriber, Subscription, SubscriptionArbiter,
        UNBOUNDED,
    },
    retry::{RetrySignal, RetrySpec},
    scheduler::{self, CancelHandle},
};

/// 重试阶段。
///
/// # 教案式说明
/// - **意图（Why）**：失败后的“重新订阅”既可能在当前调用栈内同步发生（上游同步失败、无退避），
///   也可能在计时器线程或异步钩子的完成回调中发生；两种路径必须共享同一份计数与取消状态。
/// - **契约（What）**：
///   - 下游只收到一次 `on_subscribe`，其订阅为 [`SubscriptionArbiter`]，需求跨越重试继承；
///   - 下游取消后不再重新订阅，同时取消挂起的退避计时器与异步钩子；
///   - 异步钩子返回的流出错时，以该错误终止下游。
/// - **实现（How）**：
///   - 下游消费者在尝试之间以所有权转移的方式传递：当前尝试的订阅者持有它，失败时交给重试流程，
///     流程走完后再交给下一次尝试的订阅者；
///   - 重新订阅经 [`DrainGate`] 蹦床化：同步失败引发的重新订阅只登记到 `pending`，
///     由最外层循环依次执行，调用栈深度与重试次数无关。
pub(crate) struct RetryPublisher<T> {
    source: Flux<T>,
    spec: Arc<RetrySpec>,
}

impl<T> RetryPublisher<T> {
    pub(crate) fn new(source: Flux<T>, spec: RetrySpec) -> Self {
        Self {
            source,
            spec: Arc::new(spec),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for RetryPublisher<T> {
    fn subscribe(&self, mut actual: BoxSubscriber<T>) {
        let shared = Arc::new(RetryShared {
            source: self.source.clone(),
            spec: self.spec.clone(),
            context: actual.context(),
            arbiter: Arc::new(SubscriptionArbiter::new()),
            counters: Mutex::new(Counters::default()),
            gate: DrainGate::new(),
            pending: Mutex::new(None),
            timer: Mutex::new(None),
            hook: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        });
        actual.on_subscribe(Arc::new(RetrySubscription {
            shared: shared.clone(),
        }));
        shared.resubscribe(actual);
    }
}

#[derive(Default)]
struct Counters {
    total: u64,
    in_a_row: u64,
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Before,
    BeforeAsync,
    Delay,
    After,
    AfterAsync,
    Resubscribe,
}

struct RetryShared<T> {
    source: Flux<T>,
    spec: Arc<RetrySpec>,
    context: Context,
    arbiter: Arc<SubscriptionArbiter>,
    counters: Mutex<Counters>,
    gate: DrainGate,
    pending: Mutex<Option<BoxSubscriber<T>>>,
    timer: Mutex<Option<CancelHandle>>,
    hook: Mutex<Option<Arc<dyn Subscription>>>,
    cancelled: AtomicBool,
}

impl<T: Send + 'static> RetryShared<T> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.arbiter.cancel();
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
        if let Some(hook) = self.hook.lock().take() {
            hook.cancel();
        }
        self.pending.lock().take();
    }

    fn resubscribe(self: &Arc<Self>, actual: BoxSubscriber<T>) {
        *self.pending.lock() = Some(actual);
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            let next = self.pending.lock().take();
            if let Some(actual) = next {
                if !self.is_cancelled() {
                    self.source.subscribe_inner(Box::new(AttemptSubscriber {
                        shared: self.clone(),
                        actual: Some(actual),
                        delivered: false,
                    }));
                }
            }
            missed = self.gate.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    fn failed(self: &Arc<Self>, mut actual: BoxSubscriber<T>, error: FlowError, delivered: bool) {
        if !self.spec.accepts(&error) {
            actual.on_error(error);
            return;
        }
        let signal = {
            let mut counters = self.counters.lock();
            if delivered {
                counters.in_a_row = 0;
            }
            let signal = RetrySignal::new(counters.total, counters.in_a_row, error);
            if !self.spec.is_exhausted(&signal) {
                counters.total += 1;
                counters.in_a_row += 1;
            }
            signal
        };
        if self.spec.is_exhausted(&signal) {
            tracing::debug!(
                retries = signal.total_retries(),
                max = self.spec.max_attempts(),
                "retries exhausted"
            );
            actual.on_error(self.spec.exhausted_error(&signal));
            return;
        }
        tracing::debug!(
            retries = signal.total_retries(),
            in_a_row = signal.total_retries_in_a_row(),
            error = %signal.failure(),
            "scheduling resubscription"
        );
        self.advance(Phase::Before, actual, signal);
    }

    fn advance(self: &Arc<Self>, mut phase: Phase, actual: BoxSubscriber<T>, signal: RetrySignal) {
        loop {
            if self.is_cancelled() {
                return;
            }
            phase = match phase {
                Phase::Before => {
                    for hook in &self.spec.before {
                        hook(&signal);
                    }
                    Phase::BeforeAsync
                }
                Phase::BeforeAsync => match &self.spec.before_async {
                    Some(hook) => {
                        let gate = hook(&signal);
                        self.await_hook(gate, Phase::Delay, actual, signal);
                        return;
                    }
                    None => Phase::Delay,
                },
                Phase::Delay => {
                    let delay = self.spec.delay_for(&signal);
                    if delay.is_zero() {
                        Phase::After
                    } else {
                        self.schedule_delay(delay, actual, signal);
                        return;
                    }
                }
                Phase::After => {
                    for hook in &self.spec.after {
                        hook(&signal);
                    }
                    Phase::AfterAsync
                }
                Phase::AfterAsync => match &self.spec.after_async {
                    Some(hook) => {
                        let gate = hook(&signal);
                        self.await_hook(gate, Phase::Resubscribe, actual, signal);
                        return;
                    }
                    None => Phase::Resubscribe,
                },
                Phase::Resubscribe => {
                    self.resubscribe(actual);
                    return;
                }
            };
        }
    }

    fn schedule_delay(
        self: &Arc<Self>,
        delay: std::time::Duration,
        actual: BoxSubscriber<T>,
        signal: RetrySignal,
    ) {
        let scheduler = self
            .spec
            .scheduler
            .clone()
            .unwrap_or_else(scheduler::parallel);
        let parked = Arc::new(Mutex::new(Some(actual)));
        let task_parked = parked.clone();
        let shared = self.clone();
        let task = Box::new(move || {
            let actual = task_parked.lock().take();
            if let Some(actual) = actual {
                shared.advance(Phase::After, actual, signal);
            }
        });
        match scheduler.schedule(task, Some(delay)) {
            Ok(handle) => *self.timer.lock() = Some(handle),
            Err(err) => {
                let actual = parked.lock().take();
                if let Some(mut actual) = actual {
                    tracing::warn!(scheduler = scheduler.name(), error = %err, "retry timer rejected");
                    actual.on_error(err.into());
                }
            }
        }
    }

    fn await_hook(
        self: &Arc<Self>,
        gate: Flux<()>,
        next: Phase,
        actual: BoxSubscriber<T>,
        signal: RetrySignal,
    ) {
        gate.subscribe_inner(Box::new(HookSubscriber {
            shared: self.clone(),
            next,
            parked: Some((actual, signal)),
        }));
    }
}

struct RetrySubscription<T> {
    shared: Arc<RetryShared<T>>,
}

impl<T: Send + 'static> Subscription for RetrySubscription<T> {
    fn request(&self, n: u64) {
        self.shared.arbiter.request(n);
    }

    fn cancel(&self) {
        self.shared.cancel();
    }
}

struct AttemptSubscriber<T> {
    shared: Arc<RetryShared<T>>,
    actual: Option<BoxSubscriber<T>>,
    delivered: bool,
}

impl<T: Send + 'static> Subscriber<T> for AttemptSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.shared.arbiter.set(subscription);
    }

    fn on_next(&mut self, value: T) {
        let Some(actual) = self.actual.as_mut() else {
            hooks::on_next_dropped("retry");
            return;
        };
        self.delivered = true;
        self.shared.arbiter.produced(1);
        actual.on_next(value);
    }

    fn on_error(&mut self, error: FlowError) {
        match self.actual.take() {
            Some(actual) => self.shared.failed(actual, error, self.delivered),
            None => hooks::on_error_dropped("retry", error),
        }
    }

    fn on_complete(&mut self) {
        if let Some(mut actual) = self.actual.take() {
            actual.on_complete();
        }
    }

    fn context(&self) -> Context {
        self.shared.context.clone()
    }
}

/// 订阅异步钩子返回的流，完成后推进到下一阶段。
struct HookSubscriber<T> {
    shared: Arc<RetryShared<T>>,
    next: Phase,
    parked: Option<(BoxSubscriber<T>, RetrySignal)>,
}

impl<T: Send + 'static> Subscriber<()> for HookSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        if self.shared.is_cancelled() {
            subscription.cancel();
            self.parked = None;
            return;
        }
        *self.shared.hook.lock() = Some(subscription.clone());
        subscription.request(UNBOUNDED);
    }

    fn on_next(&mut self, _value: ()) {}

    fn on_error(&mut self, error: FlowError) {
        self.shared.hook.lock().take();
        if let Some((mut actual, _)) = self.parked.take() {
            tracing::debug!(error = %error, "retry hook failed");
            actual.on_error(error);
        }
    }

    fn on_complete(&mut self) {
        self.shared.hook.lock().take();
        if let Some((actual, signal)) = self.parked.take() {
            self.shared.advance(self.next, actual, signal);
        }
    }

    fn context(&self) -> Context {
        self.shared.context.clone()
    }
}
