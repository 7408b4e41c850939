//! `flat_map` / `concat_map`：把每个元素映射为子流并合并子流的输出。
//!
//! # 教案式说明
//! - **意图（Why）**：分组、开窗之后的下游几乎总是“逐个订阅子流再合并”，合并阶段必须同时
//!   满足两端的需求约束：对下游不超发，对每个子流按预取额度拉取。
//! - **契约（What）**：
//!   - 同时活跃的子流不超过 `concurrency`；每完成一个子流才向上游补请求一个元素；
//!   - 每个子流订阅时预取 `prefetch.size()` 个元素，被下游消费满 `prefetch.limit()` 个后补货；
//!   - 任一子流或上游出错时，取消其余子流与上游并立即以该错误终止；
//!   - 上游完成且全部子流完成后才完成；`concurrency == 1` 时子流按上游顺序串行展开（`concat_map`）。
//! - **实现（How）**：所有子流把元素写入各自的队列，由单一排空循环（[`DrainGate`]）
//!   在剩余需求内按子流开启顺序轮流出队投递；投递期间下游的重入请求只累加需求。

use std::{
    collections::VecDeque,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    context::Context,
    error::FlowError,
    flux::{
        Flux,
        prefetch::{Prefetch, Replenisher},
    },
    hooks,
    protocol::{
        BoxSubscriber, DemandCounter, DrainGate, Publisher, Subscriber, Subscription, UNBOUNDED,
    },
};

type Mapper<T, U> = dyn Fn(T) -> Flux<U> + Send + Sync;

pub(crate) struct FlatMapPublisher<T, U> {
    source: Flux<T>,
    mapper: Arc<Mapper<T, U>>,
    concurrency: usize,
    prefetch: Prefetch,
    stage: &'static str,
}

impl<T, U> FlatMapPublisher<T, U> {
    pub(crate) fn new(
        source: Flux<T>,
        mapper: impl Fn(T) -> Flux<U> + Send + Sync + 'static,
        concurrency: usize,
        prefetch: Prefetch,
        stage: &'static str,
    ) -> Self {
        Self {
            source,
            mapper: Arc::new(mapper),
            concurrency: concurrency.max(1),
            prefetch,
            stage,
        }
    }
}

impl<T, U> Publisher<U> for FlatMapPublisher<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn subscribe(&self, actual: BoxSubscriber<U>) {
        let context = actual.context();
        let shared = Arc::new(MergeShared {
            stage: self.stage,
            gate: DrainGate::new(),
            demand: DemandCounter::new(),
            actual: Mutex::new(None),
            inners: Mutex::new(Vec::new()),
            upstream: OnceLock::new(),
            upstream_done: AtomicBool::new(false),
            error: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });
        self.source.subscribe_inner(Box::new(FlatMapSubscriber {
            actual: Some(actual),
            context,
            shared,
            mapper: self.mapper.clone(),
            concurrency: self.concurrency,
            prefetch: self.prefetch,
            done: false,
        }));
    }
}

struct InnerState<U> {
    queue: Mutex<VecDeque<U>>,
    done: AtomicBool,
    subscription: OnceLock<Arc<dyn Subscription>>,
    replenisher: Mutex<Replenisher>,
}

impl<U> InnerState<U> {
    fn cancel(&self) {
        if let Some(subscription) = self.subscription.get() {
            subscription.cancel();
        }
        self.queue.lock().clear();
    }
}

struct MergeShared<U> {
    stage: &'static str,
    gate: DrainGate,
    demand: DemandCounter,
    actual: Mutex<Option<BoxSubscriber<U>>>,
    inners: Mutex<Vec<Arc<InnerState<U>>>>,
    upstream: OnceLock<Arc<dyn Subscription>>,
    upstream_done: AtomicBool,
    error: Mutex<Option<FlowError>>,
    cancelled: AtomicBool,
    terminated: AtomicBool,
}

impl<U: Send + 'static> MergeShared<U> {
    fn fail(&self, error: FlowError) {
        let mut slot = self.error.lock();
        if slot.is_some() || self.terminated.load(Ordering::Acquire) {
            drop(slot);
            hooks::on_error_dropped(self.stage, error);
            return;
        }
        *slot = Some(error);
        drop(slot);
        self.drain();
    }

    fn cancel_all(&self) {
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
        let inners = std::mem::take(&mut *self.inners.lock());
        for inner in inners {
            inner.cancel();
        }
    }

    fn drain(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            self.drain_once();
            missed = self.gate.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    fn drain_once(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            self.actual.lock().take();
            self.cancel_all();
            return;
        }
        let mut guard = self.actual.lock();
        let Some(actual) = guard.as_mut() else {
            return;
        };

        let pending = self.error.lock().take();
        if let Some(error) = pending {
            self.terminated.store(true, Ordering::Release);
            self.cancel_all();
            actual.on_error(error);
            *guard = None;
            return;
        }

        let requested = self.demand.get();
        let mut emitted = 0u64;
        let mut finished = 0u64;
        let inners: Vec<_> = self.inners.lock().clone();
        for inner in &inners {
            let mut consumed = 0u64;
            while emitted < requested && !self.cancelled.load(Ordering::Acquire) {
                let Some(value) = inner.queue.lock().pop_front() else {
                    break;
                };
                actual.on_next(value);
                emitted += 1;
                consumed += 1;
            }
            let done = inner.done.load(Ordering::Acquire);
            if done && inner.queue.lock().is_empty() {
                self.inners.lock().retain(|other| !Arc::ptr_eq(other, inner));
                finished += 1;
            } else if consumed > 0 {
                let amount = inner.replenisher.lock().consumed(consumed);
                if let (Some(amount), Some(subscription)) = (amount, inner.subscription.get()) {
                    subscription.request(amount);
                }
            }
            if self.error.lock().is_some() {
                break;
            }
        }

        let all_done =
            self.upstream_done.load(Ordering::Acquire) && self.inners.lock().is_empty();
        if all_done && self.error.lock().is_none() {
            self.terminated.store(true, Ordering::Release);
            actual.on_complete();
            *guard = None;
        }
        let terminated = guard.is_none();
        drop(guard);

        if emitted > 0 && requested != UNBOUNDED {
            self.demand.produced(emitted);
        }
        if finished > 0 && !terminated && !self.upstream_done.load(Ordering::Acquire) {
            if let Some(upstream) = self.upstream.get() {
                upstream.request(finished);
            }
        }
    }
}

struct MergeSubscription<U> {
    shared: Arc<MergeShared<U>>,
}

impl<U: Send + 'static> Subscription for MergeSubscription<U> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.shared.demand.add(n);
        self.shared.drain();
    }

    fn cancel(&self) {
        if !self.shared.cancelled.swap(true, Ordering::AcqRel) {
            self.shared.drain();
        }
    }
}

struct FlatMapSubscriber<T, U> {
    actual: Option<BoxSubscriber<U>>,
    context: Context,
    shared: Arc<MergeShared<U>>,
    mapper: Arc<Mapper<T, U>>,
    concurrency: usize,
    prefetch: Prefetch,
    done: bool,
}

impl<T, U> Subscriber<T> for FlatMapSubscriber<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let Some(mut actual) = self.actual.take() else {
            subscription.cancel();
            return;
        };
        let _ = self.shared.upstream.set(subscription.clone());
        actual.on_subscribe(Arc::new(MergeSubscription {
            shared: self.shared.clone(),
        }));
        *self.shared.actual.lock() = Some(actual);
        self.shared.drain();
        let initial = if self.concurrency == usize::MAX {
            UNBOUNDED
        } else {
            self.concurrency as u64
        };
        subscription.request(initial);
    }

    fn on_next(&mut self, value: T) {
        if self.done || self.shared.cancelled.load(Ordering::Acquire) {
            hooks::on_next_dropped(self.shared.stage);
            return;
        }
        let inner = Arc::new(InnerState {
            queue: Mutex::new(VecDeque::new()),
            done: AtomicBool::new(false),
            subscription: OnceLock::new(),
            replenisher: Mutex::new(self.prefetch.replenisher()),
        });
        self.shared.inners.lock().push(inner.clone());
        let flux = (self.mapper)(value);
        flux.subscribe_inner(Box::new(InnerSubscriber {
            shared: self.shared.clone(),
            inner,
            prefetch: self.prefetch,
            context: self.context.clone(),
        }));
    }

    fn on_error(&mut self, error: FlowError) {
        if self.done {
            hooks::on_error_dropped(self.shared.stage, error);
            return;
        }
        self.done = true;
        self.shared.fail(error);
    }

    fn on_complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.shared.upstream_done.store(true, Ordering::Release);
        self.shared.drain();
    }

    fn context(&self) -> Context {
        self.context.clone()
    }
}

struct InnerSubscriber<U> {
    shared: Arc<MergeShared<U>>,
    inner: Arc<InnerState<U>>,
    prefetch: Prefetch,
    context: Context,
}

impl<U: Send + 'static> Subscriber<U> for InnerSubscriber<U> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        if self.inner.subscription.set(subscription.clone()).is_err()
            || self.shared.cancelled.load(Ordering::Acquire)
            || self.shared.terminated.load(Ordering::Acquire)
        {
            subscription.cancel();
            return;
        }
        subscription.request(self.prefetch.initial_request());
    }

    fn on_next(&mut self, value: U) {
        if self.inner.done.load(Ordering::Acquire) {
            hooks::on_next_dropped(self.shared.stage);
            return;
        }
        self.inner.queue.lock().push_back(value);
        self.shared.drain();
    }

    fn on_error(&mut self, error: FlowError) {
        if self.inner.done.swap(true, Ordering::AcqRel) {
            hooks::on_error_dropped(self.shared.stage, error);
            return;
        }
        self.shared.fail(error);
    }

    fn on_complete(&mut self) {
        if !self.inner.done.swap(true, Ordering::AcqRel) {
            self.shared.drain();
        }
    }

    fn context(&self) -> Context {
        self.context.clone()
    }
}
