//! 直通型阶段：需求原样转发，不缓存元素。

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::{
    context::Context,
    error::FlowError,
    flux::Flux,
    hooks,
    protocol::{BoxSubscriber, EmptySubscription, Publisher, Subscriber, Subscription},
};

pub(crate) type FilterMapFn<T, U> = dyn Fn(T) -> Result<Option<U>, FlowError> + Send + Sync;

/// `map`/`filter`/`try_map` 共用的阶段。
///
/// - `Ok(Some(u))` 向下游发射；
/// - `Ok(None)` 丢弃元素并向上游补请求 1 个，保持下游看到的需求不变；
/// - `Err(e)` 取消上游并以 `e` 终止。
pub(crate) struct FilterMapPublisher<T, U> {
    source: Flux<T>,
    stage: &'static str,
    f: Arc<FilterMapFn<T, U>>,
}

impl<T, U> FilterMapPublisher<T, U> {
    pub(crate) fn new(
        source: Flux<T>,
        stage: &'static str,
        f: impl Fn(T) -> Result<Option<U>, FlowError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            stage,
            f: Arc::new(f),
        }
    }
}

impl<T: Send + 'static, U: Send + 'static> Publisher<U> for FilterMapPublisher<T, U> {
    fn subscribe(&self, actual: BoxSubscriber<U>) {
        self.source.subscribe_inner(Box::new(FilterMapSubscriber {
            actual,
            f: self.f.clone(),
            stage: self.stage,
            upstream: None,
            done: false,
        }));
    }
}

struct FilterMapSubscriber<T, U> {
    actual: BoxSubscriber<U>,
    f: Arc<FilterMapFn<T, U>>,
    stage: &'static str,
    upstream: Option<Arc<dyn Subscription>>,
    done: bool,
}

impl<T: Send + 'static, U: Send + 'static> Subscriber<T> for FilterMapSubscriber<T, U> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.upstream = Some(subscription.clone());
        self.actual.on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) {
        if self.done {
            hooks::on_next_dropped(self.stage);
            return;
        }
        match (self.f)(value) {
            Ok(Some(mapped)) => self.actual.on_next(mapped),
            Ok(None) => {
                if let Some(upstream) = &self.upstream {
                    upstream.request(1);
                }
            }
            Err(error) => {
                self.done = true;
                if let Some(upstream) = &self.upstream {
                    upstream.cancel();
                }
                self.actual.on_error(error);
            }
        }
    }

    fn on_error(&mut self, error: FlowError) {
        if self.done {
            hooks::on_error_dropped(self.stage, error);
            return;
        }
        self.done = true;
        self.actual.on_error(error);
    }

    fn on_complete(&mut self) {
        if !self.done {
            self.done = true;
            self.actual.on_complete();
        }
    }

    fn context(&self) -> Context {
        self.actual.context()
    }
}

/// 只取前 `limit` 个元素。
///
/// 向上游转发的累计需求被截断到 `limit`；第 `limit` 个元素送达后取消上游并完成。
pub(crate) struct TakePublisher<T> {
    source: Flux<T>,
    limit: u64,
}

impl<T> TakePublisher<T> {
    pub(crate) fn new(source: Flux<T>, limit: u64) -> Self {
        Self { source, limit }
    }
}

impl<T: Send + 'static> Publisher<T> for TakePublisher<T> {
    fn subscribe(&self, actual: BoxSubscriber<T>) {
        self.source.subscribe_inner(Box::new(TakeSubscriber {
            actual,
            remaining: self.limit,
            limit: self.limit,
            upstream: None,
            done: false,
        }));
    }
}

struct TakeSubscriber<T> {
    actual: BoxSubscriber<T>,
    remaining: u64,
    limit: u64,
    upstream: Option<Arc<dyn Subscription>>,
    done: bool,
}

struct TakeSubscription {
    upstream: Arc<dyn Subscription>,
    budget: AtomicU64,
}

impl Subscription for TakeSubscription {
    fn request(&self, n: u64) {
        let mut budget = self.budget.load(Ordering::Acquire);
        loop {
            if budget == 0 || n == 0 {
                return;
            }
            let granted = n.min(budget);
            match self.budget.compare_exchange_weak(
                budget,
                budget - granted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.upstream.request(granted);
                    return;
                }
                Err(actual) => budget = actual,
            }
        }
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}

impl<T: Send + 'static> Subscriber<T> for TakeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        if self.limit == 0 {
            subscription.cancel();
            self.done = true;
            self.actual.on_subscribe(EmptySubscription::shared());
            self.actual.on_complete();
            return;
        }
        self.upstream = Some(subscription.clone());
        self.actual.on_subscribe(Arc::new(TakeSubscription {
            upstream: subscription,
            budget: AtomicU64::new(self.limit),
        }));
    }

    fn on_next(&mut self, value: T) {
        if self.done {
            hooks::on_next_dropped("take");
            return;
        }
        self.remaining -= 1;
        self.actual.on_next(value);
        if self.remaining == 0 {
            self.done = true;
            if let Some(upstream) = &self.upstream {
                upstream.cancel();
            }
            self.actual.on_complete();
        }
    }

    fn on_error(&mut self, error: FlowError) {
        if self.done {
            hooks::on_error_dropped("take", error);
            return;
        }
        self.done = true;
        self.actual.on_error(error);
    }

    fn on_complete(&mut self) {
        if !self.done {
            self.done = true;
            self.actual.on_complete();
        }
    }

    fn context(&self) -> Context {
        self.actual.context()
    }
}

/// `do_on_*` 系列旁路观察钩子。
pub(crate) enum PeekHook<T> {
    Next(Arc<dyn Fn(&T) + Send + Sync>),
    Error(Arc<dyn Fn(&FlowError) + Send + Sync>),
    Complete(Arc<dyn Fn() + Send + Sync>),
    Request(Arc<dyn Fn(u64) + Send + Sync>),
    Cancel(Arc<dyn Fn() + Send + Sync>),
}

impl<T> Clone for PeekHook<T> {
    fn clone(&self) -> Self {
        match self {
            PeekHook::Next(f) => PeekHook::Next(f.clone()),
            PeekHook::Error(f) => PeekHook::Error(f.clone()),
            PeekHook::Complete(f) => PeekHook::Complete(f.clone()),
            PeekHook::Request(f) => PeekHook::Request(f.clone()),
            PeekHook::Cancel(f) => PeekHook::Cancel(f.clone()),
        }
    }
}

pub(crate) struct PeekPublisher<T> {
    source: Flux<T>,
    hook: PeekHook<T>,
}

impl<T> PeekPublisher<T> {
    pub(crate) fn new(source: Flux<T>, hook: PeekHook<T>) -> Self {
        Self { source, hook }
    }
}

impl<T: Send + 'static> Publisher<T> for PeekPublisher<T> {
    fn subscribe(&self, actual: BoxSubscriber<T>) {
        self.source.subscribe_inner(Box::new(PeekSubscriber {
            actual,
            hook: self.hook.clone(),
        }));
    }
}

struct PeekSubscriber<T> {
    actual: BoxSubscriber<T>,
    hook: PeekHook<T>,
}

struct PeekSubscription {
    upstream: Arc<dyn Subscription>,
    on_request: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    on_cancel: Option<Arc<dyn Fn() + Send + Sync>>,
    cancelled: AtomicBool,
}

impl Subscription for PeekSubscription {
    fn request(&self, n: u64) {
        if let Some(hook) = &self.on_request {
            hook(n);
        }
        self.upstream.request(n);
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(hook) = &self.on_cancel {
            hook();
        }
        self.upstream.cancel();
    }
}

impl<T: Send + 'static> Subscriber<T> for PeekSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let subscription: Arc<dyn Subscription> = match &self.hook {
            PeekHook::Request(hook) => Arc::new(PeekSubscription {
                upstream: subscription,
                on_request: Some(hook.clone()),
                on_cancel: None,
                cancelled: AtomicBool::new(false),
            }),
            PeekHook::Cancel(hook) => Arc::new(PeekSubscription {
                upstream: subscription,
                on_request: None,
                on_cancel: Some(hook.clone()),
                cancelled: AtomicBool::new(false),
            }),
            _ => subscription,
        };
        self.actual.on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) {
        if let PeekHook::Next(hook) = &self.hook {
            hook(&value);
        }
        self.actual.on_next(value);
    }

    fn on_error(&mut self, error: FlowError) {
        if let PeekHook::Error(hook) = &self.hook {
            hook(&error);
        }
        self.actual.on_error(error);
    }

    fn on_complete(&mut self) {
        if let PeekHook::Complete(hook) = &self.hook {
            hook();
        }
        self.actual.on_complete();
    }

    fn context(&self) -> Context {
        self.actual.context()
    }
}
