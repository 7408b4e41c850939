//! 开窗型重塑阶段：把上游切分为若干子流。
//!
//! # 契约说明（What）
//! - 每个窗口是一个单播子流，只允许订阅一次；窗口内元素在子流订阅者请求前缓存在窗口内部；
//! - 外层按下游需求发射窗口；固定大小窗口的上游需求换算与 `buffer` 相同；
//! - 谓词窗口按预取额度驱动上游，只有元素被窗口消费者取走（或被丢弃）后才向上游补货：
//!   - `until`：匹配元素开启新窗口并归属新窗口（`cut_before`），或归属并关闭当前窗口；
//!   - `while`：匹配元素进入当前窗口，不匹配元素被丢弃并关闭当前窗口（若尚无窗口则发射一个空窗口），
//!     下一个元素开启新窗口；
//! - 上游完成或出错时，所有打开的窗口与外层一起终止。

use std::{
    collections::VecDeque,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    context::Context,
    error::FlowError,
    flux::{
        Flux,
        buffer::{fan_out, reshape_request},
        prefetch::{Prefetch, Replenisher},
    },
    hooks,
    protocol::{BoxSubscriber, DrainQueue, Publisher, Subscriber, Subscription},
    sink::{EmitResult, UnicastProcessor},
};

pub(crate) struct WindowPublisher<T> {
    source: Flux<T>,
    size: usize,
    skip: usize,
    clone: Option<fn(&T) -> T>,
}

impl<T> WindowPublisher<T> {
    pub(crate) fn exact(source: Flux<T>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            source,
            size,
            skip: size,
            clone: None,
        }
    }

    pub(crate) fn skipping(source: Flux<T>, size: usize, skip: usize) -> Self
    where
        T: Clone,
    {
        Self {
            source,
            size: size.max(1),
            skip: skip.max(1),
            clone: Some(T::clone),
        }
    }
}

impl<T: Send + 'static> Publisher<Flux<T>> for WindowPublisher<T> {
    fn subscribe(&self, actual: BoxSubscriber<Flux<T>>) {
        let context = actual.context();
        self.source.subscribe_inner(Box::new(WindowSubscriber {
            actual: Some(actual),
            context,
            queue: Arc::new(DrainQueue::new("window")),
            size: self.size,
            skip: self.skip,
            clone: self.clone,
            index: 0,
            open: VecDeque::new(),
            done: false,
        }));
    }
}

struct WindowSubscription<T> {
    queue: Arc<DrainQueue<Flux<T>>>,
    upstream: Arc<dyn Subscription>,
    size: usize,
    skip: usize,
    first: AtomicBool,
}

impl<T: Send + 'static> Subscription for WindowSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.queue.request(n);
        let first = self.first.swap(false, Ordering::AcqRel);
        self.upstream
            .request(reshape_request(n, self.size, self.skip, first));
    }

    fn cancel(&self) {
        self.queue.cancel();
        self.upstream.cancel();
    }
}

struct OpenWindow<T> {
    processor: Arc<UnicastProcessor<T>>,
    count: usize,
}

struct WindowSubscriber<T> {
    actual: Option<BoxSubscriber<Flux<T>>>,
    context: Context,
    queue: Arc<DrainQueue<Flux<T>>>,
    size: usize,
    skip: usize,
    clone: Option<fn(&T) -> T>,
    index: u64,
    open: VecDeque<OpenWindow<T>>,
    done: bool,
}

impl<T: Send + 'static> Subscriber<T> for WindowSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let Some(mut actual) = self.actual.take() else {
            subscription.cancel();
            return;
        };
        actual.on_subscribe(Arc::new(WindowSubscription {
            queue: self.queue.clone(),
            upstream: subscription,
            size: self.size,
            skip: self.skip,
            first: AtomicBool::new(true),
        }));
        self.queue.attach(actual);
        self.queue.drain();
    }

    fn on_next(&mut self, value: T) {
        if self.done {
            hooks::on_next_dropped("window");
            return;
        }
        if self.index % self.skip as u64 == 0 {
            let processor = Arc::new(UnicastProcessor::new("window"));
            self.queue.push(Flux::from_arc(processor.clone()));
            self.open.push_back(OpenWindow {
                processor,
                count: 0,
            });
            self.queue.drain();
        }
        self.index += 1;
        fan_out(
            self.open.make_contiguous(),
            value,
            self.clone,
            |window, item| {
                window.count += 1;
                let _ = window.processor.offer(item);
            },
        );
        while self
            .open
            .front()
            .is_some_and(|window| window.count >= self.size)
        {
            if let Some(full) = self.open.pop_front() {
                let _ = full.processor.finish(None);
            }
        }
    }

    fn on_error(&mut self, error: FlowError) {
        if self.done {
            hooks::on_error_dropped("window", error);
            return;
        }
        self.done = true;
        for window in self.open.drain(..) {
            let _ = window.processor.finish(Some(error.clone()));
        }
        self.queue.error(error);
        self.queue.drain();
    }

    fn on_complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        for window in self.open.drain(..) {
            let _ = window.processor.finish(None);
        }
        self.queue.complete();
        self.queue.drain();
    }

    fn context(&self) -> Context {
        self.context.clone()
    }
}

/// 谓词窗口的边界策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WindowBoundary {
    /// 匹配元素结束当前窗口；`cut_before` 为真时匹配元素归属新窗口，否则归属当前窗口。
    Until { cut_before: bool },
    /// 匹配元素留在当前窗口，不匹配元素被丢弃并结束当前窗口。
    While,
}

pub(crate) struct WindowPredicatePublisher<T> {
    source: Flux<T>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    boundary: WindowBoundary,
    prefetch: Prefetch,
}

impl<T> WindowPredicatePublisher<T> {
    pub(crate) fn new(
        source: Flux<T>,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
        boundary: WindowBoundary,
        prefetch: Prefetch,
    ) -> Self {
        Self {
            source,
            predicate: Arc::new(predicate),
            boundary,
            prefetch,
        }
    }
}

impl<T: Send + 'static> Publisher<Flux<T>> for WindowPredicatePublisher<T> {
    fn subscribe(&self, actual: BoxSubscriber<Flux<T>>) {
        let context = actual.context();
        self.source.subscribe_inner(Box::new(WindowPredicateSubscriber {
            actual: Some(actual),
            context,
            queue: Arc::new(DrainQueue::new("window_predicate")),
            predicate: self.predicate.clone(),
            boundary: self.boundary,
            prefetch: self.prefetch,
            pacing: Arc::new(UpstreamPacing {
                upstream: OnceLock::new(),
                replenisher: Mutex::new(self.prefetch.replenisher()),
            }),
            current: None,
            done: false,
        }));
    }
}

/// 谓词窗口对上游的补货记账。
///
/// 元素只有在离开本阶段时才计入补货：被窗口消费者取走、作为分隔符丢弃，
/// 或因窗口已取消而无处可去。窗口内积压而未被消费的元素一直占用预取额度。
struct UpstreamPacing {
    upstream: OnceLock<Arc<dyn Subscription>>,
    replenisher: Mutex<Replenisher>,
}

impl UpstreamPacing {
    fn consumed(&self, n: u64) {
        let amount = self.replenisher.lock().consumed(n);
        if let (Some(amount), Some(upstream)) = (amount, self.upstream.get()) {
            upstream.request(amount);
        }
    }
}

struct OuterSubscription<T> {
    queue: Arc<DrainQueue<Flux<T>>>,
    upstream: Arc<dyn Subscription>,
}

impl<T: Send + 'static> Subscription for OuterSubscription<T> {
    fn request(&self, n: u64) {
        self.queue.request(n);
    }

    fn cancel(&self) {
        self.queue.cancel();
        self.upstream.cancel();
    }
}

struct WindowPredicateSubscriber<T> {
    actual: Option<BoxSubscriber<Flux<T>>>,
    context: Context,
    queue: Arc<DrainQueue<Flux<T>>>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    boundary: WindowBoundary,
    prefetch: Prefetch,
    pacing: Arc<UpstreamPacing>,
    current: Option<Arc<UnicastProcessor<T>>>,
    done: bool,
}

impl<T: Send + 'static> WindowPredicateSubscriber<T> {
    fn current_window(&mut self) -> Arc<UnicastProcessor<T>> {
        if let Some(current) = &self.current {
            return current.clone();
        }
        let on_emitted = Arc::downgrade(&self.pacing);
        let on_cancel = Arc::downgrade(&self.pacing);
        let processor = Arc::new(UnicastProcessor::with_hooks(
            "window",
            move |emitted| {
                if let Some(pacing) = Weak::upgrade(&on_emitted) {
                    pacing.consumed(emitted);
                }
            },
            move |discarded| {
                if let Some(pacing) = Weak::upgrade(&on_cancel) {
                    pacing.consumed(discarded);
                }
            },
        ));
        self.queue.push(Flux::from_arc(processor.clone()));
        self.queue.drain();
        self.current = Some(processor.clone());
        processor
    }

    fn offer_current(&mut self, value: T) {
        if self.current_window().offer(value) != EmitResult::Ok {
            hooks::on_next_dropped("window_predicate");
            self.pacing.consumed(1);
        }
    }

    fn close_current(&mut self) {
        if let Some(window) = self.current.take() {
            let _ = window.finish(None);
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for WindowPredicateSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let Some(mut actual) = self.actual.take() else {
            subscription.cancel();
            return;
        };
        let _ = self.pacing.upstream.set(subscription.clone());
        actual.on_subscribe(Arc::new(OuterSubscription {
            queue: self.queue.clone(),
            upstream: subscription.clone(),
        }));
        self.queue.attach(actual);
        self.queue.drain();
        subscription.request(self.prefetch.initial_request());
    }

    fn on_next(&mut self, value: T) {
        if self.done {
            hooks::on_next_dropped("window_predicate");
            return;
        }
        let matched = (self.predicate)(&value);
        match self.boundary {
            WindowBoundary::Until { cut_before: true } => {
                if matched {
                    self.close_current();
                }
                self.offer_current(value);
            }
            WindowBoundary::Until { cut_before: false } => {
                self.offer_current(value);
                if matched {
                    self.close_current();
                }
            }
            WindowBoundary::While => {
                if matched {
                    self.offer_current(value);
                } else {
                    // 分隔符不进入任何窗口，但仍要保证下游看到一个（可能为空的）窗口。
                    let _ = self.current_window();
                    self.close_current();
                    self.pacing.consumed(1);
                }
            }
        }
    }

    fn on_error(&mut self, error: FlowError) {
        if self.done {
            hooks::on_error_dropped("window_predicate", error);
            return;
        }
        self.done = true;
        if let Some(window) = self.current.take() {
            let _ = window.finish(Some(error.clone()));
        }
        self.queue.error(error);
        self.queue.drain();
    }

    fn on_complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.close_current();
        self.queue.complete();
        self.queue.drain();
    }

    fn context(&self) -> Context {
        self.context.clone()
    }
}
