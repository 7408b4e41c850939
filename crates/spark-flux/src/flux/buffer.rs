//! 聚合型重塑阶段：`buffer` 系列与 `collect_list`。
//!
//! # 需求换算（What）
//! - 精确模式（`skip == size`）：下游每请求 `n` 个聚合，向上游请求 `n * size` 个元素；
//! - 间隔模式（`skip > size`）：首次请求 `n * size + (n - 1) * (skip - size)`，之后每次 `n * skip`；
//! - 重叠模式（`skip < size`）：首次请求 `size + (n - 1) * skip`，之后每次 `n * skip`；
//! - 上游完成时，尚未装满的聚合按打开顺序作为最后的 `Next` 冲刷，然后完成；上游出错时丢弃未满聚合。

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    context::Context,
    error::FlowError,
    flux::Flux,
    hooks,
    protocol::{BoxSubscriber, DrainQueue, Publisher, Subscriber, Subscription, UNBOUNDED},
};

/// 把下游对聚合的请求换算为对上游元素的请求。
pub(crate) fn reshape_request(n: u64, size: usize, skip: usize, first: bool) -> u64 {
    if n == UNBOUNDED {
        return UNBOUNDED;
    }
    let size = size as u64;
    let skip = skip as u64;
    if skip == size {
        return n.saturating_mul(size);
    }
    if !first {
        return n.saturating_mul(skip);
    }
    let rest = n - 1;
    if skip > size {
        n.saturating_mul(size)
            .saturating_add(rest.saturating_mul(skip - size))
    } else {
        size.saturating_add(rest.saturating_mul(skip))
    }
}

/// 在多个打开的聚合之间复制元素：最后一个拿走所有权，其余调用复制函数。
pub(crate) fn fan_out<T, B>(
    targets: &mut [B],
    value: T,
    clone: Option<fn(&T) -> T>,
    mut push: impl FnMut(&mut B, T),
) {
    let mut value = Some(value);
    let last = targets.len().saturating_sub(1);
    for (index, target) in targets.iter_mut().enumerate() {
        let item = if index == last {
            value.take()
        } else {
            match (clone, value.as_ref()) {
                (Some(clone), Some(value)) => Some(clone(value)),
                _ => None,
            }
        };
        if let Some(item) = item {
            push(target, item);
        }
    }
}

pub(crate) struct BufferPublisher<T> {
    source: Flux<T>,
    size: usize,
    skip: usize,
    clone: Option<fn(&T) -> T>,
}

impl<T> BufferPublisher<T> {
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

impl<T: Send + 'static> Publisher<Vec<T>> for BufferPublisher<T> {
    fn subscribe(&self, actual: BoxSubscriber<Vec<T>>) {
        let context = actual.context();
        self.source.subscribe_inner(Box::new(BufferSubscriber {
            actual: Some(actual),
            context,
            queue: Arc::new(DrainQueue::new("buffer")),
            size: self.size,
            skip: self.skip,
            clone: self.clone,
            index: 0,
            open: VecDeque::new(),
            done: false,
        }));
    }
}

struct BufferSubscription<T> {
    queue: Arc<DrainQueue<Vec<T>>>,
    upstream: Arc<dyn Subscription>,
    size: usize,
    skip: usize,
    first: AtomicBool,
}

impl<T: Send + 'static> Subscription for BufferSubscription<T> {
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

struct BufferSubscriber<T> {
    actual: Option<BoxSubscriber<Vec<T>>>,
    context: Context,
    queue: Arc<DrainQueue<Vec<T>>>,
    size: usize,
    skip: usize,
    clone: Option<fn(&T) -> T>,
    index: u64,
    open: VecDeque<Vec<T>>,
    done: bool,
}

impl<T: Send + 'static> Subscriber<T> for BufferSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let Some(mut actual) = self.actual.take() else {
            subscription.cancel();
            return;
        };
        actual.on_subscribe(Arc::new(BufferSubscription {
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
            hooks::on_next_dropped("buffer");
            return;
        }
        if self.index % self.skip as u64 == 0 {
            self.open.push_back(Vec::with_capacity(self.size));
        }
        self.index += 1;
        fan_out(
            self.open.make_contiguous(),
            value,
            self.clone,
            |buffer, item| buffer.push(item),
        );
        while self
            .open
            .front()
            .is_some_and(|buffer| buffer.len() >= self.size)
        {
            if let Some(full) = self.open.pop_front() {
                self.queue.push(full);
            }
        }
        self.queue.drain();
    }

    fn on_error(&mut self, error: FlowError) {
        if self.done {
            hooks::on_error_dropped("buffer", error);
            return;
        }
        self.done = true;
        self.open.clear();
        self.queue.error(error);
        self.queue.drain();
    }

    fn on_complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        for partial in self.open.drain(..) {
            if !partial.is_empty() {
                self.queue.push(partial);
            }
        }
        self.queue.complete();
        self.queue.drain();
    }

    fn context(&self) -> Context {
        self.context.clone()
    }
}

/// 把全部元素收集为一个 `Vec`，在上游完成时发射。
pub(crate) struct CollectPublisher<T> {
    source: Flux<T>,
}

impl<T> CollectPublisher<T> {
    pub(crate) fn new(source: Flux<T>) -> Self {
        Self { source }
    }
}

impl<T: Send + 'static> Publisher<Vec<T>> for CollectPublisher<T> {
    fn subscribe(&self, actual: BoxSubscriber<Vec<T>>) {
        let context = actual.context();
        self.source.subscribe_inner(Box::new(CollectSubscriber {
            actual: Some(actual),
            context,
            queue: Arc::new(DrainQueue::new("collect_list")),
            items: Vec::new(),
            done: false,
        }));
    }
}

struct CollectSubscription<T> {
    queue: Arc<DrainQueue<Vec<T>>>,
    upstream: Arc<dyn Subscription>,
    started: AtomicBool,
}

impl<T: Send + 'static> Subscription for CollectSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.queue.request(n);
        if !self.started.swap(true, Ordering::AcqRel) {
            self.upstream.request(UNBOUNDED);
        }
    }

    fn cancel(&self) {
        self.queue.cancel();
        self.upstream.cancel();
    }
}

struct CollectSubscriber<T> {
    actual: Option<BoxSubscriber<Vec<T>>>,
    context: Context,
    queue: Arc<DrainQueue<Vec<T>>>,
    items: Vec<T>,
    done: bool,
}

impl<T: Send + 'static> Subscriber<T> for CollectSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let Some(mut actual) = self.actual.take() else {
            subscription.cancel();
            return;
        };
        actual.on_subscribe(Arc::new(CollectSubscription {
            queue: self.queue.clone(),
            upstream: subscription,
            started: AtomicBool::new(false),
        }));
        self.queue.attach(actual);
        self.queue.drain();
    }

    fn on_next(&mut self, value: T) {
        if self.done {
            hooks::on_next_dropped("collect_list");
            return;
        }
        self.items.push(value);
    }

    fn on_error(&mut self, error: FlowError) {
        if self.done {
            hooks::on_error_dropped("collect_list", error);
            return;
        }
        self.done = true;
        self.items.clear();
        self.queue.error(error);
        self.queue.drain();
    }

    fn on_complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.queue.push(std::mem::take(&mut self.items));
        self.queue.complete();
        self.queue.drain();
    }

    fn context(&self) -> Context {
        self.context.clone()
    }
}
