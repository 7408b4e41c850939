//! 订阅期上下文的写入与读取阶段。
//!
//! - `context_write`：在订阅建立时以下游上下文为输入计算新上下文，只有本阶段上游的阶段
//!   通过 [`Subscriber::context`] 读到它；
//! - `defer_contextual`：在订阅建立时以下游上下文构造真正的源。

use std::sync::Arc;

use crate::{
    context::Context,
    error::FlowError,
    flux::Flux,
    protocol::{BoxSubscriber, Publisher, Subscriber, Subscription},
};

type ContextFn = dyn Fn(Context) -> Context + Send + Sync;

pub(crate) struct ContextWritePublisher<T> {
    source: Flux<T>,
    write: Arc<ContextFn>,
}

impl<T> ContextWritePublisher<T> {
    pub(crate) fn new(
        source: Flux<T>,
        write: impl Fn(Context) -> Context + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            write: Arc::new(write),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for ContextWritePublisher<T> {
    fn subscribe(&self, actual: BoxSubscriber<T>) {
        let context = (self.write)(actual.context());
        self.source
            .subscribe_inner(Box::new(ContextWriteSubscriber { actual, context }));
    }
}

struct ContextWriteSubscriber<T> {
    actual: BoxSubscriber<T>,
    context: Context,
}

impl<T: Send + 'static> Subscriber<T> for ContextWriteSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.actual.on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) {
        self.actual.on_next(value);
    }

    fn on_error(&mut self, error: FlowError) {
        self.actual.on_error(error);
    }

    fn on_complete(&mut self) {
        self.actual.on_complete();
    }

    fn context(&self) -> Context {
        self.context.clone()
    }
}

pub(crate) struct DeferContextualPublisher<T> {
    factory: Arc<dyn Fn(&Context) -> Flux<T> + Send + Sync>,
}

impl<T> DeferContextualPublisher<T> {
    pub(crate) fn new(factory: impl Fn(&Context) -> Flux<T> + Send + Sync + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for DeferContextualPublisher<T> {
    fn subscribe(&self, actual: BoxSubscriber<T>) {
        let context = actual.context();
        (self.factory)(&context).subscribe_inner(actual);
    }
}
