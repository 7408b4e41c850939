//! 订阅期调度切换点：把对上游的 `subscribe` 调用与后续 `request` 调用迁移到调度器线程，
//! 元素的投递线程由上游决定，本阶段不插入队列。

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    context::{Context, propagation::Snapshot},
    error::FlowError,
    flux::Flux,
    protocol::{BoxSubscriber, Publisher, Subscriber, Subscription, SubscriptionArbiter},
    scheduler::SchedulerRef,
};

pub(crate) struct SubscribeOnPublisher<T> {
    source: Flux<T>,
    scheduler: SchedulerRef,
}

impl<T> SubscribeOnPublisher<T> {
    pub(crate) fn new(source: Flux<T>, scheduler: SchedulerRef) -> Self {
        Self { source, scheduler }
    }
}

impl<T: Send + 'static> Publisher<T> for SubscribeOnPublisher<T> {
    fn subscribe(&self, mut actual: BoxSubscriber<T>) {
        let arbiter = Arc::new(SubscriptionArbiter::new());
        actual.on_subscribe(Arc::new(SubscribeOnSubscription {
            arbiter: arbiter.clone(),
            scheduler: self.scheduler.clone(),
        }));

        let slot = Arc::new(Mutex::new(Some(SubscribeOnSubscriber { actual, arbiter })));
        let task_slot = slot.clone();
        let source = self.source.clone();
        let snapshot = Snapshot::capture();
        let scheduled = self.scheduler.schedule(
            Box::new(move || {
                let _scope = snapshot.restore();
                let parent = task_slot.lock().take();
                if let Some(parent) = parent {
                    source.subscribe_inner(Box::new(parent));
                }
            }),
            None,
        );
        if let Err(err) = scheduled {
            let parent = slot.lock().take();
            if let Some(mut parent) = parent {
                tracing::warn!(scheduler = self.scheduler.name(), error = %err, "subscribe task rejected");
                parent.actual.on_error(err.into());
            }
        }
    }
}

struct SubscribeOnSubscription {
    arbiter: Arc<SubscriptionArbiter>,
    scheduler: SchedulerRef,
}

impl Subscription for SubscribeOnSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        if self.arbiter.accumulate_if_detached(n) {
            return;
        }
        let arbiter = self.arbiter.clone();
        if let Err(err) = self
            .scheduler
            .schedule(Box::new(move || arbiter.request(n)), None)
        {
            tracing::debug!(scheduler = self.scheduler.name(), error = %err, "request forwarded inline");
            self.arbiter.request(n);
        }
    }

    fn cancel(&self) {
        self.arbiter.cancel();
    }
}

struct SubscribeOnSubscriber<T> {
    actual: BoxSubscriber<T>,
    arbiter: Arc<SubscriptionArbiter>,
}

impl<T: Send + 'static> Subscriber<T> for SubscribeOnSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.arbiter.set(subscription);
    }

    fn on_next(&mut self, value: T) {
        self.arbiter.produced(1);
        self.actual.on_next(value);
    }

    fn on_error(&mut self, error: FlowError) {
        self.actual.on_error(error);
    }

    fn on_complete(&mut self) {
        self.actual.on_complete();
    }

    fn context(&self) -> Context {
        self.actual.context()
    }
}
