//! 发射期调度切换点。
//!
//! # 教案式说明
//! - **意图（Why）**：只有在信号投递处插入显式交接队列，下游回调才会真正迁移到调度器线程；
//!   `limit_rate` 复用同一机制，只是把调度器换成 [`Immediate`](crate::scheduler::Immediate)。
//! - **契约（What）**：
//!   - 上游线程把 `Next`/`Complete`/`Error` 按序入队，调度器工作线程上的排空循环按下游需求出队投递；
//!   - 订阅时向上游预取 `prefetch.size()` 个元素，每投递满 `prefetch.limit()` 个再补货；
//!   - 每次提交排空任务时抓取调用线程的线程局部快照，并在工作线程投递前恢复、投递后拆除；
//!   - 调度器拒绝排空任务（饱和或已释放）时取消上游，并在当前线程以对应错误终止下游。
//! - **实现（How）**：基于 [`DrainQueue`]；只有赢得排空权的线程负责提交任务，
//!   任务运行期间到达的新信号由同一次排空循环吸收，不会重复提交。

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    context::{Context, propagation::Snapshot},
    error::FlowError,
    flux::{Flux, prefetch::Prefetch},
    hooks,
    protocol::{BoxSubscriber, DrainQueue, Publisher, Subscriber, Subscription},
    scheduler::{SchedulerRef, Task},
};

pub(crate) struct PublishOnPublisher<T> {
    source: Flux<T>,
    scheduler: SchedulerRef,
    prefetch: Prefetch,
    stage: &'static str,
}

impl<T> PublishOnPublisher<T> {
    pub(crate) fn new(
        source: Flux<T>,
        scheduler: SchedulerRef,
        prefetch: Prefetch,
        stage: &'static str,
    ) -> Self {
        Self {
            source,
            scheduler,
            prefetch,
            stage,
        }
    }
}

impl<T: Send + 'static> Publisher<T> for PublishOnPublisher<T> {
    fn subscribe(&self, actual: BoxSubscriber<T>) {
        let context = actual.context();
        self.source.subscribe_inner(Box::new(PublishOnSubscriber {
            actual: Some(actual),
            context,
            scheduler: self.scheduler.clone(),
            prefetch: self.prefetch,
            stage: self.stage,
            shared: None,
        }));
    }
}

struct PublishOnShared<T> {
    queue: DrainQueue<T>,
    scheduler: SchedulerRef,
    upstream: Arc<dyn Subscription>,
}

impl<T: Send + 'static> PublishOnShared<T> {
    fn schedule_drain(self: &Arc<Self>) {
        if !self.queue.try_claim() {
            return;
        }
        let snapshot = Snapshot::capture();
        let shared = self.clone();
        let task: Task = Box::new(move || {
            let _scope = snapshot.restore();
            shared.queue.drain_claimed();
        });
        if let Err(err) = self.scheduler.schedule(task, None) {
            tracing::warn!(
                stage = self.queue.stage(),
                scheduler = self.scheduler.name(),
                error = %err,
                "drain task rejected"
            );
            self.upstream.cancel();
            self.queue.fail_claimed(err.into());
        }
    }
}

struct PublishOnSubscription<T> {
    shared: Arc<PublishOnShared<T>>,
}

impl<T: Send + 'static> Subscription for PublishOnSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.shared.queue.add_demand(n);
        self.shared.schedule_drain();
    }

    fn cancel(&self) {
        self.shared.upstream.cancel();
        self.shared.queue.cancel();
    }
}

struct PublishOnSubscriber<T> {
    actual: Option<BoxSubscriber<T>>,
    context: Context,
    scheduler: SchedulerRef,
    prefetch: Prefetch,
    stage: &'static str,
    shared: Option<Arc<PublishOnShared<T>>>,
}

impl<T: Send + 'static> Subscriber<T> for PublishOnSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let Some(mut actual) = self.actual.take() else {
            subscription.cancel();
            return;
        };
        let replenisher = Mutex::new(self.prefetch.replenisher());
        let upstream = subscription.clone();
        let queue = DrainQueue::with_emit_hook(self.stage, move |emitted| {
            let amount = replenisher.lock().consumed(emitted);
            if let Some(amount) = amount {
                upstream.request(amount);
            }
        });
        let shared = Arc::new(PublishOnShared {
            queue,
            scheduler: self.scheduler.clone(),
            upstream: subscription.clone(),
        });
        self.shared = Some(shared.clone());
        actual.on_subscribe(Arc::new(PublishOnSubscription {
            shared: shared.clone(),
        }));
        shared.queue.attach(actual);
        if shared.queue.requested() > 0 {
            shared.schedule_drain();
        }
        subscription.request(self.prefetch.initial_request());
    }

    fn on_next(&mut self, value: T) {
        match &self.shared {
            Some(shared) => {
                if shared.queue.push(value) {
                    shared.schedule_drain();
                }
            }
            None => hooks::on_next_dropped(self.stage),
        }
    }

    fn on_error(&mut self, error: FlowError) {
        match &self.shared {
            Some(shared) if shared.queue.error(error.clone()) => shared.schedule_drain(),
            _ => hooks::on_error_dropped(self.stage, error),
        }
    }

    fn on_complete(&mut self) {
        if let Some(shared) = &self.shared {
            if shared.queue.complete() {
                shared.schedule_drain();
            }
        }
    }

    fn context(&self) -> Context {
        self.context.clone()
    }
}
