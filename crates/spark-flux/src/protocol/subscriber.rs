use std::sync::Arc;

use crate::{context::Context, error::FlowError};

/// 订阅链路：消费者通过它向生产者授予需求或取消订阅。
///
/// # 契约说明（What）
/// - `request(n)`：累加需求额度，`n == 0` 视为空操作；额度累计到 [`UNBOUNDED`](super::UNBOUNDED) 后即为无界；
/// - `cancel()`：幂等且单向；生产者观察到后停止后续发射，已经派发到消费者回调中的那一次投递正常完成；
/// - 订阅仅用于回调 `request`/`cancel`，从不用于发射：发射始终由生产者调用消费者回调完成。
///
/// # 线程安全
/// - 实现必须允许从任意线程并发调用，且调用可能在消费者回调内部重入发生。
pub trait Subscription: Send + Sync + 'static {
    fn request(&self, n: u64);
    fn cancel(&self);
}

/// 消费者回调集合。
///
/// # 教案式说明
/// - **意图（Why）**：每个阶段都以 `Box<dyn Subscriber<T>>` 的形式被其上游独占持有，
///   因此回调使用 `&mut self`，阶段内部状态无需额外加锁；
/// - **契约（What）**：
///   - 调用顺序：`on_subscribe` 恰好一次 → `on_next` 零到多次 → `on_error`/`on_complete` 至多一次；
///   - 同一消费者上的回调永不并发，但可能先后发生在不同线程上；
///   - [`Subscriber::context`] 在订阅期（自下游向上游遍历）被读取，中间阶段必须转发下游的上下文。
pub trait Subscriber<T>: Send + 'static {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>);
    fn on_next(&mut self, value: T);
    fn on_error(&mut self, error: FlowError);
    fn on_complete(&mut self);

    /// 订阅期可见的上下文，默认为空。
    fn context(&self) -> Context {
        Context::empty()
    }
}

/// 被上游独占持有的消费者。
pub type BoxSubscriber<T> = Box<dyn Subscriber<T>>;

impl<T: 'static> Subscriber<T> for Box<dyn Subscriber<T>> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        (**self).on_subscribe(subscription)
    }

    fn on_next(&mut self, value: T) {
        (**self).on_next(value)
    }

    fn on_error(&mut self, error: FlowError) {
        (**self).on_error(error)
    }

    fn on_complete(&mut self) {
        (**self).on_complete()
    }

    fn context(&self) -> Context {
        (**self).context()
    }
}

/// 生产者：对每次 `subscribe` 建立一条独立的订阅链路。
///
/// # 契约说明（What）
/// - 实现必须先调用 `subscriber.on_subscribe`，之后才可投递其他信号；
/// - 冷源对每个订阅者独立地从头生产；热源（汇点）的生产与订阅者是否存在无关。
pub trait Publisher<T>: Send + Sync + 'static {
    fn subscribe(&self, subscriber: BoxSubscriber<T>);
}

/// 不承载任何需求语义的占位订阅，用于立即终止或永不发射的源。
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptySubscription;

impl EmptySubscription {
    pub fn shared() -> Arc<dyn Subscription> {
        Arc::new(EmptySubscription)
    }
}

impl Subscription for EmptySubscription {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}
