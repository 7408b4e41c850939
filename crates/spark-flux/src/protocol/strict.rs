use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::{
    context::Context,
    error::FlowError,
    hooks,
    protocol::{BoxSubscriber, DemandCounter, Subscriber, Subscription, SubscriptionArbiter},
};

/// 终止标记，供 [`Disposable`](crate::flux::Disposable) 查询订阅是否已经结束。
#[derive(Clone, Debug, Default)]
pub(crate) struct TerminalFlag(Arc<AtomicBool>);

impl TerminalFlag {
    pub(crate) fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// 最外层的协议守卫，包裹每一个终端订阅者。
///
/// # 教案式说明
/// - **意图（Why）**：内部阶段为了性能信任彼此遵守契约，但用户实现的 [`Publisher`](super::Publisher)
///   或自定义阶段可能违约；在订阅链最外层统一校验，把违约转化为可观测的事件。
/// - **契约（What）**：
///   - 终止之后到达的 `Next` 被丢弃并计入 [`hooks`] 的“丢弃元素”计数，之后到达的错误走“丢弃错误”钩子；
///   - 超出累计请求额度的 `Next` 属于协议违约：先上报 `ProtocolViolation` 钩子，
///     调试构建随即 panic 以便尽早暴露缺陷，发布构建则取消上游并向下游投递
///     [`FlowError::ProtocolViolation`]；
///   - 重复的 `on_subscribe` 会取消多余的订阅。
/// - **实现（How）**：下游看到的订阅被替换为计数包装，`request` 先累加额度再转发，
///   因此任何“先请求后投递”的合法交错都不会被误判。
pub struct StrictSubscriber<T> {
    actual: BoxSubscriber<T>,
    outstanding: Arc<DemandCounter>,
    upstream: Option<Arc<dyn Subscription>>,
    handle: Option<(Arc<SubscriptionArbiter>, TerminalFlag)>,
    done: bool,
}

impl<T: Send + 'static> StrictSubscriber<T> {
    pub fn new(actual: BoxSubscriber<T>) -> Self {
        Self {
            actual,
            outstanding: Arc::new(DemandCounter::new()),
            upstream: None,
            handle: None,
            done: false,
        }
    }

    pub(crate) fn with_handle(
        actual: BoxSubscriber<T>,
        arbiter: Arc<SubscriptionArbiter>,
        terminal: TerminalFlag,
    ) -> Self {
        Self {
            handle: Some((arbiter, terminal)),
            ..Self::new(actual)
        }
    }

    fn mark_done(&mut self) {
        self.done = true;
        if let Some((_, terminal)) = &self.handle {
            terminal.set();
        }
    }
}

struct StrictSubscription {
    outstanding: Arc<DemandCounter>,
    upstream: Arc<dyn Subscription>,
}

impl Subscription for StrictSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.outstanding.add(n);
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}

impl<T: Send + 'static> Subscriber<T> for StrictSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        if self.upstream.is_some() {
            subscription.cancel();
            hooks::on_protocol_violation(FlowError::protocol(
                "subscribe",
                "on_subscribe delivered more than once",
            ));
            return;
        }
        self.upstream = Some(subscription.clone());
        let guarded: Arc<dyn Subscription> = Arc::new(StrictSubscription {
            outstanding: self.outstanding.clone(),
            upstream: subscription,
        });
        self.actual.on_subscribe(guarded.clone());
        if let Some((arbiter, _)) = &self.handle {
            arbiter.set(guarded);
        }
    }

    fn on_next(&mut self, value: T) {
        if self.done {
            hooks::on_next_dropped("subscribe");
            return;
        }
        if !self.outstanding.try_take_one() {
            let violation =
                FlowError::protocol("subscribe", "on_next delivered without outstanding demand");
            hooks::on_protocol_violation(violation.clone());
            if cfg!(debug_assertions) {
                panic!("{violation}");
            }
            if let Some(upstream) = &self.upstream {
                upstream.cancel();
            }
            self.mark_done();
            self.actual.on_error(violation);
            return;
        }
        self.actual.on_next(value);
    }

    fn on_error(&mut self, error: FlowError) {
        if self.done {
            hooks::on_error_dropped("subscribe", error);
            return;
        }
        self.mark_done();
        self.actual.on_error(error);
    }

    fn on_complete(&mut self) {
        if self.done {
            tracing::debug!(stage = "subscribe", "completion after terminal signal ignored");
            return;
        }
        self.mark_done();
        self.actual.on_complete();
    }

    fn context(&self) -> Context {
        self.actual.context()
    }
}
