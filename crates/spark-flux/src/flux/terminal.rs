//! 终端订阅：回调式消费者、可释放句柄与阻塞桥接。
//!
//! # 教案式说明
//! - **意图（Why）**：非响应式调用方需要两种收尾方式：注册回调后立即返回一个可释放句柄，
//!   或在当前线程阻塞直到终止信号到达；只有阻塞桥接允许阻塞调用线程，流水线阶段本身从不阻塞。
//! - **契约（What）**：
//!   - 所有终端订阅都经过 [`StrictSubscriber`](crate::protocol::StrictSubscriber) 守卫；
//!   - 回调式消费者请求无界需求；未提供错误回调时错误交给 [`hooks`] 的“未处理错误”通道，
//!     只终止该订阅，不影响进程；
//!   - 阻塞桥接在超时后取消订阅并返回 [`FlowError::Timeout`]。

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    context::Context,
    error::FlowError,
    hooks,
    protocol::{Subscriber, Subscription, SubscriptionArbiter, TerminalFlag, UNBOUNDED},
};

/// 终端订阅的句柄。
///
/// - [`Disposable::dispose`] 取消整条订阅链，可重复调用；
/// - 句柄同时实现 [`Subscription`]，订阅者自行管理需求时可通过它追加请求。
#[derive(Clone, Debug)]
pub struct Disposable {
    arbiter: Arc<SubscriptionArbiter>,
    terminal: TerminalFlag,
}

impl Disposable {
    pub(crate) fn new(arbiter: Arc<SubscriptionArbiter>, terminal: TerminalFlag) -> Self {
        Self { arbiter, terminal }
    }

    pub fn dispose(&self) {
        self.arbiter.cancel();
    }

    /// 已被释放或已收到终止信号。
    pub fn is_disposed(&self) -> bool {
        self.arbiter.is_cancelled() || self.terminal.is_set()
    }
}

impl Subscription for Disposable {
    fn request(&self, n: u64) {
        self.arbiter.request(n);
    }

    fn cancel(&self) {
        self.dispose();
    }
}

type NextFn<T> = Box<dyn FnMut(T) + Send>;
type ErrorFn = Box<dyn FnMut(FlowError) + Send>;
type CompleteFn = Box<dyn FnMut() + Send>;

/// 以闭包组装的消费者，订阅即请求无界需求。
pub(crate) struct LambdaSubscriber<T> {
    on_next: NextFn<T>,
    on_error: Option<ErrorFn>,
    on_complete: Option<CompleteFn>,
}

impl<T> LambdaSubscriber<T> {
    pub(crate) fn new(
        on_next: impl FnMut(T) + Send + 'static,
        on_error: Option<ErrorFn>,
        on_complete: Option<CompleteFn>,
    ) -> Self {
        Self {
            on_next: Box::new(on_next),
            on_error,
            on_complete,
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for LambdaSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        subscription.request(UNBOUNDED);
    }

    fn on_next(&mut self, value: T) {
        (self.on_next)(value);
    }

    fn on_error(&mut self, error: FlowError) {
        match self.on_error.as_mut() {
            Some(handler) => handler(error),
            None => hooks::on_unhandled_error(error),
        }
    }

    fn on_complete(&mut self) {
        if let Some(handler) = self.on_complete.as_mut() {
            handler();
        }
    }
}

/// 阻塞桥接保留哪些元素。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockMode {
    All,
    First,
    Last,
}

struct BlockState<T> {
    values: Vec<T>,
    terminal: Option<Result<(), FlowError>>,
}

pub(crate) struct BlockingLatch<T> {
    state: Mutex<BlockState<T>>,
    ready: Condvar,
}

impl<T> BlockingLatch<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BlockState {
                values: Vec::new(),
                terminal: None,
            }),
            ready: Condvar::new(),
        })
    }

    fn finish(&self, result: Result<(), FlowError>) {
        let mut state = self.state.lock();
        if state.terminal.is_none() {
            state.terminal = Some(result);
            self.ready.notify_all();
        }
    }

    /// 等待终止信号；超时返回 `Err(Timeout)`，由调用方负责取消订阅。
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<Vec<T>, FlowError> {
        let deadline = timeout.map(|after| (Instant::now() + after, after));
        let mut state = self.state.lock();
        while state.terminal.is_none() {
            match deadline {
                Some((at, after)) => {
                    if self.ready.wait_until(&mut state, at).timed_out()
                        && state.terminal.is_none()
                    {
                        return Err(FlowError::Timeout { after });
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
        match state.terminal.take() {
            Some(Err(error)) => Err(error),
            _ => Ok(std::mem::take(&mut state.values)),
        }
    }
}

pub(crate) struct BlockingSubscriber<T> {
    latch: Arc<BlockingLatch<T>>,
    mode: BlockMode,
    upstream: Option<Arc<dyn Subscription>>,
    context: Context,
}

impl<T> BlockingSubscriber<T> {
    pub(crate) fn new(latch: Arc<BlockingLatch<T>>, mode: BlockMode) -> Self {
        Self {
            latch,
            mode,
            upstream: None,
            context: Context::empty(),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for BlockingSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.upstream = Some(subscription.clone());
        let demand = match self.mode {
            BlockMode::First => 1,
            BlockMode::All | BlockMode::Last => UNBOUNDED,
        };
        subscription.request(demand);
    }

    fn on_next(&mut self, value: T) {
        match self.mode {
            BlockMode::All => self.latch.state.lock().values.push(value),
            BlockMode::Last => {
                let mut state = self.latch.state.lock();
                state.values.clear();
                state.values.push(value);
            }
            BlockMode::First => {
                self.latch.state.lock().values.push(value);
                if let Some(upstream) = self.upstream.take() {
                    upstream.cancel();
                }
                self.latch.finish(Ok(()));
            }
        }
    }

    fn on_error(&mut self, error: FlowError) {
        self.latch.finish(Err(error));
    }

    fn on_complete(&mut self) {
        self.latch.finish(Ok(()));
    }

    fn context(&self) -> Context {
        self.context.clone()
    }
}
