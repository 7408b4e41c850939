//! 测试探针。
//!
//! # 教案式说明
//! - **意图（Why）**：算子、调度器与汇点的测试都需要一个“可手动控制需求、完整记录信号”的消费者，
//!   以便断言背压、顺序与执行线程；本模块对外公开，下游 crate 也可复用。
//! - **契约（What）**：
//!   - [`TestSubscriber`] 是共享句柄：克隆后一份交给 `subscribe`，另一份留在测试中驱动与断言；
//!   - 构造时给出的初始需求在 `on_subscribe` 中请求；之后通过 [`TestSubscriber::request`] 追加；
//!   - 记录每个元素及其投递线程名；超出已请求额度的投递属于协议违约，调试构建下直接 panic；
//!   - [`TestSubscriber::await_terminal`]/[`TestSubscriber::await_values`] 供跨线程场景等待。

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    context::Context,
    error::FlowError,
    protocol::{Subscriber, Subscription, UNBOUNDED, add_cap},
};

/// 可共享的记录型消费者。
pub struct TestSubscriber<T> {
    probe: Arc<Probe<T>>,
}

struct Probe<T> {
    initial: u64,
    context: Context,
    state: Mutex<ProbeState<T>>,
    changed: Condvar,
}

struct ProbeState<T> {
    subscription: Option<Arc<dyn Subscription>>,
    subscribed: usize,
    outstanding: u64,
    values: Vec<T>,
    threads: Vec<Option<String>>,
    terminal: Option<Result<(), FlowError>>,
    late_signals: usize,
    cancelled: bool,
}

impl<T> Clone for TestSubscriber<T> {
    fn clone(&self) -> Self {
        Self {
            probe: self.probe.clone(),
        }
    }
}

impl<T: Send + 'static> TestSubscriber<T> {
    /// 订阅时不请求任何元素。
    pub fn new() -> Self {
        Self::with_demand(0)
    }

    pub fn unbounded() -> Self {
        Self::with_demand(UNBOUNDED)
    }

    pub fn with_demand(initial: u64) -> Self {
        Self::build(initial, Context::empty())
    }

    /// 以给定上下文作为订阅期可见的上下文。
    pub fn with_context(initial: u64, context: Context) -> Self {
        Self::build(initial, context)
    }

    fn build(initial: u64, context: Context) -> Self {
        Self {
            probe: Arc::new(Probe {
                initial,
                context,
                state: Mutex::new(ProbeState {
                    subscription: None,
                    subscribed: 0,
                    outstanding: 0,
                    values: Vec::new(),
                    threads: Vec::new(),
                    terminal: None,
                    late_signals: 0,
                    cancelled: false,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// 追加需求；尚未订阅时只累加，在订阅时一并请求。
    pub fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        let subscription = {
            let mut state = self.probe.state.lock();
            state.outstanding = add_cap(state.outstanding, n);
            state.subscription.clone()
        };
        if let Some(subscription) = subscription {
            subscription.request(n);
        }
    }

    pub fn cancel(&self) {
        let subscription = {
            let mut state = self.probe.state.lock();
            state.cancelled = true;
            state.subscription.clone()
        };
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    /// 移出已记录的元素。
    pub fn take_values(&self) -> Vec<T> {
        std::mem::take(&mut self.probe.state.lock().values)
    }

    pub fn value_count(&self) -> usize {
        self.probe.state.lock().values.len()
    }

    /// 每个元素的投递线程名，与元素一一对应。
    pub fn thread_names(&self) -> Vec<Option<String>> {
        self.probe.state.lock().threads.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.probe.state.lock().subscribed > 0
    }

    pub fn subscribe_count(&self) -> usize {
        self.probe.state.lock().subscribed
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.probe.state.lock().terminal, Some(Ok(())))
    }

    pub fn is_terminated(&self) -> bool {
        self.probe.state.lock().terminal.is_some()
    }

    pub fn error(&self) -> Option<FlowError> {
        match &self.probe.state.lock().terminal {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// 终止之后仍到达的信号数量。
    pub fn late_signals(&self) -> usize {
        self.probe.state.lock().late_signals
    }

    /// 尚未被满足的需求。
    pub fn outstanding(&self) -> u64 {
        self.probe.state.lock().outstanding
    }

    /// 等待终止信号；超时返回 `false`。
    pub fn await_terminal(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.terminal.is_some())
    }

    /// 等待至少 `n` 个元素或终止信号；超时返回 `false`。
    pub fn await_values(&self, n: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| {
            state.values.len() >= n || state.terminal.is_some()
        })
    }

    fn wait_until(&self, timeout: Duration, ready: impl Fn(&ProbeState<T>) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.probe.state.lock();
        while !ready(&state) {
            if self
                .probe
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return ready(&state);
            }
        }
        true
    }
}

impl<T: Clone + Send + 'static> TestSubscriber<T> {
    pub fn values(&self) -> Vec<T> {
        self.probe.state.lock().values.clone()
    }
}

impl<T: Send + 'static> Default for TestSubscriber<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let (initial, cancelled) = {
            let mut state = self.probe.state.lock();
            state.subscribed += 1;
            if state.subscription.is_some() {
                drop(state);
                subscription.cancel();
                return;
            }
            state.subscription = Some(subscription.clone());
            state.outstanding = add_cap(state.outstanding, self.probe.initial);
            (state.outstanding, state.cancelled)
        };
        self.probe.changed.notify_all();
        if cancelled {
            subscription.cancel();
        } else if initial > 0 {
            subscription.request(initial);
        }
    }

    fn on_next(&mut self, value: T) {
        let overflow = {
            let mut state = self.probe.state.lock();
            if state.terminal.is_some() {
                state.late_signals += 1;
                return;
            }
            let overflow = state.outstanding == 0;
            if !overflow && state.outstanding != UNBOUNDED {
                state.outstanding -= 1;
            }
            state.values.push(value);
            state
                .threads
                .push(std::thread::current().name().map(str::to_owned));
            overflow
        };
        self.probe.changed.notify_all();
        if overflow && cfg!(debug_assertions) {
            panic!("TestSubscriber received `on_next` without outstanding demand");
        }
    }

    fn on_error(&mut self, error: FlowError) {
        self.finish(Err(error));
    }

    fn on_complete(&mut self) {
        self.finish(Ok(()));
    }

    fn context(&self) -> Context {
        self.probe.context.clone()
    }
}

impl<T> TestSubscriber<T> {
    fn finish(&self, result: Result<(), FlowError>) {
        {
            let mut state = self.probe.state.lock();
            if state.terminal.is_some() {
                state.late_signals += 1;
                return;
            }
            state.terminal = Some(result);
            state.subscription = None;
        }
        self.probe.changed.notify_all();
    }
}

impl<T> std::fmt::Debug for TestSubscriber<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.probe.state.lock();
        f.debug_struct("TestSubscriber")
            .field("values", &state.values.len())
            .field("outstanding", &state.outstanding)
            .field("terminal", &state.terminal)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flux::Flux;

    #[test]
    fn demand_requested_before_subscription_is_forwarded() {
        let probe = TestSubscriber::new();
        probe.request(2);
        Flux::range(1, 10).subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1, 2]);
        assert_eq!(probe.outstanding(), 0);
        assert!(!probe.is_terminated());
    }

    #[test]
    fn records_the_delivering_thread() {
        let probe = TestSubscriber::unbounded();
        Flux::just([1u8]).subscribe(probe.clone());
        assert_eq!(probe.thread_names().len(), 1);
        assert!(probe.await_terminal(Duration::from_millis(10)));
    }
}
