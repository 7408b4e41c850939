use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::{Subscription, UNBOUNDED, add_cap};

/// 可替换上游的订阅仲裁器。
///
/// # 教案式说明
/// - **意图（Why）**：重试、错误回退、空流切换与订阅切线程都会在同一个下游订阅之下
///   先后挂接多个上游；下游的累计需求必须跨越这些切换被完整继承，不重复也不丢失。
/// - **契约（What）**：
///   - [`SubscriptionArbiter::request`] 累加未满足需求并转发给当前上游（若已挂接）；
///   - [`SubscriptionArbiter::produced`] 在每次向下游投递后扣减未满足需求；
///   - [`SubscriptionArbiter::set`] 挂接新上游，并把当时未满足的需求一次性补请求给它；
///     若仲裁器已取消，新上游会被立即取消；
///   - [`SubscriptionArbiter::cancel`] 幂等：只有第一次调用会取消当前上游。
/// - **实现（How）**：状态更新在锁内完成，对上游的 `request`/`cancel` 调用在锁外执行，
///   从而允许上游在这些调用中同步回调下游而不发生重入死锁。
///   `request` 与 `set` 并发时，需求要么被旧上游看到并随后计入补请求，要么直接转发给新上游，
///   不会被同一上游重复计数。
#[derive(Default)]
pub struct SubscriptionArbiter {
    state: Mutex<ArbiterState>,
}

#[derive(Default)]
struct ArbiterState {
    current: Option<Arc<dyn Subscription>>,
    requested: u64,
    cancelled: bool,
}

impl SubscriptionArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 挂接新上游。
    pub fn set(&self, upstream: Arc<dyn Subscription>) {
        let outstanding = {
            let mut state = self.state.lock();
            if state.cancelled {
                None
            } else {
                state.current = Some(upstream.clone());
                Some(state.requested)
            }
        };
        match outstanding {
            None => upstream.cancel(),
            Some(0) => {}
            Some(n) => upstream.request(n),
        }
    }

    /// 尚未挂接上游时把 `n` 计入未满足需求并返回 `true`，由之后的 [`SubscriptionArbiter::set`] 补请求；
    /// 已挂接上游时不做任何修改并返回 `false`，调用方自行决定在何处转发。
    ///
    /// 判断与累加在同一次加锁内完成，不会与 `set` 交错出重复或丢失的需求。
    pub fn accumulate_if_detached(&self, n: u64) -> bool {
        let mut state = self.state.lock();
        if state.cancelled {
            return true;
        }
        if state.current.is_some() {
            return false;
        }
        state.requested = add_cap(state.requested, n);
        true
    }

    /// 记录一次向下游的投递。
    pub fn produced(&self, n: u64) {
        let mut state = self.state.lock();
        if state.requested != UNBOUNDED {
            state.requested = state.requested.saturating_sub(n);
        }
    }

    /// 当前未满足的需求。
    pub fn requested(&self) -> u64 {
        self.state.lock().requested
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }
}

impl std::fmt::Debug for SubscriptionArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SubscriptionArbiter")
            .field("requested", &state.requested)
            .field("has_upstream", &state.current.is_some())
            .field("cancelled", &state.cancelled)
            .finish()
    }
}

impl Subscription for SubscriptionArbiter {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        let current = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.requested = add_cap(state.requested, n);
            state.current.clone()
        };
        if let Some(upstream) = current {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        let current = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.current.take()
        };
        if let Some(upstream) = current {
            upstream.cancel();
        }
    }
}
