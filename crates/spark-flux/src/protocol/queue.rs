use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

use crate::{
    error::FlowError,
    protocol::{BoxSubscriber, DemandCounter, DrainGate, Signal, UNBOUNDED},
};

type EmitHook = Box<dyn Fn(u64) + Send + Sync>;

/// 带需求约束的串行排空队列，是所有“自带内部队列”阶段的公共底座。
///
/// # 教案式说明
/// - **意图（Why）**：`publish_on`、`buffer`、`window`、`group_by`、单播汇点等阶段都遵循同一模式：
///   上游侧把信号按序入队，下游侧按需求取出投递；把这段逻辑收敛为一个类型，
///   保证每个阶段都天然满足“串行投递、不超需求、终止一次”的契约。
/// - **契约（What）**：
///   - 入队端：[`DrainQueue::push`] 追加 `Next`，[`DrainQueue::complete`]/[`DrainQueue::error`]
///     追加终止信号，终止之后的入队被拒绝并返回 `false`；
///   - 出队端：`Next` 仅在剩余需求内出队；排在队首的终止信号无需需求即可投递；
///   - [`DrainQueue::attach`] 安装下游消费者，安装之前到达的请求只累加需求；
///   - 取消后队列被清空、消费者被释放，之后的排空为空操作。
/// - **实现（How）**：
///   - 排空权由 [`DrainGate`] 仲裁；排空者持有消费者锁进行投递，消费者在回调中重入的
///     `request` 只会累加需求并登记错过次数，不会争用消费者锁；
///   - 可选的发射钩子在每轮投递后以本轮发射数调用，供阶段据此向上游补货。
/// - **权衡（Trade-offs）**：队列本身无界，容量约束由各阶段的预取额度或汇点的溢出检查负责。
pub struct DrainQueue<T> {
    stage: &'static str,
    gate: DrainGate,
    demand: DemandCounter,
    signals: Mutex<VecDeque<Signal<T>>>,
    actual: Mutex<Option<BoxSubscriber<T>>>,
    input_closed: AtomicBool,
    cancelled: AtomicBool,
    terminated: AtomicBool,
    on_emitted: Option<EmitHook>,
}

impl<T: Send + 'static> DrainQueue<T> {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            gate: DrainGate::new(),
            demand: DemandCounter::new(),
            signals: Mutex::new(VecDeque::new()),
            actual: Mutex::new(None),
            input_closed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            on_emitted: None,
        }
    }

    /// 附带发射钩子构造。
    pub fn with_emit_hook(stage: &'static str, hook: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            on_emitted: Some(Box::new(hook)),
            ..Self::new(stage)
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    /// 安装下游消费者；调用方随后负责触发一次排空。
    pub fn attach(&self, actual: BoxSubscriber<T>) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        *self.actual.lock() = Some(actual);
    }

    /// 追加数据元素。
    pub fn push(&self, value: T) -> bool {
        if self.input_closed.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            return false;
        }
        self.signals.lock().push_back(Signal::Next(value));
        true
    }

    /// 追加完成信号。
    pub fn complete(&self) -> bool {
        self.close_with(Signal::Complete)
    }

    /// 追加错误信号。
    pub fn error(&self, error: FlowError) -> bool {
        self.close_with(Signal::Error(error))
    }

    fn close_with(&self, terminal: Signal<T>) -> bool {
        if self.input_closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if !self.cancelled.load(Ordering::Acquire) {
            self.signals.lock().push_back(terminal);
        }
        true
    }

    /// 累加下游需求，不触发排空。
    pub fn add_demand(&self, n: u64) {
        if n > 0 {
            self.demand.add(n);
        }
    }

    /// 累加下游需求并排空。
    pub fn request(&self, n: u64) {
        self.add_demand(n);
        self.drain();
    }

    /// 取消：清空队列并释放消费者；返回是否为第一次取消。
    pub fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::AcqRel);
        self.drain();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// 终止信号是否已投递给下游。
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// 入队端是否已关闭。
    pub fn is_input_closed(&self) -> bool {
        self.input_closed.load(Ordering::Acquire)
    }

    /// 尚未投递的数据元素数量。
    pub fn pending(&self) -> usize {
        let signals = self.signals.lock();
        let terminal = signals.back().is_some_and(Signal::is_terminal);
        signals.len() - usize::from(terminal)
    }

    /// 当前未满足的下游需求。
    pub fn requested(&self) -> u64 {
        self.demand.get()
    }

    /// 在当前线程排空。
    pub fn drain(&self) {
        if self.gate.enter() {
            self.drain_claimed();
        }
    }

    /// 仅获取排空权，不执行排空；成功后调用方必须调用 [`DrainQueue::drain_claimed`]。
    pub fn try_claim(&self) -> bool {
        self.gate.enter()
    }

    /// 在已获得排空权的前提下执行排空循环。
    pub fn drain_claimed(&self) {
        let mut missed = 1;
        loop {
            self.drain_once();
            missed = self.gate.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    /// 在已获得排空权的前提下丢弃积压信号并以错误终止。
    pub fn fail_claimed(&self, error: FlowError) {
        {
            let mut signals = self.signals.lock();
            signals.clear();
            signals.push_back(Signal::Error(error));
        }
        self.input_closed.store(true, Ordering::Release);
        self.drain_claimed();
    }

    fn drain_once(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            self.signals.lock().clear();
            self.actual.lock().take();
            return;
        }

        let mut guard = self.actual.lock();
        let Some(actual) = guard.as_mut() else {
            if self.terminated.load(Ordering::Acquire) {
                self.signals.lock().clear();
            }
            return;
        };

        let requested = self.demand.get();
        let mut emitted = 0u64;
        let mut finished = false;
        while !self.cancelled.load(Ordering::Acquire) {
            let next = {
                let mut signals = self.signals.lock();
                match signals.front() {
                    None => None,
                    Some(Signal::Next(_)) if emitted == requested => None,
                    Some(_) => signals.pop_front(),
                }
            };
            match next {
                None => break,
                Some(Signal::Next(value)) => {
                    actual.on_next(value);
                    emitted += 1;
                }
                Some(terminal) => {
                    self.terminated.store(true, Ordering::Release);
                    terminal.deliver(actual.as_mut());
                    finished = true;
                    break;
                }
            }
        }
        if finished {
            *guard = None;
            self.signals.lock().clear();
        }
        drop(guard);

        if emitted > 0 {
            if requested != UNBOUNDED {
                self.demand.produced(emitted);
            }
            if let Some(hook) = &self.on_emitted {
                hook(emitted);
            }
        }
    }
}

impl<T> std::fmt::Debug for DrainQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainQueue")
            .field("stage", &self.stage)
            .field("requested", &self.demand.get())
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .finish()
    }
}
