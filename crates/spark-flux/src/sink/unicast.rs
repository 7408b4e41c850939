use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::{
    error::FlowError,
    flux::Flux,
    protocol::{BoxSubscriber, DrainQueue, EmptySubscription, Publisher, Subscription},
    sink::{EmitResult, ManySink, SerializedGate},
};

type CancelHook = Box<dyn Fn(u64) + Send + Sync>;

/// 单消费者处理器：内部积压队列加一次性订阅权。
///
/// # 教案式说明
/// - **意图（Why）**：单播汇点、`window` 的子窗口、`group_by` 的分组流都是
///   “上游推入，唯一消费者按需求拉取”的形态，共用同一实现。
/// - **契约（What）**：
///   - 第二个订阅者收到 [`FlowError::TooManySubscribers`]；
///   - 消费者挂接之前推入的元素被保留，挂接后按需求投递；
///   - 消费者取消后 [`UnicastProcessor::offer`] 返回 [`EmitResult::FailZeroSubscriber`]，
///     并以取消时丢弃的积压元素数触发可选的取消钩子；
///   - 发射钩子以每轮实际投递数调用，供分组/窗口据此向上游补货。
/// - **实现（How）**：直接建立在 [`DrainQueue`] 之上；本类型只负责订阅权与容量检查。
pub(crate) struct UnicastProcessor<T> {
    state: Arc<UnicastState<T>>,
}

struct UnicastState<T> {
    name: &'static str,
    queue: DrainQueue<T>,
    capacity: Option<usize>,
    claimed: AtomicBool,
    on_cancel: Option<CancelHook>,
}

impl<T> Clone for UnicastProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Send + 'static> UnicastProcessor<T> {
    pub(crate) fn new(name: &'static str) -> Self {
        Self::build(name, DrainQueue::new(name), None, None)
    }

    pub(crate) fn bounded(name: &'static str, capacity: Option<usize>) -> Self {
        Self::build(name, DrainQueue::new(name), capacity, None)
    }

    pub(crate) fn with_hooks(
        name: &'static str,
        on_emitted: impl Fn(u64) + Send + Sync + 'static,
        on_cancel: impl Fn(u64) + Send + Sync + 'static,
    ) -> Self {
        Self::build(
            name,
            DrainQueue::with_emit_hook(name, on_emitted),
            None,
            Some(Box::new(on_cancel)),
        )
    }

    fn build(
        name: &'static str,
        queue: DrainQueue<T>,
        capacity: Option<usize>,
        on_cancel: Option<CancelHook>,
    ) -> Self {
        Self {
            state: Arc::new(UnicastState {
                name,
                queue,
                capacity,
                claimed: AtomicBool::new(false),
                on_cancel,
            }),
        }
    }

    /// 推入一个元素并尝试投递。
    pub(crate) fn offer(&self, value: T) -> EmitResult {
        let queue = &self.state.queue;
        if queue.is_input_closed() {
            return EmitResult::FailTerminated;
        }
        if queue.is_cancelled() {
            return EmitResult::FailZeroSubscriber;
        }
        if let Some(capacity) = self.state.capacity {
            if queue.pending() >= capacity {
                return EmitResult::FailOverflow;
            }
        }
        if !queue.push(value) {
            return if queue.is_cancelled() {
                EmitResult::FailZeroSubscriber
            } else {
                EmitResult::FailTerminated
            };
        }
        queue.drain();
        EmitResult::Ok
    }

    /// 以完成（`None`）或错误结束；积压元素先于终止信号投递。
    pub(crate) fn finish(&self, error: Option<FlowError>) -> EmitResult {
        let queue = &self.state.queue;
        let accepted = match error {
            Some(error) => queue.error(error),
            None => queue.complete(),
        };
        if !accepted {
            return EmitResult::FailTerminated;
        }
        queue.drain();
        EmitResult::Ok
    }

    fn is_finished(&self) -> bool {
        self.state.queue.is_input_closed()
    }

    fn has_subscriber(&self) -> bool {
        let state = &self.state;
        state.claimed.load(Ordering::Acquire)
            && !state.queue.is_cancelled()
            && !state.queue.is_terminated()
    }
}

impl<T: Send + 'static> Publisher<T> for UnicastProcessor<T> {
    fn subscribe(&self, mut actual: BoxSubscriber<T>) {
        let state = &self.state;
        if state.claimed.swap(true, Ordering::AcqRel) {
            tracing::debug!(sink = state.name, "rejecting second subscriber");
            actual.on_subscribe(EmptySubscription::shared());
            actual.on_error(FlowError::TooManySubscribers {
                sink: state.name.into(),
            });
            return;
        }
        actual.on_subscribe(Arc::new(UnicastSubscription {
            state: state.clone(),
        }));
        state.queue.attach(actual);
        state.queue.drain();
    }
}

struct UnicastSubscription<T> {
    state: Arc<UnicastState<T>>,
}

impl<T: Send + 'static> Subscription for UnicastSubscription<T> {
    fn request(&self, n: u64) {
        self.state.queue.request(n);
    }

    fn cancel(&self) {
        let discarded = self.state.queue.pending() as u64;
        if self.state.queue.cancel() {
            if let Some(hook) = &self.state.on_cancel {
                hook(discarded);
            }
        }
    }
}

/// 单消费者汇点的所有者句柄。
///
/// 句柄被丢弃且尚未发送终止信号时，消费者收到完成信号。
pub struct UnicastSink<T: Send + 'static> {
    processor: UnicastProcessor<T>,
    gate: SerializedGate,
}

impl<T: Send + 'static> UnicastSink<T> {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self {
            processor: UnicastProcessor::bounded("unicast", capacity),
            gate: SerializedGate::default(),
        }
    }

    /// 已接受终止信号。
    pub fn is_terminated(&self) -> bool {
        self.processor.is_finished()
    }

    /// 唯一消费者已取消。
    pub fn is_cancelled(&self) -> bool {
        self.processor.state.queue.is_cancelled()
    }
}

impl<T: Send + 'static> ManySink<T> for UnicastSink<T> {
    fn emit_next(&self, value: T) -> EmitResult {
        let Some(_guard) = self.gate.try_enter() else {
            return EmitResult::FailNonSerialized;
        };
        self.processor.offer(value)
    }

    fn emit_complete(&self) -> EmitResult {
        let Some(_guard) = self.gate.try_enter() else {
            return EmitResult::FailNonSerialized;
        };
        self.processor.finish(None)
    }

    fn emit_error(&self, error: FlowError) -> EmitResult {
        let Some(_guard) = self.gate.try_enter() else {
            return EmitResult::FailNonSerialized;
        };
        self.processor.finish(Some(error))
    }

    fn subscriber_count(&self) -> usize {
        usize::from(self.processor.has_subscriber())
    }

    fn as_producer(&self) -> Flux<T> {
        Flux::from_arc(Arc::new(self.processor.clone()))
    }
}

impl<T: Send + 'static> Drop for UnicastSink<T> {
    fn drop(&mut self) {
        if !self.processor.is_finished() {
            let _ = self.processor.finish(None);
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for UnicastSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnicastSink")
            .field("queue", &self.processor.state.queue)
            .field("capacity", &self.processor.state.capacity)
            .finish()
    }
}
