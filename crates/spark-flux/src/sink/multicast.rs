use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::FlowError,
    flux::Flux,
    protocol::{BoxSubscriber, Publisher},
    sink::{
        Consumer, ConsumerSubscription, EmitResult, Hub, ManySink, Registry, SerializedGate,
        Terminal,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Delivery {
    BestEffort,
    AllOrNothing,
}

/// 直接投递的多播汇点。
///
/// # 教案式说明
/// - **意图（Why）**：不设缓冲的广播点，元素在发射线程上直接交给当时可接收的消费者。
/// - **契约（What）**：
///   - 尽力而为模式：元素只投递给需求非零的消费者，其余消费者永久错过该元素；
///     没有消费者时返回 [`EmitResult::Ok`] 并丢弃元素；慢消费者从不限制生产者或其他消费者；
///   - 全有或全无模式：没有消费者时返回 [`EmitResult::FailZeroSubscriber`]；
///     任一消费者需求为零时返回 [`EmitResult::FailOverflow`] 且不投递给任何人；
///     [`MulticastSink::emit_next_blocking`] 等待所有消费者都有需求后再投递；
///   - 终止之后挂接的消费者立即收到该终止信号。
/// - **实现（How）**：全有或全无的“检查后投递”是安全的：需求只会被串行化的发射路径扣减，
///   并发的 `request` 只会让检查结果更宽松。
pub struct MulticastSink<T: Clone + Send + 'static> {
    hub: Arc<MulticastHub<T>>,
    gate: SerializedGate,
}

struct MulticastHub<T> {
    delivery: Delivery,
    consumers: Registry<T>,
    terminal: Mutex<Option<Terminal>>,
    demand_epoch: Mutex<u64>,
    demand_changed: Condvar,
}

impl<T: Clone + Send + 'static> MulticastSink<T> {
    pub(crate) fn best_effort() -> Self {
        Self::with_delivery(Delivery::BestEffort)
    }

    pub(crate) fn all_or_nothing() -> Self {
        Self::with_delivery(Delivery::AllOrNothing)
    }

    fn with_delivery(delivery: Delivery) -> Self {
        Self {
            hub: Arc::new(MulticastHub {
                delivery,
                consumers: Registry::new(),
                terminal: Mutex::new(None),
                demand_epoch: Mutex::new(0),
                demand_changed: Condvar::new(),
            }),
            gate: SerializedGate::default(),
        }
    }

    /// 阻塞发射：需求不足或并发冲突时等待并重试，直到成功、遇到其他失败或超时。
    ///
    /// 超时返回最后一次失败结果。
    pub fn emit_next_blocking(&self, value: T, timeout: Duration) -> EmitResult {
        let deadline = Instant::now() + timeout;
        loop {
            let epoch = *self.hub.demand_epoch.lock();
            let result = self.emit_next(value.clone());
            match result {
                EmitResult::FailNonSerialized => {
                    if Instant::now() >= deadline {
                        return result;
                    }
                    std::thread::yield_now();
                }
                EmitResult::FailOverflow => {
                    let mut current = self.hub.demand_epoch.lock();
                    while *current == epoch {
                        if self
                            .hub
                            .demand_changed
                            .wait_until(&mut current, deadline)
                            .timed_out()
                        {
                            return result;
                        }
                    }
                }
                other => return other,
            }
        }
    }
}

impl<T: Clone + Send + 'static> MulticastHub<T> {
    fn emit(&self, value: T) -> EmitResult {
        if self.terminal.lock().is_some() {
            return EmitResult::FailTerminated;
        }
        let consumers = self.consumers.snapshot();
        match self.delivery {
            Delivery::BestEffort => {
                for consumer in consumers.iter().filter(|c| c.is_active()) {
                    if consumer.demand.try_take_one() {
                        consumer.next(value.clone());
                    }
                }
                EmitResult::Ok
            }
            Delivery::AllOrNothing => {
                let active: Vec<_> = consumers.iter().filter(|c| c.is_active()).collect();
                if active.is_empty() {
                    return EmitResult::FailZeroSubscriber;
                }
                if active.iter().any(|consumer| consumer.demand.get() == 0) {
                    return EmitResult::FailOverflow;
                }
                for consumer in active {
                    consumer.demand.try_take_one();
                    consumer.next(value.clone());
                }
                EmitResult::Ok
            }
        }
    }

    fn terminate(&self, terminal: Terminal) -> EmitResult {
        {
            let mut slot = self.terminal.lock();
            if slot.is_some() {
                return EmitResult::FailTerminated;
            }
            *slot = Some(terminal.clone());
        }
        for consumer in self.consumers.take_all().iter() {
            consumer.terminate(&terminal);
        }
        self.bump_epoch();
        EmitResult::Ok
    }

    fn bump_epoch(&self) {
        if self.delivery == Delivery::AllOrNothing {
            *self.demand_epoch.lock() += 1;
            self.demand_changed.notify_all();
        }
    }
}

impl<T: Clone + Send + 'static> Hub<T> for MulticastHub<T> {
    fn requested(&self, _consumer: &Arc<Consumer<T>>) {
        self.bump_epoch();
    }

    fn detached(&self, consumer: &Arc<Consumer<T>>) {
        self.consumers.remove(consumer);
        tracing::debug!(sink = "multicast", "consumer detached");
        self.bump_epoch();
    }
}

struct MulticastProducer<T> {
    hub: Arc<MulticastHub<T>>,
}

impl<T: Clone + Send + 'static> Publisher<T> for MulticastProducer<T> {
    fn subscribe(&self, mut actual: BoxSubscriber<T>) {
        let consumer = Consumer::new();
        actual.on_subscribe(ConsumerSubscription::shared(&consumer, &self.hub));
        if !self.hub.consumers.admit(&consumer, actual) {
            return;
        }
        tracing::debug!(
            sink = "multicast",
            subscribers = self.hub.consumers.active_count(),
            "consumer attached"
        );
        let terminal = self.hub.terminal.lock().clone();
        if let Some(terminal) = terminal {
            self.hub.consumers.remove(&consumer);
            consumer.terminate(&terminal);
        }
        self.hub.bump_epoch();
    }
}

impl<T: Clone + Send + 'static> ManySink<T> for MulticastSink<T> {
    fn emit_next(&self, value: T) -> EmitResult {
        let Some(_guard) = self.gate.try_enter() else {
            return EmitResult::FailNonSerialized;
        };
        self.hub.emit(value)
    }

    fn emit_complete(&self) -> EmitResult {
        let Some(_guard) = self.gate.try_enter() else {
            return EmitResult::FailNonSerialized;
        };
        self.hub.terminate(Terminal::Complete)
    }

    fn emit_error(&self, error: FlowError) -> EmitResult {
        let Some(_guard) = self.gate.try_enter() else {
            return EmitResult::FailNonSerialized;
        };
        self.hub.terminate(Terminal::Error(error))
    }

    fn subscriber_count(&self) -> usize {
        self.hub.consumers.active_count()
    }

    fn as_producer(&self) -> Flux<T> {
        Flux::from_publisher(MulticastProducer {
            hub: self.hub.clone(),
        })
    }
}

impl<T: Clone + Send + 'static> Drop for MulticastSink<T> {
    fn drop(&mut self) {
        let _ = self.hub.terminate(Terminal::Complete);
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for MulticastSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastSink")
            .field("delivery", &self.hub.delivery)
            .field("subscribers", &self.hub.consumers.active_count())
            .field("terminated", &self.hub.terminal.lock().is_some())
            .finish()
    }
}
