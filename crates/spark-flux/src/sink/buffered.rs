use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    error::FlowError,
    flux::Flux,
    protocol::{BoxSubscriber, DrainGate, Publisher},
    sink::{
        Consumer, ConsumerSubscription, EmitResult, Hub, ManySink, Registry, SerializedGate,
        Terminal,
    },
};

/// 带汇点级背压缓冲的多播汇点。
///
/// # 教案式说明
/// - **意图（Why）**：所有消费者步调一致地看到同一序列，最慢的消费者决定放行速度，
///   生产侧的超前量由汇点级队列吸收。
/// - **契约（What）**：
///   - 每轮排空放行的元素数等于当前所有消费者未满足需求的最小值；
///   - 有界队列满时 [`EmitResult::FailOverflow`]，无界队列永不溢出；
///   - 没有消费者时元素留在队列中，由第一个挂接的消费者接收（预热）；
///   - 终止信号在队列排空后投递；终止并排空之后挂接的消费者立即收到终止信号。
/// - **实现（How）**：排空由 [`DrainGate`] 串行化，发射、请求、取消都只触发一次排空尝试；
///   取消的消费者立即离开最小需求的计算，不会拖住其余消费者。
pub struct BufferedSink<T: Clone + Send + 'static> {
    hub: Arc<BufferedHub<T>>,
    gate: SerializedGate,
}

struct BufferedHub<T> {
    capacity: Option<usize>,
    consumers: Registry<T>,
    queue: Mutex<VecDeque<T>>,
    terminal: Mutex<Option<Terminal>>,
    done: AtomicBool,
    drain_gate: DrainGate,
}

impl<T: Clone + Send + 'static> BufferedSink<T> {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self {
            hub: Arc::new(BufferedHub {
                capacity,
                consumers: Registry::new(),
                queue: Mutex::new(VecDeque::new()),
                terminal: Mutex::new(None),
                done: AtomicBool::new(false),
                drain_gate: DrainGate::new(),
            }),
            gate: SerializedGate::default(),
        }
    }

    /// 队列中尚未放行的元素数量。
    pub fn pending(&self) -> usize {
        self.hub.queue.lock().len()
    }
}

impl<T: Clone + Send + 'static> BufferedHub<T> {
    fn offer(&self, value: T) -> EmitResult {
        if self.terminal.lock().is_some() {
            return EmitResult::FailTerminated;
        }
        {
            let mut queue = self.queue.lock();
            if self.capacity.is_some_and(|capacity| queue.len() >= capacity) {
                return EmitResult::FailOverflow;
            }
            queue.push_back(value);
        }
        self.drain();
        EmitResult::Ok
    }

    fn terminate(&self, terminal: Terminal) -> EmitResult {
        {
            let mut slot = self.terminal.lock();
            if slot.is_some() {
                return EmitResult::FailTerminated;
            }
            *slot = Some(terminal);
        }
        self.drain();
        EmitResult::Ok
    }

    fn drain(&self) {
        if !self.drain_gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            self.drain_once();
            missed = self.drain_gate.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    fn drain_once(&self) {
        loop {
            let consumers = self.consumers.snapshot();
            let active: Vec<_> = consumers.iter().filter(|c| c.is_active()).collect();
            if active.is_empty() {
                return;
            }
            if self.queue.lock().is_empty() {
                let terminal = self.terminal.lock().clone();
                if let Some(terminal) = terminal {
                    self.done.store(true, Ordering::Release);
                    for consumer in self.consumers.take_all().iter() {
                        consumer.terminate(&terminal);
                    }
                }
                return;
            }
            let window = active
                .iter()
                .map(|consumer| consumer.demand.get())
                .min()
                .unwrap_or(0);
            if window == 0 {
                return;
            }
            let batch: Vec<T> = {
                let mut queue = self.queue.lock();
                let take = usize::try_from(window).unwrap_or(usize::MAX).min(queue.len());
                queue.drain(..take).collect()
            };
            for value in batch {
                for consumer in active.iter().filter(|c| c.is_active()) {
                    consumer.demand.try_take_one();
                    consumer.next(value.clone());
                }
            }
        }
    }
}

impl<T: Clone + Send + 'static> Hub<T> for BufferedHub<T> {
    fn requested(&self, _consumer: &Arc<Consumer<T>>) {
        self.drain();
    }

    fn detached(&self, consumer: &Arc<Consumer<T>>) {
        self.consumers.remove(consumer);
        tracing::debug!(sink = "multicast_buffer", "consumer detached");
        self.drain();
    }
}

struct BufferedProducer<T> {
    hub: Arc<BufferedHub<T>>,
}

impl<T: Clone + Send + 'static> Publisher<T> for BufferedProducer<T> {
    fn subscribe(&self, mut actual: BoxSubscriber<T>) {
        let consumer = Consumer::new();
        actual.on_subscribe(ConsumerSubscription::shared(&consumer, &self.hub));
        if !self.hub.consumers.admit(&consumer, actual) {
            return;
        }
        if self.hub.done.load(Ordering::Acquire) {
            self.hub.consumers.remove(&consumer);
            let terminal = self.hub.terminal.lock().clone();
            if let Some(terminal) = terminal {
                consumer.terminate(&terminal);
            }
            return;
        }
        tracing::debug!(
            sink = "multicast_buffer",
            subscribers = self.hub.consumers.active_count(),
            "consumer attached"
        );
        self.hub.drain();
    }
}

impl<T: Clone + Send + 'static> ManySink<T> for BufferedSink<T> {
    fn emit_next(&self, value: T) -> EmitResult {
        let Some(_guard) = self.gate.try_enter() else {
            return EmitResult::FailNonSerialized;
        };
        self.hub.offer(value)
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
        Flux::from_publisher(BufferedProducer {
            hub: self.hub.clone(),
        })
    }
}

impl<T: Clone + Send + 'static> Drop for BufferedSink<T> {
    fn drop(&mut self) {
        let _ = self.hub.terminate(Terminal::Complete);
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for BufferedSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedSink")
            .field("capacity", &self.hub.capacity)
            .field("pending", &self.hub.queue.lock().len())
            .field("subscribers", &self.hub.consumers.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSubscriber;

    #[test]
    fn slowest_consumer_paces_everyone() {
        let sink = BufferedSink::<u32>::new(None);
        let fast = TestSubscriber::unbounded();
        let slow = TestSubscriber::with_demand(2);
        sink.as_producer().subscribe(fast.clone());
        sink.as_producer().subscribe(slow.clone());

        for value in 1..=5 {
            assert_eq!(sink.emit_next(value), EmitResult::Ok);
        }
        assert_eq!(fast.values(), vec![1, 2]);
        assert_eq!(sink.pending(), 3);

        slow.request(10);
        assert_eq!(fast.values(), vec![1, 2, 3, 4, 5]);
        assert_eq!(slow.values(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn warm_up_values_wait_for_the_first_consumer() {
        let sink = BufferedSink::<u32>::new(Some(2));
        assert_eq!(sink.emit_next(1), EmitResult::Ok);
        assert_eq!(sink.emit_next(2), EmitResult::Ok);
        assert_eq!(sink.emit_next(3), EmitResult::FailOverflow);
        assert_eq!(sink.emit_complete(), EmitResult::Ok);

        let first = TestSubscriber::unbounded();
        sink.as_producer().subscribe(first.clone());
        assert_eq!(first.values(), vec![1, 2]);
        assert!(first.is_completed());

        let late = TestSubscriber::unbounded();
        sink.as_producer().subscribe(late.clone());
        assert!(late.values().is_empty());
        assert!(late.is_completed());
    }

    #[test]
    fn cancelled_consumer_no_longer_holds_back_others() {
        let sink = BufferedSink::<u32>::new(None);
        let fast = TestSubscriber::unbounded();
        let stuck = TestSubscriber::with_demand(0);
        sink.as_producer().subscribe(fast.clone());
        sink.as_producer().subscribe(stuck.clone());
        let _ = sink.emit_next(9);
        assert!(fast.values().is_empty());
        stuck.cancel();
        assert_eq!(fast.values(), vec![9]);
    }
}
