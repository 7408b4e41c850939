use std::{
    collections::VecDeque,
    sync::{Arc, atomic::Ordering},
};

use parking_lot::Mutex;

use crate::{
    error::FlowError,
    flux::Flux,
    protocol::{BoxSubscriber, Publisher},
    sink::{
        Consumer, ConsumerSubscription, EmitResult, Hub, ManySink, Registry, SerializedGate,
        Terminal,
    },
};

/// 回放汇点。
///
/// # 教案式说明
/// - **意图（Why）**：迟到的订阅者也要看到此前发生的全部（或最近 N 个）元素，
///   且顺序与原始发射顺序一致。
/// - **契约（What）**：
///   - 新订阅者先收到挂接时保留的全部历史，再收到之后的实时元素，全程受其自身需求约束；
///   - 有界历史只保留最近 `limit` 个元素，落后于淘汰位置的订阅者从最旧的保留元素继续；
///   - 终止之后挂接的订阅者收到保留的历史，随后收到终止信号；
///   - 没有订阅者时发射照常成功，元素进入历史。
/// - **实现（How）**：历史以绝对序号编址，每个订阅者只保存下一条待投递的序号；
///   每个订阅者各自的排空闸门保证投递串行，慢订阅者只拖慢自己。
pub struct ReplaySink<T: Clone + Send + 'static> {
    hub: Arc<ReplayHub<T>>,
    gate: SerializedGate,
}

struct ReplayHub<T> {
    limit: Option<usize>,
    history: Mutex<History<T>>,
    consumers: Registry<T>,
}

struct History<T> {
    values: VecDeque<T>,
    first_index: u64,
    terminal: Option<Terminal>,
}

enum Step<T> {
    Next(T),
    Terminal(Terminal),
}

impl<T: Clone + Send + 'static> ReplaySink<T> {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            hub: Arc::new(ReplayHub {
                limit,
                history: Mutex::new(History {
                    values: VecDeque::new(),
                    first_index: 0,
                    terminal: None,
                }),
                consumers: Registry::new(),
            }),
            gate: SerializedGate::default(),
        }
    }

    /// 当前保留的历史长度。
    pub fn retained(&self) -> usize {
        self.hub.history.lock().values.len()
    }
}

impl<T: Clone + Send + 'static> ReplayHub<T> {
    fn record(&self, value: T) -> EmitResult {
        {
            let mut history = self.history.lock();
            if history.terminal.is_some() {
                return EmitResult::FailTerminated;
            }
            history.values.push_back(value);
            if let Some(limit) = self.limit {
                while history.values.len() > limit {
                    history.values.pop_front();
                    history.first_index += 1;
                }
            }
        }
        self.replay_all();
        EmitResult::Ok
    }

    fn terminate(&self, terminal: Terminal) -> EmitResult {
        {
            let mut history = self.history.lock();
            if history.terminal.is_some() {
                return EmitResult::FailTerminated;
            }
            history.terminal = Some(terminal);
        }
        self.replay_all();
        EmitResult::Ok
    }

    fn replay_all(&self) {
        for consumer in self.consumers.snapshot().iter() {
            self.replay(consumer);
        }
    }

    fn replay(&self, consumer: &Arc<Consumer<T>>) {
        if consumer.gate.enter() {
            self.replay_claimed(consumer);
        }
    }

    fn replay_claimed(&self, consumer: &Arc<Consumer<T>>) {
        let mut missed = 1;
        loop {
            while consumer.is_active() {
                match self.next_step(consumer) {
                    Some(Step::Next(value)) => consumer.next(value),
                    Some(Step::Terminal(terminal)) => {
                        self.consumers.remove(consumer);
                        consumer.terminate(&terminal);
                        break;
                    }
                    None => break,
                }
            }
            missed = consumer.gate.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    fn next_step(&self, consumer: &Consumer<T>) -> Option<Step<T>> {
        let history = self.history.lock();
        let cursor = consumer.cursor.load(Ordering::Acquire).max(history.first_index);
        let offset = usize::try_from(cursor - history.first_index).unwrap_or(usize::MAX);
        match history.values.get(offset) {
            Some(value) => {
                if !consumer.demand.try_take_one() {
                    return None;
                }
                consumer.cursor.store(cursor + 1, Ordering::Release);
                Some(Step::Next(value.clone()))
            }
            None => history.terminal.clone().map(Step::Terminal),
        }
    }
}

impl<T: Clone + Send + 'static> Hub<T> for ReplayHub<T> {
    fn requested(&self, consumer: &Arc<Consumer<T>>) {
        self.replay(consumer);
    }

    fn detached(&self, consumer: &Arc<Consumer<T>>) {
        self.consumers.remove(consumer);
    }
}

struct ReplayProducer<T> {
    hub: Arc<ReplayHub<T>>,
}

impl<T: Clone + Send + 'static> Publisher<T> for ReplayProducer<T> {
    fn subscribe(&self, mut actual: BoxSubscriber<T>) {
        let consumer = Consumer::new();
        // 挂接完成前持有排空权：此间的请求只累加需求。
        let claimed = consumer.gate.enter();
        actual.on_subscribe(ConsumerSubscription::shared(&consumer, &self.hub));
        if self.hub.consumers.admit(&consumer, actual) && claimed {
            tracing::debug!(
                sink = "replay",
                retained = self.hub.history.lock().values.len(),
                "consumer attached"
            );
            self.hub.replay_claimed(&consumer);
        }
    }
}

impl<T: Clone + Send + 'static> ManySink<T> for ReplaySink<T> {
    fn emit_next(&self, value: T) -> EmitResult {
        let Some(_guard) = self.gate.try_enter() else {
            return EmitResult::FailNonSerialized;
        };
        self.hub.record(value)
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
        Flux::from_publisher(ReplayProducer {
            hub: self.hub.clone(),
        })
    }
}

impl<T: Clone + Send + 'static> Drop for ReplaySink<T> {
    fn drop(&mut self) {
        let _ = self.hub.terminate(Terminal::Complete);
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for ReplaySink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplaySink")
            .field("limit", &self.hub.limit)
            .field("retained", &self.hub.history.lock().values.len())
            .field("subscribers", &self.hub.consumers.active_count())
            .finish()
    }
}
