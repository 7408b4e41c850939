//! 汇点：由命令式代码驱动的热源。
//!
//! # 设计综述（Why）
//! - 汇点把“调用方主动推送”桥接到需求协议：发射以返回值 [`EmitResult`] 同步告知结果，
//!   失败从不以流错误的形式抛出，调用方可以据此重试、丢弃或改走阻塞变体；
//! - 消费者集合、需求计数与历史缓冲都归属于单个汇点实例：创建汇点的一方是唯一所有者，
//!   通过 [`ManySink::as_producer`] 分发共享引用形式的生产者句柄；所有者句柄被丢弃且尚未发送终止信号时，
//!   已挂接的消费者收到完成信号。
//!
//! # 变体（What）
//! - [`UnicastSink`]：至多一个消费者，需求不足时在内部队列积压；
//! - [`MulticastSink`]：直接投递，分为“尽力而为”（无需求的消费者错过该元素）
//!   与“全有或全无”（任一消费者无需求即拒绝本次发射）两种模式；
//! - [`BufferedSink`]：汇点级共享队列，按所有消费者的最小需求放行；
//! - [`ReplaySink`]：保留有序历史，新订阅者先收到历史再收到实时元素。
//!
//! # 并发（How）
//! - 同一汇点上的发射经 [`SerializedGate`] 串行化：并发冲突的一方立即得到
//!   [`EmitResult::FailNonSerialized`]，由调用方决定是否自旋重试（见 [`ManySink::emit_next_busy_looping`]）；
//! - 消费者集合以 `ArcSwap` 的写时复制列表维护，发射路径无锁遍历快照，挂接与离开不阻塞发射；
//! - 每个消费者各自持有投递锁，单个慢消费者不会阻塞其他消费者的挂接或取消。

mod buffered;
mod multicast;
mod replay;
mod unicast;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

pub use buffered::BufferedSink;
pub use multicast::MulticastSink;
pub use replay::ReplaySink;
pub(crate) use unicast::UnicastProcessor;
pub use unicast::UnicastSink;

use crate::{
    error::{EmitError, FlowError},
    flux::Flux,
    protocol::{BoxSubscriber, DemandCounter, DrainGate, Subscription},
};

/// 一次发射尝试的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum EmitResult {
    Ok,
    /// 汇点已完成或出错。
    FailTerminated,
    /// 缓冲已满，或全有或全无模式下存在无需求的消费者。
    FailOverflow,
    /// 与另一发射方并发冲突，整次发射需要重试。
    FailNonSerialized,
    /// 没有可投递的消费者。
    FailZeroSubscriber,
}

impl EmitResult {
    pub fn is_success(self) -> bool {
        self == EmitResult::Ok
    }

    pub fn is_failure(self) -> bool {
        !self.is_success()
    }

    /// 转换为 `Result`，便于以 `?` 传播。
    pub fn into_result(self) -> Result<(), EmitError> {
        match self {
            EmitResult::Ok => Ok(()),
            EmitResult::FailTerminated => Err(EmitError::Terminated),
            EmitResult::FailOverflow => Err(EmitError::Overflow),
            EmitResult::FailNonSerialized => Err(EmitError::NonSerialized),
            EmitResult::FailZeroSubscriber => Err(EmitError::ZeroSubscriber),
        }
    }
}

/// 多值汇点的公共接口。
///
/// # 契约说明（What）
/// - 发射方法从不阻塞、从不 panic，失败以 [`EmitResult`] 返回；
/// - 终止信号至多接受一次，之后的一切发射返回 [`EmitResult::FailTerminated`]；
/// - [`ManySink::as_producer`] 可多次调用，每次返回指向同一汇点的生产者句柄。
pub trait ManySink<T: Send + 'static>: Send + Sync {
    fn emit_next(&self, value: T) -> EmitResult;
    fn emit_complete(&self) -> EmitResult;
    fn emit_error(&self, error: FlowError) -> EmitResult;

    /// 当前挂接且未取消的消费者数量。
    fn subscriber_count(&self) -> usize;

    fn as_producer(&self) -> Flux<T>;

    /// 在期限内对 [`EmitResult::FailNonSerialized`] 自旋重试，其他结果立即返回。
    fn emit_next_busy_looping(&self, value: T, deadline: Duration) -> EmitResult
    where
        T: Clone,
    {
        let until = Instant::now() + deadline;
        loop {
            match self.emit_next(value.clone()) {
                EmitResult::FailNonSerialized if Instant::now() < until => {
                    std::thread::yield_now();
                }
                other => return other,
            }
        }
    }
}

/// 汇点工厂。
///
/// ```
/// use spark_flux::sink::{ManySink, Sinks};
///
/// let sink = Sinks::replay_all::<u32>();
/// for value in [1, 2, 3] {
///     sink.emit_next(value).into_result().unwrap();
/// }
/// let late = sink.as_producer();
/// sink.emit_next(4).into_result().unwrap();
/// sink.emit_complete().into_result().unwrap();
/// assert_eq!(late.collect_blocking().unwrap(), vec![1, 2, 3, 4]);
/// ```
#[derive(Debug)]
pub enum Sinks {}

impl Sinks {
    /// 单消费者汇点，积压队列无界。
    pub fn unicast<T: Send + 'static>() -> UnicastSink<T> {
        UnicastSink::new(None)
    }

    /// 单消费者汇点，积压超过 `capacity` 时返回 [`EmitResult::FailOverflow`]。
    pub fn unicast_bounded<T: Send + 'static>(capacity: usize) -> UnicastSink<T> {
        UnicastSink::new(Some(capacity))
    }

    pub fn multicast_best_effort<T: Clone + Send + 'static>() -> MulticastSink<T> {
        MulticastSink::best_effort()
    }

    pub fn multicast_all_or_nothing<T: Clone + Send + 'static>() -> MulticastSink<T> {
        MulticastSink::all_or_nothing()
    }

    pub fn multicast_buffer<T: Clone + Send + 'static>() -> BufferedSink<T> {
        BufferedSink::new(None)
    }

    pub fn multicast_buffer_bounded<T: Clone + Send + 'static>(capacity: usize) -> BufferedSink<T> {
        BufferedSink::new(Some(capacity))
    }

    pub fn replay_all<T: Clone + Send + 'static>() -> ReplaySink<T> {
        ReplaySink::new(None)
    }

    /// 仅保留最近 `limit` 个元素的回放汇点。
    pub fn replay_limit<T: Clone + Send + 'static>(limit: usize) -> ReplaySink<T> {
        ReplaySink::new(Some(limit))
    }
}

/// 发射串行化的非阻塞互斥位。
#[derive(Debug, Default)]
pub(crate) struct SerializedGate {
    busy: AtomicBool,
}

pub(crate) struct SerializedGuard<'a> {
    busy: &'a AtomicBool,
}

impl SerializedGate {
    pub(crate) fn try_enter(&self) -> Option<SerializedGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SerializedGuard { busy: &self.busy })
    }
}

impl Drop for SerializedGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// 汇点记录的终止信号。
#[derive(Clone, Debug)]
enum Terminal {
    Complete,
    Error(FlowError),
}

impl Terminal {
    fn deliver<T: 'static>(&self, actual: &mut BoxSubscriber<T>) {
        match self {
            Terminal::Complete => actual.on_complete(),
            Terminal::Error(error) => actual.on_error(error.clone()),
        }
    }
}

/// 多播汇点中的单个消费者槽位。
///
/// - 需求计数由订阅方累加、由发射路径扣减；
/// - 投递持有槽位锁，消费者在回调内重入的取消只打标记，由投递方在回调返回后释放消费者；
/// - `cursor` 与 `gate` 仅回放汇点使用：前者是下一条待投递历史的绝对序号。
struct Consumer<T> {
    demand: DemandCounter,
    actual: Mutex<Option<BoxSubscriber<T>>>,
    cancelled: AtomicBool,
    cursor: AtomicU64,
    gate: DrainGate,
}

impl<T: Send + 'static> Consumer<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            demand: DemandCounter::new(),
            actual: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            cursor: AtomicU64::new(0),
            gate: DrainGate::new(),
        })
    }

    fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire)
    }

    fn next(&self, value: T) {
        let mut guard = self.actual.lock();
        if let Some(actual) = guard.as_mut() {
            actual.on_next(value);
        }
        if !self.is_active() {
            guard.take();
        }
    }

    /// 投递终止信号；返回是否确实投递（每个消费者至多一次）。
    fn terminate(&self, terminal: &Terminal) -> bool {
        let actual = self.actual.lock().take();
        match actual {
            Some(mut actual) => {
                terminal.deliver(&mut actual);
                true
            }
            None => false,
        }
    }

    /// 标记取消；返回是否为第一次取消。
    fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::AcqRel);
        if let Some(mut guard) = self.actual.try_lock() {
            guard.take();
        }
        first
    }
}

/// 写时复制的消费者列表，保持挂接顺序。
struct Registry<T> {
    members: ArcSwap<Vec<Arc<Consumer<T>>>>,
}

impl<T: Send + 'static> Registry<T> {
    fn new() -> Self {
        Self {
            members: ArcSwap::from_pointee(Vec::new()),
        }
    }

    fn snapshot(&self) -> Arc<Vec<Arc<Consumer<T>>>> {
        self.members.load_full()
    }

    fn active_count(&self) -> usize {
        self.members
            .load()
            .iter()
            .filter(|consumer| consumer.is_active())
            .count()
    }

    fn remove(&self, consumer: &Arc<Consumer<T>>) {
        self.members.rcu(|current| {
            current
                .iter()
                .filter(|member| !Arc::ptr_eq(member, consumer))
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    fn take_all(&self) -> Arc<Vec<Arc<Consumer<T>>>> {
        self.members.swap(Arc::new(Vec::new()))
    }

    /// 安装消费者并登记；返回 `false` 表示消费者在安装期间已取消。
    fn admit(&self, consumer: &Arc<Consumer<T>>, actual: BoxSubscriber<T>) -> bool {
        if !consumer.is_active() {
            return false;
        }
        *consumer.actual.lock() = Some(actual);
        self.members.rcu(|current| {
            let mut next: Vec<_> = current.iter().cloned().collect();
            next.push(consumer.clone());
            next
        });
        if !consumer.is_active() {
            self.remove(consumer);
            consumer.actual.lock().take();
            return false;
        }
        true
    }
}

/// 消费者取消或追加需求时通知所属汇点。
trait Hub<T>: Send + Sync + 'static {
    fn requested(&self, consumer: &Arc<Consumer<T>>);
    fn detached(&self, consumer: &Arc<Consumer<T>>);
}

/// 多播类汇点交给消费者的订阅。
struct ConsumerSubscription<T, H> {
    consumer: Arc<Consumer<T>>,
    hub: Arc<H>,
}

impl<T, H> ConsumerSubscription<T, H>
where
    T: Send + 'static,
    H: Hub<T>,
{
    fn shared(consumer: &Arc<Consumer<T>>, hub: &Arc<H>) -> Arc<dyn Subscription> {
        Arc::new(Self {
            consumer: consumer.clone(),
            hub: hub.clone(),
        })
    }
}

impl<T, H> Subscription for ConsumerSubscription<T, H>
where
    T: Send + 'static,
    H: Hub<T>,
{
    fn request(&self, n: u64) {
        if n == 0 || !self.consumer.is_active() {
            return;
        }
        self.consumer.demand.add(n);
        self.hub.requested(&self.consumer);
    }

    fn cancel(&self) {
        if self.consumer.cancel() {
            self.hub.detached(&self.consumer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_result_maps_failures_to_errors() {
        assert!(EmitResult::Ok.into_result().is_ok());
        assert_eq!(
            EmitResult::FailOverflow.into_result(),
            Err(EmitError::Overflow)
        );
        assert_eq!(
            EmitResult::FailZeroSubscriber.into_result(),
            Err(EmitError::ZeroSubscriber)
        );
        assert!(EmitResult::FailTerminated.is_failure());
    }

    #[test]
    fn serialized_gate_rejects_second_entrant() {
        let gate = SerializedGate::default();
        let guard = gate.try_enter();
        assert!(guard.is_some());
        assert!(gate.try_enter().is_none());
        drop(guard);
        assert!(gate.try_enter().is_some());
    }
}
