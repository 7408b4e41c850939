//! 冷源：每个订阅者独立地从头生产。

use std::{
    iter::Peekable,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    error::FlowError,
    flux::Flux,
    protocol::{
        BoxSubscriber, DemandCounter, DrainGate, EmptySubscription, Publisher, Subscription,
        UNBOUNDED,
    },
    sink::{ManySink, Sinks, UnicastSink},
};

/// 拉取式源每一轮产出的信号。
pub(crate) enum Pull<T> {
    Next(T),
    NextThenTerminate(T, Option<FlowError>),
    Terminate(Option<FlowError>),
}

/// 按需求逐个拉取元素的同步源。
pub(crate) trait PullSource<T>: Send + 'static {
    fn pull(&mut self) -> Pull<T>;

    /// 在没有剩余需求时探测源是否已经耗尽，耗尽的源无需额外需求即可完成。
    fn is_exhausted(&mut self) -> bool {
        false
    }
}

struct PullState<T, S> {
    actual: Option<BoxSubscriber<T>>,
    source: Option<S>,
}

/// 拉取式源共用的订阅：需求驱动的排空循环逐个调用 [`PullSource::pull`]。
///
/// - 消费者在 `on_subscribe` 返回之后才被安装，此前到达的请求只累加需求；
/// - 终止或取消后同时释放消费者与源，打断与上游阶段之间的引用环。
pub(crate) struct PullSubscription<T, S> {
    gate: DrainGate,
    demand: DemandCounter,
    cancelled: AtomicBool,
    state: Mutex<PullState<T, S>>,
}

impl<T, S> PullSubscription<T, S>
where
    T: Send + 'static,
    S: PullSource<T>,
{
    pub(crate) fn start(source: S, mut actual: BoxSubscriber<T>) {
        let subscription = Arc::new(Self {
            gate: DrainGate::new(),
            demand: DemandCounter::new(),
            cancelled: AtomicBool::new(false),
            state: Mutex::new(PullState {
                actual: None,
                source: Some(source),
            }),
        });
        actual.on_subscribe(subscription.clone());
        subscription.state.lock().actual = Some(actual);
        subscription.drain();
    }

    fn drain(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            self.drain_once();
            missed = self.gate.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    fn drain_once(&self) {
        let mut state = self.state.lock();
        if self.cancelled.load(Ordering::Acquire) {
            state.actual = None;
            state.source = None;
            return;
        }
        let PullState {
            actual: Some(actual),
            source: Some(source),
        } = &mut *state
        else {
            return;
        };

        let requested = self.demand.get();
        let mut emitted = 0u64;
        let mut finished = None;
        while !self.cancelled.load(Ordering::Acquire) {
            if emitted == requested {
                if source.is_exhausted() {
                    finished = Some(None);
                }
                break;
            }
            match source.pull() {
                Pull::Next(value) => {
                    actual.on_next(value);
                    emitted += 1;
                }
                Pull::NextThenTerminate(value, terminal) => {
                    actual.on_next(value);
                    emitted += 1;
                    finished = Some(terminal);
                    break;
                }
                Pull::Terminate(terminal) => {
                    finished = Some(terminal);
                    break;
                }
            }
        }
        if let Some(terminal) = finished {
            if !self.cancelled.load(Ordering::Acquire) {
                match terminal {
                    None => actual.on_complete(),
                    Some(error) => actual.on_error(error),
                }
            }
            state.actual = None;
            state.source = None;
        }
        drop(state);
        if emitted > 0 && requested != UNBOUNDED {
            self.demand.produced(emitted);
        }
    }
}

impl<T, S> Subscription for PullSubscription<T, S>
where
    T: Send + 'static,
    S: PullSource<T>,
{
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.demand.add(n);
        self.drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.drain();
        }
    }
}

struct IterSource<I: Iterator> {
    iter: Peekable<I>,
}

impl<I> PullSource<I::Item> for IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    fn pull(&mut self) -> Pull<I::Item> {
        match self.iter.next() {
            Some(value) if self.iter.peek().is_none() => Pull::NextThenTerminate(value, None),
            Some(value) => Pull::Next(value),
            None => Pull::Terminate(None),
        }
    }

    fn is_exhausted(&mut self) -> bool {
        self.iter.peek().is_none()
    }
}

/// 可重复遍历的集合源，每个订阅者克隆一份集合独立遍历。
pub(crate) struct IterPublisher<I> {
    items: I,
}

impl<I> IterPublisher<I> {
    pub(crate) fn new(items: I) -> Self {
        Self { items }
    }
}

impl<I> Publisher<I::Item> for IterPublisher<I>
where
    I: IntoIterator + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<I::Item>) {
        let source = IterSource {
            iter: self.items.clone().into_iter().peekable(),
        };
        PullSubscription::start(source, subscriber);
    }
}

/// 同步生成器每一轮使用的汇：至多一个 `next`，可选一个终止信号。
pub struct SynchronousSink<T> {
    value: Option<T>,
    terminal: Option<Option<FlowError>>,
    misuse: Option<&'static str>,
}

impl<T> SynchronousSink<T> {
    fn new() -> Self {
        Self {
            value: None,
            terminal: None,
            misuse: None,
        }
    }

    /// 发射本轮的元素；同一轮重复调用属于误用，流将以协议错误终止。
    pub fn next(&mut self, value: T) {
        if self.terminal.is_some() {
            self.misuse = Some("next called after a terminal signal");
        } else if self.value.is_some() {
            self.misuse = Some("next called more than once in one round");
        } else {
            self.value = Some(value);
        }
    }

    pub fn complete(&mut self) {
        if self.terminal.is_none() {
            self.terminal = Some(None);
        }
    }

    pub fn error(&mut self, error: FlowError) {
        if self.terminal.is_none() {
            self.terminal = Some(Some(error));
        }
    }
}

type Generator<S, T> = dyn Fn(S, &mut SynchronousSink<T>) -> S + Send + Sync;

struct GenerateSource<S, T> {
    state: Option<S>,
    generator: Arc<Generator<S, T>>,
}

impl<S, T> PullSource<T> for GenerateSource<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    fn pull(&mut self) -> Pull<T> {
        let Some(state) = self.state.take() else {
            return Pull::Terminate(None);
        };
        let mut sink = SynchronousSink::new();
        self.state = Some((self.generator)(state, &mut sink));
        if let Some(detail) = sink.misuse {
            return Pull::Terminate(Some(FlowError::protocol("generate", detail)));
        }
        match (sink.value, sink.terminal) {
            (Some(value), None) => Pull::Next(value),
            (Some(value), Some(terminal)) => Pull::NextThenTerminate(value, terminal),
            (None, Some(terminal)) => Pull::Terminate(terminal),
            (None, None) => Pull::Terminate(Some(FlowError::protocol(
                "generate",
                "generator returned without emitting any signal",
            ))),
        }
    }
}

pub(crate) struct GeneratePublisher<S, T> {
    init: Arc<dyn Fn() -> S + Send + Sync>,
    generator: Arc<Generator<S, T>>,
}

impl<S, T> GeneratePublisher<S, T> {
    pub(crate) fn new(
        init: impl Fn() -> S + Send + Sync + 'static,
        generator: impl Fn(S, &mut SynchronousSink<T>) -> S + Send + Sync + 'static,
    ) -> Self {
        Self {
            init: Arc::new(init),
            generator: Arc::new(generator),
        }
    }
}

impl<S, T> Publisher<T> for GeneratePublisher<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let source = GenerateSource {
            state: Some((self.init)()),
            generator: self.generator.clone(),
        };
        PullSubscription::start(source, subscriber);
    }
}

pub(crate) struct EmptyPublisher<T>(PhantomData<fn() -> T>);

impl<T> EmptyPublisher<T> {
    pub(crate) fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: Send + 'static> Publisher<T> for EmptyPublisher<T> {
    fn subscribe(&self, mut subscriber: BoxSubscriber<T>) {
        subscriber.on_subscribe(EmptySubscription::shared());
        subscriber.on_complete();
    }
}

pub(crate) struct ErrorPublisher<T> {
    error: FlowError,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ErrorPublisher<T> {
    pub(crate) fn new(error: FlowError) -> Self {
        Self {
            error,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> Publisher<T> for ErrorPublisher<T> {
    fn subscribe(&self, mut subscriber: BoxSubscriber<T>) {
        subscriber.on_subscribe(EmptySubscription::shared());
        subscriber.on_error(self.error.clone());
    }
}

pub(crate) struct NeverPublisher<T>(PhantomData<fn() -> T>);

impl<T> NeverPublisher<T> {
    pub(crate) fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: Send + 'static> Publisher<T> for NeverPublisher<T> {
    fn subscribe(&self, mut subscriber: BoxSubscriber<T>) {
        subscriber.on_subscribe(EmptySubscription::shared());
    }
}

pub(crate) struct DeferPublisher<T> {
    factory: Arc<dyn Fn() -> Flux<T> + Send + Sync>,
}

impl<T> DeferPublisher<T> {
    pub(crate) fn new(factory: impl Fn() -> Flux<T> + Send + Sync + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for DeferPublisher<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        (self.factory)().subscribe_inner(subscriber);
    }
}

/// 推模式源：每个订阅者获得一个独立的单播汇，由用户回调驱动发射。
pub(crate) struct CreatePublisher<T: Send + 'static> {
    emitter: Arc<dyn Fn(UnicastSink<T>) + Send + Sync>,
}

impl<T: Send + 'static> CreatePublisher<T> {
    pub(crate) fn new(emitter: impl Fn(UnicastSink<T>) + Send + Sync + 'static) -> Self {
        Self {
            emitter: Arc::new(emitter),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for CreatePublisher<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let sink = Sinks::unicast::<T>();
        sink.as_producer().subscribe_inner(subscriber);
        (self.emitter)(sink);
    }
}
