//! 算子流水线：`Flux<T>` 组合类型及其阶段。
//!
//! # 设计综述（Why）
//! - 每个算子都是一个小而独占的阶段对象：订阅时为下游创建自己的订阅者并向上游订阅，
//!   各阶段之间只通过 [`Publisher`]/[`Subscriber`]/[`Subscription`] 三个 trait 交互，
//!   不依赖共同基类即可任意组合；
//! - `Flux<T>` 本身只是 `Arc<dyn Publisher<T>>` 的廉价句柄，克隆即共享同一条“冷”流水线定义，
//!   每次订阅都会沿链重新建立一组独立的阶段实例。
//!
//! # 阶段分类（What）
//! - 源：`range`、`just`、`from_iter`、`generate`、`create`、`defer` 等；
//! - 直通型：`map`、`filter`、`try_map`、`take`、`do_on_*`，需求原样转发且不缓存；
//! - 重塑型：`buffer`、`window*`、`group_by`、`flat_map`、`concat_map`、`collect_list`，
//!   各自声明需求换算与完成时的冲刷策略；
//! - 调度切换点：`subscribe_on`（订阅期）与 `publish_on`（发射期）；
//! - 回退与重试：`on_error_*`、`switch_if_empty`、`retry*`；
//! - 终端：`subscribe*` 返回 [`Disposable`]，`block_*`/`collect_blocking*` 为阻塞桥接。
//!
//! # 示例
//! ```
//! use spark_flux::flux::Flux;
//!
//! let batches = Flux::range(1, 10)
//!     .map(|x| x * 2)
//!     .buffer(3)
//!     .collect_blocking()
//!     .unwrap();
//! assert_eq!(batches, vec![vec![2, 4, 6], vec![8, 10, 12], vec![14, 16, 18], vec![20]]);
//! ```

mod buffer;
mod contextual;
mod fallback;
mod flat_map;
mod group_by;
mod prefetch;
mod publish_on;
mod source;
mod subscribe_on;
mod terminal;
mod transform;
mod window;

use std::{hash::Hash, sync::Arc, time::Duration};

pub use group_by::GroupedFlux;
pub use prefetch::{Prefetch, Replenisher};
pub use source::SynchronousSink;
pub use terminal::Disposable;

use crate::{
    config::{DEFAULT_SMALL_PREFETCH, PipelineConfig},
    context::Context,
    error::FlowError,
    protocol::{
        BoxSubscriber, Publisher, StrictSubscriber, Subscriber, SubscriptionArbiter, TerminalFlag,
    },
    retry::{RetryPublisher, RetrySpec},
    scheduler::{self, SchedulerRef},
    sink::UnicastSink,
};

use self::{
    buffer::{BufferPublisher, CollectPublisher},
    contextual::{ContextWritePublisher, DeferContextualPublisher},
    fallback::FallbackPublisher,
    flat_map::FlatMapPublisher,
    group_by::GroupByPublisher,
    publish_on::PublishOnPublisher,
    source::{
        CreatePublisher, DeferPublisher, EmptyPublisher, ErrorPublisher, GeneratePublisher,
        IterPublisher, NeverPublisher,
    },
    subscribe_on::SubscribeOnPublisher,
    terminal::{BlockMode, BlockingLatch, BlockingSubscriber, LambdaSubscriber},
    transform::{FilterMapPublisher, PeekHook, PeekPublisher, TakePublisher},
    window::{WindowBoundary, WindowPredicatePublisher, WindowPublisher},
};

/// 自带内部队列的重塑阶段（`group_by`、谓词窗口）使用的预取额度。
fn reshape_prefetch(pipeline: &PipelineConfig) -> Prefetch {
    Prefetch::with_ratio(pipeline.prefetch, pipeline.replenish_ratio)
}

/// 冷流水线句柄。
pub struct Flux<T> {
    publisher: Arc<dyn Publisher<T>>,
}

impl<T> Clone for Flux<T> {
    fn clone(&self) -> Self {
        Self {
            publisher: self.publisher.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Flux<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flux").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Publisher<T> for Flux<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        self.publisher.subscribe(subscriber);
    }
}

impl Flux<i64> {
    /// 发射 `start, start + 1, ..., start + count - 1`。
    pub fn range(start: i64, count: u64) -> Self {
        let end = start.saturating_add(i64::try_from(count).unwrap_or(i64::MAX));
        Flux::from_publisher(IterPublisher::new(start..end))
    }
}

impl<T: Send + 'static> Flux<T> {
    /// 把任意生产者包装为 `Flux`。
    pub fn from_publisher(publisher: impl Publisher<T>) -> Self {
        Self {
            publisher: Arc::new(publisher),
        }
    }

    pub(crate) fn from_arc(publisher: Arc<dyn Publisher<T>>) -> Self {
        Self { publisher }
    }

    /// 不经协议守卫直接订阅，供阶段内部串联使用。
    pub(crate) fn subscribe_inner(&self, subscriber: BoxSubscriber<T>) {
        self.publisher.subscribe(subscriber);
    }

    pub fn just(values: impl IntoIterator<Item = T>) -> Self
    where
        T: Clone + Sync,
    {
        let values: Vec<T> = values.into_iter().collect();
        Flux::from_publisher(IterPublisher::new(values))
    }

    /// 每个订阅者克隆一份 `items` 独立遍历。
    #[allow(clippy::should_implement_trait)]
    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send + 'static,
    {
        Flux::from_publisher(IterPublisher::new(items))
    }

    pub fn empty() -> Self {
        Flux::from_publisher(EmptyPublisher::new())
    }

    pub fn error(error: FlowError) -> Self {
        Flux::from_publisher(ErrorPublisher::new(error))
    }

    /// 永不发射任何信号。
    pub fn never() -> Self {
        Flux::from_publisher(NeverPublisher::new())
    }

    /// 每次订阅时调用工厂得到真正的源。
    pub fn defer(factory: impl Fn() -> Flux<T> + Send + Sync + 'static) -> Self {
        Flux::from_publisher(DeferPublisher::new(factory))
    }

    /// 每次订阅时以下游上下文调用工厂。
    pub fn defer_contextual(factory: impl Fn(&Context) -> Flux<T> + Send + Sync + 'static) -> Self {
        Flux::from_publisher(DeferContextualPublisher::new(factory))
    }

    /// 需求驱动的同步生成器：每轮调用 `generator` 至多发射一个元素。
    ///
    /// ```
    /// use spark_flux::flux::Flux;
    ///
    /// let squares = Flux::generate(
    ///     || 1u32,
    ///     |n, sink| {
    ///         sink.next(n * n);
    ///         if n == 4 {
    ///             sink.complete();
    ///         }
    ///         n + 1
    ///     },
    /// );
    /// assert_eq!(squares.collect_blocking().unwrap(), vec![1, 4, 9, 16]);
    /// ```
    pub fn generate<S: Send + 'static>(
        init: impl Fn() -> S + Send + Sync + 'static,
        generator: impl Fn(S, &mut SynchronousSink<T>) -> S + Send + Sync + 'static,
    ) -> Self {
        Flux::from_publisher(GeneratePublisher::new(init, generator))
    }

    /// 推模式源：每个订阅者拿到一个独立的单播汇，发射节奏由回调自行决定，
    /// 超出下游需求的元素缓存在汇内。
    pub fn create(emitter: impl Fn(UnicastSink<T>) + Send + Sync + 'static) -> Self {
        Flux::from_publisher(CreatePublisher::new(emitter))
    }

    pub fn map<U: Send + 'static>(&self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Flux<U> {
        Flux::from_publisher(FilterMapPublisher::new(self.clone(), "map", move |value| {
            Ok(Some(f(value)))
        }))
    }

    /// 映射函数返回 `Err` 时取消上游并以该错误终止。
    pub fn try_map<U: Send + 'static>(
        &self,
        f: impl Fn(T) -> Result<U, FlowError> + Send + Sync + 'static,
    ) -> Flux<U> {
        Flux::from_publisher(FilterMapPublisher::new(
            self.clone(),
            "try_map",
            move |value| f(value).map(Some),
        ))
    }

    pub fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flux<T> {
        Flux::from_publisher(FilterMapPublisher::new(self.clone(), "filter", move |value| {
            Ok(predicate(&value).then_some(value))
        }))
    }

    /// 至多发射 `n` 个元素后取消上游并完成。
    pub fn take(&self, n: u64) -> Flux<T> {
        Flux::from_publisher(TakePublisher::new(self.clone(), n))
    }

    pub fn do_on_next(&self, f: impl Fn(&T) + Send + Sync + 'static) -> Flux<T> {
        self.peek(PeekHook::Next(Arc::new(f)))
    }

    pub fn do_on_error(&self, f: impl Fn(&FlowError) + Send + Sync + 'static) -> Flux<T> {
        self.peek(PeekHook::Error(Arc::new(f)))
    }

    pub fn do_on_complete(&self, f: impl Fn() + Send + Sync + 'static) -> Flux<T> {
        self.peek(PeekHook::Complete(Arc::new(f)))
    }

    pub fn do_on_request(&self, f: impl Fn(u64) + Send + Sync + 'static) -> Flux<T> {
        self.peek(PeekHook::Request(Arc::new(f)))
    }

    pub fn do_on_cancel(&self, f: impl Fn() + Send + Sync + 'static) -> Flux<T> {
        self.peek(PeekHook::Cancel(Arc::new(f)))
    }

    fn peek(&self, hook: PeekHook<T>) -> Flux<T> {
        Flux::from_publisher(PeekPublisher::new(self.clone(), hook))
    }

    /// 以 `n` 为预取量、75% 为补货阈值限制上游请求的粒度。
    pub fn limit_rate(&self, n: usize) -> Flux<T> {
        self.limit_rate_with(Prefetch::new(n))
    }

    /// 见 [`Prefetch::with_low_tide`]。
    pub fn limit_rate_tides(&self, high_tide: usize, low_tide: usize) -> Flux<T> {
        self.limit_rate_with(Prefetch::with_low_tide(high_tide, low_tide))
    }

    fn limit_rate_with(&self, prefetch: Prefetch) -> Flux<T> {
        Flux::from_publisher(PublishOnPublisher::new(
            self.clone(),
            scheduler::immediate(),
            prefetch,
            "limit_rate",
        ))
    }

    /// 每 `size` 个元素聚合为一个 `Vec`，上游完成时冲刷未满的聚合。
    pub fn buffer(&self, size: usize) -> Flux<Vec<T>> {
        Flux::from_publisher(BufferPublisher::exact(self.clone(), size))
    }

    /// 每隔 `skip` 个元素开启一个大小为 `size` 的聚合，`skip < size` 时聚合相互重叠。
    pub fn buffer_skip(&self, size: usize, skip: usize) -> Flux<Vec<T>>
    where
        T: Clone,
    {
        Flux::from_publisher(BufferPublisher::skipping(self.clone(), size, skip))
    }

    pub fn collect_list(&self) -> Flux<Vec<T>> {
        Flux::from_publisher(CollectPublisher::new(self.clone()))
    }

    pub fn window(&self, size: usize) -> Flux<Flux<T>> {
        Flux::from_publisher(WindowPublisher::exact(self.clone(), size))
    }

    pub fn window_skip(&self, size: usize, skip: usize) -> Flux<Flux<T>>
    where
        T: Clone,
    {
        Flux::from_publisher(WindowPublisher::skipping(self.clone(), size, skip))
    }

    /// 匹配元素开启新窗口，并作为新窗口的第一个元素。
    ///
    /// 元素进入窗口后一直占用预取额度，直到窗口的消费者取走它；从不订阅的窗口会让上游停在预取量处。
    pub fn window_until(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Flux<Flux<T>> {
        self.window_until_configured(predicate, &PipelineConfig::default())
    }

    /// 同 [`Flux::window_until`]，预取量与补货比例取自配置的 `[pipeline]` 段。
    pub fn window_until_configured(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
        pipeline: &PipelineConfig,
    ) -> Flux<Flux<T>> {
        self.window_predicate(
            predicate,
            WindowBoundary::Until { cut_before: true },
            reshape_prefetch(pipeline),
        )
    }

    /// 匹配元素作为当前窗口的最后一个元素并关闭窗口。
    pub fn window_until_inclusive(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Flux<Flux<T>> {
        self.window_predicate(
            predicate,
            WindowBoundary::Until { cut_before: false },
            reshape_prefetch(&PipelineConfig::default()),
        )
    }

    /// 匹配元素留在当前窗口；第一个不匹配的元素被丢弃并关闭窗口。
    pub fn window_while(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Flux<Flux<T>> {
        self.window_while_configured(predicate, &PipelineConfig::default())
    }

    /// 同 [`Flux::window_while`]，预取量与补货比例取自配置的 `[pipeline]` 段。
    pub fn window_while_configured(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
        pipeline: &PipelineConfig,
    ) -> Flux<Flux<T>> {
        self.window_predicate(predicate, WindowBoundary::While, reshape_prefetch(pipeline))
    }

    fn window_predicate(
        &self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
        boundary: WindowBoundary,
        prefetch: Prefetch,
    ) -> Flux<Flux<T>> {
        Flux::from_publisher(WindowPredicatePublisher::new(
            self.clone(),
            predicate,
            boundary,
            prefetch,
        ))
    }

    pub fn group_by<K>(
        &self,
        key_fn: impl Fn(&T) -> K + Send + Sync + 'static,
    ) -> Flux<GroupedFlux<K, T>>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
    {
        self.group_by_configured(key_fn, &PipelineConfig::default())
    }

    /// 预取量与补货比例取自配置的 `[pipeline]` 段。
    pub fn group_by_configured<K>(
        &self,
        key_fn: impl Fn(&T) -> K + Send + Sync + 'static,
        pipeline: &PipelineConfig,
    ) -> Flux<GroupedFlux<K, T>>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
    {
        Flux::from_publisher(GroupByPublisher::new(
            self.clone(),
            key_fn,
            reshape_prefetch(pipeline),
        ))
    }

    pub fn group_by_with_prefetch<K>(
        &self,
        key_fn: impl Fn(&T) -> K + Send + Sync + 'static,
        prefetch: usize,
    ) -> Flux<GroupedFlux<K, T>>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
    {
        Flux::from_publisher(GroupByPublisher::new(
            self.clone(),
            key_fn,
            Prefetch::new(prefetch),
        ))
    }

    pub fn flat_map<U: Send + 'static>(
        &self,
        f: impl Fn(T) -> Flux<U> + Send + Sync + 'static,
    ) -> Flux<U> {
        let pipeline = PipelineConfig::default();
        self.flat_map_with(f, pipeline.flat_map_concurrency, pipeline.small_prefetch)
    }

    /// `concurrency` 为同时订阅的子流上限，`prefetch` 为每个子流的预取量。
    pub fn flat_map_with<U: Send + 'static>(
        &self,
        f: impl Fn(T) -> Flux<U> + Send + Sync + 'static,
        concurrency: usize,
        prefetch: usize,
    ) -> Flux<U> {
        Flux::from_publisher(FlatMapPublisher::new(
            self.clone(),
            f,
            concurrency,
            Prefetch::new(prefetch),
            "flat_map",
        ))
    }

    /// 逐个展开子流，保持上游顺序。
    pub fn concat_map<U: Send + 'static>(
        &self,
        f: impl Fn(T) -> Flux<U> + Send + Sync + 'static,
    ) -> Flux<U> {
        Flux::from_publisher(FlatMapPublisher::new(
            self.clone(),
            f,
            1,
            Prefetch::new(DEFAULT_SMALL_PREFETCH),
            "concat_map",
        ))
    }

    /// 上游出错时改为发射 `value` 并完成。
    pub fn on_error_return(&self, value: T) -> Flux<T>
    where
        T: Clone + Sync,
    {
        Flux::from_publisher(FallbackPublisher::on_error(
            self.clone(),
            "on_error_return",
            move |_| Ok(Flux::just([value.clone()])),
        ))
    }

    pub fn on_error_resume(
        &self,
        f: impl Fn(FlowError) -> Flux<T> + Send + Sync + 'static,
    ) -> Flux<T> {
        Flux::from_publisher(FallbackPublisher::on_error(
            self.clone(),
            "on_error_resume",
            move |error| Ok(f(error)),
        ))
    }

    pub fn on_error_map(
        &self,
        f: impl Fn(FlowError) -> FlowError + Send + Sync + 'static,
    ) -> Flux<T> {
        Flux::from_publisher(FallbackPublisher::on_error(
            self.clone(),
            "on_error_map",
            move |error| Err(f(error)),
        ))
    }

    /// 谓词匹配的错误被吞掉并转为完成，其余错误照常传播。
    pub fn on_error_complete(
        &self,
        predicate: impl Fn(&FlowError) -> bool + Send + Sync + 'static,
    ) -> Flux<T> {
        Flux::from_publisher(FallbackPublisher::on_error(
            self.clone(),
            "on_error_complete",
            move |error| {
                if predicate(&error) {
                    Ok(Flux::empty())
                } else {
                    Err(error)
                }
            },
        ))
    }

    pub fn switch_if_empty(&self, other: Flux<T>) -> Flux<T> {
        Flux::from_publisher(FallbackPublisher::on_empty(self.clone(), other))
    }

    /// 出错后至多重新订阅 `n` 次。
    pub fn retry(&self, n: u64) -> Flux<T> {
        self.retry_when(RetrySpec::max(n))
    }

    pub fn retry_when(&self, spec: RetrySpec) -> Flux<T> {
        Flux::from_publisher(RetryPublisher::new(self.clone(), spec))
    }

    pub fn subscribe_on(&self, scheduler: SchedulerRef) -> Flux<T> {
        Flux::from_publisher(SubscribeOnPublisher::new(self.clone(), scheduler))
    }

    pub fn publish_on(&self, scheduler: SchedulerRef) -> Flux<T> {
        self.publish_on_with(scheduler, DEFAULT_SMALL_PREFETCH)
    }

    pub fn publish_on_with(&self, scheduler: SchedulerRef, prefetch: usize) -> Flux<T> {
        self.publish_on_prefetch(scheduler, Prefetch::new(prefetch))
    }

    /// 预取量与补货比例取自配置的 `[pipeline]` 段。
    pub fn publish_on_configured(&self, scheduler: SchedulerRef, pipeline: &PipelineConfig) -> Flux<T> {
        self.publish_on_prefetch(
            scheduler,
            Prefetch::with_ratio(pipeline.small_prefetch, pipeline.replenish_ratio),
        )
    }

    fn publish_on_prefetch(&self, scheduler: SchedulerRef, prefetch: Prefetch) -> Flux<T> {
        Flux::from_publisher(PublishOnPublisher::new(
            self.clone(),
            scheduler,
            prefetch,
            "publish_on",
        ))
    }

    /// 以下游上下文计算新上下文，只对本阶段上游可见。
    ///
    /// ```
    /// use spark_flux::flux::Flux;
    ///
    /// let greeting = Flux::defer_contextual(|ctx| {
    ///     Flux::just([ctx.get_or::<String>("user", "anonymous".to_string())])
    /// })
    /// .context_write(|ctx| ctx.put("user", "ada".to_string()));
    /// assert_eq!(greeting.block_last().unwrap().as_deref(), Some("ada"));
    /// ```
    pub fn context_write(
        &self,
        f: impl Fn(Context) -> Context + Send + Sync + 'static,
    ) -> Flux<T> {
        Flux::from_publisher(ContextWritePublisher::new(self.clone(), f))
    }

    /// 以协议守卫包裹 `consumer` 后订阅。
    pub fn subscribe(&self, consumer: impl Subscriber<T>) -> Disposable {
        let arbiter = Arc::new(SubscriptionArbiter::new());
        let terminal = TerminalFlag::default();
        self.subscribe_inner(Box::new(StrictSubscriber::with_handle(
            Box::new(consumer),
            arbiter.clone(),
            terminal.clone(),
        )));
        Disposable::new(arbiter, terminal)
    }

    /// 以无界需求消费，错误交给未处理错误通道。
    pub fn subscribe_with(&self, on_next: impl FnMut(T) + Send + 'static) -> Disposable {
        self.subscribe(LambdaSubscriber::new(on_next, None, None))
    }

    pub fn subscribe_full(
        &self,
        on_next: impl FnMut(T) + Send + 'static,
        on_error: impl FnMut(FlowError) + Send + 'static,
        on_complete: impl FnMut() + Send + 'static,
    ) -> Disposable {
        self.subscribe(LambdaSubscriber::new(
            on_next,
            Some(Box::new(on_error)),
            Some(Box::new(on_complete)),
        ))
    }

    /// 阻塞直到完成，返回最后一个元素。
    pub fn block_last(&self) -> Result<Option<T>, FlowError> {
        Ok(self.block(BlockMode::Last, None)?.pop())
    }

    /// 阻塞直到收到第一个元素或终止信号，收到元素后取消上游。
    pub fn block_first(&self) -> Result<Option<T>, FlowError> {
        Ok(self.block(BlockMode::First, None)?.into_iter().next())
    }

    pub fn collect_blocking(&self) -> Result<Vec<T>, FlowError> {
        self.block(BlockMode::All, None)
    }

    /// 超时后取消订阅并返回 [`FlowError::Timeout`]。
    pub fn collect_blocking_timeout(&self, timeout: Duration) -> Result<Vec<T>, FlowError> {
        self.block(BlockMode::All, Some(timeout))
    }

    fn block(&self, mode: BlockMode, timeout: Option<Duration>) -> Result<Vec<T>, FlowError> {
        let latch = BlockingLatch::new();
        let disposable = self.subscribe(BlockingSubscriber::new(latch.clone(), mode));
        let result = latch.wait(timeout);
        if matches!(result, Err(FlowError::Timeout { .. })) {
            tracing::debug!(?timeout, "blocking wait timed out");
            disposable.dispose();
        }
        result
    }
}
