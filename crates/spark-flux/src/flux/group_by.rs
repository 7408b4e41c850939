//! 按键分组：每个新键开启一个单播子流，后续同键元素路由到该子流。
//!
//! # 教案式说明
//! - **意图（Why）**：分组把一个上游拆成若干独立生产者，下游通常再以 `flat_map` 逐个订阅；
//!   上游节奏只能由“所有子流共同的消费进度”驱动，因此本阶段以预取额度请求上游，
//!   并在任一子流投递元素后按补货阈值向上游补请求。
//! - **契约（What）**：
//!   - 外层按下游需求发射 [`GroupedFlux`]；子流元素在订阅前缓存在子流内部；
//!   - 元素因子流已取消或外层已取消而无处可去时被丢弃，并计入补货，避免上游停滞；
//!     子流取消时尚未投递的积压元素同样计入补货；
//!   - 子流被取消后从路由表移除，同键元素再次出现时开启新的子流；
//!   - 外层取消后不再开启新子流；当外层已取消且路由表为空时取消上游；
//!   - 上游完成或出错时，所有子流与外层一起终止。
//! - **权衡（Trade-offs）**：从不被订阅的子流会一直占用预取额度，所有子流都应被消费或取消。

use std::{
    collections::HashMap,
    hash::Hash,
    ops::Deref,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    context::Context,
    error::FlowError,
    flux::{
        Flux,
        prefetch::{Prefetch, Replenisher},
    },
    hooks,
    protocol::{BoxSubscriber, DrainQueue, Publisher, Subscriber, Subscription},
    sink::{EmitResult, UnicastProcessor},
};

/// 带键的子流。
#[derive(Clone)]
pub struct GroupedFlux<K, T> {
    key: K,
    flux: Flux<T>,
}

impl<K, T> GroupedFlux<K, T> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn into_flux(self) -> Flux<T> {
        self.flux
    }

    pub fn into_parts(self) -> (K, Flux<T>) {
        (self.key, self.flux)
    }
}

impl<K, T> Deref for GroupedFlux<K, T> {
    type Target = Flux<T>;

    fn deref(&self) -> &Flux<T> {
        &self.flux
    }
}

impl<K: std::fmt::Debug, T> std::fmt::Debug for GroupedFlux<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupedFlux").field("key", &self.key).finish()
    }
}

type KeyFn<T, K> = dyn Fn(&T) -> K + Send + Sync;

pub(crate) struct GroupByPublisher<T, K> {
    source: Flux<T>,
    key_fn: Arc<KeyFn<T, K>>,
    prefetch: Prefetch,
}

impl<T, K> GroupByPublisher<T, K> {
    pub(crate) fn new(
        source: Flux<T>,
        key_fn: impl Fn(&T) -> K + Send + Sync + 'static,
        prefetch: Prefetch,
    ) -> Self {
        Self {
            source,
            key_fn: Arc::new(key_fn),
            prefetch,
        }
    }
}

impl<T, K> Publisher<GroupedFlux<K, T>> for GroupByPublisher<T, K>
where
    T: Send + 'static,
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn subscribe(&self, actual: BoxSubscriber<GroupedFlux<K, T>>) {
        let context = actual.context();
        let shared = Arc::new(GroupShared {
            groups: Mutex::new(HashMap::new()),
            outer: DrainQueue::new("group_by"),
            upstream: OnceLock::new(),
            replenisher: Mutex::new(self.prefetch.replenisher()),
            outer_cancelled: AtomicBool::new(false),
            upstream_cancelled: AtomicBool::new(false),
        });
        self.source.subscribe_inner(Box::new(GroupBySubscriber {
            actual: Some(actual),
            context,
            shared,
            key_fn: self.key_fn.clone(),
            prefetch: self.prefetch,
            done: false,
        }));
    }
}

struct GroupShared<K, T> {
    groups: Mutex<HashMap<K, Arc<UnicastProcessor<T>>>>,
    outer: DrainQueue<GroupedFlux<K, T>>,
    upstream: OnceLock<Arc<dyn Subscription>>,
    replenisher: Mutex<Replenisher>,
    outer_cancelled: AtomicBool,
    upstream_cancelled: AtomicBool,
}

impl<K, T> GroupShared<K, T>
where
    T: Send + 'static,
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn replenish(&self, consumed: u64) {
        let amount = self.replenisher.lock().consumed(consumed);
        if let (Some(amount), Some(upstream)) = (amount, self.upstream.get()) {
            upstream.request(amount);
        }
    }

    fn remove_group(&self, key: &K, discarded: u64) {
        self.replenish(discarded);
        let now_empty = {
            let mut groups = self.groups.lock();
            groups.remove(key);
            groups.is_empty()
        };
        if now_empty && self.outer_cancelled.load(Ordering::Acquire) {
            self.cancel_upstream();
        }
    }

    fn cancel_upstream(&self) {
        if !self.upstream_cancelled.swap(true, Ordering::AcqRel) {
            if let Some(upstream) = self.upstream.get() {
                upstream.cancel();
            }
        }
    }

    fn open_group(self: &Arc<Self>, key: &K) -> Arc<UnicastProcessor<T>> {
        let on_emitted = Arc::downgrade(self);
        let on_cancel = Arc::downgrade(self);
        let cancelled_key = key.clone();
        Arc::new(UnicastProcessor::with_hooks(
            "group_by",
            move |emitted| {
                if let Some(shared) = Weak::upgrade(&on_emitted) {
                    shared.replenish(emitted);
                }
            },
            move |discarded| {
                if let Some(shared) = Weak::upgrade(&on_cancel) {
                    shared.remove_group(&cancelled_key, discarded);
                }
            },
        ))
    }
}

struct GroupByOuterSubscription<K, T> {
    shared: Arc<GroupShared<K, T>>,
}

impl<K, T> Subscription for GroupByOuterSubscription<K, T>
where
    T: Send + 'static,
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        self.shared.outer.request(n);
    }

    fn cancel(&self) {
        if self.shared.outer_cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.outer.cancel();
        if self.shared.groups.lock().is_empty() {
            self.shared.cancel_upstream();
        }
    }
}

struct GroupBySubscriber<T, K> {
    actual: Option<BoxSubscriber<GroupedFlux<K, T>>>,
    context: Context,
    shared: Arc<GroupShared<K, T>>,
    key_fn: Arc<KeyFn<T, K>>,
    prefetch: Prefetch,
    done: bool,
}

impl<T, K> GroupBySubscriber<T, K>
where
    T: Send + 'static,
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn take_groups(&self) -> Vec<Arc<UnicastProcessor<T>>> {
        self.shared
            .groups
            .lock()
            .drain()
            .map(|(_, group)| group)
            .collect()
    }
}

impl<T, K> Subscriber<T> for GroupBySubscriber<T, K>
where
    T: Send + 'static,
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let Some(mut actual) = self.actual.take() else {
            subscription.cancel();
            return;
        };
        let _ = self.shared.upstream.set(subscription.clone());
        actual.on_subscribe(Arc::new(GroupByOuterSubscription {
            shared: self.shared.clone(),
        }));
        self.shared.outer.attach(actual);
        self.shared.outer.drain();
        subscription.request(self.prefetch.initial_request());
    }

    fn on_next(&mut self, value: T) {
        if self.done {
            hooks::on_next_dropped("group_by");
            return;
        }
        let key = (self.key_fn)(&value);
        let (group, created) = {
            let mut groups = self.shared.groups.lock();
            match groups.get(&key) {
                Some(group) => (Some(group.clone()), false),
                None if self.shared.outer_cancelled.load(Ordering::Acquire) => (None, false),
                None => {
                    let group = self.shared.open_group(&key);
                    groups.insert(key.clone(), group.clone());
                    (Some(group), true)
                }
            }
        };
        if let (true, Some(group)) = (created, &group) {
            tracing::trace!(stage = "group_by", "group opened");
            self.shared.outer.push(GroupedFlux {
                key,
                flux: Flux::from_arc(group.clone()),
            });
            self.shared.outer.drain();
        }
        let delivered = group.is_some_and(|group| group.offer(value) == EmitResult::Ok);
        if !delivered {
            self.shared.replenish(1);
        }
    }

    fn on_error(&mut self, error: FlowError) {
        if self.done {
            hooks::on_error_dropped("group_by", error);
            return;
        }
        self.done = true;
        for group in self.take_groups() {
            let _ = group.finish(Some(error.clone()));
        }
        self.shared.outer.error(error);
        self.shared.outer.drain();
    }

    fn on_complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        for group in self.take_groups() {
            let _ = group.finish(None);
        }
        self.shared.outer.complete();
        self.shared.outer.drain();
    }

    fn context(&self) -> Context {
        self.context.clone()
    }
}
