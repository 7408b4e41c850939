//! 线程局部环境状态的抓取与恢复。
//!
//! # 教案式说明
//! - **意图（Why）**：调度切换后，下游回调运行在工作线程上，调用方线程上的日志 MDC、
//!   追踪 span 等线程局部状态不会自动跟随；切换点需要在提交任务时抓取快照，
//!   在工作线程执行投递前恢复，投递结束后再拆除，避免污染池中线程。
//! - **契约（What）**：
//!   - 通过 [`register_accessor`] 注册的每个 [`ThreadLocalAccessor`] 都参与抓取与恢复；
//!   - [`Snapshot::capture`] 读取当前线程上所有访问器的值；
//!   - [`Snapshot::restore`] 返回 [`RestoreScope`] 守卫，守卫析构时把工作线程恢复到恢复前的状态。
//! - **权衡（Trade-offs）**：注册表是进程级的，未注册任何访问器时抓取与恢复都是空操作。

use std::{
    any::Any,
    cell::RefCell,
    sync::Arc,
    thread::LocalKey,
};

use parking_lot::{RwLock, const_rwlock};

/// 单个线程局部值的读写适配器。
pub trait ThreadLocalAccessor: Send + Sync + 'static {
    /// 注册表中的唯一键。
    fn key(&self) -> &'static str;
    /// 读取当前线程上的值。
    fn get_value(&self) -> Option<Box<dyn Any + Send>>;
    /// 在当前线程上设置值。
    fn set_value(&self, value: Box<dyn Any + Send>);
    /// 清除当前线程上的值。
    fn reset(&self);
}

static REGISTRY: RwLock<Vec<Arc<dyn ThreadLocalAccessor>>> = const_rwlock(Vec::new());

/// 注册访问器；同键的旧访问器被替换。
pub fn register_accessor(accessor: impl ThreadLocalAccessor) {
    let accessor: Arc<dyn ThreadLocalAccessor> = Arc::new(accessor);
    let mut registry = REGISTRY.write();
    registry.retain(|existing| existing.key() != accessor.key());
    tracing::debug!(key = accessor.key(), "thread-local accessor registered");
    registry.push(accessor);
}

/// 注销访问器，返回是否存在。
pub fn unregister_accessor(key: &str) -> bool {
    let mut registry = REGISTRY.write();
    let before = registry.len();
    registry.retain(|existing| existing.key() != key);
    before != registry.len()
}

/// 基于 `thread_local!` 槽位的访问器。
///
/// ```
/// use std::cell::RefCell;
/// use spark_flux::context::propagation::{LocalKeyAccessor, register_accessor};
///
/// thread_local! {
///     static REQUEST_ID: RefCell<Option<String>> = const { RefCell::new(None) };
/// }
///
/// register_accessor(LocalKeyAccessor::new("request-id", &REQUEST_ID));
/// ```
pub struct LocalKeyAccessor<V: 'static> {
    key: &'static str,
    slot: &'static LocalKey<RefCell<Option<V>>>,
}

impl<V: 'static> LocalKeyAccessor<V> {
    pub const fn new(key: &'static str, slot: &'static LocalKey<RefCell<Option<V>>>) -> Self {
        Self { key, slot }
    }
}

impl<V: Clone + Send + 'static> ThreadLocalAccessor for LocalKeyAccessor<V> {
    fn key(&self) -> &'static str {
        self.key
    }

    fn get_value(&self) -> Option<Box<dyn Any + Send>> {
        self.slot
            .with(|cell| cell.borrow().clone())
            .map(|value| Box::new(value) as Box<dyn Any + Send>)
    }

    fn set_value(&self, value: Box<dyn Any + Send>) {
        if let Ok(value) = value.downcast::<V>() {
            self.slot.with(|cell| *cell.borrow_mut() = Some(*value));
        }
    }

    fn reset(&self) {
        self.slot.with(|cell| cell.borrow_mut().take());
    }
}

type Captured = Vec<(Arc<dyn ThreadLocalAccessor>, Option<Box<dyn Any + Send>>)>;

/// 某一线程上全部已注册线程局部值的快照。
#[derive(Default)]
pub struct Snapshot {
    values: Captured,
}

impl Snapshot {
    /// 抓取当前线程的值。
    pub fn capture() -> Self {
        let registry = REGISTRY.read();
        let values = registry
            .iter()
            .map(|accessor| (accessor.clone(), accessor.get_value()))
            .collect();
        Self { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// 在当前线程上恢复快照，守卫析构时还原。
    pub fn restore(self) -> RestoreScope {
        let mut previous = Vec::with_capacity(self.values.len());
        for (accessor, value) in self.values {
            previous.push((accessor.clone(), accessor.get_value()));
            match value {
                Some(value) => accessor.set_value(value),
                None => accessor.reset(),
            }
        }
        RestoreScope { previous }
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.values.iter().map(|(accessor, _)| accessor.key()))
            .finish()
    }
}

/// 快照恢复作用域。
#[must_use = "the snapshot is torn down as soon as the scope is dropped"]
pub struct RestoreScope {
    previous: Captured,
}

impl Drop for RestoreScope {
    fn drop(&mut self) {
        for (accessor, value) in self.previous.drain(..).rev() {
            match value {
                Some(value) => accessor.set_value(value),
                None => accessor.reset(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    thread_local! {
        static TRACE_ID: RefCell<Option<u64>> = const { RefCell::new(None) };
    }

    #[test]
    fn snapshot_travels_to_another_thread_and_is_torn_down() {
        register_accessor(LocalKeyAccessor::new("propagation-unit-trace", &TRACE_ID));
        TRACE_ID.with(|cell| *cell.borrow_mut() = Some(42));
        let snapshot = Snapshot::capture();
        assert!(!snapshot.is_empty());

        let observed = std::thread::spawn(move || {
            let inside = {
                let _scope = snapshot.restore();
                TRACE_ID.with(|cell| *cell.borrow())
            };
            let after = TRACE_ID.with(|cell| *cell.borrow());
            (inside, after)
        })
        .join()
        .expect("worker thread");

        assert_eq!(observed, (Some(42), None));
        assert!(unregister_accessor("propagation-unit-trace"));
    }
}
