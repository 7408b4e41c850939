//! 旁路错误通道（side error channel）。
//!
//! # 设计背景（Why）
//! - 终止信号之后到达的 `Next`/`Error` 属于越界信号，不能交给消费者，但也不能静默吞掉；
//! - 未提供 `on_error` 处理器的订阅遇到终止错误时，只应让该订阅“崩溃”，而不是让进程崩溃；
//! - 以上情况统一汇入本模块：输出 `tracing` 事件、累加进程级计数器，并回调可选的观察者。
//!
//! # 契约说明（What）
//! - 计数器通过 [`snapshot`] 读取，只增不减（测试可调用 [`reset_counters`] 归零）；
//! - 观察者通过 [`install_observer`] 注册，后注册者覆盖先注册者；回调在触发线程上同步执行，
//!   实现方不得在其中阻塞。

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::{RwLock, const_rwlock};

use crate::error::FlowError;

/// 旁路事件的分类。
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum HookEvent {
    /// 终止后到达、或目标子流已取消而无处投递的 `Next` 被丢弃。
    NextDropped { stage: &'static str },
    /// 终止后到达的 `Error` 被丢弃。
    ErrorDropped { stage: &'static str, error: FlowError },
    /// 订阅未提供错误处理器，错误在此被记录。
    UnhandledError { error: FlowError },
    /// 阶段违反需求协议。
    ProtocolViolation { error: FlowError },
}

/// 旁路事件观察者。
pub trait ErrorObserver: Send + Sync + 'static {
    fn observe(&self, event: &HookEvent);
}

impl<F> ErrorObserver for F
where
    F: Fn(&HookEvent) + Send + Sync + 'static,
{
    fn observe(&self, event: &HookEvent) {
        self(event)
    }
}

/// 旁路计数器快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HookCounters {
    pub next_dropped: u64,
    pub error_dropped: u64,
    pub unhandled_errors: u64,
    pub protocol_violations: u64,
}

static NEXT_DROPPED: AtomicU64 = AtomicU64::new(0);
static ERROR_DROPPED: AtomicU64 = AtomicU64::new(0);
static UNHANDLED: AtomicU64 = AtomicU64::new(0);
static VIOLATIONS: AtomicU64 = AtomicU64::new(0);
static OBSERVER: RwLock<Option<Arc<dyn ErrorObserver>>> = const_rwlock(None);

/// 注册观察者，返回被替换的旧观察者。
pub fn install_observer(observer: impl ErrorObserver) -> Option<Arc<dyn ErrorObserver>> {
    OBSERVER.write().replace(Arc::new(observer))
}

/// 移除已注册的观察者。
pub fn reset_observer() -> Option<Arc<dyn ErrorObserver>> {
    OBSERVER.write().take()
}

/// 读取当前计数器。
pub fn snapshot() -> HookCounters {
    HookCounters {
        next_dropped: NEXT_DROPPED.load(Ordering::Relaxed),
        error_dropped: ERROR_DROPPED.load(Ordering::Relaxed),
        unhandled_errors: UNHANDLED.load(Ordering::Relaxed),
        protocol_violations: VIOLATIONS.load(Ordering::Relaxed),
    }
}

/// 计数器归零，仅供测试隔离使用。
pub fn reset_counters() {
    NEXT_DROPPED.store(0, Ordering::Relaxed);
    ERROR_DROPPED.store(0, Ordering::Relaxed);
    UNHANDLED.store(0, Ordering::Relaxed);
    VIOLATIONS.store(0, Ordering::Relaxed);
}

pub(crate) fn on_next_dropped(stage: &'static str) {
    NEXT_DROPPED.fetch_add(1, Ordering::Relaxed);
    tracing::warn!(stage, "next signal dropped");
    notify(&HookEvent::NextDropped { stage });
}

pub(crate) fn on_error_dropped(stage: &'static str, error: FlowError) {
    ERROR_DROPPED.fetch_add(1, Ordering::Relaxed);
    tracing::warn!(stage, %error, "error signal dropped after terminal");
    notify(&HookEvent::ErrorDropped { stage, error });
}

pub(crate) fn on_unhandled_error(error: FlowError) {
    UNHANDLED.fetch_add(1, Ordering::Relaxed);
    tracing::error!(%error, "subscription terminated by unhandled error");
    notify(&HookEvent::UnhandledError { error });
}

pub(crate) fn on_protocol_violation(error: FlowError) {
    VIOLATIONS.fetch_add(1, Ordering::Relaxed);
    tracing::error!(%error, "demand protocol violated");
    notify(&HookEvent::ProtocolViolation { error });
}

fn notify(event: &HookEvent) {
    let observer = OBSERVER.read().clone();
    if let Some(observer) = observer {
        observer.observe(event);
    }
}
