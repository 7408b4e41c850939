//! 可插拔的执行上下文。
//!
//! # 设计综述（Why）
//! - 订阅链本身不关心回调运行在哪个线程；`subscribe_on` 与 `publish_on` 两个挂接点
//!   借助 [`Scheduler`] 把订阅调用或信号投递迁移到指定工作线程；
//! - 四种实现覆盖典型负载：[`Immediate`] 在调用线程同步执行，[`SingleScheduler`] 单线程 FIFO，
//!   [`ParallelScheduler`] 面向 CPU 密集短任务的固定线程池，[`BoundedElasticScheduler`]
//!   面向阻塞任务的按需扩容线程池。
//!
//! # 契约说明（What）
//! - `schedule(task, delay)` 同步返回 [`CancelHandle`] 或 [`SchedulerError`]：
//!   容量耗尽与已释放都以错误返回给调用方，绝不静默丢弃任务；
//! - 取消句柄只阻止尚未开始的任务，正在运行的任务不会被中断；
//! - `dispose()` 之后的提交返回 [`SchedulerError::Disposed`]。
//!
//! # 共享实例
//! - [`immediate`]、[`single`]、[`parallel`]、[`bounded_elastic`] 返回进程级共享实例，
//!   按默认配置惰性创建；共享实例被释放后保持释放状态。

mod elastic;
mod immediate;
mod parallel;
mod single;
mod worker;

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    config::{BoundedElasticConfig, ParallelConfig},
    error::SchedulerError,
};

pub use elastic::BoundedElasticScheduler;
pub use immediate::Immediate;
pub use parallel::ParallelScheduler;
pub use single::SingleScheduler;

/// 提交给调度器的一次性任务。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 共享的调度器引用。
pub type SchedulerRef = Arc<dyn Scheduler>;

/// 执行上下文抽象。
pub trait Scheduler: Send + Sync + 'static {
    /// 调度器名称，出现在日志、错误与线程名中。
    fn name(&self) -> &str;

    /// 提交任务；`delay` 为 `Some` 时延后执行。
    ///
    /// # Errors
    /// - [`SchedulerError::Saturated`]：线程与排队容量均已耗尽；
    /// - [`SchedulerError::Disposed`]：调度器已释放。
    fn schedule(&self, task: Task, delay: Option<Duration>) -> Result<CancelHandle, SchedulerError>;

    /// 释放调度器：停止接收新任务，丢弃尚未开始的任务。
    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// 已提交任务的取消句柄。
///
/// # 契约说明（What）
/// - [`CancelHandle::cancel`] 幂等，第一次调用返回 `true`；
/// - 取消会唤醒正在等待延迟到期的工作线程，使其放弃该任务；
/// - 任务开始运行后取消不再生效，运行结束后 [`CancelHandle::is_finished`] 返回 `true`。
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<TaskState>,
}

struct TaskState {
    cancelled: AtomicBool,
    finished: AtomicBool,
    sleep: Mutex<()>,
    wake: Condvar,
}

impl CancelHandle {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(TaskState {
                cancelled: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                sleep: Mutex::new(()),
                wake: Condvar::new(),
            }),
        }
    }

    /// 取消任务。
    pub fn cancel(&self) -> bool {
        let first = !self.state.cancelled.swap(true, Ordering::AcqRel);
        if first {
            let _guard = self.state.sleep.lock();
            self.state.wake.notify_all();
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire)
    }

    pub(crate) fn finish(&self) {
        self.state.finished.store(true, Ordering::Release);
    }

    /// 等待 `delay` 到期；期间被取消则返回 `false`。
    pub(crate) fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut guard = self.state.sleep.lock();
        while !self.is_cancelled() {
            if self.state.wake.wait_until(&mut guard, deadline).timed_out() {
                return !self.is_cancelled();
            }
        }
        false
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// 排队中的任务及其取消句柄。
pub(crate) struct Job {
    task: Task,
    handle: CancelHandle,
}

impl Job {
    pub(crate) fn new(task: Task) -> (Self, CancelHandle) {
        let handle = CancelHandle::new();
        (
            Self {
                task,
                handle: handle.clone(),
            },
            handle,
        )
    }

    pub(crate) fn handle(&self) -> &CancelHandle {
        &self.handle
    }

    /// 运行任务；任务 panic 被捕获并记录，工作线程保持存活。
    pub(crate) fn run(self, scheduler: &str) {
        if self.handle.is_cancelled() {
            return;
        }
        if catch_unwind(AssertUnwindSafe(self.task)).is_err() {
            tracing::error!(scheduler, "scheduled task panicked");
        }
        self.handle.finish();
    }
}

static IMMEDIATE: OnceLock<Arc<Immediate>> = OnceLock::new();
static SINGLE: OnceLock<Arc<SingleScheduler>> = OnceLock::new();
static PARALLEL: OnceLock<Arc<ParallelScheduler>> = OnceLock::new();
static BOUNDED_ELASTIC: OnceLock<Arc<BoundedElasticScheduler>> = OnceLock::new();

/// 共享的同步调度器。
pub fn immediate() -> SchedulerRef {
    IMMEDIATE.get_or_init(|| Arc::new(Immediate)).clone()
}

/// 共享的单线程调度器。
pub fn single() -> SchedulerRef {
    SINGLE
        .get_or_init(|| Arc::new(SingleScheduler::new("spark-single")))
        .clone()
}

/// 共享的固定并行池。
pub fn parallel() -> SchedulerRef {
    PARALLEL
        .get_or_init(|| {
            Arc::new(ParallelScheduler::from_config(
                "spark-parallel",
                &ParallelConfig::default(),
            ))
        })
        .clone()
}

/// 共享的有界弹性池。
pub fn bounded_elastic() -> SchedulerRef {
    BOUNDED_ELASTIC
        .get_or_init(|| {
            Arc::new(BoundedElasticScheduler::from_config(
                "spark-elastic",
                &BoundedElasticConfig::default(),
            ))
        })
        .clone()
}
