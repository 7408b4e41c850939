use std::{
    borrow::Cow,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use crate::{
    error::SchedulerError,
    scheduler::{CancelHandle, Job, Scheduler, Task, worker::Worker},
};

/// 单个长期存活工作线程上的 FIFO 调度器。
///
/// # 契约说明（What）
/// - 所有任务按提交顺序在同一线程上串行执行；
/// - 线程在第一次提交时创建，直到 [`Scheduler::dispose`] 或实例析构才退出。
pub struct SingleScheduler {
    name: Cow<'static, str>,
    worker: Worker,
    disposed: AtomicBool,
}

impl SingleScheduler {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        let name = name.into();
        Self {
            worker: Worker::new(name.clone(), name.to_string()),
            name,
            disposed: AtomicBool::new(false),
        }
    }

    /// 尚未开始执行的任务数。
    pub fn pending(&self) -> usize {
        self.worker.pending()
    }
}

impl Scheduler for SingleScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self, task: Task, delay: Option<Duration>) -> Result<CancelHandle, SchedulerError> {
        if self.is_disposed() {
            return Err(SchedulerError::Disposed {
                scheduler: self.name.clone(),
            });
        }
        let (job, handle) = Job::new(task);
        self.worker.submit(job, delay)?;
        Ok(handle)
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            tracing::debug!(scheduler = %self.name, "scheduler disposed");
            self.worker.shutdown();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for SingleScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}
