use std::{
    borrow::Cow,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use crate::{
    config::ParallelConfig,
    error::SchedulerError,
    scheduler::{CancelHandle, Job, Scheduler, Task, worker::Worker},
};

/// 固定 N 个工作线程、轮询分派的并行池。
///
/// # 契约说明（What）
/// - 任务按提交顺序轮流分配给各工作线程，同一工作线程上的任务串行执行；
/// - 只适合短小的 CPU 密集任务：任何阻塞都会让同一工作线程上排队的任务一起等待，
///   阻塞型任务应提交给 [`BoundedElasticScheduler`](super::BoundedElasticScheduler)。
pub struct ParallelScheduler {
    name: Cow<'static, str>,
    workers: Vec<Worker>,
    next: AtomicUsize,
    disposed: AtomicBool,
}

impl ParallelScheduler {
    /// 以 `workers` 个线程构造；0 按 1 处理。
    pub fn new(name: impl Into<Cow<'static, str>>, workers: usize) -> Self {
        let name = name.into();
        let workers = (0..workers.max(1))
            .map(|index| Worker::new(name.clone(), format!("{name}-{index}")))
            .collect();
        Self {
            name,
            workers,
            next: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn from_config(name: impl Into<Cow<'static, str>>, config: &ParallelConfig) -> Self {
        Self::new(name, config.workers)
    }

    /// 工作线程数。
    pub fn workers(&self) -> usize {
        self.workers.len()
    }
}

impl Scheduler for ParallelScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self, task: Task, delay: Option<Duration>) -> Result<CancelHandle, SchedulerError> {
        if self.is_disposed() {
            return Err(SchedulerError::Disposed {
                scheduler: self.name.clone(),
            });
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let (job, handle) = Job::new(task);
        self.workers[index].submit(job, delay)?;
        Ok(handle)
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            tracing::debug!(scheduler = %self.name, "scheduler disposed");
            for worker in &self.workers {
                worker.shutdown();
            }
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for ParallelScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}
