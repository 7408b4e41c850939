use std::{
    borrow::Cow,
    cmp::Ordering,
    collections::{BinaryHeap, VecDeque},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{error::SchedulerError, scheduler::Job};

/// 单个常驻工作线程及其任务队列，[`SingleScheduler`](super::SingleScheduler) 与
/// [`ParallelScheduler`](super::ParallelScheduler) 共用。
///
/// # 实现（How）
/// - 就绪任务 FIFO 排队；延迟任务进入按到期时间排序的小顶堆，到期后转入就绪队列，
///   同一时刻到期的任务按提交顺序执行；
/// - 线程在第一次提交时惰性创建，创建失败以 `Saturated` 报告给提交方。
pub(crate) struct Worker {
    scheduler: Cow<'static, str>,
    thread_name: String,
    queue: Arc<WorkerQueue>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn new(scheduler: Cow<'static, str>, thread_name: String) -> Self {
        Self {
            queue: Arc::new(WorkerQueue::new(scheduler.clone())),
            scheduler,
            thread_name,
            thread: Mutex::new(None),
        }
    }

    pub(crate) fn submit(&self, job: Job, delay: Option<Duration>) -> Result<(), SchedulerError> {
        self.ensure_started()?;
        if self.queue.push(job, delay) {
            Ok(())
        } else {
            Err(SchedulerError::Disposed {
                scheduler: self.scheduler.clone(),
            })
        }
    }

    fn ensure_started(&self) -> Result<(), SchedulerError> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        let queue = self.queue.clone();
        let handle = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || queue.run())
            .map_err(|err| {
                tracing::warn!(scheduler = %self.scheduler, error = %err, "worker spawn failed");
                SchedulerError::Saturated {
                    scheduler: self.scheduler.clone(),
                    capacity: 0,
                }
            })?;
        tracing::debug!(scheduler = %self.scheduler, thread = %self.thread_name, "worker started");
        *thread = Some(handle);
        Ok(())
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// 停止线程并丢弃未开始的任务；在工作线程自身上调用时不等待其退出。
    pub(crate) fn shutdown(&self) {
        self.queue.shutdown();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

struct WorkerQueue {
    scheduler: Cow<'static, str>,
    state: Mutex<QueueState>,
    available: Condvar,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Job>,
    timed: BinaryHeap<Timed>,
    seq: u64,
    shutdown: bool,
}

struct Timed {
    due: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Timed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timed {}

impl PartialOrd for Timed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timed {
    // 反转比较以得到最早到期者位于堆顶的小顶堆。
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl WorkerQueue {
    fn new(scheduler: Cow<'static, str>) -> Self {
        Self {
            scheduler,
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
        }
    }

    fn push(&self, job: Job, delay: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        match delay {
            Some(delay) if !delay.is_zero() => {
                state.seq += 1;
                let seq = state.seq;
                state.timed.push(Timed {
                    due: Instant::now() + delay,
                    seq,
                    job,
                });
            }
            _ => state.ready.push_back(job),
        }
        self.available.notify_one();
        true
    }

    fn pending(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.timed.len()
    }

    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            promote_due(&mut state);
            if let Some(job) = state.ready.pop_front() {
                MutexGuard::unlocked(&mut state, || job.run(&self.scheduler));
                continue;
            }
            match state.timed.peek().map(|timed| timed.due) {
                Some(due) => {
                    self.available.wait_until(&mut state, due);
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.ready.clear();
        state.timed.clear();
        self.available.notify_all();
    }
}

fn promote_due(state: &mut QueueState) {
    let now = Instant::now();
    while state.timed.peek().is_some_and(|timed| timed.due <= now) {
        if let Some(timed) = state.timed.pop() {
            state.ready.push_back(timed.job);
        }
    }
}
