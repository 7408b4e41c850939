use std::{
    borrow::Cow,
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    config::{BoundedElasticConfig, DEFAULT_ELASTIC_IDLE_TTL, DEFAULT_ELASTIC_QUEUE_CAPACITY},
    error::SchedulerError,
    scheduler::{CancelHandle, Job, Scheduler, Task},
};

/// 按需扩容、空闲回收的有界线程池，面向阻塞型任务。
///
/// # 教案式说明
/// - **意图（Why）**：阻塞 I/O 不能占用固定并行池的少量线程，但无限制地创建线程同样危险；
///   本池在上限内按需创建线程，超出线程上限的任务进入有界队列，队列也满时以
///   [`SchedulerError::Saturated`] 拒绝，由调用方决定降级策略。
/// - **契约（What）**：
///   - 同时在运行与排队的任务总数不超过 `max_threads + queue_capacity`；
///   - 延迟任务的延迟从某个工作线程取到它开始计时，排队时间不计入延迟；
///   - 空闲超过 `idle_ttl` 的工作线程由池自有的回收线程周期性淘汰；
///   - `dispose` 丢弃排队任务、停止回收线程，正在运行的任务执行完毕后其线程退出。
/// - **实现（How）**：
///   - 单把互斥锁保护队列与线程账本；`idle` 记录正在等待任务的线程数，
///     排队任务数超过空闲线程数且未达上限时创建新线程；
///   - 被标记淘汰的线程若醒来时发现队列非空，会先处理任务，避免任务因淘汰而滞留。
pub struct BoundedElasticScheduler {
    inner: Arc<ElasticInner>,
}

struct ElasticInner {
    name: Cow<'static, str>,
    max_threads: usize,
    queue_capacity: usize,
    idle_ttl: Duration,
    eviction_interval: Duration,
    state: Mutex<ElasticState>,
    work: Condvar,
    evictor_wake: Condvar,
}

#[derive(Default)]
struct ElasticState {
    queue: VecDeque<(Job, Option<Duration>)>,
    live: usize,
    idle: usize,
    busy: usize,
    next_id: usize,
    idle_since: HashMap<usize, Instant>,
    retire: HashSet<usize>,
    evictor: Option<JoinHandle<()>>,
    disposed: bool,
}

impl BoundedElasticScheduler {
    /// 以默认排队上限与空闲时间构造。
    pub fn new(name: impl Into<Cow<'static, str>>, max_threads: usize) -> Self {
        Self::with_limits(
            name,
            max_threads,
            DEFAULT_ELASTIC_QUEUE_CAPACITY,
            DEFAULT_ELASTIC_IDLE_TTL,
        )
    }

    pub fn with_limits(
        name: impl Into<Cow<'static, str>>,
        max_threads: usize,
        queue_capacity: usize,
        idle_ttl: Duration,
    ) -> Self {
        let eviction_interval = (idle_ttl / 2).max(Duration::from_millis(10));
        Self::build(name.into(), max_threads, queue_capacity, idle_ttl, eviction_interval)
    }

    pub fn from_config(name: impl Into<Cow<'static, str>>, config: &BoundedElasticConfig) -> Self {
        Self::build(
            name.into(),
            config.max_threads,
            config.queue_capacity,
            config.idle_ttl(),
            config.eviction_interval(),
        )
    }

    fn build(
        name: Cow<'static, str>,
        max_threads: usize,
        queue_capacity: usize,
        idle_ttl: Duration,
        eviction_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ElasticInner {
                name,
                max_threads: max_threads.max(1),
                queue_capacity,
                idle_ttl,
                eviction_interval,
                state: Mutex::new(ElasticState::default()),
                work: Condvar::new(),
                evictor_wake: Condvar::new(),
            }),
        }
    }

    /// 当前存活的工作线程数。
    pub fn live_workers(&self) -> usize {
        self.inner.state.lock().live
    }

    /// 正在执行（含等待延迟到期）的任务数。
    pub fn busy_workers(&self) -> usize {
        self.inner.state.lock().busy
    }

    /// 排队中的任务数。
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// 运行与排队任务的总容量。
    pub fn capacity(&self) -> usize {
        self.inner.max_threads.saturating_add(self.inner.queue_capacity)
    }
}

impl Scheduler for BoundedElasticScheduler {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn schedule(&self, task: Task, delay: Option<Duration>) -> Result<CancelHandle, SchedulerError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.disposed {
            return Err(SchedulerError::Disposed {
                scheduler: inner.name.clone(),
            });
        }
        let capacity = self.capacity();
        if state.busy + state.queue.len() >= capacity {
            tracing::warn!(scheduler = %inner.name, capacity, "bounded elastic pool saturated");
            return Err(SchedulerError::Saturated {
                scheduler: inner.name.clone(),
                capacity,
            });
        }

        let (job, handle) = Job::new(task);
        state.queue.push_back((job, delay));
        if state.queue.len() > state.idle && state.live < inner.max_threads {
            if let Err(err) = spawn_worker(inner, &mut state) {
                state.queue.pop_back();
                tracing::warn!(scheduler = %inner.name, error = %err, "worker spawn failed");
                return Err(SchedulerError::Saturated {
                    scheduler: inner.name.clone(),
                    capacity,
                });
            }
        } else {
            inner.work.notify_one();
        }
        Ok(handle)
    }

    fn dispose(&self) {
        let evictor = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.queue.clear();
            self.inner.work.notify_all();
            self.inner.evictor_wake.notify_all();
            state.evictor.take()
        };
        tracing::debug!(scheduler = %self.inner.name, "scheduler disposed");
        if let Some(evictor) = evictor {
            let _ = evictor.join();
        }
    }

    fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }
}

impl Drop for BoundedElasticScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn spawn_worker(inner: &Arc<ElasticInner>, state: &mut ElasticState) -> std::io::Result<()> {
    let id = state.next_id;
    let worker_inner = inner.clone();
    thread::Builder::new()
        .name(format!("{}-{id}", inner.name))
        .spawn(move || worker_loop(worker_inner, id))?;
    state.next_id += 1;
    state.live += 1;
    tracing::debug!(scheduler = %inner.name, worker = id, live = state.live, "elastic worker spawned");

    if state.evictor.is_none() {
        let evictor_inner = inner.clone();
        match thread::Builder::new()
            .name(format!("{}-evictor", inner.name))
            .spawn(move || evictor_loop(evictor_inner))
        {
            Ok(handle) => state.evictor = Some(handle),
            Err(err) => {
                tracing::warn!(scheduler = %inner.name, error = %err, "idle eviction disabled")
            }
        }
    }
    Ok(())
}

fn worker_loop(inner: Arc<ElasticInner>, id: usize) {
    let mut state = inner.state.lock();
    loop {
        if state.disposed {
            break;
        }
        if let Some((job, delay)) = state.queue.pop_front() {
            state.busy += 1;
            state.idle_since.remove(&id);
            state.retire.remove(&id);
            MutexGuard::unlocked(&mut state, || {
                if let Some(delay) = delay {
                    if !job.handle().sleep(delay) {
                        return;
                    }
                }
                job.run(&inner.name);
            });
            state.busy -= 1;
            continue;
        }
        if state.retire.remove(&id) {
            break;
        }
        state.idle_since.entry(id).or_insert_with(Instant::now);
        state.idle += 1;
        inner.work.wait(&mut state);
        state.idle -= 1;
    }
    state.live -= 1;
    state.idle_since.remove(&id);
    state.retire.remove(&id);
    tracing::debug!(scheduler = %inner.name, worker = id, live = state.live, "elastic worker exited");
}

fn evictor_loop(inner: Arc<ElasticInner>) {
    let mut state = inner.state.lock();
    loop {
        inner
            .evictor_wake
            .wait_for(&mut state, inner.eviction_interval);
        if state.disposed {
            break;
        }
        let now = Instant::now();
        let expired: Vec<usize> = state
            .idle_since
            .iter()
            .filter(|(_, since)| now.duration_since(**since) >= inner.idle_ttl)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            continue;
        }
        for id in expired {
            state.idle_since.remove(&id);
            state.retire.insert(id);
        }
        inner.work.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn idle_workers_are_evicted() {
        let pool = BoundedElasticScheduler::with_limits("evict-test", 2, 4, Duration::from_millis(40));
        let (tx, rx) = mpsc::channel();
        pool.schedule(Box::new(move || tx.send(()).unwrap_or(())), None)
            .expect("accepted");
        rx.recv_timeout(Duration::from_secs(2)).expect("task ran");
        assert_eq!(pool.live_workers(), 1);

        let deadline = Instant::now() + Duration::from_secs(3);
        while pool.live_workers() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.live_workers(), 0);
        pool.dispose();
    }
}
