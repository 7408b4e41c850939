use std::time::Duration;

use crate::{
    error::SchedulerError,
    scheduler::{CancelHandle, Job, Scheduler, Task},
};

/// 在调用线程上同步执行任务的调度器。
///
/// - 任务在 `schedule` 返回前执行完毕，返回的句柄已处于完成状态；
/// - 任务 panic 与工作线程上的处理一致：被捕获并记录，不会展开到调用方；
/// - 带延迟的提交会让调用线程休眠相应时长；
/// - 不可释放，`dispose` 为空操作。
#[derive(Clone, Copy, Debug, Default)]
pub struct Immediate;

impl Scheduler for Immediate {
    fn name(&self) -> &str {
        "immediate"
    }

    fn schedule(&self, task: Task, delay: Option<Duration>) -> Result<CancelHandle, SchedulerError> {
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let (job, handle) = Job::new(task);
        job.run(self.name());
        Ok(handle)
    }

    fn dispose(&self) {}

    fn is_disposed(&self) -> bool {
        false
    }
}
