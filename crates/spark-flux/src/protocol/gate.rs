use std::sync::atomic::{AtomicUsize, Ordering};

/// 非阻塞的“工作进行中”（WIP）排空闸门。
///
/// # 教案式说明
/// - **意图（Why）**：同一订阅上的投递必须串行，但生产者、请求方、取消方可能同时触发排空；
///   用阻塞锁会让生产线程在慢消费者上停顿，因此改用计数闸门：
///   第一个把计数从 0 抬起的线程成为排空者，其余线程只登记一次“错过”即返回。
/// - **契约（What）**：
///   - [`DrainGate::enter`] 返回 `true` 表示调用方获得排空权，必须随后循环调用 [`DrainGate::leave`]
///     直到其返回 0；
///   - 排空者每轮结束时以已处理的错过次数调用 `leave`，返回值非零说明期间有新的触发，需要再跑一轮。
/// - **用法（How）**：
///   ```
///   use spark_flux::protocol::DrainGate;
///
///   let gate = DrainGate::new();
///   if gate.enter() {
///       let mut missed = 1;
///       loop {
///           // ... 投递当前可投递的全部信号 ...
///           missed = gate.leave(missed);
///           if missed == 0 {
///               break;
///           }
///       }
///   }
///   assert!(!gate.is_draining());
///   ```
#[derive(Debug, Default)]
pub struct DrainGate {
    wip: AtomicUsize,
}

impl DrainGate {
    pub const fn new() -> Self {
        Self {
            wip: AtomicUsize::new(0),
        }
    }

    /// 尝试获取排空权。
    pub fn enter(&self) -> bool {
        self.wip.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// 归还本轮处理掉的错过次数，返回剩余次数。
    pub fn leave(&self, missed: usize) -> usize {
        self.wip.fetch_sub(missed, Ordering::AcqRel) - missed
    }

    /// 是否有线程正在排空。
    pub fn is_draining(&self) -> bool {
        self.wip.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrant_entries_are_counted_as_missed() {
        let gate = DrainGate::new();
        assert!(gate.enter());
        assert!(!gate.enter());
        assert!(!gate.enter());
        assert_eq!(gate.leave(1), 2);
        assert_eq!(gate.leave(2), 0);
        assert!(gate.enter());
        assert_eq!(gate.leave(1), 0);
    }
}
