use std::sync::atomic::{AtomicU64, Ordering};

/// “无界需求”哨兵：累计请求一旦达到该值即视为无限，且不再递减。
pub const UNBOUNDED: u64 = u64::MAX;

/// 饱和加法：任一操作数为哨兵或溢出时返回 [`UNBOUNDED`]。
#[inline]
pub fn add_cap(current: u64, n: u64) -> u64 {
    current.saturating_add(n)
}

/// 某一时刻的需求快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Demand {
    /// 剩余的有限额度。
    Finite(u64),
    /// 无界需求。
    Unbounded,
}

impl Demand {
    /// 由原始计数值构造。
    pub const fn from_raw(raw: u64) -> Self {
        if raw == UNBOUNDED {
            Demand::Unbounded
        } else {
            Demand::Finite(raw)
        }
    }

    pub const fn is_unbounded(&self) -> bool {
        matches!(self, Demand::Unbounded)
    }

    /// 是否仍有可用额度。
    pub const fn has_demand(&self) -> bool {
        match self {
            Demand::Unbounded => true,
            Demand::Finite(remaining) => *remaining > 0,
        }
    }

    /// 有限额度返回剩余值，无界返回 `None`。
    pub const fn remaining(&self) -> Option<u64> {
        match self {
            Demand::Finite(value) => Some(*value),
            Demand::Unbounded => None,
        }
    }
}

/// 订阅持有的原子需求计数器。
///
/// # 教案式说明
/// - **意图（Why）**：`request` 可能来自任意线程，而消耗额度只发生在串行的排空路径上；
///   以 CAS 循环实现“累加饱和、消耗单调”的计数器，避免为计数加锁。
/// - **契约（What）**：
///   - [`DemandCounter::add`] 返回累加前的值，调用方可据此判断是否由自己发起排空（0 → n 的转换）；
///   - [`DemandCounter::produced`] 扣减已发射数量并返回剩余值，计数器处于无界状态时保持不变；
///   - 计数值永不为负：扣减超过剩余额度属于实现缺陷，在调试构建中触发断言，在发布构建中饱和到 0。
#[derive(Debug, Default)]
pub struct DemandCounter {
    value: AtomicU64,
}

impl DemandCounter {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// 当前原始计数。
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// 当前需求快照。
    pub fn demand(&self) -> Demand {
        Demand::from_raw(self.get())
    }

    /// 是否已处于无界状态。
    pub fn is_unbounded(&self) -> bool {
        self.get() == UNBOUNDED
    }

    /// 累加需求并返回累加前的值。
    pub fn add(&self, n: u64) -> u64 {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            let next = add_cap(current, n);
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return previous,
                Err(actual) => current = actual,
            }
        }
    }

    /// 扣减已发射数量，返回剩余值。
    pub fn produced(&self, n: u64) -> u64 {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            debug_assert!(n <= current, "produced {n} exceeds outstanding demand {current}");
            let next = current.saturating_sub(n);
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// 若仍有额度则消耗一个并返回 `true`。
    pub fn try_take_one(&self) -> bool {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return true;
            }
            if current == 0 {
                return false;
            }
            match self.value.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_accumulates_and_saturates() {
        let counter = DemandCounter::new();
        assert_eq!(counter.add(3), 0);
        assert_eq!(counter.add(4), 3);
        assert_eq!(counter.get(), 7);
        counter.add(u64::MAX - 2);
        assert!(counter.is_unbounded());
        assert_eq!(counter.produced(100), UNBOUNDED);
        assert!(counter.try_take_one());
        assert_eq!(counter.demand(), Demand::Unbounded);
    }

    #[test]
    fn produced_and_take_one_consume_finite_demand() {
        let counter = DemandCounter::new();
        assert!(!counter.try_take_one());
        counter.add(2);
        assert!(counter.try_take_one());
        assert_eq!(counter.produced(1), 0);
        assert!(!counter.demand().has_demand());
        assert_eq!(counter.demand().remaining(), Some(0));
    }
}
