use crate::{config::DEFAULT_REPLENISH_RATIO, protocol::UNBOUNDED};

/// 自带内部队列的阶段向上游预取的额度与补货阈值。
///
/// # 契约说明（What）
/// - 订阅建立时立即向上游请求 `size` 个元素；
/// - 之后每消费满 `limit` 个元素，一次性向上游补请求 `limit` 个，而不是逐个补货；
/// - `size == usize::MAX` 表示无界预取：只请求一次 [`UNBOUNDED`]，此后不再补货。
///
/// # 默认值
/// - `limit` 默认为 `size` 的 75%（向上取整），与 `size - size / 4` 在常见取值下一致。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Prefetch {
    size: usize,
    limit: usize,
}

impl Prefetch {
    /// 无界预取。
    pub const UNBOUNDED: Prefetch = Prefetch {
        size: usize::MAX,
        limit: usize::MAX,
    };

    /// 以默认补货比例构造；`size` 为 0 时按 1 处理。
    pub fn new(size: usize) -> Self {
        Self::with_ratio(size, DEFAULT_REPLENISH_RATIO)
    }

    /// 以给定补货比例构造，比例被限制在 `(0, 1]`。
    pub fn with_ratio(size: usize, ratio: f64) -> Self {
        let size = size.max(1);
        if size == usize::MAX {
            return Self::UNBOUNDED;
        }
        let ratio = if ratio > 0.0 && ratio <= 1.0 {
            ratio
        } else {
            DEFAULT_REPLENISH_RATIO
        };
        let limit = ((size as f64) * ratio).ceil() as usize;
        Self {
            size,
            limit: limit.clamp(1, size),
        }
    }

    /// `limit_rate(high, low)` 的额度：`low == 0` 时消费满 `high` 才补货，
    /// `low >= high` 时回落到默认的 75%，其余情况以 `low` 为阈值。
    pub fn with_low_tide(high: usize, low: usize) -> Self {
        let high = high.max(1);
        if high == usize::MAX {
            return Self::UNBOUNDED;
        }
        match low {
            0 => Self {
                size: high,
                limit: high,
            },
            low if low >= high => Self::new(high),
            low => Self { size: high, limit: low },
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_unbounded(&self) -> bool {
        self.size == usize::MAX
    }

    /// 订阅时向上游请求的初始额度。
    pub fn initial_request(&self) -> u64 {
        if self.is_unbounded() {
            UNBOUNDED
        } else {
            self.size as u64
        }
    }

    pub fn replenisher(&self) -> Replenisher {
        Replenisher {
            consumed: 0,
            limit: self.limit as u64,
            unbounded: self.is_unbounded(),
        }
    }
}

/// 补货计数器：累计消费量达到阈值时给出应补请求的数量。
#[derive(Clone, Debug)]
pub struct Replenisher {
    consumed: u64,
    limit: u64,
    unbounded: bool,
}

impl Replenisher {
    /// 记录消费 `n` 个元素，达到阈值时返回应补请求的数量并清零。
    pub fn consumed(&mut self, n: u64) -> Option<u64> {
        if self.unbounded || n == 0 {
            return None;
        }
        self.consumed += n;
        if self.consumed >= self.limit {
            let amount = self.consumed;
            self.consumed = 0;
            Some(amount)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ratio_replenishes_at_three_quarters() {
        let prefetch = Prefetch::new(256);
        assert_eq!(prefetch.limit(), 192);
        let mut replenisher = prefetch.replenisher();
        assert_eq!(replenisher.consumed(191), None);
        assert_eq!(replenisher.consumed(1), Some(192));
        assert_eq!(replenisher.consumed(10), None);
    }

    #[test]
    fn low_tide_variants() {
        assert_eq!(Prefetch::with_low_tide(10, 0).limit(), 10);
        assert_eq!(Prefetch::with_low_tide(10, 10).limit(), 8);
        assert_eq!(Prefetch::with_low_tide(10, 3).limit(), 3);
        assert!(Prefetch::with_low_tide(usize::MAX, 5).is_unbounded());
        assert_eq!(Prefetch::UNBOUNDED.replenisher().consumed(1_000), None);
    }
}
