//! 需求协议的性质验证。
//!
//! # 教案式说明
//! - **核心目标（Why）**：示例测试只覆盖挑选过的需求序列；这里用 Proptest 生成任意的
//!   “请求额度序列 + 源长度”组合，验证背压与重塑阶段的计数性质在所有组合下都成立。
//! - **性质（What）**：
//!   1. 任一时刻已投递元素数不超过累计请求额度，且恰为 `min(累计额度, 源长度)`；
//!   2. `buffer(k)` 产生 `ceil(L / k)` 批，除最后一批外都满 `k` 个，拼接后还原原序列；
//!   3. `take(n)` 投递 `min(n, L)` 个元素，并在满足后完成；
//!   4. `limit_rate(n)` 向上游的单次请求额度从不超过 `n`。

use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;
use spark_flux::{flux::Flux, testing::TestSubscriber};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_delivery_never_exceeds_requested_demand(
        len in 0u64..200,
        requests in prop::collection::vec(0u64..20, 0..16),
    ) {
        let probe = TestSubscriber::new();
        Flux::range(0, len).subscribe(probe.clone());
        prop_assert_eq!(probe.value_count(), 0);

        let mut requested = 0u64;
        for n in requests {
            probe.request(n);
            requested += n;
            let delivered = probe.value_count() as u64;
            prop_assert!(delivered <= requested);
            prop_assert_eq!(delivered, requested.min(len));
        }
        if requested >= len {
            prop_assert!(probe.is_completed());
        }
        prop_assert_eq!(probe.late_signals(), 0);
    }

    #[test]
    fn prop_buffer_batches_cover_the_source(len in 0u64..120, size in 1usize..12) {
        let batches = Flux::range(0, len).buffer(size).collect_blocking().unwrap();
        let expected_batches = (len as usize).div_ceil(size);
        prop_assert_eq!(batches.len(), expected_batches);
        if let Some((last, full)) = batches.split_last() {
            prop_assert!(full.iter().all(|batch| batch.len() == size));
            let tail = len as usize % size;
            prop_assert_eq!(last.len(), if tail == 0 { size } else { tail });
        }
        let flattened: Vec<i64> = batches.into_iter().flatten().collect();
        prop_assert_eq!(flattened, (0..len as i64).collect::<Vec<_>>());
    }

    #[test]
    fn prop_take_stops_at_the_limit(len in 0u64..100, limit in 0u64..120) {
        let probe = TestSubscriber::unbounded();
        Flux::range(0, len).take(limit).subscribe(probe.clone());
        prop_assert_eq!(probe.value_count() as u64, len.min(limit));
        prop_assert!(probe.is_completed());
    }

    #[test]
    fn prop_limit_rate_caps_every_upstream_request(len in 1u64..300, rate in 1usize..40) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();
        let values = Flux::range(0, len)
            .do_on_request(move |n| recorded.lock().push(n))
            .limit_rate(rate)
            .collect_blocking()
            .unwrap();
        prop_assert_eq!(values.len() as u64, len);
        let requests = requests.lock();
        prop_assert!(!requests.is_empty());
        prop_assert!(requests.iter().all(|&n| n >= 1 && n <= rate as u64));
    }
}
