//! 重试与退避策略。
//!
//! # 设计综述（Why）
//! - 重试阶段在上游失败时按策略重新订阅原始上游（冷流每次订阅都会从头生产），
//!   而不是复用已经终止的订阅；下游始终只看到一个订阅，未满足的需求跨越重试被完整继承；
//! - 策略以不可变的 [`RetrySpec`] 描述，构建器风格的方法返回新值，便于在多个流水线间共享。
//!
//! # 状态机（What）
//! `Subscribed → (Next)* → {Completed | Failed}`；`Failed` 时：
//! 1. 过滤器拒绝的错误原样传播，不做任何重试；
//! 2. 计数达到上限时以 [`FlowError::RetryExhausted`]（或 `on_retry_exhausted` 提供的错误）终止；
//! 3. 否则依次执行同步前置钩子、异步前置钩子（其完成信号到达后才继续）、退避等待、
//!    同步后置钩子、异步后置钩子，最后重新订阅上游。
//!
//! # 计数（What）
//! - `total_retries`：自首次订阅以来已经发生的重试次数，即本次失败之前的失败次数；
//! - `total_retries_in_a_row`：连续失败次数，一次尝试中只要投递过任意元素就清零；
//! - 上一次尝试从未投递元素时两者相等。

mod engine;

use std::{fmt, sync::Arc, time::Duration};

use libm::pow;

use crate::{config::RetryConfig, error::FlowError, flux::Flux, scheduler::SchedulerRef};

pub(crate) use engine::RetryPublisher;

/// 指数退避未配置上限时使用的封顶值。
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// 触发重试决策的失败快照。
#[derive(Clone, Debug)]
pub struct RetrySignal {
    total_retries: u64,
    total_retries_in_a_row: u64,
    failure: FlowError,
}

impl RetrySignal {
    pub fn new(total_retries: u64, total_retries_in_a_row: u64, failure: FlowError) -> Self {
        Self {
            total_retries,
            total_retries_in_a_row,
            failure,
        }
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries
    }

    pub fn total_retries_in_a_row(&self) -> u64 {
        self.total_retries_in_a_row
    }

    pub fn failure(&self) -> &FlowError {
        &self.failure
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Backoff {
    Immediate,
    Fixed(Duration),
    Exponential {
        min: Duration,
        max: Duration,
        jitter: f64,
    },
}

type SignalHook = Arc<dyn Fn(&RetrySignal) + Send + Sync>;
type AsyncHook = Arc<dyn Fn(&RetrySignal) -> Flux<()> + Send + Sync>;
type ErrorFilter = Arc<dyn Fn(&FlowError) -> bool + Send + Sync>;
type ExhaustedFn = Arc<dyn Fn(&RetrySignal) -> FlowError + Send + Sync>;

/// 重试策略。
///
/// # 示例
/// ```
/// use std::time::Duration;
/// use spark_flux::retry::{RetrySignal, RetrySpec};
/// use spark_flux::error::FlowError;
///
/// let spec = RetrySpec::backoff(5, Duration::from_millis(100)).max_backoff(Duration::from_millis(300));
/// let signal = |n| RetrySignal::new(n, n, FlowError::message("boom"));
/// assert_eq!(spec.delay_for(&signal(0)), Duration::from_millis(100));
/// assert_eq!(spec.delay_for(&signal(1)), Duration::from_millis(200));
/// assert_eq!(spec.delay_for(&signal(2)), Duration::from_millis(300));
/// ```
#[derive(Clone)]
pub struct RetrySpec {
    max_attempts: u64,
    in_a_row: bool,
    backoff: Backoff,
    filter: Option<ErrorFilter>,
    before: Vec<SignalHook>,
    after: Vec<SignalHook>,
    before_async: Option<AsyncHook>,
    after_async: Option<AsyncHook>,
    on_exhausted: Option<ExhaustedFn>,
    scheduler: Option<SchedulerRef>,
}

impl RetrySpec {
    fn with_backoff(max_attempts: u64, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            in_a_row: false,
            backoff,
            filter: None,
            before: Vec::new(),
            after: Vec::new(),
            before_async: None,
            after_async: None,
            on_exhausted: None,
            scheduler: None,
        }
    }

    /// 至多重试 `n` 次，立即重新订阅。
    pub fn max(n: u64) -> Self {
        Self::with_backoff(n, Backoff::Immediate)
    }

    /// 连续失败至多 `n` 次；投递过元素的尝试会清零计数。
    pub fn max_in_a_row(n: u64) -> Self {
        Self::max(n).transient_errors(true)
    }

    /// 每次重试前等待固定时长。
    pub fn fixed_delay(n: u64, delay: Duration) -> Self {
        Self::with_backoff(n, Backoff::Fixed(delay))
    }

    /// 指数退避：第 `k` 次重试等待 `min * 2^k`，不超过上限。
    pub fn backoff(n: u64, min: Duration) -> Self {
        Self::with_backoff(
            n,
            Backoff::Exponential {
                min,
                max: DEFAULT_MAX_BACKOFF,
                jitter: 0.0,
            },
        )
    }

    /// 指数退避的上限；对非指数策略无效。
    pub fn max_backoff(mut self, max: Duration) -> Self {
        if let Backoff::Exponential { max: slot, .. } = &mut self.backoff {
            *slot = max;
        }
        self
    }

    /// 抖动系数，限制在 `[0, 1]`：实际等待在 `delay * (1 ± jitter)` 内浮动，且不越过上下限。
    pub fn jitter(mut self, factor: f64) -> Self {
        if let Backoff::Exponential { jitter, .. } = &mut self.backoff {
            *jitter = factor.clamp(0.0, 1.0);
        }
        self
    }

    /// 以配置中的退避上限与抖动覆盖当前值。
    pub fn with_config(self, config: &RetryConfig) -> Self {
        let spec = self.jitter(config.jitter);
        match config.max_backoff_ms {
            Some(ms) => spec.max_backoff(Duration::from_millis(ms)),
            None => spec,
        }
    }

    /// 只有谓词接受的错误才会触发重试。
    pub fn filter(mut self, predicate: impl Fn(&FlowError) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(predicate));
        self
    }

    /// 为真时按连续失败次数计数。
    pub fn transient_errors(mut self, enabled: bool) -> Self {
        self.in_a_row = enabled;
        self
    }

    pub fn do_before_retry(mut self, hook: impl Fn(&RetrySignal) + Send + Sync + 'static) -> Self {
        self.before.push(Arc::new(hook));
        self
    }

    pub fn do_after_retry(mut self, hook: impl Fn(&RetrySignal) + Send + Sync + 'static) -> Self {
        self.after.push(Arc::new(hook));
        self
    }

    /// 重试前订阅钩子返回的流，直到它完成才继续；它出错时以该错误终止。
    pub fn do_before_retry_async(
        mut self,
        hook: impl Fn(&RetrySignal) -> Flux<()> + Send + Sync + 'static,
    ) -> Self {
        self.before_async = Some(Arc::new(hook));
        self
    }

    pub fn do_after_retry_async(
        mut self,
        hook: impl Fn(&RetrySignal) -> Flux<()> + Send + Sync + 'static,
    ) -> Self {
        self.after_async = Some(Arc::new(hook));
        self
    }

    /// 自定义耗尽时交给下游的错误。
    pub fn on_retry_exhausted(
        mut self,
        f: impl Fn(&RetrySignal) -> FlowError + Send + Sync + 'static,
    ) -> Self {
        self.on_exhausted = Some(Arc::new(f));
        self
    }

    /// 退避计时所用的调度器，缺省为共享并行池。
    pub fn scheduler(mut self, scheduler: SchedulerRef) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn max_attempts(&self) -> u64 {
        self.max_attempts
    }

    pub fn is_transient(&self) -> bool {
        self.in_a_row
    }

    /// 策略是否接受该错误。
    pub fn accepts(&self, error: &FlowError) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(error))
    }

    /// 该信号是否已达到重试上限。
    pub fn is_exhausted(&self, signal: &RetrySignal) -> bool {
        self.attempt_index(signal) >= self.max_attempts
    }

    fn attempt_index(&self, signal: &RetrySignal) -> u64 {
        if self.in_a_row {
            signal.total_retries_in_a_row
        } else {
            signal.total_retries
        }
    }

    /// 耗尽时交给下游的错误。
    pub fn exhausted_error(&self, signal: &RetrySignal) -> FlowError {
        match &self.on_exhausted {
            Some(f) => f(signal),
            None => FlowError::RetryExhausted {
                retries: self.max_attempts,
                source: Box::new(signal.failure.clone()),
            },
        }
    }

    /// 本次重试前的退避时长。
    pub fn delay_for(&self, signal: &RetrySignal) -> Duration {
        match self.backoff {
            Backoff::Immediate => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { min, max, jitter } => {
                let iteration = self.attempt_index(signal);
                exponential(min, max, jitter, iteration)
            }
        }
    }
}

impl fmt::Debug for RetrySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrySpec")
            .field("max_attempts", &self.max_attempts)
            .field("in_a_row", &self.in_a_row)
            .field("backoff", &self.backoff)
            .field("filtered", &self.filter.is_some())
            .finish_non_exhaustive()
    }
}

/// `min * 2^iteration`，封顶 `max`，再叠加确定性抖动并夹回 `[min, max]`；以纳秒为单位计算。
fn exponential(min: Duration, max: Duration, jitter: f64, iteration: u64) -> Duration {
    let min_nanos = min.as_nanos() as f64;
    let max_nanos = (max.as_nanos() as f64).max(min_nanos);
    let raw = min_nanos * pow(2.0, iteration as f64);
    let capped = if raw.is_finite() {
        raw.min(max_nanos)
    } else {
        max_nanos
    };
    let wait = if jitter > 0.0 {
        let offset = capped * jitter;
        let unit = unit_interval(iteration ^ capped.to_bits());
        (capped + offset * (unit * 2.0 - 1.0)).clamp(min_nanos, max_nanos)
    } else {
        capped
    };
    let nanos = wait.round();
    if nanos >= u64::MAX as f64 {
        max
    } else {
        Duration::from_nanos(nanos as u64)
    }
}

fn unit_interval(seed: u64) -> f64 {
    let mantissa = (mix64(seed) >> 11) as f64;
    mantissa / ((1u64 << 53) as f64)
}

fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(total: u64, in_a_row: u64) -> RetrySignal {
        RetrySignal::new(total, in_a_row, FlowError::message("boom"))
    }

    #[test]
    fn exhaustion_counts_total_or_consecutive_retries() {
        let flat = RetrySpec::max(2);
        assert!(!flat.is_exhausted(&signal(1, 0)));
        assert!(flat.is_exhausted(&signal(2, 0)));

        let transient = RetrySpec::max_in_a_row(2);
        assert!(!transient.is_exhausted(&signal(7, 1)));
        assert!(transient.is_exhausted(&signal(7, 2)));
    }

    #[test]
    fn jittered_backoff_stays_within_bounds() {
        let min = Duration::from_millis(10);
        let max = Duration::from_millis(80);
        let spec = RetrySpec::backoff(10, min).max_backoff(max).jitter(0.5);
        for n in 0..10 {
            let delay = spec.delay_for(&signal(n, n));
            assert!(delay >= min && delay <= max, "{delay:?} out of range");
        }
    }

    #[test]
    fn huge_iterations_saturate_at_the_cap() {
        let spec = RetrySpec::backoff(u64::MAX, Duration::from_secs(1));
        assert_eq!(spec.delay_for(&signal(5_000, 5_000)), DEFAULT_MAX_BACKOFF);
    }

    #[test]
    fn config_overrides_cap_and_jitter() {
        let config = RetryConfig {
            max_backoff_ms: Some(50),
            jitter: 0.0,
        };
        let spec = RetrySpec::backoff(3, Duration::from_millis(40)).with_config(&config);
        assert_eq!(spec.delay_for(&signal(2, 2)), Duration::from_millis(50));
    }

    #[test]
    fn filter_and_exhausted_error() {
        let spec = RetrySpec::max(1).filter(|e| e.is_upstream());
        assert!(spec.accepts(&FlowError::message("x")));
        assert!(!spec.accepts(&FlowError::Timeout {
            after: Duration::from_secs(1)
        }));
        let exhausted = spec.exhausted_error(&signal(1, 1));
        assert!(matches!(exhausted, FlowError::RetryExhausted { retries: 1, .. }));
    }
}
