//! 内核默认参数的配置入口。
//!
//! # 设计背景（Why）
//! - 调度器容量、预取大小、补货比例、退避上限等参数需要在部署时按负载调整，
//!   因此集中为一份可由 TOML 反序列化的结构，缺省字段回落到文档约定的默认值；
//! - 解析后统一执行校验，把“零容量”“比例越界”等错误在启动期暴露，而不是运行期静默退化。
//!
//! # 使用方式（How）
//! ```
//! use spark_flux::config::FluxConfig;
//!
//! let cfg = FluxConfig::from_toml_str(
//!     r#"
//!     [bounded_elastic]
//!     max_threads = 4
//!     queue_capacity = 16
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(cfg.bounded_elastic.max_threads, 4);
//! assert_eq!(cfg.pipeline.prefetch, 256);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// `[pipeline] prefetch` 的默认值：`group_by` 与谓词窗口向上游预取的额度。
pub const DEFAULT_PREFETCH: usize = 256;
/// `publish_on`、`flat_map` 内层订阅使用的小预取量。
pub const DEFAULT_SMALL_PREFETCH: usize = 32;
/// 默认补货比例：消费掉预取量的 75% 后再向上游补货。
pub const DEFAULT_REPLENISH_RATIO: f64 = 0.75;
/// 有界弹性池的默认排队上限。
pub const DEFAULT_ELASTIC_QUEUE_CAPACITY: usize = 100_000;
/// 有界弹性池的默认空闲回收时间。
pub const DEFAULT_ELASTIC_IDLE_TTL: Duration = Duration::from_secs(60);

/// 硬件并行度；无法探测时回落为 1。
pub fn hardware_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// 顶层配置。
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FluxConfig {
    pub bounded_elastic: BoundedElasticConfig,
    pub parallel: ParallelConfig,
    pub pipeline: PipelineConfig,
    pub retry: RetryConfig,
}

impl FluxConfig {
    /// 解析 TOML 文本并校验。
    ///
    /// # Errors
    /// - 语法错误返回 [`ConfigError::Parse`]；
    /// - 字段越界返回 [`ConfigError::Invalid`]。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: FluxConfig =
            toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 校验全部字段。
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bounded_elastic.validate()?;
        self.parallel.validate()?;
        self.pipeline.validate()?;
        self.retry.validate()
    }
}

/// 有界弹性池参数。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BoundedElasticConfig {
    /// 线程上限，默认硬件并行度 × 10。
    pub max_threads: usize,
    /// 线程全忙时允许排队的任务数。
    pub queue_capacity: usize,
    /// 空闲线程被回收前的存活时间（毫秒）。
    pub idle_ttl_ms: u64,
    /// 回收任务的巡检周期（毫秒）；缺省为 `idle_ttl_ms / 2`，最小 10 毫秒。
    pub eviction_interval_ms: Option<u64>,
}

impl Default for BoundedElasticConfig {
    fn default() -> Self {
        Self {
            max_threads: hardware_parallelism() * 10,
            queue_capacity: DEFAULT_ELASTIC_QUEUE_CAPACITY,
            idle_ttl_ms: DEFAULT_ELASTIC_IDLE_TTL.as_millis() as u64,
            eviction_interval_ms: None,
        }
    }
}

impl BoundedElasticConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    pub fn eviction_interval(&self) -> Duration {
        let millis = self
            .eviction_interval_ms
            .unwrap_or(self.idle_ttl_ms / 2)
            .max(10);
        Duration::from_millis(millis)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "bounded_elastic.max_threads",
                reason: "must be at least 1".into(),
            });
        }
        if self.idle_ttl_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "bounded_elastic.idle_ttl_ms",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// 固定并行池参数。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ParallelConfig {
    pub workers: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            workers: hardware_parallelism(),
        }
    }
}

impl ParallelConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "parallel.workers",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// 算子流水线参数。
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// `group_by_configured`、`window_*_configured` 向上游预取的额度。
    pub prefetch: usize,
    /// `publish_on_configured` 与 `flat_map` 子流的预取量。
    pub small_prefetch: usize,
    /// 消费掉预取量的多少比例后补货，取值 `(0, 1]`。
    pub replenish_ratio: f64,
    pub flat_map_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prefetch: DEFAULT_PREFETCH,
            small_prefetch: DEFAULT_SMALL_PREFETCH,
            replenish_ratio: DEFAULT_REPLENISH_RATIO,
            flat_map_concurrency: DEFAULT_PREFETCH,
        }
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch == 0 || self.small_prefetch == 0 || self.flat_map_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline",
                reason: "prefetch sizes and concurrency must be positive".into(),
            });
        }
        if !(self.replenish_ratio > 0.0 && self.replenish_ratio <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "pipeline.replenish_ratio",
                reason: "must lie in (0, 1]".into(),
            });
        }
        Ok(())
    }
}

/// 重试退避的全局默认值。
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_backoff_ms: Option<u64>,
    pub jitter: f64,
}

impl RetryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid {
                field: "retry.jitter",
                reason: "must lie in [0, 1]".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = FluxConfig::from_toml_str("").expect("empty config is valid");
        assert_eq!(cfg, FluxConfig::default());
        assert_eq!(cfg.bounded_elastic.queue_capacity, 100_000);
        assert_eq!(cfg.bounded_elastic.idle_ttl(), Duration::from_secs(60));
        assert_eq!(cfg.bounded_elastic.eviction_interval(), Duration::from_secs(30));
    }

    #[test]
    fn ratio_out_of_range_is_rejected() {
        let err = FluxConfig::from_toml_str("[pipeline]\nreplenish_ratio = 1.5\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "pipeline.replenish_ratio",
                ..
            }
        ));
    }

    #[test]
    fn unknown_keys_fail_parsing() {
        let err = FluxConfig::from_toml_str("[parallel]\nthreads = 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
