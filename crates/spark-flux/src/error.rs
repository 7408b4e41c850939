//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为响应式内核对外暴露的错误语义提供集中定义：流级终止错误、调度器容量错误、汇点发射错误、配置错误；
//! - 区分“作为终止信号沿订阅链传播一次”的 [`FlowError`] 与“以返回值同步告知调用方”的
//!   [`SchedulerError`]/[`EmitError`]，避免把可恢复的局部状况伪装成流错误。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，并满足 `Clone + Send + Sync + 'static`，可在线程间复制投递；
//! - 领域错误通过 `Arc<dyn Error>` 承载，保证 `Clone` 不要求底层错误可克隆。

use std::{borrow::Cow, error::Error as StdError, fmt, sync::Arc, time::Duration};

use thiserror::Error;

/// 流级错误：沿订阅链以终止信号 `on_error` 的形式传播，且每个订阅恰好传播一次。
///
/// # 教案式说明
/// - **意图（Why）**：流的错误类型在整个内核内统一为一个枚举，使算子无需额外的错误类型参数即可组合；
///   业务错误经 [`FlowError::upstream`] 包装后原样透传。
/// - **契约（What）**：
///   - `Upstream`：生产者抛出的领域错误，算子按各自语义透传或转换；
///   - `ProtocolViolation`：阶段实现违反需求协议（超额发射等），属于实现缺陷；
///   - `SchedulerSaturated`/`SchedulerDisposed`：调度切换点提交任务失败后转化而来的终止错误；
///   - `RetryExhausted`：重试策略耗尽，包装最后一次上游错误；
///   - `TooManySubscribers`：单播汇点的第二个订阅者收到的错误；
///   - `Timeout`：阻塞桥接在限定时间内未等到终止信号。
/// - **权衡（Trade-offs）**：`Upstream` 使用 `Arc` 共享，多播场景下向多个消费者复制错误只增加引用计数。
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum FlowError {
    #[error("upstream error: {0}")]
    Upstream(Arc<dyn StdError + Send + Sync + 'static>),

    #[error("protocol violation in `{stage}`: {detail}")]
    ProtocolViolation {
        stage: Cow<'static, str>,
        detail: Cow<'static, str>,
    },

    #[error("scheduler `{scheduler}` saturated (capacity {capacity})")]
    SchedulerSaturated {
        scheduler: Cow<'static, str>,
        capacity: usize,
    },

    #[error("scheduler `{scheduler}` has been disposed")]
    SchedulerDisposed { scheduler: Cow<'static, str> },

    #[error("retries exhausted after {retries} attempt(s)")]
    RetryExhausted {
        retries: u64,
        #[source]
        source: Box<FlowError>,
    },

    #[error("sink `{sink}` allows only one subscriber")]
    TooManySubscribers { sink: Cow<'static, str> },

    #[error("no terminal signal within {after:?}")]
    Timeout { after: Duration },
}

impl FlowError {
    /// 包装任意领域错误为 `Upstream`。
    pub fn upstream<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        FlowError::Upstream(Arc::new(err))
    }

    /// 以纯文本构造领域错误，常用于测试与示例。
    pub fn message(msg: impl Into<Cow<'static, str>>) -> Self {
        FlowError::Upstream(Arc::new(MessageError(msg.into())))
    }

    pub(crate) fn protocol(
        stage: impl Into<Cow<'static, str>>,
        detail: impl Into<Cow<'static, str>>,
    ) -> Self {
        FlowError::ProtocolViolation {
            stage: stage.into(),
            detail: detail.into(),
        }
    }

    /// 是否为业务领域错误。
    pub fn is_upstream(&self) -> bool {
        matches!(self, FlowError::Upstream(_))
    }

    /// 是否为重试耗尽错误。
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, FlowError::RetryExhausted { .. })
    }

    /// 剥离 `RetryExhausted` 包装，返回触发耗尽的最后一个错误；其他变体返回自身。
    pub fn root(&self) -> &FlowError {
        match self {
            FlowError::RetryExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}

/// 纯文本领域错误的载体。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageError(pub Cow<'static, str>);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for MessageError {}

/// 调度器提交失败的原因，始终同步返回给 `schedule` 的调用方，不会被静默丢弃。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchedulerError {
    /// 线程与排队容量均已耗尽。
    #[error("scheduler `{scheduler}` saturated (capacity {capacity})")]
    Saturated {
        scheduler: Cow<'static, str>,
        capacity: usize,
    },
    /// 调度器已被释放，不再接受任务。
    #[error("scheduler `{scheduler}` has been disposed")]
    Disposed { scheduler: Cow<'static, str> },
}

impl From<SchedulerError> for FlowError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Saturated {
                scheduler,
                capacity,
            } => FlowError::SchedulerSaturated {
                scheduler,
                capacity,
            },
            SchedulerError::Disposed { scheduler } => FlowError::SchedulerDisposed { scheduler },
        }
    }
}

/// 汇点发射失败，对应 [`EmitResult`](crate::sink::EmitResult) 的失败分支。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum EmitError {
    #[error("sink buffer overflow")]
    Overflow,
    #[error("concurrent emission collided; retry the emit")]
    NonSerialized,
    #[error("sink already terminated")]
    Terminated,
    #[error("sink has no subscriber")]
    ZeroSubscriber,
}

/// 配置解析或校验失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid TOML: {0}")]
    Parse(String),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: Cow<'static, str>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_unwraps_nested_exhaustion() {
        let inner = FlowError::message("boom");
        let wrapped = FlowError::RetryExhausted {
            retries: 2,
            source: Box::new(inner),
        };
        assert!(wrapped.is_retry_exhausted());
        assert!(wrapped.root().is_upstream());
        assert_eq!(wrapped.root().to_string(), "upstream error: boom");
    }

    #[test]
    fn scheduler_error_maps_into_flow_error() {
        let err: FlowError = SchedulerError::Saturated {
            scheduler: "elastic".into(),
            capacity: 3,
        }
        .into();
        assert!(matches!(
            err,
            FlowError::SchedulerSaturated { capacity: 3, .. }
        ));
    }
}
