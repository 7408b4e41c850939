//! 回退阶段：在上游出错或空完成时切换到替代流。
//!
//! # 契约说明（What）
//! - 除重试外，只有本阶段允许吞掉上游错误并以替代数据或替代流继续；
//! - 切换前后对下游呈现同一个订阅：未满足的需求由 [`SubscriptionArbiter`] 转交替代流，
//!   下游不会因切换而收到重复的 `on_subscribe`；
//! - 下游已取消时不再切换；回退函数本身返回错误时以该错误终止。

use std::sync::Arc;

use crate::{
    context::Context,
    error::FlowError,
    flux::Flux,
    hooks,
    protocol::{BoxSubscriber, Publisher, Subscriber, Subscription, SubscriptionArbiter},
};

type ErrorFallback<T> = dyn Fn(FlowError) -> Result<Flux<T>, FlowError> + Send + Sync;

/// 切换时机。
pub(crate) enum SwitchPolicy<T> {
    /// 上游出错时调用回退函数：`Ok` 切换到替代流，`Err` 以新错误终止。
    OnError(Arc<ErrorFallback<T>>),
    /// 上游未发射任何元素即完成时切换到替代流。
    OnEmpty(Flux<T>),
}

impl<T> Clone for SwitchPolicy<T> {
    fn clone(&self) -> Self {
        match self {
            SwitchPolicy::OnError(f) => SwitchPolicy::OnError(f.clone()),
            SwitchPolicy::OnEmpty(other) => SwitchPolicy::OnEmpty(other.clone()),
        }
    }
}

pub(crate) struct FallbackPublisher<T> {
    source: Flux<T>,
    policy: SwitchPolicy<T>,
    stage: &'static str,
}

impl<T> FallbackPublisher<T> {
    pub(crate) fn on_error(
        source: Flux<T>,
        stage: &'static str,
        fallback: impl Fn(FlowError) -> Result<Flux<T>, FlowError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            policy: SwitchPolicy::OnError(Arc::new(fallback)),
            stage,
        }
    }

    pub(crate) fn on_empty(source: Flux<T>, other: Flux<T>) -> Self {
        Self {
            source,
            policy: SwitchPolicy::OnEmpty(other),
            stage: "switch_if_empty",
        }
    }
}

impl<T: Send + 'static> Publisher<T> for FallbackPublisher<T> {
    fn subscribe(&self, mut actual: BoxSubscriber<T>) {
        let arbiter = Arc::new(SubscriptionArbiter::new());
        let context = actual.context();
        actual.on_subscribe(arbiter.clone());
        self.source.subscribe_inner(Box::new(SwitchSubscriber {
            actual: Some(actual),
            context,
            arbiter,
            policy: self.policy.clone(),
            stage: self.stage,
            received: false,
        }));
    }
}

struct SwitchSubscriber<T> {
    actual: Option<BoxSubscriber<T>>,
    context: Context,
    arbiter: Arc<SubscriptionArbiter>,
    policy: SwitchPolicy<T>,
    stage: &'static str,
    received: bool,
}

impl<T: Send + 'static> SwitchSubscriber<T> {
    fn switch_to(&mut self, other: Flux<T>) {
        let Some(actual) = self.actual.take() else {
            return;
        };
        if self.arbiter.is_cancelled() {
            return;
        }
        tracing::debug!(stage = self.stage, "switching to fallback");
        other.subscribe_inner(Box::new(FallbackSubscriber {
            actual,
            arbiter: self.arbiter.clone(),
        }));
    }
}

impl<T: Send + 'static> Subscriber<T> for SwitchSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.arbiter.set(subscription);
    }

    fn on_next(&mut self, value: T) {
        let Some(actual) = self.actual.as_mut() else {
            hooks::on_next_dropped(self.stage);
            return;
        };
        self.received = true;
        self.arbiter.produced(1);
        actual.on_next(value);
    }

    fn on_error(&mut self, error: FlowError) {
        if self.actual.is_none() {
            hooks::on_error_dropped(self.stage, error);
            return;
        }
        match &self.policy {
            SwitchPolicy::OnError(fallback) => match fallback(error) {
                Ok(other) => self.switch_to(other),
                Err(error) => {
                    if let Some(mut actual) = self.actual.take() {
                        actual.on_error(error);
                    }
                }
            },
            SwitchPolicy::OnEmpty(_) => {
                if let Some(mut actual) = self.actual.take() {
                    actual.on_error(error);
                }
            }
        }
    }

    fn on_complete(&mut self) {
        match &self.policy {
            SwitchPolicy::OnEmpty(other) if !self.received => {
                let other = other.clone();
                self.switch_to(other);
            }
            _ => {
                if let Some(mut actual) = self.actual.take() {
                    actual.on_complete();
                }
            }
        }
    }

    fn context(&self) -> Context {
        self.context.clone()
    }
}

/// 替代流的订阅者：与主订阅者共享仲裁器，只做透传与需求记账。
struct FallbackSubscriber<T> {
    actual: BoxSubscriber<T>,
    arbiter: Arc<SubscriptionArbiter>,
}

impl<T: Send + 'static> Subscriber<T> for FallbackSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.arbiter.set(subscription);
    }

    fn on_next(&mut self, value: T) {
        self.arbiter.produced(1);
        self.actual.on_next(value);
    }

    fn on_error(&mut self, error: FlowError) {
        self.actual.on_error(error);
    }

    fn on_complete(&mut self) {
        self.actual.on_complete();
    }

    fn context(&self) -> Context {
        self.actual.context()
    }
}
