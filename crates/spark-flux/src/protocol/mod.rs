//! 需求协议内核（request/cancel/emit 契约）。
//!
//! # 设计综述（Why）
//! - 所有上层组件（算子、调度切换点、重试、汇点）都建立在同一份订阅契约之上：
//!   生产者只在消费者通过 `request(n)` 授予的累计额度内发射 `Next`，`cancel()` 幂等且单向，
//!   终止信号每个订阅最多一次；
//! - 单个订阅的信号投递严格串行：并发的发射尝试通过 [`DrainGate`] 的非阻塞 CAS 仲裁，
//!   只有赢得闸门的线程进入排空循环，其余线程仅登记“错过次数”后立即返回，生产端不会被阻塞。
//!
//! # 模块结构（How）
//! - `signal`：三态信号 [`Signal`]；
//! - `demand`：需求值 [`Demand`] 与原子计数器 [`DemandCounter`]；
//! - `subscriber`：[`Publisher`]/[`Subscriber`]/[`Subscription`] 三个 trait；
//! - `gate`：WIP 排空闸门 [`DrainGate`]；
//! - `arbiter`：可替换上游的订阅仲裁器 [`SubscriptionArbiter`]；
//! - `queue`：带需求约束的串行排空队列 [`DrainQueue`]；
//! - `strict`：最外层协议守卫 [`StrictSubscriber`]。

mod arbiter;
mod demand;
mod gate;
mod queue;
mod signal;
mod strict;
mod subscriber;

pub use arbiter::SubscriptionArbiter;
pub use demand::{Demand, DemandCounter, UNBOUNDED, add_cap};
pub use gate::DrainGate;
pub use queue::DrainQueue;
pub use signal::Signal;
pub use strict::StrictSubscriber;
pub(crate) use strict::TerminalFlag;
pub use subscriber::{BoxSubscriber, EmptySubscription, Publisher, Subscriber, Subscription};
