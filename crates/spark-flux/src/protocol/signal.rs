use crate::{error::FlowError, protocol::Subscriber};

/// 沿订阅链向下游流动的三态信号。
///
/// # 契约说明（What）
/// - `Next(T)`：数据元素，受需求额度约束；
/// - `Complete`/`Error`：终止信号，每个订阅最多投递一次，之后不再有任何信号；
/// - 调度切换点把信号按提交顺序入队，由排空循环逐个取出投递，保证不乱序、不并发。
#[derive(Clone, Debug)]
pub enum Signal<T> {
    Next(T),
    Complete,
    Error(FlowError),
}

impl<T> Signal<T> {
    /// 是否为终止信号。
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Signal::Next(_))
    }

    /// 取出数据元素。
    pub fn into_value(self) -> Option<T> {
        match self {
            Signal::Next(value) => Some(value),
            _ => None,
        }
    }

    /// 转换元素类型，终止信号原样保留。
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Signal<U> {
        match self {
            Signal::Next(value) => Signal::Next(f(value)),
            Signal::Complete => Signal::Complete,
            Signal::Error(err) => Signal::Error(err),
        }
    }
}

impl<T: 'static> Signal<T> {
    /// 把信号交付给消费者对应的回调。
    pub fn deliver(self, subscriber: &mut dyn Subscriber<T>) {
        match self {
            Signal::Next(value) => subscriber.on_next(value),
            Signal::Complete => subscriber.on_complete(),
            Signal::Error(err) => subscriber.on_error(err),
        }
    }
}
