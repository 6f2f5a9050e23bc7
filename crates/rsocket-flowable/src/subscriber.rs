//! 订阅契约：`Subscriber` 接收信号，`Subscription` 承载需求与取消。
//!
//! ## 契约（What）
//! - 每个订阅先收到一次 `on_subscribe`，随后是零或多次 `on_next`，最多一次终止信号
//!   （`on_complete` / `on_error` / `on_last`）；
//! - 生产者发出的元素数量永远不超过订阅者经 `request(n)` 累计授予的需求；
//! - `cancel` 幂等，调用后不再有任何信号到达订阅者。

use std::sync::Arc;

/// 协议允许的最大单次需求（31 位）。
pub const MAX_REQUEST_N: u32 = 0x7fff_ffff;

/// 订阅句柄：消费者通过它授予需求或取消订阅。
pub trait Subscription: Send + Sync {
    /// 追加 `n` 个元素的发送许可，累计生效。`n == 0` 视为误用，会被忽略并记录告警。
    fn request(&self, n: u32);

    /// 取消订阅，幂等。
    fn cancel(&self);
}

/// 单值订阅的取消句柄。
pub trait Cancellable: Send + Sync {
    /// 取消尚未完成的计算，幂等；取消后迟到的结果被丢弃。
    fn cancel(&self);
}

/// `Flowable` 的订阅者。
///
/// # 教案式说明
/// - **契约 (What)**：方法按 `on_subscribe → on_next* → (on_complete | on_error | on_last)`
///   顺序被调用，且不会并发调用同一订阅者；
/// - **扩展点 (How)**：`on_last` 是“最后一个元素 + 完成”的合并信号，默认拆成
///   `on_next` 与 `on_complete` 两次调用；协议层覆盖它以便把最后一个 PAYLOAD 帧直接标记为完成。
pub trait Subscriber<T, E>: Send {
    /// 收到订阅句柄，可在此同步调用 `request`。
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>);

    /// 收到一个元素。
    fn on_next(&mut self, item: T);

    /// 收到最后一个元素，且序列随即完成。
    fn on_last(&mut self, item: T) {
        self.on_next(item);
        self.on_complete();
    }

    /// 序列正常结束。
    fn on_complete(&mut self);

    /// 序列以错误结束。
    fn on_error(&mut self, error: E);
}

/// 类型擦除后的订阅者。
pub type BoxSubscriber<T, E> = Box<dyn Subscriber<T, E>>;

impl<T, E> Subscriber<T, E> for BoxSubscriber<T, E> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        (**self).on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        (**self).on_next(item);
    }

    fn on_last(&mut self, item: T) {
        (**self).on_last(item);
    }

    fn on_complete(&mut self) {
        (**self).on_complete();
    }

    fn on_error(&mut self, error: E) {
        (**self).on_error(error);
    }
}

/// 不承载任何资源的订阅句柄，用于立即终止的序列。
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: u32) {}

    fn cancel(&self) {}
}

impl Cancellable for NoopSubscription {
    fn cancel(&self) {}
}
