#![doc = r#"
# rsocket-flowable

## 设计动机（Why）
- 为多路复用协议层提供最小的响应式原语：单值的 [`Single`] 与支持背压的多值 [`Flowable`]；
- 协议层把网络帧翻译成这些原语的信号，应用处理器则以它们表达请求结果。

## 核心契约（What）
- [`Subscriber`] 依次收到 `on_subscribe`、零或多次 `on_next`、至多一次终止信号；
- 发出的元素数不超过经 [`Subscription::request`] 累计授予的需求；
- 取消幂等，取消后不再有信号到达订阅者。

## 特性开关（How）
- `runtime-tokio`（默认）：`Single::from_future`、`Flowable::from_stream` 与 `Single::into_future`；
- `test-util`：[`test_util::TestSubscriber`] 记录型订阅者。
"#]

mod emitter;
mod flowable;
mod single;
mod subscriber;

#[cfg(feature = "runtime-tokio")]
mod runtime;

#[cfg(feature = "test-util")]
pub mod test_util;

pub use emitter::Emitter;
pub use flowable::Flowable;
pub use single::{Single, SingleEmitter, SingleSubscriber};
pub use subscriber::{
    BoxSubscriber, Cancellable, MAX_REQUEST_N, NoopSubscription, Subscriber, Subscription,
};

#[cfg(feature = "runtime-tokio")]
pub use runtime::{Interrupted, SingleFuture};
