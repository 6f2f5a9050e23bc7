//! Tokio 适配层：在 `Future`/`Stream` 与响应式原语之间搭桥。
//!
//! # 教案式说明
//! - **意图 (Why)**：应用处理器通常以 `async` 编写，而协议层只认 `Single`/`Flowable`；
//! - **契约 (What)**：`from_future`/`from_stream` 在订阅时派生任务，取消即 `abort`；
//!   `from_stream` 只在存在未满足需求时才拉取下一个元素；
//! - **前置条件**：订阅必须发生在 Tokio 运行时上下文内。

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use tokio::sync::{Notify, oneshot};

use crate::flowable::Flowable;
use crate::single::{Single, SingleSubscriber};
use crate::subscriber::Cancellable;

impl<T: Send + 'static, E: Send + 'static> Flowable<T, E> {
    /// 以异步流构造序列；每次订阅调用一次 `factory` 并派生一个拉取任务。
    ///
    /// 流产出 `Err` 时序列以该错误终止，流结束时序列完成。
    pub fn from_stream<F, S>(factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = Result<T, E>> + Send + 'static,
    {
        Self::create(move |emitter| {
            let stream = factory();
            let demand = Arc::new(Notify::new());
            let wake = demand.clone();
            emitter.on_request(move |_| wake.notify_one());

            let producer = emitter.clone();
            let task = tokio::spawn(async move {
                let mut stream = Box::pin(stream);
                loop {
                    while producer.outstanding() == 0 {
                        if producer.is_terminated() {
                            return;
                        }
                        demand.notified().await;
                    }
                    match stream.next().await {
                        Some(Ok(item)) => {
                            if !producer.next(item) {
                                return;
                            }
                        }
                        Some(Err(error)) => {
                            producer.error(error);
                            return;
                        }
                        None => {
                            producer.complete();
                            return;
                        }
                    }
                }
            });
            emitter.on_cancel(move || task.abort());
        })
    }
}

impl<T: Send + 'static, E: Send + 'static> Single<T, E> {
    /// 以 `Future` 构造单值；每次订阅调用一次 `factory` 并派生任务，取消时中止任务。
    pub fn from_future<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::new(move |emitter| {
            let future = factory();
            let producer = emitter.clone();
            let task = tokio::spawn(async move {
                match future.await {
                    Ok(value) => producer.success(value),
                    Err(error) => producer.error(error),
                };
            });
            emitter.on_cancel(move || task.abort());
        })
    }
}

impl<T: Send + 'static, E: From<Interrupted> + Send + 'static> Single<T, E> {
    /// 订阅并以 `Future` 形式等待结果。
    ///
    /// 返回的 `Future` 被丢弃时取消订阅；生产者未交付任何结果便消失时得到
    /// `E::from(Interrupted)`。
    pub fn into_future(self) -> SingleFuture<T, E> {
        let (tx, rx) = oneshot::channel();
        let cancellable = self.subscribe(OneshotSubscriber { tx: Some(tx) });
        SingleFuture {
            rx,
            cancellable,
            done: false,
        }
    }
}

/// 生产者在交付结果前被丢弃。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("single producer dropped without a result")
    }
}

impl std::error::Error for Interrupted {}

struct OneshotSubscriber<T, E> {
    tx: Option<oneshot::Sender<Result<T, E>>>,
}

impl<T: Send, E: Send> SingleSubscriber<T, E> for OneshotSubscriber<T, E> {
    fn on_complete(&mut self, value: T) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(value));
        }
    }

    fn on_error(&mut self, error: E) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error));
        }
    }
}

/// [`Single::into_future`] 返回的等待句柄。
pub struct SingleFuture<T, E> {
    rx: oneshot::Receiver<Result<T, E>>,
    cancellable: Arc<dyn Cancellable>,
    done: bool,
}

impl<T, E> fmt::Debug for SingleFuture<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFuture")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<T, E: From<Interrupted>> Future for SingleFuture<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.done = true;
                Poll::Ready(result.unwrap_or_else(|_| Err(E::from(Interrupted))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, E> Drop for SingleFuture<T, E> {
    fn drop(&mut self) {
        if !self.done {
            self.cancellable.cancel();
        }
    }
}
