//! 测试工具：记录所有信号的订阅者。
//!
//! 仅在 `test-util` 特性下编译，供本 crate 与协议层的集成测试复用。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::subscriber::{Subscriber, Subscription};

struct Record<T, E> {
    items: Vec<T>,
    completed: bool,
    error: Option<E>,
    terminal_signals: usize,
    subscription: Option<Arc<dyn Subscription>>,
}

struct Shared<T, E> {
    record: Mutex<Record<T, E>>,
    changed: Notify,
}

/// 记录型订阅者。克隆得到指向同一记录的句柄，一份交给 `subscribe`，一份留在测试中断言。
pub struct TestSubscriber<T, E> {
    shared: Arc<Shared<T, E>>,
    initial_request: u32,
}

impl<T, E> Clone for TestSubscriber<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            initial_request: self.initial_request,
        }
    }
}

impl<T: Clone + Send + 'static, E: Clone + Send + 'static> TestSubscriber<T, E> {
    /// `initial_request` 为 `on_subscribe` 时立即授予的需求，0 表示不请求。
    pub fn new(initial_request: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                record: Mutex::new(Record {
                    items: Vec::new(),
                    completed: false,
                    error: None,
                    terminal_signals: 0,
                    subscription: None,
                }),
                changed: Notify::new(),
            }),
            initial_request,
        }
    }

    /// 追加需求；尚未订阅时忽略。
    pub fn request(&self, n: u32) {
        let subscription = self.shared.record.lock().subscription.clone();
        if let Some(subscription) = subscription {
            subscription.request(n);
        }
    }

    /// 取消订阅。
    pub fn cancel(&self) {
        let subscription = self.shared.record.lock().subscription.clone();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    pub fn items(&self) -> Vec<T> {
        self.shared.record.lock().items.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.shared.record.lock().completed
    }

    pub fn error(&self) -> Option<E> {
        self.shared.record.lock().error.clone()
    }

    /// 收到的终止信号次数；合规的生产者至多为 1。
    pub fn terminal_signals(&self) -> usize {
        self.shared.record.lock().terminal_signals
    }

    /// 等待至少 `count` 个元素或终止信号，超时返回 `false`。
    pub async fn await_items(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |record| {
            record.items.len() >= count || record.terminal_signals > 0
        })
        .await
    }

    /// 等待终止信号，超时返回 `false`。
    pub async fn await_terminal(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |record| record.terminal_signals > 0)
            .await
    }

    async fn wait_until<P>(&self, timeout: Duration, predicate: P) -> bool
    where
        P: Fn(&Record<T, E>) -> bool,
    {
        let wait = async {
            loop {
                let changed = self.shared.changed.notified();
                tokio::pin!(changed);
                changed.as_mut().enable();
                if predicate(&self.shared.record.lock()) {
                    return;
                }
                changed.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Record<T, E>),
    {
        f(&mut self.shared.record.lock());
        self.shared.changed.notify_waiters();
    }
}

impl<T: Clone + Send + 'static, E: Clone + Send + 'static> Subscriber<T, E>
    for TestSubscriber<T, E>
{
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.update(|record| record.subscription = Some(subscription.clone()));
        if self.initial_request > 0 {
            subscription.request(self.initial_request);
        }
    }

    fn on_next(&mut self, item: T) {
        self.update(|record| record.items.push(item));
    }

    fn on_complete(&mut self) {
        self.update(|record| {
            record.completed = true;
            record.terminal_signals += 1;
        });
    }

    fn on_error(&mut self, error: E) {
        self.update(|record| {
            record.error = Some(error);
            record.terminal_signals += 1;
        });
    }
}
