//! `Flowable`：0..N 个元素、由消费者按需拉取的序列。

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::emitter::{Emitter, EmitterCore};
use crate::subscriber::{BoxSubscriber, NoopSubscription, Subscriber, Subscription};

type Source<T, E> = Arc<dyn Fn(BoxSubscriber<T, E>) + Send + Sync>;

/// 支持背压的多值响应式序列。
///
/// # 教案式说明
/// - **契约 (What)**：`subscribe` 触发生产；订阅者经 [`Subscription::request`] 授予累计需求，
///   生产者发出的元素数不超过该累计值；终止信号互斥且最多一次；
/// - **语义 (How)**：`Flowable` 本身只保存“如何为一个订阅者生产”的闭包，克隆廉价；
///   除 [`Flowable::unicast`] 外，每次订阅都会独立地重新生产；
/// - **注意事项 (Trade-offs)**：闭包在订阅线程上同步执行，耗时生产应交给
///   `from_stream` 这类异步适配器。
pub struct Flowable<T, E> {
    source: Source<T, E>,
}

impl<T, E> Clone for Flowable<T, E> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Flowable<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flowable").finish_non_exhaustive()
    }
}

impl<T: Send + 'static, E: Send + 'static> Flowable<T, E> {
    /// 以原始订阅闭包构造。闭包必须先调用 `on_subscribe`，且遵守需求约束。
    pub fn new<F>(source: F) -> Self
    where
        F: Fn(BoxSubscriber<T, E>) + Send + Sync + 'static,
    {
        Self {
            source: Arc::new(source),
        }
    }

    /// 订阅该序列。
    pub fn subscribe<S>(&self, subscriber: S)
    where
        S: Subscriber<T, E> + 'static,
    {
        (self.source)(Box::new(subscriber));
    }

    /// 以已装箱的订阅者订阅。
    pub fn subscribe_boxed(&self, subscriber: BoxSubscriber<T, E>) {
        (self.source)(subscriber);
    }

    /// 以缓冲发射器构造序列：每次订阅都会调用一次 `producer`。
    ///
    /// 超出需求的元素被缓冲，直到消费者继续 `request`。
    pub fn create<F>(producer: F) -> Self
    where
        F: Fn(Emitter<T, E>) + Send + Sync + 'static,
    {
        Self::new(move |mut subscriber| {
            let core = EmitterCore::new();
            let subscription: Arc<dyn Subscription> = core.clone();
            subscriber.on_subscribe(subscription);
            core.attach(subscriber);
            producer(Emitter::from_core(core));
        })
    }

    /// 立即完成的空序列。
    pub fn empty() -> Self {
        Self::new(|mut subscriber| {
            subscriber.on_subscribe(Arc::new(NoopSubscription));
            subscriber.on_complete();
        })
    }

    /// 只允许订阅一次的热序列，返回生产者句柄与序列本身。
    ///
    /// 第二次及以后的订阅收到 `on_resubscribe` 构造的错误。
    pub fn unicast<F>(on_resubscribe: F) -> (Emitter<T, E>, Self)
    where
        F: Fn() -> E + Send + Sync + 'static,
    {
        let core = EmitterCore::new();
        let slot = Mutex::new(Some(core.clone()));
        let flowable = Self::new(move |mut subscriber| {
            let taken = slot.lock().take();
            match taken {
                Some(core) => {
                    let subscription: Arc<dyn Subscription> = core.clone();
                    subscriber.on_subscribe(subscription);
                    core.attach(subscriber);
                }
                None => {
                    subscriber.on_subscribe(Arc::new(NoopSubscription));
                    subscriber.on_error(on_resubscribe());
                }
            }
        });
        (Emitter::from_core(core), flowable)
    }

    /// 逐个变换元素。
    pub fn map<U, F>(self, f: F) -> Flowable<U, E>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let upstream = self;
        Flowable::new(move |subscriber| {
            upstream.subscribe(MapSubscriber {
                inner: subscriber,
                f: f.clone(),
            });
        })
    }

    /// 变换错误类型。
    pub fn map_err<E2, F>(self, f: F) -> Flowable<T, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let upstream = self;
        Flowable::new(move |subscriber| {
            upstream.subscribe(MapErrSubscriber {
                inner: subscriber,
                f: f.clone(),
            });
        })
    }
}

impl<T, E> Flowable<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + 'static,
{
    /// 有限、可重复订阅的序列：每个订阅者都看到全部元素。
    pub fn just<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let items: Arc<[T]> = items.into_iter().collect();
        Self::create(move |emitter| {
            let Some((last, init)) = items.split_last() else {
                emitter.complete();
                return;
            };
            for item in init {
                if !emitter.next(item.clone()) {
                    return;
                }
            }
            emitter.last(last.clone());
        })
    }
}

impl<T, E> Flowable<T, E>
where
    T: Send + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// 订阅即失败的序列。
    pub fn error(error: E) -> Self {
        Self::new(move |mut subscriber| {
            subscriber.on_subscribe(Arc::new(NoopSubscription));
            subscriber.on_error(error.clone());
        })
    }
}

struct MapSubscriber<T, U, E> {
    inner: BoxSubscriber<U, E>,
    f: Arc<dyn Fn(T) -> U + Send + Sync>,
}

impl<T, U, E> Subscriber<T, E> for MapSubscriber<T, U, E> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.inner.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        self.inner.on_next((self.f)(item));
    }

    fn on_last(&mut self, item: T) {
        self.inner.on_last((self.f)(item));
    }

    fn on_complete(&mut self) {
        self.inner.on_complete();
    }

    fn on_error(&mut self, error: E) {
        self.inner.on_error(error);
    }
}

struct MapErrSubscriber<T, E, E2> {
    inner: BoxSubscriber<T, E2>,
    f: Arc<dyn Fn(E) -> E2 + Send + Sync>,
}

impl<T, E, E2> Subscriber<T, E> for MapErrSubscriber<T, E, E2> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.inner.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        self.inner.on_next(item);
    }

    fn on_last(&mut self, item: T) {
        self.inner.on_last(item);
    }

    fn on_complete(&mut self) {
        self.inner.on_complete();
    }

    fn on_error(&mut self, error: E) {
        self.inner.on_error((self.f)(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Next(u32),
        Last(u32),
        Complete,
        Error(String),
    }

    struct Recorder {
        events: Arc<Mutex<Vec<Event>>>,
        subscription: Arc<Mutex<Option<Arc<dyn Subscription>>>>,
        initial: u32,
    }

    impl Subscriber<u32, String> for Recorder {
        fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
            *self.subscription.lock() = Some(subscription.clone());
            if self.initial > 0 {
                subscription.request(self.initial);
            }
        }

        fn on_next(&mut self, item: u32) {
            self.events.lock().push(Event::Next(item));
        }

        fn on_last(&mut self, item: u32) {
            self.events.lock().push(Event::Last(item));
        }

        fn on_complete(&mut self) {
            self.events.lock().push(Event::Complete);
        }

        fn on_error(&mut self, error: String) {
            self.events.lock().push(Event::Error(error));
        }
    }

    type Handles = (
        Arc<Mutex<Vec<Event>>>,
        Arc<Mutex<Option<Arc<dyn Subscription>>>>,
    );

    fn record(flowable: &Flowable<u32, String>, initial: u32) -> Handles {
        let events = Arc::new(Mutex::new(Vec::new()));
        let subscription = Arc::new(Mutex::new(None));
        flowable.subscribe(Recorder {
            events: events.clone(),
            subscription: subscription.clone(),
            initial,
        });
        (events, subscription)
    }

    fn request(handles: &Handles, n: u32) {
        let subscription = handles.1.lock().clone();
        if let Some(subscription) = subscription {
            subscription.request(n);
        }
    }

    #[test]
    fn just_emits_only_within_demand() {
        let flowable = Flowable::just([1, 2, 3]);
        let handles = record(&flowable, 1);
        assert_eq!(*handles.0.lock(), vec![Event::Next(1)]);

        request(&handles, 1);
        assert_eq!(*handles.0.lock(), vec![Event::Next(1), Event::Next(2)]);

        request(&handles, 5);
        assert_eq!(
            *handles.0.lock(),
            vec![Event::Next(1), Event::Next(2), Event::Last(3)]
        );
    }

    #[test]
    fn just_is_restartable() {
        let flowable = Flowable::just([7, 8]);
        let first = record(&flowable, 10);
        let second = record(&flowable, 10);
        assert_eq!(*first.0.lock(), vec![Event::Next(7), Event::Last(8)]);
        assert_eq!(*second.0.lock(), *first.0.lock());
    }

    #[test]
    fn cancel_stops_further_emission() {
        let flowable = Flowable::just([1, 2, 3]);
        let handles = record(&flowable, 1);
        let subscription = handles.1.lock().clone();
        if let Some(subscription) = subscription {
            subscription.cancel();
            subscription.cancel();
            subscription.request(10);
        }
        assert_eq!(*handles.0.lock(), vec![Event::Next(1)]);
    }

    #[test]
    fn error_is_signalled_on_subscribe() {
        let flowable: Flowable<u32, String> = Flowable::error("boom".to_owned());
        let handles = record(&flowable, 0);
        assert_eq!(*handles.0.lock(), vec![Event::Error("boom".to_owned())]);
    }

    #[test]
    fn empty_completes_without_demand() {
        let flowable: Flowable<u32, String> = Flowable::empty();
        let handles = record(&flowable, 0);
        assert_eq!(*handles.0.lock(), vec![Event::Complete]);
    }

    #[test]
    fn error_skips_buffered_items() {
        let flowable: Flowable<u32, String> = Flowable::create(|emitter| {
            emitter.next(1);
            emitter.next(2);
            emitter.error("late".to_owned());
            assert!(!emitter.next(3));
        });
        let handles = record(&flowable, 1);
        assert_eq!(
            *handles.0.lock(),
            vec![Event::Next(1), Event::Error("late".to_owned())]
        );
    }

    #[test]
    fn reentrant_request_from_on_next_is_trampolined() {
        struct Greedy {
            seen: Arc<Mutex<Vec<u32>>>,
            subscription: Option<Arc<dyn Subscription>>,
        }

        impl Subscriber<u32, String> for Greedy {
            fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
                self.subscription = Some(subscription.clone());
                subscription.request(1);
            }

            fn on_next(&mut self, item: u32) {
                self.seen.lock().push(item);
                if let Some(subscription) = &self.subscription {
                    subscription.request(1);
                }
            }

            fn on_complete(&mut self) {}

            fn on_error(&mut self, _error: String) {}
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        Flowable::just(0..100u32).subscribe(Greedy {
            seen: seen.clone(),
            subscription: None,
        });
        assert_eq!(seen.lock().len(), 100);
    }

    #[test]
    fn unicast_rejects_second_subscriber() {
        let (emitter, flowable) = Flowable::<u32, String>::unicast(|| "taken".to_owned());
        emitter.next(5);
        let first = record(&flowable, 1);
        let second = record(&flowable, 1);
        assert_eq!(*first.0.lock(), vec![Event::Next(5)]);
        assert_eq!(*second.0.lock(), vec![Event::Error("taken".to_owned())]);
    }

    #[test]
    fn on_request_replays_existing_demand() {
        let observed = Arc::new(Mutex::new(Vec::new()));
        let (emitter, flowable) = Flowable::<u32, String>::unicast(|| "taken".to_owned());
        let _handles = record(&flowable, 3);
        let sink = observed.clone();
        emitter.on_request(move |n| sink.lock().push(n));
        assert_eq!(*observed.lock(), vec![3]);
    }

    #[test]
    fn map_preserves_last_signal() {
        let flowable = Flowable::<u32, String>::just([1, 2]).map(|n| n * 10);
        let handles = record(&flowable, 2);
        assert_eq!(*handles.0.lock(), vec![Event::Next(10), Event::Last(20)]);
    }
}
