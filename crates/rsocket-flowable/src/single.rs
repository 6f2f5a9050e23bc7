//! `Single`：恰好一个值或一个错误的延迟计算。

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::subscriber::Cancellable;

/// `Single` 的订阅者。
pub trait SingleSubscriber<T, E>: Send {
    /// 收到取消句柄。默认忽略。
    fn on_subscribe(&mut self, _cancellable: Arc<dyn Cancellable>) {}

    /// 计算成功。
    fn on_complete(&mut self, value: T);

    /// 计算失败。
    fn on_error(&mut self, error: E);
}

type BoxSingleSubscriber<T, E> = Box<dyn SingleSubscriber<T, E>>;
type CancelHook = Box<dyn FnOnce() + Send>;

struct SingleState<T, E> {
    subscriber: Option<BoxSingleSubscriber<T, E>>,
    cancelled: bool,
    done: bool,
    on_cancel: Vec<CancelHook>,
}

struct SingleCore<T, E> {
    state: Mutex<SingleState<T, E>>,
}

impl<T, E> SingleCore<T, E> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SingleState {
                subscriber: None,
                cancelled: false,
                done: false,
                on_cancel: Vec::new(),
            }),
        })
    }

    fn attach(&self, subscriber: BoxSingleSubscriber<T, E>) -> bool {
        let mut state = self.state.lock();
        if state.cancelled {
            return false;
        }
        state.subscriber = Some(subscriber);
        true
    }

    /// 取走订阅者并标记完成；已取消或已完成时返回 `None`。
    fn finish(&self) -> Option<BoxSingleSubscriber<T, E>> {
        let (subscriber, _hooks) = {
            let mut state = self.state.lock();
            if state.cancelled || state.done {
                return None;
            }
            state.done = true;
            (state.subscriber.take(), mem::take(&mut state.on_cancel))
        };
        subscriber
    }

    fn cancel(&self) {
        let (subscriber, hooks) = {
            let mut state = self.state.lock();
            if state.cancelled || state.done {
                return;
            }
            state.cancelled = true;
            (state.subscriber.take(), mem::take(&mut state.on_cancel))
        };
        drop(subscriber);
        for hook in hooks {
            hook();
        }
    }
}

/// 订阅方持有的取消句柄。
///
/// 只弱引用内核：全部 [`SingleEmitter`] 未交付便被丢弃时，订阅者随内核一同释放。
struct SingleHandle<T, E> {
    core: Weak<SingleCore<T, E>>,
}

impl<T: Send, E: Send> Cancellable for SingleHandle<T, E> {
    fn cancel(&self) {
        if let Some(core) = self.core.upgrade() {
            core.cancel();
        }
    }
}

/// 生产者侧句柄：交付结果、感知取消。结果只会被交付一次。
pub struct SingleEmitter<T, E> {
    core: Arc<SingleCore<T, E>>,
}

impl<T, E> Clone for SingleEmitter<T, E> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T, E> fmt::Debug for SingleEmitter<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleEmitter").finish_non_exhaustive()
    }
}

impl<T: Send + 'static, E: Send + 'static> SingleEmitter<T, E> {
    /// 交付成功结果；若已取消或已交付则返回 `false`。
    pub fn success(&self, value: T) -> bool {
        match self.core.finish() {
            Some(mut subscriber) => {
                subscriber.on_complete(value);
                true
            }
            None => false,
        }
    }

    /// 交付错误；若已取消或已交付则返回 `false`。
    pub fn error(&self, error: E) -> bool {
        match self.core.finish() {
            Some(mut subscriber) => {
                subscriber.on_error(error);
                true
            }
            None => false,
        }
    }

    /// 订阅方是否已取消。
    pub fn is_cancelled(&self) -> bool {
        self.core.state.lock().cancelled
    }

    /// 订阅方取消时执行一次；已取消则立即执行，已交付则丢弃。
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let run_now = {
            let mut state = self.core.state.lock();
            if state.cancelled {
                Some(hook)
            } else {
                if !state.done {
                    state.on_cancel.push(Box::new(hook));
                }
                None
            }
        };
        if let Some(hook) = run_now {
            hook();
        }
    }
}

/// 单值延迟计算。
///
/// # 教案式说明
/// - **契约 (What)**：`subscribe` 触发执行；结果（值或错误）至多交付一次；
///   通过返回的 [`Cancellable`] 在完成前取消后，迟到的结果被丢弃；
/// - **语义 (How)**：与 [`Flowable`](crate::Flowable) 一样只保存生产闭包，每次订阅独立执行；
///   单值无需背压。
pub struct Single<T, E> {
    source: Arc<dyn Fn(SingleEmitter<T, E>) + Send + Sync>,
}

impl<T, E> Clone for Single<T, E> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Single<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Single").finish_non_exhaustive()
    }
}

impl<T: Send + 'static, E: Send + 'static> Single<T, E> {
    /// 以生产闭包构造；闭包在订阅时执行，可把 [`SingleEmitter`] 移交给其他线程。
    pub fn new<F>(source: F) -> Self
    where
        F: Fn(SingleEmitter<T, E>) + Send + Sync + 'static,
    {
        Self {
            source: Arc::new(source),
        }
    }

    /// 订阅并触发执行，返回取消句柄。
    pub fn subscribe<S>(&self, subscriber: S) -> Arc<dyn Cancellable>
    where
        S: SingleSubscriber<T, E> + 'static,
    {
        let mut subscriber: BoxSingleSubscriber<T, E> = Box::new(subscriber);
        let core = SingleCore::new();
        let cancellable: Arc<dyn Cancellable> = Arc::new(SingleHandle {
            core: Arc::downgrade(&core),
        });
        subscriber.on_subscribe(cancellable.clone());
        if core.attach(subscriber) {
            (self.source)(SingleEmitter { core });
        }
        cancellable
    }

    /// 以两个闭包订阅。
    pub fn subscribe_fn<F, G>(&self, on_complete: F, on_error: G) -> Arc<dyn Cancellable>
    where
        F: FnOnce(T) + Send + 'static,
        G: FnOnce(E) + Send + 'static,
    {
        self.subscribe(FnSubscriber {
            on_complete: Some(on_complete),
            on_error: Some(on_error),
        })
    }

    /// 变换成功值。
    pub fn map<U, F>(self, f: F) -> Single<U, E>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let upstream = self;
        Single::new(move |emitter: SingleEmitter<U, E>| {
            let f = f.clone();
            let on_ok = emitter.clone();
            let on_err = emitter.clone();
            let handle = upstream.subscribe_fn(
                move |value| {
                    on_ok.success(f(value));
                },
                move |error| {
                    on_err.error(error);
                },
            );
            emitter.on_cancel(move || handle.cancel());
        })
    }

    /// 变换错误。
    pub fn map_err<E2, F>(self, f: F) -> Single<T, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let upstream = self;
        Single::new(move |emitter: SingleEmitter<T, E2>| {
            let f = f.clone();
            let on_ok = emitter.clone();
            let on_err = emitter.clone();
            let handle = upstream.subscribe_fn(
                move |value| {
                    on_ok.success(value);
                },
                move |error| {
                    on_err.error(f(error));
                },
            );
            emitter.on_cancel(move || handle.cancel());
        })
    }
}

impl<T: Clone + Send + Sync + 'static, E: Send + 'static> Single<T, E> {
    /// 订阅即成功的单值。
    pub fn of(value: T) -> Self {
        Self::new(move |emitter| {
            emitter.success(value.clone());
        })
    }
}

impl<T: Send + 'static, E: Clone + Send + Sync + 'static> Single<T, E> {
    /// 预先失败的单值。
    pub fn error(error: E) -> Self {
        Self::new(move |emitter| {
            emitter.error(error.clone());
        })
    }
}

struct FnSubscriber<F, G> {
    on_complete: Option<F>,
    on_error: Option<G>,
}

impl<T, E, F, G> SingleSubscriber<T, E> for FnSubscriber<F, G>
where
    F: FnOnce(T) + Send,
    G: FnOnce(E) + Send,
{
    fn on_complete(&mut self, value: T) {
        if let Some(f) = self.on_complete.take() {
            f(value);
        }
    }

    fn on_error(&mut self, error: E) {
        if let Some(g) = self.on_error.take() {
            g(error);
        }
    }
}
