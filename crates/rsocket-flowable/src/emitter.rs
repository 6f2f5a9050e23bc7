//! 缓冲 + 按需发射的生产者内核。
//!
//! # 教案式说明
//! - **意图 (Why)**：`Flowable::create`、`Flowable::just`、单播处理器以及协议层的入站通道都需要
//!   “生产者随意推送、消费者按需拉取”的桥接，本模块把这套状态机集中在一处；
//! - **策略 (What)**：溢出策略为“缓冲并等待”：超出需求的元素进入无界队列，直到消费者
//!   `request(n)` 后才发射；错误信号不等待需求、丢弃尚未发射的缓冲；
//! - **并发 (How)**：状态由 `parking_lot::Mutex` 保护，但调用订阅者回调时从不持锁。
//!   发射期间订阅者被“借出”，可重入的 `request`/`cancel` 只修改计数，由正在发射的循环接手。

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::subscriber::{BoxSubscriber, Subscription};

type RequestHook = Arc<dyn Fn(u64) + Send + Sync>;
type CancelHook = Box<dyn FnOnce() + Send>;

enum Pending<E> {
    Complete,
    Error(E),
}

enum Step<T, E> {
    Next(T),
    Last(T),
    Complete,
    Error(E),
    Stop,
}

struct EmitterState<T, E> {
    subscriber: Option<BoxSubscriber<T, E>>,
    queue: VecDeque<T>,
    demand: u64,
    requested_total: u64,
    pending: Option<Pending<E>>,
    cancelled: bool,
    draining: bool,
    finished: bool,
    on_request: Option<RequestHook>,
    on_cancel: Vec<CancelHook>,
}

/// 回调钩子在锁外释放。
struct Released {
    _on_request: Option<RequestHook>,
    _on_cancel: Vec<CancelHook>,
}

impl<T, E> EmitterState<T, E> {
    fn release_hooks(&mut self) -> Released {
        Released {
            _on_request: self.on_request.take(),
            _on_cancel: mem::take(&mut self.on_cancel),
        }
    }

    fn accepts_signals(&self) -> bool {
        !self.cancelled && !self.finished && self.pending.is_none()
    }

    fn next_step(&mut self) -> Option<(Step<T, E>, Option<Released>)> {
        if self.cancelled {
            self.draining = false;
            return Some((Step::Stop, None));
        }
        if matches!(self.pending, Some(Pending::Error(_))) {
            if let Some(Pending::Error(error)) = self.pending.take() {
                self.queue.clear();
                self.finished = true;
                self.draining = false;
                return Some((Step::Error(error), Some(self.release_hooks())));
            }
        }
        if self.demand > 0
            && let Some(item) = self.queue.pop_front()
        {
            self.demand -= 1;
            if self.queue.is_empty() && matches!(self.pending, Some(Pending::Complete)) {
                self.pending = None;
                self.finished = true;
                self.draining = false;
                return Some((Step::Last(item), Some(self.release_hooks())));
            }
            return Some((Step::Next(item), None));
        }
        if self.queue.is_empty() && matches!(self.pending, Some(Pending::Complete)) {
            self.pending = None;
            self.finished = true;
            self.draining = false;
            return Some((Step::Complete, Some(self.release_hooks())));
        }
        None
    }
}

/// 生产者内核，同时充当下游看到的 [`Subscription`]。
pub(crate) struct EmitterCore<T, E> {
    state: Mutex<EmitterState<T, E>>,
}

impl<T: Send + 'static, E: Send + 'static> EmitterCore<T, E> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EmitterState {
                subscriber: None,
                queue: VecDeque::new(),
                demand: 0,
                requested_total: 0,
                pending: None,
                cancelled: false,
                draining: false,
                finished: false,
                on_request: None,
                on_cancel: Vec::new(),
            }),
        })
    }

    /// 在 `on_subscribe` 之后挂载订阅者；已取消则直接丢弃。
    pub(crate) fn attach(&self, subscriber: BoxSubscriber<T, E>) {
        let rejected = {
            let mut state = self.state.lock();
            if state.cancelled || state.finished || state.subscriber.is_some() || state.draining {
                Some(subscriber)
            } else {
                state.subscriber = Some(subscriber);
                None
            }
        };
        if rejected.is_none() {
            self.drain();
        }
    }

    pub(crate) fn push(&self, item: T) -> bool {
        {
            let mut state = self.state.lock();
            if !state.accepts_signals() {
                return false;
            }
            state.queue.push_back(item);
        }
        self.drain();
        true
    }

    /// 入队最后一个元素并同时登记完成，使其以 `on_last` 发射。
    pub(crate) fn push_last(&self, item: T) -> bool {
        {
            let mut state = self.state.lock();
            if !state.accepts_signals() {
                return false;
            }
            state.queue.push_back(item);
            state.pending = Some(Pending::Complete);
        }
        self.drain();
        true
    }

    pub(crate) fn complete(&self) {
        {
            let mut state = self.state.lock();
            if !state.accepts_signals() {
                return;
            }
            state.pending = Some(Pending::Complete);
        }
        self.drain();
    }

    pub(crate) fn error(&self, error: E) {
        {
            let mut state = self.state.lock();
            if !state.accepts_signals() {
                return;
            }
            state.pending = Some(Pending::Error(error));
        }
        self.drain();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    pub(crate) fn is_terminated(&self) -> bool {
        let state = self.state.lock();
        state.cancelled || state.finished || state.pending.is_some()
    }

    /// 生产者仍可产出而不进入缓冲等待的元素数量。
    pub(crate) fn outstanding(&self) -> u64 {
        let state = self.state.lock();
        state.demand.saturating_sub(state.queue.len() as u64)
    }

    /// 注册需求回调；若此前已有需求，立即以累计值回放一次。
    pub(crate) fn set_on_request(&self, hook: RequestHook) {
        let replay = {
            let mut state = self.state.lock();
            if state.cancelled || state.finished {
                return;
            }
            state.on_request = Some(hook.clone());
            state.requested_total
        };
        if replay > 0 {
            hook(replay);
        }
    }

    pub(crate) fn add_on_cancel(&self, hook: CancelHook) {
        let run_now = {
            let mut state = self.state.lock();
            if state.cancelled {
                Some(hook)
            } else if state.finished {
                None
            } else {
                state.on_cancel.push(hook);
                None
            }
        };
        if let Some(hook) = run_now {
            hook();
        }
    }

    fn drain(&self) {
        let mut subscriber = {
            let mut state = self.state.lock();
            if state.draining || state.finished || state.cancelled {
                return;
            }
            match state.subscriber.take() {
                Some(subscriber) => {
                    state.draining = true;
                    subscriber
                }
                None => return,
            }
        };
        loop {
            let (step, released) = {
                let mut state = self.state.lock();
                match state.next_step() {
                    Some(step) => step,
                    None => {
                        state.subscriber = Some(subscriber);
                        state.draining = false;
                        return;
                    }
                }
            };
            drop(released);
            match step {
                Step::Next(item) => subscriber.on_next(item),
                Step::Last(item) => {
                    subscriber.on_last(item);
                    return;
                }
                Step::Complete => {
                    subscriber.on_complete();
                    return;
                }
                Step::Error(error) => {
                    subscriber.on_error(error);
                    return;
                }
                Step::Stop => return,
            }
        }
    }
}

impl<T: Send + 'static, E: Send + 'static> Subscription for EmitterCore<T, E> {
    fn request(&self, n: u32) {
        if n == 0 {
            warn!("request(0) ignored: demand must be positive");
            return;
        }
        let hook = {
            let mut state = self.state.lock();
            if state.cancelled || state.finished {
                return;
            }
            state.demand = state.demand.saturating_add(u64::from(n));
            state.requested_total = state.requested_total.saturating_add(u64::from(n));
            state.on_request.clone()
        };
        if let Some(hook) = hook {
            hook(u64::from(n));
        }
        self.drain();
    }

    fn cancel(&self) {
        let (subscriber, hooks) = {
            let mut state = self.state.lock();
            if state.cancelled || state.finished {
                return;
            }
            state.cancelled = true;
            state.queue.clear();
            state.pending = None;
            state.on_request = None;
            let subscriber = if state.draining {
                None
            } else {
                state.subscriber.take()
            };
            (subscriber, mem::take(&mut state.on_cancel))
        };
        drop(subscriber);
        for hook in hooks {
            hook();
        }
    }
}

/// 生产者侧句柄：推送元素、终止序列、感知需求与取消。
///
/// 由 [`Flowable::create`](crate::Flowable::create) 或
/// [`Flowable::unicast`](crate::Flowable::unicast) 交给生产者；可克隆并跨线程使用。
pub struct Emitter<T, E> {
    core: Arc<EmitterCore<T, E>>,
}

impl<T, E> Clone for Emitter<T, E> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for Emitter<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter").finish_non_exhaustive()
    }
}

impl<T: Send + 'static, E: Send + 'static> Emitter<T, E> {
    pub(crate) fn from_core(core: Arc<EmitterCore<T, E>>) -> Self {
        Self { core }
    }

    /// 推送一个元素。超出需求时进入缓冲；序列已终止或取消时返回 `false`。
    pub fn next(&self, item: T) -> bool {
        self.core.push(item)
    }

    /// 推送最后一个元素并完成序列，下游收到合并的 `on_last`。
    pub fn last(&self, item: T) -> bool {
        self.core.push_last(item)
    }

    /// 缓冲发射完毕后完成序列。
    pub fn complete(&self) {
        self.core.complete();
    }

    /// 以错误终止序列，未发射的缓冲被丢弃。
    pub fn error(&self, error: E) {
        self.core.error(error);
    }

    /// 下游是否已取消。
    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }

    /// 序列是否已取消、已终止或已登记终止信号。
    pub fn is_terminated(&self) -> bool {
        self.core.is_terminated()
    }

    /// 尚未被缓冲元素占用的需求。
    pub fn outstanding(&self) -> u64 {
        self.core.outstanding()
    }

    /// 每次下游追加需求时回调（参数为增量）；注册时已有的需求会以累计值回放一次。
    pub fn on_request<F>(&self, hook: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.core.set_on_request(Arc::new(hook));
    }

    /// 下游取消时回调一次；若已取消则立即执行。
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.add_on_cancel(Box::new(hook));
    }
}
