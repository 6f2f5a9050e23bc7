//! # requester 模块说明
//!
//! ## 角色定位（Why）
//! - 本端主动发起请求的句柄：客户端用它访问服务端，服务端用它反向访问客户端；
//! - 与 [`Dispatcher`](crate::dispatcher) 对称：那边把入站请求翻译为响应式结果，这边把响应式订阅
//!   翻译为出站请求帧。
//!
//! ## 核心契约（What）
//! - 请求都是惰性的：订阅（`Single`）或首次 `request(n)`（`Flowable`）时才分配流 ID 并发帧；
//! - `request_stream` 的首个 `request(n)` 成为 REQUEST_STREAM 的 `initial_n`，其后的需求以 REQUEST_N
//!   发送；取消发送 CANCEL；
//! - `request_channel` 的本地输入首个元素成为 REQUEST_CHANNEL 的载荷，其后的元素只在对端以
//!   REQUEST_N 授权后发送；本地输入为空时发送带 COMPLETE 的空载荷请求；
//! - 连接终止后所有方法都以 `CONNECTION_CLOSE` 错误失败。
//!
//! ## 并发（How）
//! - 每个处理器用一把 `parking_lot::Mutex` 保护阶段机，并在持锁期间入队帧，从而保证同一流的
//!   请求帧先于 REQUEST_N；
//! - 调用发射器、上游订阅或 `close_stream` 之前一律先释放该锁。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use rsocket_flowable::{Emitter, Flowable, Single, SingleEmitter, Subscriber, Subscription};
use tracing::trace;

use crate::dispatcher::error_frame;
use crate::error::RSocketError;
use crate::frame::Frame;
use crate::multiplexer::Multiplexer;
use crate::payload::Payload;
use crate::stream::{Inbound, InteractionKind, StreamHandler, SubscriptionSlot, clamp_request_n};

/// 向对端发起请求的句柄，可廉价克隆，绑定到一条连接。
#[derive(Clone)]
pub struct Requester {
    mux: Multiplexer,
}

impl std::fmt::Debug for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requester")
            .field("connection_id", &self.mux.connection_id())
            .field("closed", &self.mux.is_closed())
            .finish()
    }
}

impl Requester {
    pub(crate) fn new(mux: Multiplexer) -> Self {
        Self { mux }
    }

    /// 所属连接是否已终止。
    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// 发送 REQUEST_FNF；不等待、也不会收到任何应答。
    pub fn fire_and_forget(&self, payload: Payload) -> Result<(), RSocketError> {
        let stream_id = self.mux.next_stream_id()?;
        let frame = Frame::RequestFnf {
            stream_id,
            follows: false,
            payload,
        };
        if self.mux.send(frame) {
            Ok(())
        } else {
            Err(RSocketError::connection_closed())
        }
    }

    /// 发送 METADATA_PUSH（流 0）。
    pub fn metadata_push(&self, metadata: impl Into<Bytes>) -> Result<(), RSocketError> {
        if self.mux.is_closed() {
            return Err(RSocketError::connection_closed());
        }
        let frame = Frame::MetadataPush {
            metadata: metadata.into(),
        };
        if self.mux.send(frame) {
            Ok(())
        } else {
            Err(RSocketError::connection_closed())
        }
    }

    /// 订阅时发送 REQUEST_RESPONSE；取消会发送 CANCEL。
    pub fn request_response(&self, payload: Payload) -> Single<Payload, RSocketError> {
        let mux = self.mux.clone();
        Single::new(move |emitter| {
            let stream_id = match mux.open_stream(InteractionKind::RequestResponse) {
                Ok(stream_id) => stream_id,
                Err(err) => {
                    emitter.error(err);
                    return;
                }
            };
            let handler = Arc::new(ResponseRequester {
                mux: mux.clone(),
                stream_id,
                emitter: emitter.clone(),
                done: AtomicBool::new(false),
            });
            if !mux.attach_handler(stream_id, handler.clone()) {
                emitter.error(RSocketError::connection_closed());
                return;
            }
            let weak: Weak<ResponseRequester> = Arc::downgrade(&handler);
            emitter.on_cancel(move || {
                if let Some(handler) = weak.upgrade() {
                    handler.cancel();
                }
            });
            mux.send(Frame::RequestResponse {
                stream_id,
                follows: false,
                payload: payload.clone(),
            });
        })
    }

    /// 首次 `request(n)` 时发送 REQUEST_STREAM(n)。
    pub fn request_stream(&self, payload: Payload) -> Flowable<Payload, RSocketError> {
        let mux = self.mux.clone();
        Flowable::create(move |emitter| {
            let handler = Arc::new(StreamRequester {
                mux: mux.clone(),
                emitter: emitter.clone(),
                phase: Mutex::new(StreamPhase::Idle {
                    payload: payload.clone(),
                }),
            });
            let on_request = handler.clone();
            emitter.on_request(move |n| on_request.on_demand(n));
            emitter.on_cancel(move || handler.cancel());
        })
    }

    /// 以本地输入序列建立双向通道。
    pub fn request_channel(
        &self,
        input: Flowable<Payload, RSocketError>,
    ) -> Flowable<Payload, RSocketError> {
        let mux = self.mux.clone();
        Flowable::create(move |emitter| {
            let handler = Arc::new(ChannelRequester {
                mux: mux.clone(),
                input: input.clone(),
                emitter: emitter.clone(),
                upstream: SubscriptionSlot::new(1),
                phase: Mutex::new(ChannelPhase::Idle),
            });
            let on_request = handler.clone();
            emitter.on_request(move |n| on_request.on_demand(n));
            emitter.on_cancel(move || handler.cancel());
        })
    }
}

struct ResponseRequester {
    mux: Multiplexer,
    stream_id: u32,
    emitter: SingleEmitter<Payload, RSocketError>,
    done: AtomicBool,
}

impl ResponseRequester {
    fn claim(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    fn cancel(&self) {
        if self.claim() {
            self.mux.send(Frame::Cancel {
                stream_id: self.stream_id,
            });
            self.mux.finish_stream(self.stream_id);
        }
    }
}

impl StreamHandler for ResponseRequester {
    fn on_inbound(&self, signal: Inbound) {
        match signal {
            Inbound::Payload { payload, next, .. } => {
                if self.claim() {
                    self.emitter
                        .success(if next { payload } else { Payload::empty() });
                    self.mux.finish_stream(self.stream_id);
                }
            }
            Inbound::Error(err) => {
                if self.claim() {
                    self.emitter.error(err);
                    self.mux.finish_stream(self.stream_id);
                }
            }
            Inbound::RequestN(_) | Inbound::Cancel => trace!(
                stream_id = self.stream_id,
                "ignoring frame on request-response requester"
            ),
        }
    }

    fn release(&self, reason: &RSocketError) {
        if self.claim() {
            self.emitter.error(reason.clone());
        }
    }
}

enum StreamPhase {
    Idle { payload: Payload },
    Open { stream_id: u32 },
    Done,
}

struct StreamRequester {
    mux: Multiplexer,
    emitter: Emitter<Payload, RSocketError>,
    phase: Mutex<StreamPhase>,
}

impl StreamRequester {
    fn on_demand(self: &Arc<Self>, n: u64) {
        let failure = {
            let mut phase = self.phase.lock();
            match std::mem::replace(&mut *phase, StreamPhase::Done) {
                StreamPhase::Idle { payload } => {
                    match self.mux.open_stream(InteractionKind::RequestStream) {
                        Ok(stream_id) => {
                            if self.mux.attach_handler(stream_id, self.clone()) {
                                *phase = StreamPhase::Open { stream_id };
                                self.mux.send(Frame::RequestStream {
                                    stream_id,
                                    follows: false,
                                    initial_n: clamp_request_n(n),
                                    payload,
                                });
                                None
                            } else {
                                Some(RSocketError::connection_closed())
                            }
                        }
                        Err(err) => Some(err),
                    }
                }
                StreamPhase::Open { stream_id } => {
                    *phase = StreamPhase::Open { stream_id };
                    self.mux.send(Frame::RequestN {
                        stream_id,
                        n: clamp_request_n(n),
                    });
                    None
                }
                StreamPhase::Done => None,
            }
        };
        if let Some(err) = failure {
            self.emitter.error(err);
        }
    }

    fn cancel(&self) {
        let previous = std::mem::replace(&mut *self.phase.lock(), StreamPhase::Done);
        if let StreamPhase::Open { stream_id } = previous {
            self.mux.send(Frame::Cancel { stream_id });
            self.mux.finish_stream(stream_id);
        }
    }

    /// 进入终态并返回此前打开的流 ID。
    fn terminate(&self) -> Option<u32> {
        match std::mem::replace(&mut *self.phase.lock(), StreamPhase::Done) {
            StreamPhase::Open { stream_id } => Some(stream_id),
            _ => None,
        }
    }
}

impl StreamHandler for StreamRequester {
    fn on_inbound(&self, signal: Inbound) {
        match signal {
            Inbound::Payload {
                payload,
                next,
                complete,
            } => {
                if next {
                    self.emitter.next(payload);
                }
                if complete {
                    self.emitter.complete();
                    if let Some(stream_id) = self.terminate() {
                        self.mux.finish_stream(stream_id);
                    }
                }
            }
            Inbound::Error(err) => {
                self.emitter.error(err);
                if let Some(stream_id) = self.terminate() {
                    self.mux.finish_stream(stream_id);
                }
            }
            Inbound::RequestN(_) | Inbound::Cancel => {
                trace!("ignoring frame on request-stream requester")
            }
        }
    }

    fn release(&self, reason: &RSocketError) {
        *self.phase.lock() = StreamPhase::Done;
        self.emitter.error(reason.clone());
    }
}

enum ChannelPhase {
    /// 下游尚未请求。
    Idle,
    /// 已订阅本地输入，等待其首个信号以发出 REQUEST_CHANNEL。
    AwaitingFirst { initial_n: u32 },
    Open {
        stream_id: u32,
        local_done: bool,
        remote_done: bool,
    },
    Done,
}

struct ChannelRequester {
    mux: Multiplexer,
    input: Flowable<Payload, RSocketError>,
    emitter: Emitter<Payload, RSocketError>,
    /// 本地输入的订阅；初始需求 1 用于取得首个元素。
    upstream: SubscriptionSlot,
    phase: Mutex<ChannelPhase>,
}

impl ChannelRequester {
    fn on_demand(self: &Arc<Self>, n: u64) {
        let subscribe = {
            let mut phase = self.phase.lock();
            match *phase {
                ChannelPhase::Idle => {
                    *phase = ChannelPhase::AwaitingFirst {
                        initial_n: clamp_request_n(n),
                    };
                    true
                }
                ChannelPhase::AwaitingFirst { ref mut initial_n } => {
                    *initial_n = clamp_request_n(u64::from(*initial_n) + n);
                    false
                }
                ChannelPhase::Open {
                    stream_id,
                    remote_done: false,
                    ..
                } => {
                    self.mux.send(Frame::RequestN {
                        stream_id,
                        n: clamp_request_n(n),
                    });
                    false
                }
                ChannelPhase::Open { .. } | ChannelPhase::Done => false,
            }
        };
        if subscribe {
            self.input.subscribe(InputSubscriber {
                channel: self.clone(),
            });
        }
    }

    /// 本地输入的一个信号：`item` 为元素，`complete` 表示输入结束。
    fn on_local(self: &Arc<Self>, item: Option<Payload>, complete: bool) {
        let mut failure = None;
        let mut close = None;
        {
            let mut phase = self.phase.lock();
            match *phase {
                ChannelPhase::AwaitingFirst { initial_n } => {
                    match self.mux.open_stream(InteractionKind::RequestChannel) {
                        Ok(stream_id) if self.mux.attach_handler(stream_id, self.clone()) => {
                            self.mux.send(Frame::RequestChannel {
                                stream_id,
                                follows: false,
                                complete,
                                initial_n,
                                payload: item.unwrap_or_default(),
                            });
                            *phase = ChannelPhase::Open {
                                stream_id,
                                local_done: complete,
                                remote_done: false,
                            };
                        }
                        Ok(_) => {
                            *phase = ChannelPhase::Done;
                            failure = Some(RSocketError::connection_closed());
                        }
                        Err(err) => {
                            *phase = ChannelPhase::Done;
                            failure = Some(err);
                        }
                    }
                }
                ChannelPhase::Open {
                    stream_id,
                    ref mut local_done,
                    remote_done,
                } => {
                    if *local_done {
                        return;
                    }
                    let frame = match item {
                        Some(payload) => Frame::next(stream_id, payload, complete),
                        None => Frame::complete(stream_id),
                    };
                    self.mux.send(frame);
                    if complete {
                        *local_done = true;
                        if remote_done {
                            *phase = ChannelPhase::Done;
                            close = Some(stream_id);
                        }
                    }
                }
                ChannelPhase::Idle | ChannelPhase::Done => {}
            }
        }
        if let Some(err) = failure {
            self.upstream.cancel();
            self.emitter.error(err);
        }
        if let Some(stream_id) = close {
            self.mux.finish_stream(stream_id);
        }
    }

    /// 本地输入失败：通道整体以该错误终止。
    fn on_local_error(&self, error: RSocketError) {
        let previous = std::mem::replace(&mut *self.phase.lock(), ChannelPhase::Done);
        match previous {
            ChannelPhase::Open {
                stream_id,
                local_done: false,
                ..
            } => {
                self.mux.send(error_frame(stream_id, &error));
                self.emitter.error(error.clone());
                self.mux.close_stream(stream_id, error);
            }
            ChannelPhase::AwaitingFirst { .. } => self.emitter.error(error),
            _ => {}
        }
    }

    fn cancel(&self) {
        let previous = std::mem::replace(&mut *self.phase.lock(), ChannelPhase::Done);
        self.upstream.cancel();
        if let ChannelPhase::Open { stream_id, .. } = previous {
            self.mux.send(Frame::Cancel { stream_id });
            self.mux.finish_stream(stream_id);
        }
    }

    /// 标记对端方向结束；两个方向都结束时返回需要移除的流 ID。
    fn end_remote(&self) -> Option<u32> {
        let mut phase = self.phase.lock();
        match *phase {
            ChannelPhase::Open {
                stream_id,
                local_done,
                ref mut remote_done,
            } => {
                *remote_done = true;
                if local_done {
                    *phase = ChannelPhase::Done;
                    Some(stream_id)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl StreamHandler for ChannelRequester {
    fn on_inbound(&self, signal: Inbound) {
        match signal {
            Inbound::Payload {
                payload,
                next,
                complete,
            } => {
                if next {
                    self.emitter.next(payload);
                }
                if complete {
                    self.emitter.complete();
                    if let Some(stream_id) = self.end_remote() {
                        self.mux.finish_stream(stream_id);
                    }
                }
            }
            Inbound::RequestN(n) => self.upstream.request(n),
            Inbound::Cancel => {
                // 对端不再接收：只关闭本地输入方向
                let close = {
                    let mut phase = self.phase.lock();
                    match *phase {
                        ChannelPhase::Open {
                            stream_id,
                            ref mut local_done,
                            remote_done,
                        } => {
                            *local_done = true;
                            if remote_done {
                                *phase = ChannelPhase::Done;
                                Some(stream_id)
                            } else {
                                None
                            }
                        }
                        _ => None,
                    }
                };
                self.upstream.cancel();
                if let Some(stream_id) = close {
                    self.mux.finish_stream(stream_id);
                }
            }
            Inbound::Error(err) => {
                let previous = std::mem::replace(&mut *self.phase.lock(), ChannelPhase::Done);
                self.upstream.cancel();
                self.emitter.error(err);
                if let ChannelPhase::Open { stream_id, .. } = previous {
                    self.mux.finish_stream(stream_id);
                }
            }
        }
    }

    fn release(&self, reason: &RSocketError) {
        *self.phase.lock() = ChannelPhase::Done;
        self.upstream.cancel();
        self.emitter.error(reason.clone());
    }
}

struct InputSubscriber {
    channel: Arc<ChannelRequester>,
}

impl Subscriber<Payload, RSocketError> for InputSubscriber {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.channel.upstream.set(subscription);
    }

    fn on_next(&mut self, item: Payload) {
        self.channel.on_local(Some(item), false);
    }

    fn on_last(&mut self, item: Payload) {
        self.channel.on_local(Some(item), true);
    }

    fn on_complete(&mut self) {
        self.channel.on_local(None, true);
    }

    fn on_error(&mut self, error: RSocketError) {
        self.channel.on_local_error(error);
    }
}

#[cfg(test)]
mod tests {
    use rsocket_flowable::test_util::TestSubscriber;
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::ErrorCode;
    use crate::multiplexer::{Outbound, Role};

    fn client() -> (Requester, Multiplexer, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mux = Multiplexer::new(11, Role::Client, 1 << 20, tx);
        (Requester::new(mux.clone()), mux, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(Outbound::Frame(frame)) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn request_response_is_lazy_and_completes_once() {
        let (requester, mux, mut rx) = client();
        let single = requester.request_response(Payload::from("ping"));
        assert!(drain(&mut rx).is_empty());

        let result = Arc::new(Mutex::new(None));
        let sink = result.clone();
        single.subscribe_fn(
            move |payload: Payload| *sink.lock() = Some(payload),
            |_err: RSocketError| {},
        );
        assert_eq!(
            drain(&mut rx),
            vec![Frame::RequestResponse {
                stream_id: 1,
                follows: false,
                payload: Payload::from("ping"),
            }]
        );

        mux.on_frame_received(Frame::next(1, Payload::from("pong"), true));
        mux.on_frame_received(Frame::next(1, Payload::from("late"), true));
        assert_eq!(*result.lock(), Some(Payload::from("pong")));
        assert!(mux.active_stream_ids().is_empty());
    }

    #[test]
    fn cancelling_request_response_sends_cancel() {
        let (requester, mux, mut rx) = client();
        let handle = requester
            .request_response(Payload::from("slow"))
            .subscribe_fn(|_: Payload| {}, |_: RSocketError| {});
        drain(&mut rx);
        handle.cancel();
        handle.cancel();
        assert_eq!(drain(&mut rx), vec![Frame::Cancel { stream_id: 1 }]);
        assert!(mux.active_stream_ids().is_empty());
    }

    #[test]
    fn request_stream_turns_demand_into_frames() {
        let (requester, mux, mut rx) = client();
        let subscriber = TestSubscriber::<Payload, RSocketError>::new(0);
        requester
            .request_stream(Payload::from("feed"))
            .subscribe(subscriber.clone());
        assert!(drain(&mut rx).is_empty());

        subscriber.request(2);
        subscriber.request(5);
        assert_eq!(
            drain(&mut rx),
            vec![
                Frame::RequestStream {
                    stream_id: 1,
                    follows: false,
                    initial_n: 2,
                    payload: Payload::from("feed"),
                },
                Frame::RequestN { stream_id: 1, n: 5 },
            ]
        );

        mux.on_frame_received(Frame::next(1, Payload::from("a"), false));
        mux.on_frame_received(Frame::next(1, Payload::from("b"), true));
        assert_eq!(subscriber.items(), vec![Payload::from("a"), Payload::from("b")]);
        assert!(subscriber.is_complete());
        assert!(mux.active_stream_ids().is_empty());
    }

    #[test]
    fn stream_error_from_peer_reaches_subscriber() {
        let (requester, mux, mut rx) = client();
        let subscriber = TestSubscriber::<Payload, RSocketError>::new(1);
        requester
            .request_stream(Payload::empty())
            .subscribe(subscriber.clone());
        drain(&mut rx);
        mux.on_frame_received(Frame::error(1, ErrorCode::ApplicationError, "nope"));
        assert_eq!(
            subscriber.error(),
            Some(RSocketError::application("nope"))
        );
        assert_eq!(subscriber.terminal_signals(), 1);
    }

    #[test]
    fn channel_sends_first_item_then_waits_for_request_n() {
        let (requester, mux, mut rx) = client();
        let input = Flowable::just([Payload::from("x"), Payload::from("y"), Payload::from("z")]);
        let subscriber = TestSubscriber::<Payload, RSocketError>::new(3);
        requester.request_channel(input).subscribe(subscriber.clone());
        assert_eq!(
            drain(&mut rx),
            vec![Frame::RequestChannel {
                stream_id: 1,
                follows: false,
                complete: false,
                initial_n: 3,
                payload: Payload::from("x"),
            }]
        );

        mux.on_frame_received(Frame::RequestN { stream_id: 1, n: 2 });
        assert_eq!(
            drain(&mut rx),
            vec![
                Frame::next(1, Payload::from("y"), false),
                Frame::next(1, Payload::from("z"), true),
            ]
        );

        mux.on_frame_received(Frame::next(1, Payload::from("reply"), true));
        assert_eq!(subscriber.items(), vec![Payload::from("reply")]);
        assert!(subscriber.is_complete());
        assert!(mux.active_stream_ids().is_empty());
    }

    #[test]
    fn empty_channel_input_sends_complete_request() {
        let (requester, mux, mut rx) = client();
        let subscriber = TestSubscriber::<Payload, RSocketError>::new(1);
        requester
            .request_channel(Flowable::empty())
            .subscribe(subscriber.clone());
        assert_eq!(
            drain(&mut rx),
            vec![Frame::RequestChannel {
                stream_id: 1,
                follows: false,
                complete: true,
                initial_n: 1,
                payload: Payload::empty(),
            }]
        );
        assert_eq!(mux.active_stream_ids(), vec![1]);
    }

    #[test]
    fn teardown_fails_pending_requests_and_rejects_new_ones() {
        let (requester, mux, mut rx) = client();
        let subscriber = TestSubscriber::<Payload, RSocketError>::new(1);
        requester
            .request_stream(Payload::empty())
            .subscribe(subscriber.clone());
        drain(&mut rx);

        mux.teardown(&RSocketError::connection_closed());
        assert_eq!(subscriber.error(), Some(RSocketError::connection_closed()));
        assert!(requester.is_closed());
        assert_eq!(
            requester.fire_and_forget(Payload::from("late")),
            Err(RSocketError::connection_closed())
        );
        assert!(requester.metadata_push("m").is_err());
    }
}
