//! # dispatcher 模块说明
//!
//! ## 角色定位（Why）
//! - 把对端发起的请求交给应用 [`Responder`]，再把返回的 `Single`/`Flowable` 信号翻译为出站帧；
//! - 每种交互模型对应一个流处理器（`ResponseResponder`、`StreamResponder`、`ChannelResponder`），
//!   由多路复用器持有并在流移除时释放。
//!
//! ## 核心契约（What）
//! - 处理器在入站帧到达时同步调用，其结果随即被订阅；
//! - 处理器返回错误、或在构造/订阅结果时 panic，都只产生一帧 `APPLICATION_ERROR` 并终止该流；
//! - 连接级错误码不会出现在流级 ERROR 帧上，统一降级为 `APPLICATION_ERROR`；
//! - FNF 与 METADATA_PUSH 的失败只记录 `warn!`，从不回应对端。

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use rsocket_flowable::{
    Cancellable, Emitter, Flowable, SingleSubscriber, Subscriber, Subscription,
};
use tracing::{debug, trace, warn};

use crate::error::{ErrorCode, RSocketError};
use crate::frame::Frame;
use crate::multiplexer::{InboundRequest, Multiplexer, RequestKind};
use crate::payload::Payload;
use crate::responder::Responder;
use crate::stream::{Inbound, StreamHandler, SubscriptionSlot, clamp_request_n};

/// 流级 ERROR 帧；连接级错误码被改写为 `APPLICATION_ERROR`。
pub(crate) fn error_frame(stream_id: u32, error: &RSocketError) -> Frame {
    let code = if error.code().is_connection_level() {
        ErrorCode::ApplicationError
    } else {
        error.code()
    };
    Frame::error(stream_id, code, error.message())
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}

/// 对端请求的分发器，每条连接一个。
#[derive(Clone)]
pub(crate) struct Dispatcher {
    mux: Multiplexer,
    responder: Arc<dyn Responder>,
}

impl Dispatcher {
    pub(crate) fn new(mux: Multiplexer, responder: Arc<dyn Responder>) -> Self {
        Self { mux, responder }
    }

    pub(crate) fn dispatch(&self, request: InboundRequest) {
        let InboundRequest {
            stream_id,
            kind,
            payload,
        } = request;
        debug!(
            connection_id = self.mux.connection_id(),
            stream_id,
            interaction = kind.interaction().as_str(),
            "dispatching request"
        );
        match kind {
            RequestKind::FireAndForget => self.fire_and_forget(stream_id, payload),
            RequestKind::RequestResponse => self.request_response(stream_id, payload),
            RequestKind::RequestStream { initial_n } => {
                self.request_stream(stream_id, initial_n, payload)
            }
            RequestKind::RequestChannel {
                initial_n,
                complete,
            } => self.request_channel(stream_id, initial_n, complete, payload),
        }
    }

    pub(crate) fn metadata_push(&self, metadata: Bytes) {
        let connection_id = self.mux.connection_id();
        let payload = Payload::new(None, Some(metadata));
        let responder = &self.responder;
        match panic::catch_unwind(AssertUnwindSafe(|| responder.metadata_push(payload))) {
            Ok(single) => {
                single.subscribe_fn(
                    move |()| trace!(connection_id, "metadata push handled"),
                    move |err: RSocketError| {
                        warn!(connection_id, error = %err, "metadata push handler failed")
                    },
                );
            }
            Err(panic) => warn!(
                connection_id,
                error = %panic_message(panic),
                "metadata push handler panicked"
            ),
        }
    }

    fn fire_and_forget(&self, stream_id: u32, payload: Payload) {
        let connection_id = self.mux.connection_id();
        let responder = &self.responder;
        match panic::catch_unwind(AssertUnwindSafe(|| responder.fire_and_forget(payload))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(
                connection_id,
                stream_id,
                error = %err,
                "fire-and-forget handler failed"
            ),
            Err(panic) => warn!(
                connection_id,
                stream_id,
                error = %panic_message(panic),
                "fire-and-forget handler panicked"
            ),
        }
    }

    fn request_response(&self, stream_id: u32, payload: Payload) {
        let handler = Arc::new(ResponseResponder {
            mux: self.mux.clone(),
            stream_id,
            done: AtomicBool::new(false),
            upstream: Mutex::new(Upstream::Pending),
        });
        if !self.mux.attach_handler(stream_id, handler.clone()) {
            return;
        }
        let responder = &self.responder;
        let single = match panic::catch_unwind(AssertUnwindSafe(|| {
            responder.request_response(payload)
        })) {
            Ok(single) => single,
            Err(panic) => {
                handler.fail(RSocketError::application(panic_message(panic)));
                return;
            }
        };
        let subscriber = ResponseSubscriber {
            handler: handler.clone(),
        };
        let subscribed = panic::catch_unwind(AssertUnwindSafe(|| single.subscribe(subscriber)));
        match subscribed {
            Ok(cancellable) => handler.set_upstream(cancellable),
            Err(panic) => handler.fail(RSocketError::application(panic_message(panic))),
        }
    }

    fn request_stream(&self, stream_id: u32, initial_n: u32, payload: Payload) {
        let handler = Arc::new(StreamResponder {
            mux: self.mux.clone(),
            stream_id,
            upstream: SubscriptionSlot::new(u64::from(initial_n)),
            done: AtomicBool::new(false),
        });
        if !self.mux.attach_handler(stream_id, handler.clone()) {
            return;
        }
        let responder = &self.responder;
        let built = panic::catch_unwind(AssertUnwindSafe(|| responder.request_stream(payload)));
        self.subscribe_outbound(built, handler);
    }

    fn request_channel(&self, stream_id: u32, initial_n: u32, complete: bool, payload: Payload) {
        let (inbound, flowable) = Flowable::unicast(|| {
            RSocketError::application("channel input can only be subscribed once")
        });
        let handler = Arc::new(ChannelResponder {
            mux: self.mux.clone(),
            stream_id,
            upstream: SubscriptionSlot::new(u64::from(initial_n)),
            inbound: inbound.clone(),
            state: Mutex::new(ChannelState {
                inbound_done: complete,
                outbound_done: false,
                first_demand: true,
            }),
        });
        if !self.mux.attach_handler(stream_id, handler.clone()) {
            return;
        }

        inbound.next(payload);
        if complete {
            inbound.complete();
        } else {
            let weak: Weak<ChannelResponder> = Arc::downgrade(&handler);
            inbound.on_request(move |n| {
                if let Some(handler) = weak.upgrade() {
                    handler.on_inbound_demand(n);
                }
            });
            let weak = Arc::downgrade(&handler);
            inbound.on_cancel(move || {
                if let Some(handler) = weak.upgrade() {
                    handler.on_inbound_cancelled();
                }
            });
        }

        let responder = &self.responder;
        let built = panic::catch_unwind(AssertUnwindSafe(|| responder.request_channel(flowable)));
        self.subscribe_outbound(built, handler);
    }

    fn subscribe_outbound<O: Outlet>(
        &self,
        built: std::thread::Result<Flowable<Payload, RSocketError>>,
        outlet: Arc<O>,
    ) {
        let flowable = match built {
            Ok(flowable) => flowable,
            Err(panic) => {
                outlet.fail(RSocketError::application(panic_message(panic)));
                return;
            }
        };
        let subscriber = OutletSubscriber {
            outlet: outlet.clone(),
        };
        if let Err(panic) =
            panic::catch_unwind(AssertUnwindSafe(|| flowable.subscribe(subscriber)))
        {
            outlet.fail(RSocketError::application(panic_message(panic)));
        }
    }
}

enum Upstream {
    Pending,
    Ready(Arc<dyn Cancellable>),
    Cancelled,
}

/// REQUEST_RESPONSE 的流处理器：恰好一帧 PAYLOAD(NEXT|COMPLETE) 或一帧 ERROR。
struct ResponseResponder {
    mux: Multiplexer,
    stream_id: u32,
    done: AtomicBool,
    upstream: Mutex<Upstream>,
}

impl ResponseResponder {
    fn claim(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    fn succeed(&self, payload: Payload) {
        if self.claim() {
            self.mux.send(Frame::next(self.stream_id, payload, true));
            self.mux.finish_stream(self.stream_id);
        }
    }

    fn fail(&self, error: RSocketError) {
        if self.claim() {
            self.mux.send(error_frame(self.stream_id, &error));
            self.mux.finish_stream(self.stream_id);
        }
    }

    fn set_upstream(&self, cancellable: Arc<dyn Cancellable>) {
        let cancel_now = {
            let mut upstream = self.upstream.lock();
            match *upstream {
                Upstream::Pending => {
                    *upstream = Upstream::Ready(cancellable);
                    None
                }
                Upstream::Ready(_) => None,
                Upstream::Cancelled => Some(cancellable),
            }
        };
        if let Some(cancellable) = cancel_now {
            cancellable.cancel();
        }
    }

    fn cancel_upstream(&self) {
        let previous = std::mem::replace(&mut *self.upstream.lock(), Upstream::Cancelled);
        if let Upstream::Ready(cancellable) = previous {
            cancellable.cancel();
        }
    }
}

impl StreamHandler for ResponseResponder {
    fn on_inbound(&self, signal: Inbound) {
        match signal {
            Inbound::Cancel | Inbound::Error(_) => {
                if self.claim() {
                    self.mux.close_stream(
                        self.stream_id,
                        RSocketError::canceled("cancelled by peer"),
                    );
                }
            }
            Inbound::Payload { .. } | Inbound::RequestN(_) => trace!(
                stream_id = self.stream_id,
                "ignoring frame on request-response stream"
            ),
        }
    }

    fn release(&self, _reason: &RSocketError) {
        self.done.store(true, Ordering::Release);
        self.cancel_upstream();
    }
}

/// request/response 结果的订阅者。
///
/// 生产者丢弃全部 `SingleEmitter` 却未交付结果时，订阅者随之被释放；此时以
/// APPLICATION_ERROR 结束该流，保证每条流恰好一个终止帧。
struct ResponseSubscriber {
    handler: Arc<ResponseResponder>,
}

impl SingleSubscriber<Payload, RSocketError> for ResponseSubscriber {
    fn on_complete(&mut self, payload: Payload) {
        self.handler.succeed(payload);
    }

    fn on_error(&mut self, error: RSocketError) {
        self.handler.fail(error);
    }
}

impl Drop for ResponseSubscriber {
    fn drop(&mut self) {
        // 已交付或已释放时 `claim` 失败，这里不会产生第二个终止帧。
        self.handler
            .fail(RSocketError::application("response source dropped"));
    }
}

/// 出站方向（处理器产出的 `Flowable`）的帧出口。
trait Outlet: Send + Sync + 'static {
    fn set_subscription(&self, subscription: Arc<dyn Subscription>);
    fn emit(&self, payload: Payload, complete: bool);
    fn finish(&self);
    fn fail(&self, error: RSocketError);
}

struct OutletSubscriber<O> {
    outlet: Arc<O>,
}

impl<O: Outlet> Subscriber<Payload, RSocketError> for OutletSubscriber<O> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.outlet.set_subscription(subscription);
    }

    fn on_next(&mut self, item: Payload) {
        self.outlet.emit(item, false);
    }

    fn on_last(&mut self, item: Payload) {
        self.outlet.emit(item, true);
    }

    fn on_complete(&mut self) {
        self.outlet.finish();
    }

    fn on_error(&mut self, error: RSocketError) {
        self.outlet.fail(error);
    }
}

/// REQUEST_STREAM 的流处理器：按 `initial_n` 与后续 REQUEST_N 授予的需求发出 PAYLOAD。
struct StreamResponder {
    mux: Multiplexer,
    stream_id: u32,
    upstream: SubscriptionSlot,
    done: AtomicBool,
}

impl StreamResponder {
    fn claim(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }
}

impl Outlet for StreamResponder {
    fn set_subscription(&self, subscription: Arc<dyn Subscription>) {
        self.upstream.set(subscription);
    }

    fn emit(&self, payload: Payload, complete: bool) {
        if complete {
            if self.claim() {
                self.mux.send(Frame::next(self.stream_id, payload, true));
                self.mux.finish_stream(self.stream_id);
            }
        } else if !self.done.load(Ordering::Acquire) {
            self.mux.send(Frame::next(self.stream_id, payload, false));
        }
    }

    fn finish(&self) {
        if self.claim() {
            self.mux.send(Frame::complete(self.stream_id));
            self.mux.finish_stream(self.stream_id);
        }
    }

    fn fail(&self, error: RSocketError) {
        if self.claim() {
            self.mux.send(error_frame(self.stream_id, &error));
            self.mux.finish_stream(self.stream_id);
        }
    }
}

impl StreamHandler for StreamResponder {
    fn on_inbound(&self, signal: Inbound) {
        match signal {
            Inbound::RequestN(n) => self.upstream.request(n),
            Inbound::Cancel | Inbound::Error(_) => {
                if self.claim() {
                    self.mux.close_stream(
                        self.stream_id,
                        RSocketError::canceled("cancelled by peer"),
                    );
                }
            }
            Inbound::Payload { .. } => trace!(
                stream_id = self.stream_id,
                "ignoring payload on request-stream responder"
            ),
        }
    }

    fn release(&self, _reason: &RSocketError) {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
    }
}

struct ChannelState {
    inbound_done: bool,
    outbound_done: bool,
    /// 首个需求中的一份已由 REQUEST_CHANNEL 自带的载荷满足。
    first_demand: bool,
}

/// REQUEST_CHANNEL 的流处理器：两个方向各自完成后才移除流。
struct ChannelResponder {
    mux: Multiplexer,
    stream_id: u32,
    upstream: SubscriptionSlot,
    inbound: Emitter<Payload, RSocketError>,
    state: Mutex<ChannelState>,
}

impl ChannelResponder {
    fn on_inbound_demand(&self, n: u64) {
        let grant = {
            let mut state = self.state.lock();
            if state.inbound_done || n == 0 {
                return;
            }
            if state.first_demand {
                state.first_demand = false;
                n - 1
            } else {
                n
            }
        };
        if grant > 0 {
            self.mux.send(Frame::RequestN {
                stream_id: self.stream_id,
                n: clamp_request_n(grant),
            });
        }
    }

    fn on_inbound_cancelled(&self) {
        let close = {
            let mut state = self.state.lock();
            if state.inbound_done {
                return;
            }
            state.inbound_done = true;
            state.outbound_done
        };
        self.mux.send(Frame::Cancel {
            stream_id: self.stream_id,
        });
        if close {
            self.mux.finish_stream(self.stream_id);
        }
    }

    /// 标记出站方向结束；返回 `(本次是否由我结束, 两个方向是否都已结束)`。
    fn end_outbound(&self) -> (bool, bool) {
        let mut state = self.state.lock();
        if state.outbound_done {
            return (false, state.inbound_done);
        }
        state.outbound_done = true;
        (true, state.inbound_done)
    }

    fn tear_down(&self, reason: RSocketError) {
        let outbound_was_open = {
            let mut state = self.state.lock();
            let open = !state.outbound_done;
            state.outbound_done = true;
            open
        };
        if outbound_was_open {
            self.mux.close_stream(self.stream_id, reason);
        }
    }
}

impl Outlet for ChannelResponder {
    fn set_subscription(&self, subscription: Arc<dyn Subscription>) {
        self.upstream.set(subscription);
    }

    fn emit(&self, payload: Payload, complete: bool) {
        if !complete {
            if !self.state.lock().outbound_done {
                self.mux.send(Frame::next(self.stream_id, payload, false));
            }
            return;
        }
        let (ended, close) = self.end_outbound();
        if ended {
            self.mux.send(Frame::next(self.stream_id, payload, true));
            if close {
                self.mux.finish_stream(self.stream_id);
            }
        }
    }

    fn finish(&self) {
        let (ended, close) = self.end_outbound();
        if ended {
            self.mux.send(Frame::complete(self.stream_id));
            if close {
                self.mux.finish_stream(self.stream_id);
            }
        }
    }

    fn fail(&self, error: RSocketError) {
        let (ended, _) = self.end_outbound();
        if ended {
            self.mux.send(error_frame(self.stream_id, &error));
            self.mux.close_stream(self.stream_id, error);
        }
    }
}

impl StreamHandler for ChannelResponder {
    fn on_inbound(&self, signal: Inbound) {
        match signal {
            Inbound::Payload {
                payload,
                next,
                complete,
            } => {
                let close = {
                    let mut state = self.state.lock();
                    if state.inbound_done {
                        return;
                    }
                    if complete {
                        state.inbound_done = true;
                    }
                    complete && state.outbound_done
                };
                if next {
                    self.inbound.next(payload);
                }
                if complete {
                    self.inbound.complete();
                }
                if close {
                    self.mux.finish_stream(self.stream_id);
                }
            }
            Inbound::RequestN(n) => self.upstream.request(n),
            Inbound::Cancel => self.tear_down(RSocketError::canceled("cancelled by peer")),
            Inbound::Error(err) => self.tear_down(err),
        }
    }

    fn release(&self, reason: &RSocketError) {
        let inbound_open = {
            let mut state = self.state.lock();
            let open = !state.inbound_done;
            state.inbound_done = true;
            state.outbound_done = true;
            open
        };
        if inbound_open {
            self.inbound.error(reason.clone());
        }
        self.upstream.cancel();
    }
}

#[cfg(test)]
mod tests {
    use rsocket_flowable::Single;
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    use super::*;
    use crate::multiplexer::{Outbound, Role, Routed};

    struct Greeter;

    impl Responder for Greeter {
        fn fire_and_forget(&self, _payload: Payload) -> Result<(), RSocketError> {
            Err(RSocketError::application("audit sink unavailable"))
        }

        fn request_response(&self, payload: Payload) -> Single<Payload, RSocketError> {
            match payload.data_utf8() {
                Some("boom") => panic!("handler exploded"),
                Some("silent") => return Single::new(|_emitter| {}),
                _ => {}
            }
            Single::error(RSocketError::connection_error("db down"))
        }

        fn request_stream(&self, _payload: Payload) -> Flowable<Payload, RSocketError> {
            Flowable::just([Payload::from("Hello "), Payload::from("world!")])
        }

        fn request_channel(
            &self,
            inbound: Flowable<Payload, RSocketError>,
        ) -> Flowable<Payload, RSocketError> {
            inbound.map(|payload| {
                let echoed = format!("echo:{}", payload.data_utf8().unwrap_or_default());
                Payload::from(echoed)
            })
        }
    }

    fn setup() -> (Multiplexer, Dispatcher, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mux = Multiplexer::new(3, Role::Server, 1 << 20, tx);
        let dispatcher = Dispatcher::new(mux.clone(), Arc::new(Greeter));
        (mux, dispatcher, rx)
    }

    fn route(mux: &Multiplexer, dispatcher: &Dispatcher, frame: Frame) {
        if let Some(Routed::Request(request)) = mux.on_frame_received(frame) {
            dispatcher.dispatch(request);
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(Outbound::Frame(frame)) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn stream_respects_initial_n_then_request_n() {
        let (mux, dispatcher, mut rx) = setup();
        route(
            &mux,
            &dispatcher,
            Frame::RequestStream {
                stream_id: 1,
                follows: false,
                initial_n: 1,
                payload: Payload::from("Hello").with_metadata(""),
            },
        );
        assert_eq!(
            drain(&mut rx),
            vec![Frame::next(1, Payload::from("Hello "), false)]
        );
        assert_eq!(mux.active_stream_ids(), vec![1]);

        route(&mux, &dispatcher, Frame::RequestN { stream_id: 1, n: 1 });
        assert_eq!(
            drain(&mut rx),
            vec![Frame::next(1, Payload::from("world!"), true)]
        );
        assert!(mux.active_stream_ids().is_empty());
    }

    #[test]
    fn connection_level_codes_are_downgraded_on_streams() {
        let (mux, dispatcher, mut rx) = setup();
        route(
            &mux,
            &dispatcher,
            Frame::RequestResponse {
                stream_id: 1,
                follows: false,
                payload: Payload::from("query"),
            },
        );
        assert_eq!(
            drain(&mut rx),
            vec![Frame::error(1, ErrorCode::ApplicationError, "db down")]
        );
        assert!(mux.active_stream_ids().is_empty());
    }

    #[test]
    fn abandoned_response_fails_and_releases_the_stream() {
        let (mux, dispatcher, mut rx) = setup();
        route(
            &mux,
            &dispatcher,
            Frame::RequestResponse {
                stream_id: 1,
                follows: false,
                payload: Payload::from("silent"),
            },
        );
        assert_eq!(
            drain(&mut rx),
            vec![Frame::error(
                1,
                ErrorCode::ApplicationError,
                "response source dropped"
            )]
        );
        assert!(mux.active_stream_ids().is_empty());
    }

    #[test]
    fn panicking_handler_fails_only_its_stream() {
        let (mux, dispatcher, mut rx) = setup();
        route(
            &mux,
            &dispatcher,
            Frame::RequestResponse {
                stream_id: 1,
                follows: false,
                payload: Payload::from("boom"),
            },
        );
        assert_eq!(
            drain(&mut rx),
            vec![Frame::error(1, ErrorCode::ApplicationError, "handler exploded")]
        );

        route(
            &mux,
            &dispatcher,
            Frame::RequestStream {
                stream_id: 3,
                follows: false,
                initial_n: 8,
                payload: Payload::empty(),
            },
        );
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn peer_cancel_stops_stream_emission() {
        let (mux, dispatcher, mut rx) = setup();
        route(
            &mux,
            &dispatcher,
            Frame::RequestStream {
                stream_id: 1,
                follows: false,
                initial_n: 1,
                payload: Payload::empty(),
            },
        );
        assert_eq!(drain(&mut rx).len(), 1);
        route(&mux, &dispatcher, Frame::Cancel { stream_id: 1 });
        route(&mux, &dispatcher, Frame::RequestN { stream_id: 1, n: 5 });
        assert!(drain(&mut rx).is_empty());
        assert!(mux.active_stream_ids().is_empty());
    }

    #[test]
    fn channel_grants_inbound_demand_minus_initial_payload() {
        let (mux, dispatcher, mut rx) = setup();
        route(
            &mux,
            &dispatcher,
            Frame::RequestChannel {
                stream_id: 1,
                follows: false,
                complete: false,
                initial_n: 4,
                payload: Payload::from("a"),
            },
        );
        // 响应方向的需求为 4，map 逐个透传需求给入站方向：首个 request(4) 对应 REQUEST_N(3)
        assert_eq!(
            drain(&mut rx),
            vec![
                Frame::RequestN { stream_id: 1, n: 3 },
                Frame::next(1, Payload::from("echo:a"), false),
            ]
        );

        route(&mux, &dispatcher, Frame::next(1, Payload::from("b"), true));
        assert_eq!(
            drain(&mut rx),
            vec![
                Frame::next(1, Payload::from("echo:b"), false),
                Frame::complete(1),
            ]
        );
        assert!(mux.active_stream_ids().is_empty());
    }

    #[test]
    #[traced_test]
    fn fire_and_forget_failures_are_logged_not_answered() {
        let (mux, dispatcher, mut rx) = setup();
        route(
            &mux,
            &dispatcher,
            Frame::RequestFnf {
                stream_id: 1,
                follows: false,
                payload: Payload::from("event"),
            },
        );
        assert!(drain(&mut rx).is_empty());
        assert!(mux.active_stream_ids().is_empty());
        assert!(logs_contain("fire-and-forget handler failed"));
    }

    #[test]
    #[traced_test]
    fn default_metadata_push_failure_is_logged() {
        let (_mux, dispatcher, mut rx) = setup();
        dispatcher.metadata_push(Bytes::from_static(b"routing"));
        assert!(drain(&mut rx).is_empty());
        assert!(logs_contain("metadata push handler failed"));
    }
}
