//! # multiplexer 模块说明
//!
//! ## 角色定位（Why）
//! - 一条连接上承载多条并发逻辑流：分配本地流 ID、按流 ID 路由入站帧、把出站帧排入唯一的写队列；
//! - 流表归属于单个连接实例，从不跨连接共享。
//!
//! ## 核心契约（What）
//! - 本地发起的流 ID 奇偶性固定（客户端奇数、服务端偶数）、严格递增、永不复用，溢出即
//!   [`StreamIdsExhausted`]；
//! - 对端发起的请求必须使用对端奇偶性、大于此前接受过的最大 ID 且不与活跃流冲突，
//!   否则以 ERROR(INVALID) 回应该流，连接不受影响；
//! - 未知流上的非请求帧被静默丢弃；
//! - 流状态被移除时，其处理器的 `release` 恰好执行一次（RAII，见 `StreamState` 的 `Drop`）。
//!
//! ## 并发（How）
//! - 流表由 `parking_lot::Mutex` 保护；调用任何处理器或响应式代码前都先释放锁。

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{ErrorCode, RSocketError};
use crate::frame::{Frame, MAX_STREAM_ID};
use crate::payload::Payload;
use crate::stream::{Fragments, Inbound, InteractionKind, StreamHandler};

/// 连接的一端。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_local_id(self) -> u32 {
        match self {
            Self::Client => 1,
            Self::Server => 2,
        }
    }

    /// `stream_id` 是否具有对端发起流的奇偶性。
    fn is_peer_id(self, stream_id: u32) -> bool {
        match self {
            Self::Client => stream_id % 2 == 0,
            Self::Server => stream_id % 2 == 1,
        }
    }
}

/// 本地流 ID 已用尽。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("stream ids exhausted")]
pub struct StreamIdsExhausted;

impl From<StreamIdsExhausted> for RSocketError {
    fn from(err: StreamIdsExhausted) -> Self {
        RSocketError::rejected(err.to_string())
    }
}

/// 单调递增、奇偶固定的流 ID 分配器。
#[derive(Debug)]
pub struct StreamIdAllocator {
    next: u32,
}

impl StreamIdAllocator {
    pub fn new(role: Role) -> Self {
        Self {
            next: role.first_local_id(),
        }
    }

    #[cfg(test)]
    fn starting_at(next: u32) -> Self {
        Self { next }
    }

    pub fn next_id(&mut self) -> Result<u32, StreamIdsExhausted> {
        if self.next == 0 || self.next > MAX_STREAM_ID {
            return Err(StreamIdsExhausted);
        }
        let id = self.next;
        self.next = match id.checked_add(2) {
            Some(next) if next <= MAX_STREAM_ID => next,
            _ => 0,
        };
        Ok(id)
    }
}

/// 写任务消费的指令。
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Frame),
    /// 写完此前排队的帧后关闭传输。
    Shutdown,
}

/// 对端发起、已完成重组的请求。
#[derive(Debug)]
pub(crate) struct InboundRequest {
    pub(crate) stream_id: u32,
    pub(crate) kind: RequestKind,
    pub(crate) payload: Payload,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RequestKind {
    FireAndForget,
    RequestResponse,
    RequestStream { initial_n: u32 },
    RequestChannel { initial_n: u32, complete: bool },
}

impl RequestKind {
    pub(crate) fn interaction(self) -> InteractionKind {
        match self {
            Self::FireAndForget => InteractionKind::FireAndForget,
            Self::RequestResponse => InteractionKind::RequestResponse,
            Self::RequestStream { .. } => InteractionKind::RequestStream,
            Self::RequestChannel { .. } => InteractionKind::RequestChannel,
        }
    }
}

/// 路由结果中需要连接层继续处理的部分。
#[derive(Debug)]
pub(crate) enum Routed {
    /// 新的对端请求，交给分发器。
    Request(InboundRequest),
    /// 流 0 上的连接级帧。
    Connection(Frame),
    /// 连接级协议违规，连接应以 CONNECTION_ERROR 终止。
    Violation(&'static str),
}

/// 单条流的状态，只由所属多路复用器持有。
struct StreamState {
    kind: InteractionKind,
    handler: Option<Arc<dyn StreamHandler>>,
    fragments: Option<Fragments>,
    /// 首帧带 FOLLOWS 的对端请求，在最后一个分片到达前暂存于此。
    pending_request: Option<RequestKind>,
    release_reason: RSocketError,
}

impl StreamState {
    fn new(kind: InteractionKind) -> Self {
        Self {
            kind,
            handler: None,
            fragments: None,
            pending_request: None,
            release_reason: RSocketError::connection_closed(),
        }
    }
}

impl Drop for StreamState {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler.release(&self.release_reason);
        }
    }
}

struct StreamTable {
    streams: HashMap<u32, StreamState>,
    allocator: StreamIdAllocator,
    last_peer_id: u32,
    closed: bool,
}

struct MuxInner {
    connection_id: u64,
    role: Role,
    max_reassembly_size: usize,
    table: Mutex<StreamTable>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// 单连接的流多路复用器，可廉价克隆。
#[derive(Clone)]
pub(crate) struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    pub(crate) fn new(
        connection_id: u64,
        role: Role,
        max_reassembly_size: usize,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                connection_id,
                role,
                max_reassembly_size,
                table: Mutex::new(StreamTable {
                    streams: HashMap::new(),
                    allocator: StreamIdAllocator::new(role),
                    last_peer_id: 0,
                    closed: false,
                }),
                outbound,
            }),
        }
    }

    pub(crate) fn connection_id(&self) -> u64 {
        self.inner.connection_id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.table.lock().closed
    }

    /// 分配下一个本地流 ID 并建立流状态。
    pub(crate) fn open_stream(&self, kind: InteractionKind) -> Result<u32, RSocketError> {
        let id = {
            let mut table = self.inner.table.lock();
            if table.closed {
                return Err(RSocketError::connection_closed());
            }
            let id = table.allocator.next_id()?;
            table.streams.insert(id, StreamState::new(kind));
            id
        };
        debug!(
            connection_id = self.inner.connection_id,
            stream_id = id,
            interaction = kind.as_str(),
            "stream opened"
        );
        Ok(id)
    }

    /// 只分配 ID、不建立流状态（FNF 不需要接收任何响应）。
    pub(crate) fn next_stream_id(&self) -> Result<u32, RSocketError> {
        let mut table = self.inner.table.lock();
        if table.closed {
            return Err(RSocketError::connection_closed());
        }
        Ok(table.allocator.next_id()?)
    }

    /// 为已存在的流挂载处理器；流已不存在（例如连接已终止）时返回 `false`。
    pub(crate) fn attach_handler(&self, stream_id: u32, handler: Arc<dyn StreamHandler>) -> bool {
        let mut table = self.inner.table.lock();
        match table.streams.get_mut(&stream_id) {
            Some(state) => {
                state.handler = Some(handler);
                true
            }
            None => false,
        }
    }

    /// 终止并移除流；处理器的 `release` 在锁外以 `reason` 执行。
    pub(crate) fn close_stream(&self, stream_id: u32, reason: RSocketError) {
        let removed = self.inner.table.lock().streams.remove(&stream_id);
        if let Some(mut state) = removed {
            debug!(
                connection_id = self.inner.connection_id,
                stream_id,
                interaction = state.kind.as_str(),
                "stream closed"
            );
            state.release_reason = reason;
        }
    }

    /// 正常终止后的移除。
    pub(crate) fn finish_stream(&self, stream_id: u32) {
        self.close_stream(stream_id, RSocketError::canceled("stream closed"));
    }

    /// 排入写队列；写任务已退出时返回 `false`。
    pub(crate) fn send(&self, frame: Frame) -> bool {
        trace!(
            connection_id = self.inner.connection_id,
            stream_id = frame.stream_id(),
            frame_type = %frame.frame_type(),
            "frame queued"
        );
        self.inner.outbound.send(Outbound::Frame(frame)).is_ok()
    }

    pub(crate) fn shutdown_writer(&self) {
        let _ = self.inner.outbound.send(Outbound::Shutdown);
    }

    pub(crate) fn active_stream_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.inner.table.lock().streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn stream_count(&self) -> usize {
        self.inner.table.lock().streams.len()
    }

    /// 连接终止：拒绝后续开流，移除全部流并以 `reason` 释放。
    pub(crate) fn teardown(&self, reason: &RSocketError) {
        let streams = {
            let mut table = self.inner.table.lock();
            table.closed = true;
            mem::take(&mut table.streams)
        };
        if !streams.is_empty() {
            debug!(
                connection_id = self.inner.connection_id,
                count = streams.len(),
                "releasing streams on connection teardown"
            );
        }
        streams
            .into_values()
            .for_each(|mut state| state.release_reason = reason.clone());
    }

    /// 路由一帧入站帧。
    pub(crate) fn on_frame_received(&self, frame: Frame) -> Option<Routed> {
        let stream_id = frame.stream_id();
        if stream_id == 0 {
            return Some(Routed::Connection(frame));
        }
        match frame {
            Frame::RequestFnf {
                follows, payload, ..
            } => self.accept_request(stream_id, RequestKind::FireAndForget, follows, payload),
            Frame::RequestResponse {
                follows, payload, ..
            } => self.accept_request(stream_id, RequestKind::RequestResponse, follows, payload),
            Frame::RequestStream {
                follows,
                initial_n,
                payload,
                ..
            } => self.accept_request(
                stream_id,
                RequestKind::RequestStream { initial_n },
                follows,
                payload,
            ),
            Frame::RequestChannel {
                follows,
                complete,
                initial_n,
                payload,
                ..
            } => self.accept_request(
                stream_id,
                RequestKind::RequestChannel {
                    initial_n,
                    complete,
                },
                follows,
                payload,
            ),
            Frame::Payload {
                follows,
                complete,
                next,
                payload,
                ..
            } => self.deliver_payload(stream_id, follows, next, complete, payload),
            Frame::RequestN { n, .. } => {
                self.deliver(stream_id, Inbound::RequestN(n));
                None
            }
            Frame::Cancel { .. } => {
                self.deliver(stream_id, Inbound::Cancel);
                None
            }
            Frame::Error { code, message, .. } => {
                self.deliver(stream_id, Inbound::Error(RSocketError::new(code, message)));
                None
            }
            other => Some(Routed::Connection(other)),
        }
    }

    fn accept_request(
        &self,
        stream_id: u32,
        kind: RequestKind,
        follows: bool,
        payload: Payload,
    ) -> Option<Routed> {
        // 本端奇偶性的 ID 属于本端分配的流，不能在该流上回 ERROR。
        if !self.inner.role.is_peer_id(stream_id) {
            warn!(
                connection_id = self.inner.connection_id,
                stream_id, "request on a locally owned stream id"
            );
            return Some(Routed::Violation("request stream id has the wrong parity"));
        }
        let violation = {
            let mut table = self.inner.table.lock();
            if table.closed {
                return None;
            }
            if table.streams.contains_key(&stream_id) {
                Some("stream id is already active")
            } else if stream_id <= table.last_peer_id {
                Some("stream id was already used")
            } else {
                table.last_peer_id = stream_id;
                if follows {
                    let mut state = StreamState::new(kind.interaction());
                    let mut fragments = Fragments::default();
                    if fragments
                        .push(payload, false, false, self.inner.max_reassembly_size)
                        .is_err()
                    {
                        Some("request exceeds the reassembly limit")
                    } else {
                        state.fragments = Some(fragments);
                        state.pending_request = Some(kind);
                        table.streams.insert(stream_id, state);
                        return None;
                    }
                } else {
                    if kind != RequestKind::FireAndForget {
                        table
                            .streams
                            .insert(stream_id, StreamState::new(kind.interaction()));
                    }
                    return Some(Routed::Request(InboundRequest {
                        stream_id,
                        kind,
                        payload,
                    }));
                }
            }
        };
        if let Some(reason) = violation {
            warn!(
                connection_id = self.inner.connection_id,
                stream_id, reason, "protocol violation on request"
            );
            self.send(Frame::error(stream_id, ErrorCode::Invalid, reason));
        }
        None
    }

    fn deliver_payload(
        &self,
        stream_id: u32,
        follows: bool,
        next: bool,
        complete: bool,
        payload: Payload,
    ) -> Option<Routed> {
        let (handler, signal) = {
            let mut table = self.inner.table.lock();
            let Some(state) = table.streams.get_mut(&stream_id) else {
                trace!(
                    connection_id = self.inner.connection_id,
                    stream_id, "payload for unknown stream dropped"
                );
                return None;
            };

            let (payload, next, complete) = if follows || state.fragments.is_some() {
                let fragments = state.fragments.get_or_insert_with(Fragments::default);
                if let Err(overflow) =
                    fragments.push(payload, next, complete, self.inner.max_reassembly_size)
                {
                    let removed = table.streams.remove(&stream_id);
                    drop(table);
                    warn!(
                        connection_id = self.inner.connection_id,
                        stream_id,
                        size = overflow.size,
                        "reassembled payload exceeds limit"
                    );
                    self.send(Frame::error(
                        stream_id,
                        ErrorCode::Rejected,
                        "reassembled payload exceeds limit",
                    ));
                    if let Some(mut state) = removed {
                        state.release_reason =
                            RSocketError::rejected("reassembled payload exceeds limit");
                    }
                    return None;
                }
                if follows {
                    return None;
                }
                match state.fragments.take() {
                    Some(fragments) => fragments.finish(),
                    None => return None,
                }
            } else {
                (payload, next, complete)
            };

            if let Some(kind) = state.pending_request.take() {
                let kind = match kind {
                    RequestKind::RequestChannel {
                        initial_n,
                        complete: initial_complete,
                    } => RequestKind::RequestChannel {
                        initial_n,
                        complete: initial_complete || complete,
                    },
                    other => other,
                };
                if kind == RequestKind::FireAndForget {
                    let removed = table.streams.remove(&stream_id);
                    drop(table);
                    drop(removed);
                }
                return Some(Routed::Request(InboundRequest {
                    stream_id,
                    kind,
                    payload,
                }));
            }
            (
                state.handler.clone(),
                Inbound::Payload {
                    payload,
                    next,
                    complete,
                },
            )
        };
        match handler {
            Some(handler) => handler.on_inbound(signal),
            None => trace!(
                connection_id = self.inner.connection_id,
                stream_id, "payload for stream without handler dropped"
            ),
        }
        None
    }

    fn deliver(&self, stream_id: u32, signal: Inbound) {
        let handler = {
            let mut table = self.inner.table.lock();
            let pending = match table.streams.get(&stream_id) {
                Some(state) => state.pending_request.is_some(),
                None => {
                    trace!(
                        connection_id = self.inner.connection_id,
                        stream_id, "frame for unknown stream dropped"
                    );
                    return;
                }
            };
            if pending {
                // 请求尚未重组完成即被终止
                if matches!(signal, Inbound::Cancel | Inbound::Error(_)) {
                    let removed = table.streams.remove(&stream_id);
                    drop(table);
                    drop(removed);
                }
                return;
            }
            table
                .streams
                .get(&stream_id)
                .and_then(|state| state.handler.clone())
        };
        if let Some(handler) = handler {
            handler.on_inbound(signal);
        }
    }
}
