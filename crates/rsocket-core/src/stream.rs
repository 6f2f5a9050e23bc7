//! 单条逻辑流的共用构件：入站信号、流处理器契约、订阅槽与分片重组缓冲。

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use rsocket_flowable::{MAX_REQUEST_N, Subscription};

use crate::error::RSocketError;
use crate::payload::Payload;

/// 路由到某条既有流的入站信号（已完成分片重组）。
#[derive(Debug)]
pub(crate) enum Inbound {
    Payload {
        payload: Payload,
        next: bool,
        complete: bool,
    },
    RequestN(u32),
    Cancel,
    Error(RSocketError),
}

/// 交互模型。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InteractionKind {
    FireAndForget,
    RequestResponse,
    RequestStream,
    RequestChannel,
}

impl InteractionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FireAndForget => "fire_and_forget",
            Self::RequestResponse => "request_response",
            Self::RequestStream => "request_stream",
            Self::RequestChannel => "request_channel",
        }
    }
}

/// 多路复用器持有的每流处理器。
///
/// # 教案式说明
/// - **契约 (What)**：多路复用器在不持锁的情况下调用 `on_inbound`；`release` 在流状态被移除时
///   恰好调用一次，无论移除源于正常终止、取消还是连接丢失；
/// - **实现要求 (How)**：`release` 必须幂等地处理“已经正常终止”的情况；实现方在持有自身锁时
///   不得调用 `Multiplexer::close_stream`，因为移除会同步触发 `release`。
pub(crate) trait StreamHandler: Send + Sync {
    fn on_inbound(&self, signal: Inbound);

    /// 释放本地仍存活的订阅或消费者；`reason` 仅对尚未终止的一方有意义。
    fn release(&self, reason: &RSocketError);
}

/// 把 `u64` 需求收敛为线上可表达的 31 位值。
pub(crate) fn clamp_request_n(n: u64) -> u32 {
    u32::try_from(n.min(u64::from(MAX_REQUEST_N))).unwrap_or(MAX_REQUEST_N)
}

enum SlotState {
    Waiting { pending: u64 },
    Ready(Arc<dyn Subscription>),
    Cancelled,
}

/// 订阅句柄到达之前的需求与取消暂存处。
///
/// `on_subscribe` 可能晚于 REQUEST_N 或 CANCEL 到达；槽位先累计需求，句柄就绪时一次性转交。
pub(crate) struct SubscriptionSlot {
    state: Mutex<SlotState>,
}

impl SubscriptionSlot {
    pub(crate) fn new(initial_demand: u64) -> Self {
        Self {
            state: Mutex::new(SlotState::Waiting {
                pending: initial_demand,
            }),
        }
    }

    pub(crate) fn set(&self, subscription: Arc<dyn Subscription>) {
        let pending = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, SlotState::Cancelled) {
                SlotState::Waiting { pending } => {
                    *state = SlotState::Ready(subscription.clone());
                    Some(pending)
                }
                SlotState::Ready(existing) => {
                    *state = SlotState::Ready(existing);
                    return;
                }
                SlotState::Cancelled => None,
            }
        };
        match pending {
            None => subscription.cancel(),
            Some(0) => {}
            Some(pending) => subscription.request(clamp_request_n(pending)),
        }
    }

    pub(crate) fn request(&self, n: u32) {
        let ready = {
            let mut state = self.state.lock();
            match &mut *state {
                SlotState::Waiting { pending } => {
                    *pending = pending.saturating_add(u64::from(n));
                    None
                }
                SlotState::Ready(subscription) => Some(subscription.clone()),
                SlotState::Cancelled => None,
            }
        };
        if let Some(subscription) = ready {
            subscription.request(n);
        }
    }

    pub(crate) fn cancel(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), SlotState::Cancelled);
        if let SlotState::Ready(subscription) = previous {
            subscription.cancel();
        }
    }
}

/// 分片重组缓冲。
#[derive(Default)]
pub(crate) struct Fragments {
    data: BytesMut,
    metadata: Option<BytesMut>,
    next: bool,
    complete: bool,
    size: usize,
}

/// 重组后的载荷超过上限。
#[derive(Debug)]
pub(crate) struct ReassemblyOverflow {
    pub(crate) size: usize,
}

impl Fragments {
    /// 追加一个分片；累计大小超过 `limit` 时返回错误，缓冲不再可用。
    pub(crate) fn push(
        &mut self,
        payload: Payload,
        next: bool,
        complete: bool,
        limit: usize,
    ) -> Result<(), ReassemblyOverflow> {
        self.size += payload.len();
        if self.size > limit {
            return Err(ReassemblyOverflow { size: self.size });
        }
        self.next |= next;
        self.complete |= complete;
        let (data, metadata) = payload.into_parts();
        if let Some(metadata) = metadata {
            self.metadata
                .get_or_insert_with(BytesMut::new)
                .put_slice(&metadata);
        }
        if let Some(data) = data {
            self.data.put_slice(&data);
        }
        Ok(())
    }

    /// 返回 `(载荷, next, complete)`。
    pub(crate) fn finish(self) -> (Payload, bool, bool) {
        let payload = Payload::new(
            Some(self.data.freeze()),
            self.metadata.map(BytesMut::freeze),
        );
        (payload, self.next, self.complete)
    }
}
