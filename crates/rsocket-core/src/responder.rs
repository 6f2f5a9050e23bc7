//! 应用处理器契约。
//!
//! # 教案式说明
//! - **契约 (What)**：[`Responder`] 为每种交互模型提供一个方法，缺省实现统一返回
//!   `APPLICATION_ERROR("Not implemented")`，应用只覆盖关心的部分；
//! - **装配 (How)**：服务器为每条完成握手的连接调用一次 [`ResponderFactory::create`]，
//!   传入 SETUP 信息与可向对端反向发起请求的 [`Requester`]；
//! - **约束**：方法在读循环上同步调用，只负责“构造”响应式结果，耗时工作应放进返回的
//!   `Single`/`Flowable` 中异步完成。

use std::sync::Arc;
use std::time::Duration;

use rsocket_flowable::{Flowable, Single};

use crate::error::RSocketError;
use crate::payload::Payload;
use crate::requester::Requester;

/// 对端发起请求的处理器。
pub trait Responder: Send + Sync + 'static {
    /// 失败只记录日志，不会回应对端。
    fn fire_and_forget(&self, _payload: Payload) -> Result<(), RSocketError> {
        Err(RSocketError::not_implemented())
    }

    fn request_response(&self, _payload: Payload) -> Single<Payload, RSocketError> {
        Single::error(RSocketError::not_implemented())
    }

    fn request_stream(&self, _payload: Payload) -> Flowable<Payload, RSocketError> {
        Flowable::error(RSocketError::not_implemented())
    }

    /// `inbound` 的首个元素是 REQUEST_CHANNEL 携带的载荷；它只能被订阅一次。
    fn request_channel(
        &self,
        _inbound: Flowable<Payload, RSocketError>,
    ) -> Flowable<Payload, RSocketError> {
        Flowable::error(RSocketError::not_implemented())
    }

    /// METADATA_PUSH 没有流，也没有应答；失败只记录日志。
    fn metadata_push(&self, _payload: Payload) -> Single<(), RSocketError> {
        Single::error(RSocketError::not_implemented())
    }
}

/// 拒绝一切请求的处理器。
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultResponder;

impl Responder for DefaultResponder {}

/// 握手阶段由 SETUP 帧协商出的连接参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetupInfo {
    pub major_version: u16,
    pub minor_version: u16,
    pub keepalive_interval: Duration,
    pub max_lifetime: Duration,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    pub payload: Payload,
}

/// 为每条连接构造处理器；返回错误即以 REJECTED_SETUP 拒绝该连接。
pub trait ResponderFactory: Send + Sync + 'static {
    fn create(
        &self,
        setup: &SetupInfo,
        requester: Requester,
    ) -> Result<Arc<dyn Responder>, RSocketError>;
}

impl<F> ResponderFactory for F
where
    F: Fn(&SetupInfo, Requester) -> Result<Arc<dyn Responder>, RSocketError>
        + Send
        + Sync
        + 'static,
{
    fn create(
        &self,
        setup: &SetupInfo,
        requester: Requester,
    ) -> Result<Arc<dyn Responder>, RSocketError> {
        self(setup, requester)
    }
}
