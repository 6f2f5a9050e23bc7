//! # frame 模块说明
//!
//! ## 角色定位（Why）
//! - 定义线上帧的结构化表示 [`Frame`]，以及解码失败的分类 [`FrameError`]；
//! - 字节级编解码集中在 [`codec`] 子模块，本模块只描述“帧是什么”。
//!
//! ## 线上布局（What）
//! - 帧头 6 字节：`streamId: u32`（最高位必须为 0）+ `u16 = type << 10 | flags`；
//! - 流式传输时每帧前附 3 字节大端长度前缀，见 [`codec::FrameCodec`]。

pub mod codec;

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::error::ErrorCode;
use crate::payload::Payload;

pub use codec::{DecodeOutcome, FrameCodec, decode_frame, encode_frame, validate_frame};

/// 帧头长度（字节）。
pub const HEADER_LEN: usize = 6;
/// 长度前缀可表达的最大帧长。
pub const MAX_FRAME_LEN: usize = 0x00ff_ffff;
/// 31 位流 ID 的上界。
pub const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// 帧头中的标志位。
pub mod flags {
    pub const IGNORE: u16 = 0x200;
    pub const METADATA: u16 = 0x100;
    pub const FOLLOWS: u16 = 0x80;
    pub const COMPLETE: u16 = 0x40;
    pub const NEXT: u16 = 0x20;
    /// SETUP 专用。
    pub const LEASE: u16 = 0x40;
    /// SETUP 专用。
    pub const RESUME: u16 = 0x80;
    /// KEEPALIVE 专用。
    pub const RESPOND: u16 = 0x80;
    pub const MASK: u16 = 0x3ff;
}

/// 帧类型标签。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    Setup,
    Keepalive,
    RequestResponse,
    RequestFnf,
    RequestStream,
    RequestChannel,
    RequestN,
    Cancel,
    Payload,
    Error,
    MetadataPush,
}

impl FrameType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::Setup,
            0x03 => Self::Keepalive,
            0x04 => Self::RequestResponse,
            0x05 => Self::RequestFnf,
            0x06 => Self::RequestStream,
            0x07 => Self::RequestChannel,
            0x08 => Self::RequestN,
            0x09 => Self::Cancel,
            0x0A => Self::Payload,
            0x0B => Self::Error,
            0x0C => Self::MetadataPush,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        match self {
            Self::Setup => 0x01,
            Self::Keepalive => 0x03,
            Self::RequestResponse => 0x04,
            Self::RequestFnf => 0x05,
            Self::RequestStream => 0x06,
            Self::RequestChannel => 0x07,
            Self::RequestN => 0x08,
            Self::Cancel => 0x09,
            Self::Payload => 0x0A,
            Self::Error => 0x0B,
            Self::MetadataPush => 0x0C,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "SETUP",
            Self::Keepalive => "KEEPALIVE",
            Self::RequestResponse => "REQUEST_RESPONSE",
            Self::RequestFnf => "REQUEST_FNF",
            Self::RequestStream => "REQUEST_STREAM",
            Self::RequestChannel => "REQUEST_CHANNEL",
            Self::RequestN => "REQUEST_N",
            Self::Cancel => "CANCEL",
            Self::Payload => "PAYLOAD",
            Self::Error => "ERROR",
            Self::MetadataPush => "METADATA_PUSH",
        }
    }

    /// 只允许出现在流 0 上的帧类型。
    pub fn is_connection_level(self) -> bool {
        matches!(self, Self::Setup | Self::Keepalive | Self::MetadataPush)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SETUP 帧内容。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetupFrame {
    pub major_version: u16,
    pub minor_version: u16,
    pub keepalive_interval_ms: u32,
    pub max_lifetime_ms: u32,
    /// 仅在 RESUME 标志置位时出现。
    pub resume_token: Option<Bytes>,
    pub lease: bool,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    pub payload: Payload,
}

/// 结构化的线上帧。
///
/// # 教案式说明
/// - **契约 (What)**：除 SETUP/KEEPALIVE/METADATA_PUSH 外每个变体都携带非 0 的 `stream_id`；
///   ERROR 可以是流级（非 0）也可以是连接级（0）；
/// - **标志 (How)**：`follows` 表示后续还有分片，`complete` 表示该方向结束，`next` 表示携带元素。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Setup(SetupFrame),
    Keepalive {
        respond: bool,
        last_received_position: u64,
        data: Bytes,
    },
    RequestResponse {
        stream_id: u32,
        follows: bool,
        payload: Payload,
    },
    RequestFnf {
        stream_id: u32,
        follows: bool,
        payload: Payload,
    },
    RequestStream {
        stream_id: u32,
        follows: bool,
        initial_n: u32,
        payload: Payload,
    },
    RequestChannel {
        stream_id: u32,
        follows: bool,
        complete: bool,
        initial_n: u32,
        payload: Payload,
    },
    RequestN {
        stream_id: u32,
        n: u32,
    },
    Cancel {
        stream_id: u32,
    },
    Payload {
        stream_id: u32,
        follows: bool,
        complete: bool,
        next: bool,
        payload: Payload,
    },
    Error {
        stream_id: u32,
        code: ErrorCode,
        message: String,
    },
    MetadataPush {
        metadata: Bytes,
    },
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Self::Setup(_) | Self::Keepalive { .. } | Self::MetadataPush { .. } => 0,
            Self::RequestResponse { stream_id, .. }
            | Self::RequestFnf { stream_id, .. }
            | Self::RequestStream { stream_id, .. }
            | Self::RequestChannel { stream_id, .. }
            | Self::RequestN { stream_id, .. }
            | Self::Cancel { stream_id }
            | Self::Payload { stream_id, .. }
            | Self::Error { stream_id, .. } => *stream_id,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Setup(_) => FrameType::Setup,
            Self::Keepalive { .. } => FrameType::Keepalive,
            Self::RequestResponse { .. } => FrameType::RequestResponse,
            Self::RequestFnf { .. } => FrameType::RequestFnf,
            Self::RequestStream { .. } => FrameType::RequestStream,
            Self::RequestChannel { .. } => FrameType::RequestChannel,
            Self::RequestN { .. } => FrameType::RequestN,
            Self::Cancel { .. } => FrameType::Cancel,
            Self::Payload { .. } => FrameType::Payload,
            Self::Error { .. } => FrameType::Error,
            Self::MetadataPush { .. } => FrameType::MetadataPush,
        }
    }

    /// 是否为发起新流的请求帧。
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::RequestResponse { .. }
                | Self::RequestFnf { .. }
                | Self::RequestStream { .. }
                | Self::RequestChannel { .. }
        )
    }

    /// 流级 ERROR 帧。
    pub fn error(stream_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            stream_id,
            code,
            message: message.into(),
        }
    }

    /// 携带一个元素的 PAYLOAD 帧；`complete` 为真时同时结束该方向。
    pub fn next(stream_id: u32, payload: Payload, complete: bool) -> Self {
        Self::Payload {
            stream_id,
            follows: false,
            complete,
            next: true,
            payload,
        }
    }

    /// 不携带元素、仅表示完成的 PAYLOAD 帧。
    pub fn complete(stream_id: u32) -> Self {
        Self::Payload {
            stream_id,
            follows: false,
            complete: true,
            next: false,
            payload: Payload::empty(),
        }
    }
}

/// 帧编解码失败的原因。
///
/// 解码失败使连接以 `MalformedFrame` 终止；编码失败只拒绝该帧，不写出任何字节。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("truncated {context}: need {needed} more bytes")]
    Truncated {
        context: &'static str,
        needed: usize,
    },

    #[error("unknown frame type 0x{0:02X}")]
    UnknownFrameType(u8),

    #[error("stream id 0x{0:08X} exceeds 31 bits")]
    StreamIdOutOfRange(u32),

    #[error("{frame_type} frame not allowed on stream {stream_id}")]
    UnexpectedStreamId { frame_type: FrameType, stream_id: u32 },

    #[error("frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },

    #[error("frame length {0} is shorter than the frame header")]
    FrameTooShort(usize),

    #[error("request n must be positive")]
    ZeroRequestN,

    #[error("{field} {value} exceeds the wire limit {max}")]
    ValueOutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("{field} is not valid {encoding}")]
    InvalidText {
        field: &'static str,
        encoding: &'static str,
    },
}
