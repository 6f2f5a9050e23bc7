//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义协议层对外暴露的错误：线上错误码 [`ErrorCode`]、随响应式信号传播的
//!   [`RSocketError`]，以及连接级致命错误 [`ConnectionError`]；
//! - 错误与线上错误码的映射只在本模块出现一次。
//!
//! ## 分类（What）
//! - **流级**：`APPLICATION_ERROR`、`REJECTED`、`CANCELED`、`INVALID` 只终止单条流，连接不受影响；
//! - **连接级**：SETUP 相关错误码与 `CONNECTION_ERROR`/`CONNECTION_CLOSE` 以流 0 发送，随后连接关闭。

use std::fmt;
use std::time::Duration;

use rsocket_flowable::Interrupted;
use thiserror::Error;

use crate::config::ConfigError;
use crate::frame::FrameError;
use crate::transport::TransportError;

/// 线上错误码。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidSetup,
    UnsupportedSetup,
    RejectedSetup,
    RejectedResume,
    ConnectionError,
    ConnectionClose,
    ApplicationError,
    Rejected,
    Canceled,
    Invalid,
    /// 应用自定义错误码（`0x301..=0xFFFF_FFFE`）或未知的保留值。
    Custom(u32),
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x001 => Self::InvalidSetup,
            0x002 => Self::UnsupportedSetup,
            0x003 => Self::RejectedSetup,
            0x004 => Self::RejectedResume,
            0x101 => Self::ConnectionError,
            0x102 => Self::ConnectionClose,
            0x201 => Self::ApplicationError,
            0x202 => Self::Rejected,
            0x203 => Self::Canceled,
            0x204 => Self::Invalid,
            other => Self::Custom(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::InvalidSetup => 0x001,
            Self::UnsupportedSetup => 0x002,
            Self::RejectedSetup => 0x003,
            Self::RejectedResume => 0x004,
            Self::ConnectionError => 0x101,
            Self::ConnectionClose => 0x102,
            Self::ApplicationError => 0x201,
            Self::Rejected => 0x202,
            Self::Canceled => 0x203,
            Self::Invalid => 0x204,
            Self::Custom(code) => code,
        }
    }

    /// 该错误码是否只能出现在流 0 上。
    pub fn is_connection_level(self) -> bool {
        matches!(
            self,
            Self::InvalidSetup
                | Self::UnsupportedSetup
                | Self::RejectedSetup
                | Self::RejectedResume
                | Self::ConnectionError
                | Self::ConnectionClose
        )
    }

    fn name(self) -> &'static str {
        match self {
            Self::InvalidSetup => "INVALID_SETUP",
            Self::UnsupportedSetup => "UNSUPPORTED_SETUP",
            Self::RejectedSetup => "REJECTED_SETUP",
            Self::RejectedResume => "REJECTED_RESUME",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::ConnectionClose => "CONNECTION_CLOSE",
            Self::ApplicationError => "APPLICATION_ERROR",
            Self::Rejected => "REJECTED",
            Self::Canceled => "CANCELED",
            Self::Invalid => "INVALID",
            Self::Custom(_) => "CUSTOM",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:03X})", self.name(), self.as_u32())
    }
}

/// 随 `Single`/`Flowable` 传播、并可原样编码为 ERROR 帧的协议错误。
///
/// # 教案式说明
/// - **契约 (What)**：`code` 决定线上错误码，`message` 为 UTF-8 文案；实现 `Clone`，
///   以便 `Flowable::error` 之类可重复订阅的源多次交付同一错误；
/// - **构造 (How)**：每个错误码一个构造函数，处理器通常只需要 [`RSocketError::application`]。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct RSocketError {
    code: ErrorCode,
    message: String,
}

impl RSocketError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ApplicationError, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Rejected, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Invalid, message)
    }

    pub fn invalid_setup(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidSetup, message)
    }

    pub fn unsupported_setup(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsupportedSetup, message)
    }

    pub fn rejected_setup(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RejectedSetup, message)
    }

    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionError, message)
    }

    pub fn connection_close(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionClose, message)
    }

    /// 处理器未覆盖某交互模型时的默认应答。
    pub fn not_implemented() -> Self {
        Self::application("Not implemented")
    }

    /// 连接已进入终态。
    pub fn connection_closed() -> Self {
        Self::connection_close("connection closed")
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<Interrupted> for RSocketError {
    fn from(interrupted: Interrupted) -> Self {
        Self::canceled(interrupted.to_string())
    }
}

/// 连接级致命错误：出现后连接状态变为 `Error`，全部流在本地被终止。
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// 入站字节流无法解码。
    #[error("malformed frame: {0}")]
    Malformed(#[from] FrameError),

    /// 对端违反连接级协议约束（如 SETUP 之前发送请求）。
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// 对端在流 0 上发送了 ERROR，或拒绝了 SETUP。
    #[error("rejected by peer: {0}")]
    Rejected(RSocketError),

    /// 在 `max_lifetime` 内未收到任何帧。
    #[error("no keep-alive acks for {} ms", .0.as_millis())]
    KeepaliveTimeout(Duration),

    /// 握手失败：SETUP 缺失、格式不受支持或被处理器工厂拒绝。
    #[error("setup failed: {0}")]
    Setup(RSocketError),

    /// 本地配置无法在线上表达，连接未建立。
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// 连接已关闭。
    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    /// 关闭连接时发给对端（流 0）的 ERROR 帧内容；传输已失效时返回 `None`。
    pub fn to_wire(&self) -> Option<RSocketError> {
        match self {
            Self::Malformed(err) => Some(RSocketError::connection_error(err.to_string())),
            Self::ProtocolViolation(reason) => Some(RSocketError::connection_error(reason.clone())),
            Self::KeepaliveTimeout(_) => Some(RSocketError::connection_error(self.to_string())),
            Self::Setup(err) => Some(err.clone()),
            Self::Closed => Some(RSocketError::connection_close("connection closed")),
            Self::Transport(_) | Self::Rejected(_) | Self::InvalidConfig(_) => None,
        }
    }
}
