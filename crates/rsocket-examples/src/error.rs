use std::net::AddrParseError;

use rsocket_core::{ConnectionError, RSocketError, ServerError};
use thiserror::Error;

use crate::DemoConfigError;

/// 示例二进制的顶层错误，`main` 记录后以退出码 1 结束进程。
#[derive(Debug, Error)]
pub enum ExampleError {
    #[error(transparent)]
    Config(#[from] DemoConfigError),

    #[error("invalid address: {0}")]
    Address(#[from] AddrParseError),

    #[error("server: {0}")]
    Server(#[from] ServerError),

    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    #[error("request failed: {0}")]
    Request(#[from] RSocketError),

    #[error("failed to wait for ctrl-c: {0}")]
    Signal(#[source] std::io::Error),

    #[error("stream dropped without a terminal signal")]
    StreamDropped,
}
