//! 传输能力契约：协议层只依赖“可收发字节的全双工连接”。
//!
//! # 教案式说明
//! - **契约 (What)**：[`DuplexConnection`] 提供 `send`/`receive`/`close`，`receive` 返回 0 表示对端关闭；
//!   [`ClientTransport`] 负责建连，[`ServerTransport`] 负责监听与接受；
//! - **并发 (How)**：连接的读循环与写任务并行调用同一连接的 `receive` 与 `send`，
//!   实现方需保证两者可并发执行（通常拆分读写半部各自加锁）；
//! - **内置实现**：[`IoConnection`] 把任意 `AsyncRead`/`AsyncWrite` 半部组合成连接，
//!   测试中配合 `tokio::io::duplex` 使用。

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

/// 传输层故障。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{operation} failed: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("transport closed")]
    Closed,

    #[error("transport is not listening")]
    NotListening,
}

impl TransportError {
    pub fn io(operation: &'static str, source: io::Error) -> Self {
        Self::Io { operation, source }
    }
}

/// 全双工字节连接。
#[async_trait]
pub trait DuplexConnection: Send + Sync + 'static {
    /// 写出一段已编码的字节（可能包含多帧）。
    async fn send(&self, bytes: Bytes) -> Result<(), TransportError>;

    /// 读取若干字节追加到 `buf`，返回读取量；0 表示对端已关闭。
    async fn receive(&self, buf: &mut BytesMut) -> Result<usize, TransportError>;

    /// 关闭写方向并释放资源，幂等。
    async fn close(&self) -> Result<(), TransportError>;

    /// 对端描述，仅用于日志。
    fn peer(&self) -> Option<String> {
        None
    }
}

/// 客户端传输：每次调用建立一条新连接。
#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    type Connection: DuplexConnection;

    async fn connect(&self) -> Result<Self::Connection, TransportError>;
}

/// 服务端传输：先 `listen` 一次，之后可并发 `accept`。
#[async_trait]
pub trait ServerTransport: Send + Sync + 'static {
    type Connection: DuplexConnection;

    async fn listen(&mut self) -> Result<(), TransportError>;

    /// 等待下一条入站连接；未 `listen` 时返回 [`TransportError::NotListening`]。
    async fn accept(&self) -> Result<Self::Connection, TransportError>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// 由异步读写半部组合成的连接。
#[derive(Debug)]
pub struct IoConnection<R, W> {
    reader: AsyncMutex<R>,
    writer: AsyncMutex<W>,
    peer: Option<String>,
}

impl<R, W> IoConnection<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }
}

impl<S> IoConnection<tokio::io::ReadHalf<S>, tokio::io::WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// 拆分一个双向字节流。
    pub fn from_stream(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            peer: None,
        }
    }
}

#[async_trait]
impl<R, W> DuplexConnection for IoConnection<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, bytes: Bytes) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&bytes)
            .await
            .map_err(|err| TransportError::io("write", err))?;
        writer
            .flush()
            .await
            .map_err(|err| TransportError::io("flush", err))
    }

    async fn receive(&self, buf: &mut BytesMut) -> Result<usize, TransportError> {
        let mut reader = self.reader.lock().await;
        reader
            .read_buf(buf)
            .await
            .map_err(|err| TransportError::io("read", err))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(TransportError::io("shutdown", err)),
        }
    }

    fn peer(&self) -> Option<String> {
        self.peer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn duplex_halves_carry_bytes_and_eof() {
        let (left, right) = tokio::io::duplex(64);
        let left = IoConnection::from_stream(left);
        let right = IoConnection::from_stream(right).with_peer("right");

        left.send(Bytes::from_static(b"ping")).await.expect("send");
        let mut buf = BytesMut::new();
        let read = right.receive(&mut buf).await.expect("receive");
        assert_eq!(read, 4);
        assert_eq!(&buf[..], b"ping");
        assert_eq!(right.peer().as_deref(), Some("right"));

        left.close().await.expect("close");
        assert_eq!(right.receive(&mut buf).await.expect("eof"), 0);
    }
}
