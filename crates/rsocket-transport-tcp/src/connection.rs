use crate::TcpSocketConfig;
use crate::error::{self, CONFIGURE, map_io_error};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rsocket_core::{DuplexConnection, TransportError};
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex as AsyncMutex;

/// 一条 TCP 连接，读写半部各自加锁，可同时被读循环与写任务使用。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 协议连接的读循环与写任务并发运行，拆分为 `OwnedReadHalf`/`OwnedWriteHalf` 后两者互不阻塞；
/// - 构造时即写入 [`TcpSocketConfig`]，保证同一监听器接受的连接关闭策略一致。
///
/// ## 契约 (What)
/// - `send`：写满整段字节后返回；
/// - `receive`：追加读取到缓冲，返回 0 表示对端 EOF；
/// - `close`：写半关闭（发送 FIN），重复调用或对端已断开时视为成功。
#[derive(Debug)]
pub struct TcpConnection {
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<OwnedWriteHalf>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    config: TcpSocketConfig,
}

impl TcpConnection {
    pub(crate) fn from_stream(
        stream: TcpStream,
        config: TcpSocketConfig,
    ) -> Result<Self, TransportError> {
        config
            .apply(&stream)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let local_addr = stream
            .local_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            local_addr,
            peer_addr,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// 返回构造时使用的套接字配置。
    pub fn config(&self) -> &TcpSocketConfig {
        &self.config
    }

    /// 查询底层套接字当前的 `SO_LINGER` 设置；Linux 会向下取整到秒。
    pub async fn linger(&self) -> Result<Option<Duration>, TransportError> {
        let writer = self.writer.lock().await;
        let stream: &TcpStream = (*writer).as_ref();
        SockRef::from(stream)
            .linger()
            .map_err(|err| map_io_error(CONFIGURE, err))
    }
}

#[async_trait]
impl DuplexConnection for TcpConnection {
    async fn send(&self, bytes: Bytes) -> Result<(), TransportError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&bytes)
            .await
            .map_err(|err| map_io_error(error::WRITE, err))
    }

    async fn receive(&self, buf: &mut BytesMut) -> Result<usize, TransportError> {
        let mut reader = self.reader.lock().await;
        reader
            .read_buf(buf)
            .await
            .map_err(|err| map_io_error(error::READ, err))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(map_io_error(error::SHUTDOWN, err)),
        }
    }

    fn peer(&self) -> Option<String> {
        Some(self.peer_addr.to_string())
    }
}
