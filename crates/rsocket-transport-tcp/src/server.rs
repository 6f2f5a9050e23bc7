use crate::error::{self, map_io_error};
use crate::{TcpConnection, TcpSocketConfig};
use async_trait::async_trait;
use rsocket_core::{ServerTransport, TransportError};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// 服务端 TCP 传输。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 在不暴露 Tokio 具体类型的前提下，提供“监听 → 接受连接”的最小能力；
/// - 监听时才真正绑定端口，`bind_addr` 的端口为 0 时由操作系统分配，实际地址经
///   [`ServerTransport::local_addr`] 获取。
///
/// ## 契约 (What)
/// - `listen`：绑定地址；重复调用返回 `Ok(())` 且不重新绑定；
/// - `accept`：未监听时返回 [`TransportError::NotListening`]；成功返回的连接已应用
///   [`TcpSocketConfig`]；
/// - 单次 `accept` 失败（如对端在握手后立即 RST）不影响后续调用。
///
/// ## 注意事项 (Trade-offs)
/// - 未支持 `SO_REUSEPORT` 等高级套接字选项，可在绑定前扩展。
#[derive(Debug)]
pub struct TcpServerTransport {
    bind_addr: SocketAddr,
    config: TcpSocketConfig,
    listener: Option<TcpListener>,
}

impl TcpServerTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            config: TcpSocketConfig::default(),
            listener: None,
        }
    }

    /// 覆盖接受连接时应用的套接字配置。
    pub fn with_socket_config(mut self, config: TcpSocketConfig) -> Self {
        self.config = config;
        self
    }

    pub fn socket_config(&self) -> &TcpSocketConfig {
        &self.config
    }
}

#[async_trait]
impl ServerTransport for TcpServerTransport {
    type Connection = TcpConnection;

    async fn listen(&mut self) -> Result<(), TransportError> {
        if self.listener.is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|err| map_io_error(error::BIND, err))?;
        if let Ok(local) = listener.local_addr() {
            info!(local_addr = %local, "tcp listener bound");
        }
        self.listener = Some(listener);
        Ok(())
    }

    async fn accept(&self) -> Result<Self::Connection, TransportError> {
        let listener = self.listener.as_ref().ok_or(TransportError::NotListening)?;
        let (stream, remote) = listener
            .accept()
            .await
            .map_err(|err| map_io_error(error::ACCEPT, err))?;
        debug!(peer_addr = %remote, "tcp connection accepted");
        TcpConnection::from_stream(stream, self.config.clone())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }
}
