use crate::error::{self, map_io_error, timeout_error};
use crate::{TcpConnection, TcpSocketConfig};
use async_trait::async_trait;
use rsocket_core::{ClientTransport, TransportError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// 客户端 TCP 传输：每次 `connect` 建立一条新连接。
#[derive(Clone, Debug)]
pub struct TcpClientTransport {
    addr: SocketAddr,
    config: TcpSocketConfig,
    connect_timeout: Option<Duration>,
}

impl TcpClientTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            config: TcpSocketConfig::default(),
            connect_timeout: None,
        }
    }

    pub fn with_socket_config(mut self, config: TcpSocketConfig) -> Self {
        self.config = config;
        self
    }

    /// 建连超时；`None` 表示依赖操作系统的超时。
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl ClientTransport for TcpClientTransport {
    type Connection = TcpConnection;

    async fn connect(&self) -> Result<Self::Connection, TransportError> {
        let connect = TcpStream::connect(self.addr);
        let stream = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| timeout_error(error::CONNECT))?,
            None => connect.await,
        }
        .map_err(|err| map_io_error(error::CONNECT, err))?;
        let connection = TcpConnection::from_stream(stream, self.config.clone())?;
        debug!(
            local_addr = %connection.local_addr(),
            peer_addr = %connection.peer_addr(),
            "tcp connection established"
        );
        Ok(connection)
    }
}
