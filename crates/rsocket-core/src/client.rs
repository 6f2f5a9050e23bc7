//! 客户端入口：建立传输连接、完成 SETUP 握手并交出 [`Requester`]。
//!
//! # 教案式说明
//! - **契约 (What)**：[`ClientBuilder::connect`] 返回时 SETUP 已入队、状态为 `Connected`；
//!   服务端若拒绝 SETUP，会在随后的状态流中表现为 `Error`，并使在途请求以错误结束；
//! - **对称性 (How)**：客户端同样可以注册 [`Responder`]，处理服务端以偶数流 ID 反向发起的请求；
//! - **配置**：建连前先执行 [`ConnectionConfig::validate`]，无效配置以
//!   [`ConnectionError::InvalidConfig`] 失败且不触碰网络。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tracing::info;

use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionStatus};
use crate::error::ConnectionError;
use crate::multiplexer::Role;
use crate::payload::Payload;
use crate::requester::Requester;
use crate::responder::{DefaultResponder, Responder};
use crate::transport::ClientTransport;

static NEXT_CLIENT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 客户端构造器。
pub struct ClientBuilder {
    config: ConnectionConfig,
    setup_payload: Payload,
    responder: Arc<dyn Responder>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
            setup_payload: Payload::empty(),
            responder: Arc::new(DefaultResponder),
        }
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// SETUP 帧携带的载荷。
    pub fn with_setup_payload(mut self, payload: Payload) -> Self {
        self.setup_payload = payload;
        self
    }

    /// 处理服务端反向请求的处理器。
    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = responder;
        self
    }

    pub async fn connect<T>(self, transport: &T) -> Result<RSocketClient, ConnectionError>
    where
        T: ClientTransport,
    {
        self.config.validate()?;
        let stream = transport.connect().await?;
        let id = NEXT_CLIENT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::start(id, Role::Client, Arc::new(stream), self.config);
        connection.start_client(self.setup_payload, self.responder);
        info!(connection_id = id, "client connection established");
        Ok(RSocketClient { connection })
    }
}

/// 已完成握手的客户端连接。
pub struct RSocketClient {
    connection: Arc<Connection>,
}

impl std::fmt::Debug for RSocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RSocketClient")
            .field("connection_id", &self.connection.id())
            .field("status", &self.connection.current_status())
            .finish()
    }
}

impl RSocketClient {
    /// 以缺省 SETUP 载荷建连。
    pub async fn connect<T>(
        transport: &T,
        config: ConnectionConfig,
        responder: Arc<dyn Responder>,
    ) -> Result<Self, ConnectionError>
    where
        T: ClientTransport,
    {
        ClientBuilder::new()
            .with_config(config)
            .with_responder(responder)
            .connect(transport)
            .await
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn requester(&self) -> Requester {
        self.connection.requester()
    }

    /// 连接状态流。
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.status()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.connection.current_status()
    }

    /// 发送 CONNECTION_CLOSE 并关闭传输；幂等。
    pub async fn close(&self) {
        self.connection.close().await;
    }
}
