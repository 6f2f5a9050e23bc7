//! # server 模块说明
//!
//! ## 角色定位（Why）
//! - 监听传输、为每条入站连接建立独立的连接实例（多路复用器 + 分发器），并统一管理其生命周期；
//! - 单条连接的任何失败都只影响该连接，接受循环持续运行直到 `stop`。
//!
//! ## 状态机（What）
//! - `Idle --start()--> Listening --stop()--> Stopped`；
//! - `start` 只能在 `Idle` 调用一次，否则返回 [`ServerError::AlreadyStarted`]；监听失败时保持 `Idle`；
//! - `stop` 幂等：发出关闭信号、并发关闭每条存活连接（CONNECTION_CLOSE + 排空写队列），
//!   关闭与连接任务的回收共用一个 `shutdown_timeout`，超时后中止剩余任务与写任务。
//!
//! ## 实现要点（How）
//! - 存活连接登记在 `DashMap<u64, Arc<Connection>>` 中，连接任务退出时自行注销；
//! - 连接任务由 `JoinSet` 托管，接受循环顺带回收已结束的任务。

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::connection::Connection;
use crate::multiplexer::Role;
use crate::responder::ResponderFactory;
use crate::transport::{ServerTransport, TransportError};

/// 接受失败后的退避时长。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// 服务器状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening,
    Stopped,
}

/// 服务器控制面错误。
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server already started")]
    AlreadyStarted,

    #[error("server not started")]
    NotStarted,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct ServerInner {
    config: ServerConfig,
    factory: Arc<dyn ResponderFactory>,
    state: Mutex<ServerState>,
    connections: DashMap<u64, Arc<Connection>>,
    next_connection_id: AtomicU64,
    shutdown: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// 协议服务器。
///
/// # 教案式说明
/// - **意图 (Why)**：把“监听 + 每连接一个协议实例”的样板收敛到一处，应用只需提供处理器工厂；
/// - **契约 (What)**：`start` 返回时已经在监听，`local_addr` 可用；`connection_count` 只统计已接受
///   且尚未结束的连接；
/// - **风险 (Trade-offs)**：`Drop` 只发出关闭信号，不等待连接收尾；需要优雅退出时显式调用 `stop`。
pub struct RSocketServer<T: ServerTransport> {
    transport: Mutex<Option<T>>,
    inner: Arc<ServerInner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: ServerTransport> RSocketServer<T> {
    pub fn new<F>(transport: T, config: ServerConfig, factory: F) -> Self
    where
        F: ResponderFactory,
    {
        let (shutdown, _) = watch::channel(false);
        Self {
            transport: Mutex::new(Some(transport)),
            inner: Arc::new(ServerInner {
                config,
                factory: Arc::new(factory),
                state: Mutex::new(ServerState::Idle),
                connections: DashMap::new(),
                next_connection_id: AtomicU64::new(1),
                shutdown,
                local_addr: Mutex::new(None),
            }),
            accept_task: Mutex::new(None),
        }
    }

    /// 开始监听并启动接受循环。
    pub async fn start(&self) -> Result<(), ServerError> {
        if *self.inner.state.lock() != ServerState::Idle {
            return Err(ServerError::AlreadyStarted);
        }
        self.inner.config.validate()?;
        let mut transport = self
            .transport
            .lock()
            .take()
            .ok_or(ServerError::AlreadyStarted)?;
        if let Err(err) = transport.listen().await {
            error!(error = %err, "server failed to listen");
            *self.transport.lock() = Some(transport);
            return Err(err.into());
        }

        let local_addr = transport.local_addr();
        *self.inner.local_addr.lock() = local_addr;
        *self.inner.state.lock() = ServerState::Listening;
        let shutdown = self.inner.shutdown.subscribe();
        let task = tokio::spawn(accept_loop(self.inner.clone(), transport, shutdown));
        *self.accept_task.lock() = Some(task);
        info!(
            local_addr = local_addr.map(|addr| addr.to_string()).as_deref().unwrap_or("unknown"),
            "server listening"
        );
        Ok(())
    }

    /// 停止接受新连接并关闭全部存活连接。
    pub async fn stop(&self) -> Result<(), ServerError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ServerState::Idle => return Err(ServerError::NotStarted),
                ServerState::Stopped => return Ok(()),
                ServerState::Listening => *state = ServerState::Stopped,
            }
        }
        self.inner.shutdown.send_replace(true);
        let task = self.accept_task.lock().take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!(error = %err, "accept loop ended abnormally");
        }
        info!("server stopped");
        Ok(())
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.lock()
    }

    /// 已接受且尚未结束的连接数。
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// 实际监听地址；`start` 之前为 `None`。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }
}

impl<T: ServerTransport> Drop for RSocketServer<T> {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}

async fn stopping(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn accept_loop<T: ServerTransport>(
    inner: Arc<ServerInner>,
    transport: T,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = stopping(&mut shutdown) => break,
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            accepted = transport.accept() => match accepted {
                Ok(stream) => {
                    let id = inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    let connection = Connection::start(
                        id,
                        Role::Server,
                        Arc::new(stream),
                        inner.config.connection.clone(),
                    );
                    inner.connections.insert(id, connection.clone());
                    debug!(connection_id = id, "connection accepted");
                    let registry = inner.clone();
                    let factory = inner.factory.clone();
                    tasks.spawn(async move {
                        connection.serve(factory).await;
                        registry.connections.remove(&id);
                        debug!(connection_id = id, "connection discarded");
                    });
                }
                Err(err) => {
                    error!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    let live: Vec<Arc<Connection>> = inner
        .connections
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    info!(connections = live.len(), "closing live connections");
    let mut closing = JoinSet::new();
    for connection in &live {
        let connection = connection.clone();
        closing.spawn(async move { connection.close().await });
    }
    let drained = tokio::time::timeout(inner.config.shutdown_timeout(), async {
        while closing.join_next().await.is_some() {}
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = tasks.len(),
            "connections did not finish before the shutdown timeout"
        );
        closing.abort_all();
        tasks.abort_all();
        for connection in &live {
            connection.abort();
        }
    }
    inner.connections.clear();
}
