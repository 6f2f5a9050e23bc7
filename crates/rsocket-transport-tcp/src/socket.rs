use serde::{Deserialize, Serialize};
use socket2::SockRef;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

/// TCP 套接字级配置项，实现对内核行为的显式控制。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 协议帧通常很小且要求低延迟，默认开启 `TCP_NODELAY`，避免 Nagle 算法把 KEEPALIVE 与
///   REQUEST_N 之类的控制帧延后；
/// - 将“关闭时未发送完的数据等待多久再 RST”显式配置化，避免调用方直接操作 `socket2`。
///
/// ## 核心逻辑（How）
/// - `linger_ms` 为 `Some(ms)` 时通过 `socket2::SockRef::set_linger` 设置 `SO_LINGER`；
///   `None` 表示遵循内核默认策略；
/// - 可由 TOML 反序列化，字段缺省时取默认值。
///
/// ## 契约说明（What）
/// - **前置条件**：调用 `apply` 前 `TcpStream` 必须已成功创建；
/// - **后置条件**：`apply` 返回 `Ok(())` 时两项选项均已落地。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - `SO_LINGER` 在 Linux 上取整到秒，设置过小可能导致发送缓冲中的数据被丢弃。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSocketConfig {
    pub nodelay: bool,
    pub linger_ms: Option<u64>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            linger_ms: None,
        }
    }
}

impl TcpSocketConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger_ms = linger.map(|linger| u64::try_from(linger.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger_ms.map(Duration::from_millis)
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        SockRef::from(stream).set_linger(self.linger())
    }
}
