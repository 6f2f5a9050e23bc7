#![doc = r#"
# rsocket-transport-tcp

## 设计动机（Why）
- **定位**：为 `rsocket-core` 提供 Tokio 运行时上的 TCP 传输，封装监听、建连、读写与半关闭；
- **架构角色**：实现 [`ClientTransport`](rsocket_core::ClientTransport)、
  [`ServerTransport`](rsocket_core::ServerTransport) 与
  [`DuplexConnection`](rsocket_core::DuplexConnection) 三个契约，协议层对 TCP 无感知。

## 核心契约（What）
- **输出保障**：监听、建连、读写与半关闭的失败统一映射为
  [`TransportError::Io`](rsocket_core::TransportError::Io)，`operation` 字段标明出错的操作；
- **套接字选项**：[`TcpSocketConfig`] 在建连与接受时写入 `TCP_NODELAY` 与 `SO_LINGER`。

## 实现策略（How）
- 连接拆分为独立的读写半部并各自加锁，读循环与写任务可以并行；
- 建连超时通过 `tokio::time::timeout` 组合。

## 风险与考量（Trade-offs）
- 帧边界由协议层的长度前缀界定，本 crate 只搬运字节；
- 未实现 TLS，需要加密时可在 `DuplexConnection` 之上另行封装。
"#]

mod client;
mod connection;
mod error;
mod server;
mod socket;

pub use client::TcpClientTransport;
pub use connection::TcpConnection;
pub use server::TcpServerTransport;
pub use socket::TcpSocketConfig;
