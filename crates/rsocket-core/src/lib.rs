#![doc = r#"
# rsocket-core

## 设计动机（Why）
- 在单条全双工字节连接上复用多个逻辑流，提供四种交互模型：
  fire-and-forget、request/response、request/stream、request/channel，外加连接级 metadata push；
- 流级背压以 REQUEST_N 帧表达，应用侧通过 [`rsocket_flowable`] 的 `Single`/`Flowable` 收发信号。

## 核心契约（What）
- **帧层**：[`frame`] 负责 RSocket 1.0 线格式的编解码，带 3 字节长度前缀，畸形输入只产生错误不会 panic；
- **连接层**：客户端以奇数、服务端以偶数分配流 ID；SETUP 握手之后双方对称，都可以发起请求；
- **失败隔离**：单个流的错误只终止该流，连接级错误（畸形帧、keepalive 超时、对端关闭）终止连接上的全部流；
- **传输无关**：只依赖 [`DuplexConnection`]、[`ClientTransport`] 与 [`ServerTransport`] 三个契约。

## 模块地图（How）
- [`payload`] / [`frame`] / [`error`] / [`config`]：数据与配置模型；
- [`requester`] / [`responder`]：应用可见的请求发起与处理接口；
- [`client`] / [`server`]：建连、握手与服务端生命周期；
- 内部的多路复用器与分发器负责流表管理、分片重组与请求路由。

## 风险与考量（Trade-offs）
- 不实现 LEASE 与会话恢复，收到对应 SETUP 标志时以 UNSUPPORTED_SETUP 拒绝；
- 出站帧不做分片，超过 `max_frame_size` 的帧会以 REJECTED 终止所在的流。
"#]

pub mod client;
pub mod config;
mod connection;
mod dispatcher;
pub mod error;
pub mod frame;
mod multiplexer;
pub mod payload;
pub mod requester;
pub mod responder;
pub mod server;
mod stream;
pub mod transport;

pub use client::{ClientBuilder, RSocketClient};
pub use config::{ConfigError, ConnectionConfig, ServerConfig};
pub use connection::{ConnectionStatus, WRITE_BATCH_BYTES};
pub use error::{ConnectionError, ErrorCode, RSocketError};
pub use frame::{DecodeOutcome, Frame, FrameCodec, FrameError, FrameType, SetupFrame};
pub use multiplexer::{Role, StreamIdAllocator, StreamIdsExhausted};
pub use payload::Payload;
pub use requester::Requester;
pub use responder::{DefaultResponder, Responder, ResponderFactory, SetupInfo};
pub use server::{RSocketServer, ServerError, ServerState};
pub use stream::InteractionKind;
pub use transport::{ClientTransport, DuplexConnection, IoConnection, ServerTransport, TransportError};

pub use rsocket_flowable::{Flowable, Single};
