//! 集成测试共享夹具：内存双工传输与逐帧收发的原始对端。

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use rsocket_core::{
    ClientTransport, DecodeOutcome, DuplexConnection, Frame, FrameCodec, IoConnection, Payload,
    ServerTransport, SetupFrame, TransportError,
};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, mpsc};

pub type MemoryConnection = IoConnection<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

pub const WAIT: Duration = Duration::from_secs(5);

const PIPE_CAPACITY: usize = 64 * 1024;

/// 服务端：从通道接收客户端投递的内存连接。
pub struct MemoryServerTransport {
    incoming: AsyncMutex<mpsc::UnboundedReceiver<MemoryConnection>>,
    listening: AtomicBool,
    fail_listen: bool,
}

/// 客户端：每次建连创建一对内存管道，把对端一半投递给服务端。
#[derive(Clone)]
pub struct MemoryClientTransport {
    server: mpsc::UnboundedSender<MemoryConnection>,
}

pub fn memory_transport() -> (MemoryClientTransport, MemoryServerTransport) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryClientTransport { server: tx },
        MemoryServerTransport {
            incoming: AsyncMutex::new(rx),
            listening: AtomicBool::new(false),
            fail_listen: false,
        },
    )
}

impl MemoryServerTransport {
    /// `listen` 总是失败的服务端传输。
    pub fn failing() -> Self {
        let (_, rx) = mpsc::unbounded_channel();
        Self {
            incoming: AsyncMutex::new(rx),
            listening: AtomicBool::new(false),
            fail_listen: true,
        }
    }
}

#[async_trait]
impl ServerTransport for MemoryServerTransport {
    type Connection = MemoryConnection;

    async fn listen(&mut self) -> Result<(), TransportError> {
        if self.fail_listen {
            return Err(TransportError::io(
                "bind",
                std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
            ));
        }
        self.listening.store(true, Ordering::Release);
        Ok(())
    }

    async fn accept(&self) -> Result<Self::Connection, TransportError> {
        if !self.listening.load(Ordering::Acquire) {
            return Err(TransportError::NotListening);
        }
        match self.incoming.lock().await.recv().await {
            Some(connection) => Ok(connection),
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[async_trait]
impl ClientTransport for MemoryClientTransport {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<Self::Connection, TransportError> {
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        self.server
            .send(IoConnection::from_stream(remote).with_peer("memory"))
            .map_err(|_| TransportError::Closed)?;
        Ok(IoConnection::from_stream(local))
    }
}

/// 直接按帧读写的对端，用于断言线上行为。
pub struct RawPeer {
    io: MemoryConnection,
    codec: FrameCodec,
    inbound: BytesMut,
}

impl RawPeer {
    pub async fn connect(transport: &MemoryClientTransport) -> Self {
        Self::from_connection(transport.connect().await.expect("memory connect"))
    }

    /// 以服务端接受到的连接充当对端。
    pub fn from_connection(io: MemoryConnection) -> Self {
        Self {
            io,
            codec: FrameCodec::default(),
            inbound: BytesMut::new(),
        }
    }

    /// 建连并完成 SETUP。
    pub async fn handshake(transport: &MemoryClientTransport) -> Self {
        let mut peer = Self::connect(transport).await;
        peer.send(Frame::Setup(setup_frame())).await;
        peer
    }

    pub async fn send(&mut self, frame: Frame) {
        let mut raw = BytesMut::new();
        self.codec.encode(&frame, &mut raw).expect("encode");
        self.send_raw(&raw).await;
    }

    pub async fn send_raw(&mut self, raw: &[u8]) {
        self.io
            .send(bytes::Bytes::copy_from_slice(raw))
            .await
            .expect("send");
    }

    /// 读取下一帧；对端关闭返回 `None`，超时视为测试失败。
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::time::timeout(WAIT, async {
            loop {
                if let DecodeOutcome::Complete(frame) =
                    self.codec.decode(&mut self.inbound).expect("decode")
                {
                    return Some(frame);
                }
                match self.io.receive(&mut self.inbound).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        })
        .await
        .expect("frame within deadline")
    }

    /// 跳过 KEEPALIVE，读取下一条业务帧。
    pub async fn recv_skipping_keepalive(&mut self) -> Option<Frame> {
        loop {
            match self.recv().await {
                Some(Frame::Keepalive { .. }) => continue,
                other => return other,
            }
        }
    }

    /// 在 `window` 内没有收到任何非 KEEPALIVE 帧。
    pub async fn assert_quiet(&mut self, window: Duration) {
        let quiet = tokio::time::timeout(window, self.recv_skipping_keepalive()).await;
        assert!(quiet.is_err(), "unexpected frame: {quiet:?}");
    }
}

pub fn setup_frame() -> SetupFrame {
    SetupFrame {
        major_version: 1,
        minor_version: 0,
        keepalive_interval_ms: 30_000,
        max_lifetime_ms: 90_000,
        resume_token: None,
        lease: false,
        metadata_mime_type: "text/plain".to_owned(),
        data_mime_type: "text/plain".to_owned(),
        payload: Payload::empty(),
    }
}

pub fn text(payload: &Payload) -> String {
    payload.data_utf8().unwrap_or_default().to_owned()
}
