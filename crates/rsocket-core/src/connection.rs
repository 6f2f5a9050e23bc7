//! # connection 模块说明
//!
//! ## 角色定位（Why）
//! - 一条传输连接对应一个连接实例：读循环按到达顺序逐帧处理，写任务串行写出唯一的出站队列，
//!   保活任务负责心跳与失活检测；
//! - 连接状态通过 `tokio::sync::watch` 对外广播，任何任务都能观察并等待终态。
//!
//! ## 生命周期（What）
//! - `Connecting --SETUP--> Connected --(关闭|错误)--> Closed | Error`，终态不可再迁移；
//! - 服务端：首帧必须是合法 SETUP（主版本 1、无 LEASE/RESUME、保活参数为正），否则回应
//!   INVALID_SETUP/UNSUPPORTED_SETUP 后关闭；处理器工厂拒绝时回应 REJECTED_SETUP；
//! - 客户端：SETUP 入队即进入 Connected；
//! - 入站字节无法解码属于连接级致命错误：尽力向每条活跃流发送 ERROR，再以 CONNECTION_ERROR 关闭；
//! - 对端在流 0 上发送 ERROR：CONNECTION_CLOSE 视为正常关闭，其余错误码使连接进入 Error。
//!
//! ## 实现要点（How）
//! - 终止只会发生一次（`watch::Sender::send_if_modified` 判定），随后拆除全部流、排空写队列、关闭传输；
//! - 写任务把队列中已就绪的帧合并为一次写出，单批上限 [`WRITE_BATCH_BYTES`]；
//! - 超出 `max_frame_size` 的出站帧不会写出：对应流收到 ERROR(REJECTED) 并在本地终止。

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ConnectionError, ErrorCode, RSocketError};
use crate::frame::{DecodeOutcome, Frame, FrameCodec, SetupFrame};
use crate::multiplexer::{Multiplexer, Outbound, Role, Routed};
use crate::payload::Payload;
use crate::requester::Requester;
use crate::responder::{Responder, ResponderFactory, SetupInfo};
use crate::transport::DuplexConnection;

/// 写任务单次合并写出的字节上限。
pub const WRITE_BATCH_BYTES: usize = 64 * 1024;

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// 连接状态。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Closed,
    Error(String),
}

impl ConnectionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error(_))
    }
}

/// 等待状态进入终态；发送端已释放时同样返回。
async fn terminated(status: &mut watch::Receiver<ConnectionStatus>) {
    let _ = status.wait_for(ConnectionStatus::is_terminal).await;
}

/// 单条协议连接。
pub(crate) struct Connection {
    id: u64,
    peer: Option<String>,
    transport: Arc<dyn DuplexConnection>,
    mux: Multiplexer,
    codec: FrameCodec,
    config: ConnectionConfig,
    status: watch::Sender<ConnectionStatus>,
    last_received: Mutex<Instant>,
    writer: Mutex<Option<JoinHandle<()>>>,
    writer_abort: Mutex<Option<AbortHandle>>,
}

impl Connection {
    /// 构造连接并启动写任务。
    pub(crate) fn start(
        id: u64,
        role: Role,
        transport: Arc<dyn DuplexConnection>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let connection = Arc::new(Self {
            id,
            peer: transport.peer(),
            mux: Multiplexer::new(id, role, config.max_reassembly_size, outbound_tx),
            codec: FrameCodec::new(config.max_frame_size),
            transport,
            config,
            status,
            last_received: Mutex::new(Instant::now()),
            writer: Mutex::new(None),
            writer_abort: Mutex::new(None),
        });
        let writer = tokio::spawn(connection.clone().write_loop(outbound_rx));
        *connection.writer_abort.lock() = Some(writer.abort_handle());
        *connection.writer.lock() = Some(writer);
        connection
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn requester(&self) -> Requester {
        Requester::new(self.mux.clone())
    }

    pub(crate) fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub(crate) fn current_status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// 客户端握手：排入 SETUP，进入 Connected，随后启动保活与读循环。
    pub(crate) fn start_client(
        self: &Arc<Self>,
        setup_payload: Payload,
        responder: Arc<dyn Responder>,
    ) {
        let setup = SetupFrame {
            major_version: 1,
            minor_version: 0,
            keepalive_interval_ms: self.config.keepalive_interval_ms,
            max_lifetime_ms: self.config.max_lifetime_ms,
            resume_token: None,
            lease: false,
            metadata_mime_type: self.config.metadata_mime_type.clone(),
            data_mime_type: self.config.data_mime_type.clone(),
            payload: setup_payload,
        };
        self.mux.send(Frame::Setup(setup));
        self.mark_connected();

        let dispatcher = Dispatcher::new(self.mux.clone(), responder);
        tokio::spawn(self.clone().keepalive_loop(
            self.config.keepalive_interval(),
            self.config.max_lifetime(),
            true,
        ));
        tokio::spawn(
            self.clone()
                .read_loop(dispatcher, BytesMut::with_capacity(READ_BUFFER_CAPACITY)),
        );
    }

    /// 服务端连接主体：完成握手后在当前任务上运行读循环，连接终止时返回。
    pub(crate) async fn serve(self: Arc<Self>, factory: Arc<dyn ResponderFactory>) {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
        let deadline = self.config.max_lifetime();
        let mut status = self.status.subscribe();
        let first = tokio::select! {
            biased;
            _ = terminated(&mut status) => return,
            first = tokio::time::timeout(deadline, self.read_frame(&mut buf)) => first,
        };
        let first = match first {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                self.terminate(
                    ConnectionStatus::Closed,
                    None,
                    RSocketError::connection_closed(),
                    false,
                );
                debug!(connection_id = self.id, "peer closed before SETUP");
                return;
            }
            Ok(Err(err)) => {
                self.fail(err);
                return;
            }
            Err(_) => {
                self.fail(ConnectionError::Setup(RSocketError::invalid_setup(format!(
                    "SETUP not received within {} ms",
                    deadline.as_millis()
                ))));
                return;
            }
        };

        let setup = match first {
            Frame::Setup(setup) => setup,
            other => {
                self.fail(ConnectionError::Setup(RSocketError::invalid_setup(format!(
                    "expected SETUP, received {}",
                    other.frame_type()
                ))));
                return;
            }
        };
        let info = match validate_setup(setup) {
            Ok(info) => info,
            Err(err) => {
                self.fail(ConnectionError::Setup(err));
                return;
            }
        };

        let requester = self.requester();
        let created = panic::catch_unwind(AssertUnwindSafe(|| factory.create(&info, requester)));
        let responder = match created {
            Ok(Ok(responder)) => responder,
            Ok(Err(err)) => {
                self.fail(ConnectionError::Setup(RSocketError::rejected_setup(
                    err.message(),
                )));
                return;
            }
            Err(_) => {
                self.fail(ConnectionError::Setup(RSocketError::rejected_setup(
                    "responder factory panicked",
                )));
                return;
            }
        };

        self.mark_connected();
        info!(
            connection_id = self.id,
            peer = self.peer.as_deref().unwrap_or("unknown"),
            data_mime_type = %info.data_mime_type,
            "connection established"
        );
        tokio::spawn(
            self.clone()
                .keepalive_loop(info.keepalive_interval, info.max_lifetime, false),
        );
        let dispatcher = Dispatcher::new(self.mux.clone(), responder);
        self.read_loop(dispatcher, buf).await;
    }

    /// 本地关闭：发送 CONNECTION_CLOSE，等待写任务排空队列并关闭传输。
    pub(crate) async fn close(&self) {
        self.fail(ConnectionError::Closed);
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }

    /// 强制终止：不再等待写任务，直接中止它。`close` 超时后由服务器调用。
    pub(crate) fn abort(&self) {
        self.terminate(
            ConnectionStatus::Closed,
            None,
            RSocketError::connection_closed(),
            false,
        );
        if let Some(writer) = self.writer_abort.lock().take() {
            writer.abort();
            warn!(connection_id = self.id, "writer aborted");
        }
    }

    fn mark_connected(&self) {
        self.status.send_if_modified(|status| {
            if matches!(status, ConnectionStatus::Connecting) {
                *status = ConnectionStatus::Connected;
                true
            } else {
                false
            }
        });
    }

    fn touch(&self) {
        *self.last_received.lock() = Instant::now();
    }

    /// 迁移到终态；已处于终态时返回 `false` 且不做任何事。
    fn terminate(
        &self,
        status: ConnectionStatus,
        wire: Option<RSocketError>,
        reason: RSocketError,
        error_streams: bool,
    ) -> bool {
        let mut next = Some(status);
        let changed = self.status.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            if let Some(next) = next.take() {
                *current = next;
            }
            true
        });
        if !changed {
            return false;
        }
        if error_streams {
            for stream_id in self.mux.active_stream_ids() {
                self.mux.send(Frame::error(
                    stream_id,
                    ErrorCode::Canceled,
                    "connection terminated",
                ));
            }
        }
        if let Some(err) = wire {
            self.mux.send(Frame::error(0, err.code(), err.message()));
        }
        self.mux.teardown(&reason);
        self.mux.shutdown_writer();
        true
    }

    /// 以连接级错误终止；`ConnectionError::Closed` 是本地主动关闭，终态为 `Closed`。
    pub(crate) fn fail(&self, err: ConnectionError) {
        let wire = err.to_wire();
        let error_streams = matches!(err, ConnectionError::Malformed(_));
        let (status, reason) = match &err {
            ConnectionError::Closed => (
                ConnectionStatus::Closed,
                RSocketError::connection_closed(),
            ),
            ConnectionError::Rejected(rejected) => {
                (ConnectionStatus::Error(err.to_string()), rejected.clone())
            }
            other => (
                ConnectionStatus::Error(other.to_string()),
                RSocketError::connection_error(other.to_string()),
            ),
        };
        if !self.terminate(status, wire, reason, error_streams) {
            return;
        }
        match &err {
            ConnectionError::Transport(_) => {
                error!(connection_id = self.id, error = %err, "connection transport failed")
            }
            ConnectionError::Closed => {
                info!(connection_id = self.id, "connection closed locally")
            }
            _ => warn!(connection_id = self.id, error = %err, "connection terminated"),
        }
    }

    /// 读出一帧；对端关闭时返回 `None`。仅用于握手阶段。
    async fn read_frame(&self, buf: &mut BytesMut) -> Result<Option<Frame>, ConnectionError> {
        loop {
            if let DecodeOutcome::Complete(frame) = self.codec.decode(buf)? {
                self.touch();
                trace!(
                    connection_id = self.id,
                    stream_id = frame.stream_id(),
                    frame_type = %frame.frame_type(),
                    "frame received"
                );
                return Ok(Some(frame));
            }
            if self.transport.receive(buf).await? == 0 {
                return Ok(None);
            }
        }
    }

    async fn read_loop(self: Arc<Self>, dispatcher: Dispatcher, mut buf: BytesMut) {
        let mut status = self.status.subscribe();
        loop {
            loop {
                match self.codec.decode(&mut buf) {
                    Ok(DecodeOutcome::Complete(frame)) => {
                        self.touch();
                        trace!(
                            connection_id = self.id,
                            stream_id = frame.stream_id(),
                            frame_type = %frame.frame_type(),
                            "frame received"
                        );
                        if let Err(err) = self.handle_frame(frame, &dispatcher) {
                            self.fail(err);
                            return;
                        }
                        if self.status.borrow().is_terminal() {
                            return;
                        }
                    }
                    Ok(DecodeOutcome::Incomplete) => break,
                    Err(err) => {
                        self.fail(ConnectionError::Malformed(err));
                        return;
                    }
                }
            }

            let read = tokio::select! {
                biased;
                _ = terminated(&mut status) => return,
                read = self.transport.receive(&mut buf) => read,
            };
            match read {
                Ok(0) => {
                    if self.terminate(
                        ConnectionStatus::Closed,
                        None,
                        RSocketError::connection_closed(),
                        false,
                    ) {
                        info!(connection_id = self.id, "peer closed the connection");
                    }
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    self.fail(ConnectionError::Transport(err));
                    return;
                }
            }
        }
    }

    fn handle_frame(&self, frame: Frame, dispatcher: &Dispatcher) -> Result<(), ConnectionError> {
        match self.mux.on_frame_received(frame) {
            None => Ok(()),
            Some(Routed::Request(request)) => {
                dispatcher.dispatch(request);
                Ok(())
            }
            Some(Routed::Connection(frame)) => self.on_connection_frame(frame, dispatcher),
            Some(Routed::Violation(reason)) => {
                Err(ConnectionError::ProtocolViolation(reason.to_owned()))
            }
        }
    }

    fn on_connection_frame(
        &self,
        frame: Frame,
        dispatcher: &Dispatcher,
    ) -> Result<(), ConnectionError> {
        match frame {
            Frame::Keepalive { respond, data, .. } => {
                if respond {
                    self.mux.send(Frame::Keepalive {
                        respond: false,
                        last_received_position: 0,
                        data,
                    });
                }
                Ok(())
            }
            Frame::MetadataPush { metadata } => {
                dispatcher.metadata_push(metadata);
                Ok(())
            }
            Frame::Error { code, message, .. } => {
                let err = RSocketError::new(code, message);
                if code == ErrorCode::ConnectionClose {
                    if self.terminate(
                        ConnectionStatus::Closed,
                        None,
                        RSocketError::connection_closed(),
                        false,
                    ) {
                        info!(connection_id = self.id, "peer closed the connection");
                    }
                    Ok(())
                } else {
                    Err(ConnectionError::Rejected(err))
                }
            }
            Frame::Setup(_) => Err(ConnectionError::ProtocolViolation(
                "SETUP received on an established connection".to_owned(),
            )),
            other => {
                trace!(
                    connection_id = self.id,
                    frame_type = %other.frame_type(),
                    "ignoring connection frame"
                );
                Ok(())
            }
        }
    }

    async fn write_loop(self: Arc<Self>, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        let mut buf = BytesMut::new();
        'outer: while let Some(first) = outbound.recv().await {
            let mut shutdown = false;
            let mut pending = Some(first);
            while let Some(command) = pending.take() {
                match command {
                    Outbound::Frame(frame) => self.encode_outbound(&frame, &mut buf),
                    Outbound::Shutdown => {
                        shutdown = true;
                        break;
                    }
                }
                if buf.len() >= WRITE_BATCH_BYTES {
                    break;
                }
                pending = outbound.try_recv().ok();
            }
            if !buf.is_empty()
                && let Err(err) = self.transport.send(buf.split().freeze()).await
            {
                self.fail(ConnectionError::Transport(err));
                break 'outer;
            }
            if shutdown {
                break;
            }
        }
        if let Err(err) = self.transport.close().await {
            debug!(connection_id = self.id, error = %err, "transport close failed");
        }
    }

    fn encode_outbound(&self, frame: &Frame, buf: &mut BytesMut) {
        match self.codec.encode(frame, buf) {
            Ok(()) => trace!(
                connection_id = self.id,
                stream_id = frame.stream_id(),
                frame_type = %frame.frame_type(),
                "frame sent"
            ),
            Err(err) => {
                let stream_id = frame.stream_id();
                warn!(
                    connection_id = self.id,
                    stream_id,
                    frame_type = %frame.frame_type(),
                    error = %err,
                    "outbound frame dropped"
                );
                if stream_id != 0 {
                    let reason =
                        RSocketError::rejected(format!("outbound frame rejected: {err}"));
                    let _ = self.codec.encode(
                        &Frame::error(stream_id, reason.code(), reason.message()),
                        buf,
                    );
                    self.mux.close_stream(stream_id, reason);
                }
            }
        }
    }

    async fn keepalive_loop(
        self: Arc<Self>,
        interval: Duration,
        max_lifetime: Duration,
        send_keepalive: bool,
    ) {
        let mut status = self.status.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = terminated(&mut status) => return,
                _ = ticker.tick() => {}
            }
            let idle = self.last_received.lock().elapsed();
            if idle >= max_lifetime {
                self.fail(ConnectionError::KeepaliveTimeout(max_lifetime));
                return;
            }
            if send_keepalive {
                self.mux.send(Frame::Keepalive {
                    respond: true,
                    last_received_position: 0,
                    data: Bytes::new(),
                });
            }
        }
    }
}

/// 校验 SETUP 并提取协商参数。
fn validate_setup(setup: SetupFrame) -> Result<SetupInfo, RSocketError> {
    if setup.major_version != 1 {
        return Err(RSocketError::unsupported_setup(format!(
            "unsupported protocol version {}.{}",
            setup.major_version, setup.minor_version
        )));
    }
    if setup.lease {
        return Err(RSocketError::unsupported_setup("lease is not supported"));
    }
    if setup.resume_token.is_some() {
        return Err(RSocketError::unsupported_setup("resumption is not supported"));
    }
    if setup.keepalive_interval_ms == 0 || setup.max_lifetime_ms == 0 {
        return Err(RSocketError::invalid_setup(
            "keepalive interval and max lifetime must be positive",
        ));
    }
    Ok(SetupInfo {
        major_version: setup.major_version,
        minor_version: setup.minor_version,
        keepalive_interval: Duration::from_millis(u64::from(setup.keepalive_interval_ms)),
        max_lifetime: Duration::from_millis(u64::from(setup.max_lifetime_ms)),
        metadata_mime_type: setup.metadata_mime_type,
        data_mime_type: setup.data_mime_type,
        payload: setup.payload,
    })
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::responder::DefaultResponder;
    use crate::transport::IoConnection;

    fn setup_frame() -> SetupFrame {
        SetupFrame {
            major_version: 1,
            minor_version: 0,
            keepalive_interval_ms: 1_000,
            max_lifetime_ms: 5_000,
            resume_token: None,
            lease: false,
            metadata_mime_type: "text/plain".to_owned(),
            data_mime_type: "text/plain".to_owned(),
            payload: Payload::empty(),
        }
    }

    #[test]
    fn setup_validation_maps_to_setup_error_codes() {
        let ok = validate_setup(setup_frame()).expect("valid setup");
        assert_eq!(ok.keepalive_interval, Duration::from_secs(1));

        let mut version = setup_frame();
        version.major_version = 2;
        assert_eq!(
            validate_setup(version).map_err(|err| err.code()),
            Err(ErrorCode::UnsupportedSetup)
        );

        let mut lease = setup_frame();
        lease.lease = true;
        assert_eq!(
            validate_setup(lease).map_err(|err| err.code()),
            Err(ErrorCode::UnsupportedSetup)
        );

        let mut zero = setup_frame();
        zero.keepalive_interval_ms = 0;
        assert_eq!(
            validate_setup(zero).map_err(|err| err.code()),
            Err(ErrorCode::InvalidSetup)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    #[traced_test]
    async fn request_before_setup_is_rejected_with_invalid_setup() {
        let (server_io, client_io) = tokio::io::duplex(4096);
        let connection = Connection::start(
            1,
            Role::Server,
            Arc::new(IoConnection::from_stream(server_io)),
            ConnectionConfig::default(),
        );
        let mut status = connection.status();
        let factory: Arc<dyn ResponderFactory> =
            Arc::new(|_: &SetupInfo, _: Requester| -> Result<Arc<dyn Responder>, RSocketError> {
                Ok(Arc::new(DefaultResponder))
            });
        let serve = tokio::spawn(connection.clone().serve(factory));

        let peer = IoConnection::from_stream(client_io);
        let request = Frame::RequestResponse {
            stream_id: 1,
            follows: false,
            payload: Payload::from("too early"),
        };
        let mut raw = BytesMut::new();
        FrameCodec::default()
            .encode(&request, &mut raw)
            .expect("encode");
        peer.send(raw.freeze()).await.expect("send");

        let mut inbound = BytesMut::new();
        let reply = loop {
            if let DecodeOutcome::Complete(frame) =
                FrameCodec::default().decode(&mut inbound).expect("decode")
            {
                break frame;
            }
            assert!(peer.receive(&mut inbound).await.expect("receive") > 0);
        };
        assert!(matches!(
            reply,
            Frame::Error {
                stream_id: 0,
                code: ErrorCode::InvalidSetup,
                ..
            }
        ));

        serve.await.expect("serve task");
        let terminal = status
            .wait_for(ConnectionStatus::is_terminal)
            .await
            .expect("status")
            .clone();
        assert!(matches!(terminal, ConnectionStatus::Error(_)));
        assert!(logs_contain("connection terminated"));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[traced_test]
    async fn local_close_sends_connection_close_and_ends_closed() {
        let (server_io, client_io) = tokio::io::duplex(4096);
        let connection = Connection::start(
            2,
            Role::Server,
            Arc::new(IoConnection::from_stream(server_io)),
            ConnectionConfig::default(),
        );
        let peer = IoConnection::from_stream(client_io);

        connection.close().await;
        assert_eq!(connection.current_status(), ConnectionStatus::Closed);

        let mut inbound = BytesMut::new();
        let reply = loop {
            if let DecodeOutcome::Complete(frame) =
                FrameCodec::default().decode(&mut inbound).expect("decode")
            {
                break frame;
            }
            assert!(peer.receive(&mut inbound).await.expect("receive") > 0);
        };
        assert!(matches!(
            reply,
            Frame::Error {
                stream_id: 0,
                code: ErrorCode::ConnectionClose,
                ..
            }
        ));
        assert!(logs_contain("connection closed locally"));

        connection.fail(ConnectionError::ProtocolViolation("late".into()));
        assert_eq!(connection.current_status(), ConnectionStatus::Closed);
    }
}
