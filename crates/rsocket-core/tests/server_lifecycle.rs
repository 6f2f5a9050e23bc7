//! 服务器生命周期：Idle -> Listening -> Stopped 的迁移与错误。

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rsocket_core::{
    ConnectionConfig, DefaultResponder, Flowable, Frame, Payload, RSocketError, RSocketServer,
    Requester, Responder, ServerConfig, ServerError, ServerState, SetupInfo,
};
use support::{MemoryServerTransport, RawPeer, memory_transport};

fn default_factory(
    _: &SetupInfo,
    _: Requester,
) -> Result<Arc<dyn Responder>, RSocketError> {
    Ok(Arc::new(DefaultResponder))
}

#[tokio::test(flavor = "multi_thread")]
async fn start_twice_is_rejected() {
    let (_, transport) = memory_transport();
    let server = RSocketServer::new(transport, ServerConfig::default(), default_factory);
    assert_eq!(server.state(), ServerState::Idle);

    server.start().await.expect("first start");
    assert_eq!(server.state(), ServerState::Listening);
    assert!(matches!(
        server.start().await,
        Err(ServerError::AlreadyStarted)
    ));

    server.stop().await.expect("stop");
    assert_eq!(server.state(), ServerState::Stopped);
    // 停止是幂等的，停止后也不能再次启动。
    server.stop().await.expect("second stop");
    assert!(matches!(
        server.start().await,
        Err(ServerError::AlreadyStarted)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_before_start_is_an_error() {
    let (_, transport) = memory_transport();
    let server = RSocketServer::new(transport, ServerConfig::default(), default_factory);
    assert!(matches!(server.stop().await, Err(ServerError::NotStarted)));
    assert_eq!(server.state(), ServerState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn listen_failure_leaves_the_server_idle() {
    let server = RSocketServer::new(
        MemoryServerTransport::failing(),
        ServerConfig::default(),
        default_factory,
    );
    assert!(matches!(
        server.start().await,
        Err(ServerError::Transport(_))
    ));
    assert_eq!(server.state(), ServerState::Idle);
    assert_eq!(server.local_addr(), None);
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_config_is_reported_before_listening() {
    let (_, transport) = memory_transport();
    let mut connection = ConnectionConfig::default();
    connection.max_frame_size = 16;
    let server = RSocketServer::new(
        transport,
        ServerConfig::default().with_connection(connection),
        default_factory,
    );
    assert!(matches!(server.start().await, Err(ServerError::Config(_))));
    assert_eq!(server.state(), ServerState::Idle);
}

/// 一次请求就推送远超管道容量的数据。
struct Flood;

impl Responder for Flood {
    fn request_stream(&self, _payload: Payload) -> Flowable<Payload, RSocketError> {
        Flowable::create(|emitter| {
            for _ in 0..4_096 {
                if !emitter.next(Payload::from(vec![0u8; 1_024])) {
                    return;
                }
            }
            emitter.complete();
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_is_bounded_by_the_shutdown_timeout_when_a_peer_stops_reading() {
    let (client, transport) = memory_transport();
    let server = RSocketServer::new(
        transport,
        ServerConfig::default().with_shutdown_timeout(Duration::from_millis(200)),
        |_: &SetupInfo, _: Requester| -> Result<Arc<dyn Responder>, RSocketError> {
            Ok(Arc::new(Flood))
        },
    );
    server.start().await.expect("start");

    // 对端发出请求后不再读取，服务端写任务在管道写满后阻塞。
    let mut peer = RawPeer::handshake(&client).await;
    peer.send(Frame::RequestStream {
        stream_id: 1,
        follows: false,
        initial_n: 0x7fff_ffff,
        payload: Payload::from("flood"),
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connection_count(), 1);

    let started = Instant::now();
    let stopped = tokio::time::timeout(Duration::from_secs(5), server.stop()).await;
    assert!(matches!(stopped, Ok(Ok(()))), "stop hung: {stopped:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.connection_count(), 0);
    drop(peer);
}
