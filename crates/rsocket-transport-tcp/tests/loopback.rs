//! 回环地址上的 TCP 传输与端到端协议测试。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rsocket_core::{
    ClientTransport, ConnectionConfig, DefaultResponder, DuplexConnection, Flowable, Payload,
    RSocketClient, RSocketError, RSocketServer, Requester, Responder, ServerConfig,
    ServerTransport, SetupInfo, Single, TransportError,
};
use rsocket_flowable::test_util::TestSubscriber;
use rsocket_transport_tcp::{TcpClientTransport, TcpServerTransport, TcpSocketConfig};

const WAIT: Duration = Duration::from_secs(5);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().expect("parse addr")
}

#[tokio::test(flavor = "multi_thread")]
async fn bytes_flow_both_ways_and_close_yields_eof() {
    let mut server = TcpServerTransport::new(loopback());
    server.listen().await.expect("listen");
    let addr = server.local_addr().expect("bound addr");

    let client = TcpClientTransport::new(addr);
    let (outbound, inbound) = tokio::join!(client.connect(), server.accept());
    let outbound = outbound.expect("connect");
    let inbound = inbound.expect("accept");
    assert_eq!(outbound.peer_addr(), addr);
    assert!(outbound.config().nodelay);

    outbound
        .send(Bytes::from_static(b"ping"))
        .await
        .expect("send");
    let mut buf = BytesMut::new();
    while buf.len() < 4 {
        assert!(inbound.receive(&mut buf).await.expect("receive") > 0);
    }
    assert_eq!(&buf[..], b"ping");

    inbound.send(Bytes::from_static(b"pong")).await.expect("reply");
    let mut reply = BytesMut::new();
    while reply.len() < 4 {
        assert!(outbound.receive(&mut reply).await.expect("receive") > 0);
    }
    assert_eq!(&reply[..], b"pong");

    outbound.close().await.expect("close");
    outbound.close().await.expect("close twice");
    assert_eq!(inbound.receive(&mut buf).await.expect("eof"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn accept_before_listen_is_refused() {
    let server = TcpServerTransport::new(loopback());
    assert!(server.local_addr().is_none());
    assert!(matches!(
        server.accept().await,
        Err(TransportError::NotListening)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_to_a_closed_port_reports_the_operation() {
    let addr = {
        let listener = std::net::TcpListener::bind(loopback()).expect("bind");
        listener.local_addr().expect("addr")
    };
    let client = TcpClientTransport::new(addr).with_connect_timeout(Some(WAIT));
    match client.connect().await {
        Err(TransportError::Io { operation, .. }) => assert_eq!(operation, "tcp connect"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn accepted_connections_inherit_the_socket_config() {
    let config = TcpSocketConfig::new().with_linger(Some(Duration::from_secs(1)));
    let mut server = TcpServerTransport::new(loopback()).with_socket_config(config.clone());
    server.listen().await.expect("listen");
    let addr = server.local_addr().expect("bound addr");

    let transport = TcpClientTransport::new(addr);
    let (client, accepted) = tokio::join!(transport.connect(), server.accept());
    let _client = client.expect("connect");
    let accepted = accepted.expect("accept");
    assert_eq!(accepted.config(), &config);
    assert_eq!(
        accepted.linger().await.expect("linger"),
        Some(Duration::from_secs(1))
    );
}

#[test]
fn socket_config_loads_from_toml() {
    let config: TcpSocketConfig = toml::from_str("nodelay = false\nlinger_ms = 500\n").expect("toml");
    assert!(!config.nodelay);
    assert_eq!(config.linger(), Some(Duration::from_millis(500)));

    let defaults: TcpSocketConfig = toml::from_str("").expect("empty toml");
    assert_eq!(defaults, TcpSocketConfig::default());
}

struct Upper;

impl Responder for Upper {
    fn request_response(&self, payload: Payload) -> Single<Payload, RSocketError> {
        let text = payload.data_utf8().unwrap_or_default().to_uppercase();
        Single::of(Payload::from(text))
    }

    fn request_stream(&self, payload: Payload) -> Flowable<Payload, RSocketError> {
        let count: usize = payload
            .data_utf8()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        Flowable::just((0..count).map(|i| Payload::from(vec![i as u8; 1024])))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_runs_over_tcp() {
    let server = RSocketServer::new(
        TcpServerTransport::new(loopback()),
        ServerConfig::default(),
        |_: &SetupInfo, _: Requester| -> Result<Arc<dyn Responder>, RSocketError> {
            Ok(Arc::new(Upper))
        },
    );
    server.start().await.expect("start");
    let addr = server.local_addr().expect("listening addr");

    let client = RSocketClient::connect(
        &TcpClientTransport::new(addr),
        ConnectionConfig::default(),
        Arc::new(DefaultResponder),
    )
    .await
    .expect("connect");

    let reply = tokio::time::timeout(
        WAIT,
        client
            .requester()
            .request_response(Payload::from("shout"))
            .into_future(),
    )
    .await
    .expect("reply in time")
    .expect("reply");
    assert_eq!(reply.data_utf8(), Some("SHOUT"));

    // 超过单批写出上限的流。
    let subscriber = TestSubscriber::<Payload, RSocketError>::new(1_000);
    client
        .requester()
        .request_stream(Payload::from("200"))
        .subscribe(subscriber.clone());
    assert!(subscriber.await_terminal(WAIT).await);
    assert!(subscriber.is_complete());
    let items = subscriber.items();
    assert_eq!(items.len(), 200);
    assert_eq!(items[199].data().map(|data| data[0]), Some(199));

    client.close().await;
    server.stop().await.expect("stop");
}
