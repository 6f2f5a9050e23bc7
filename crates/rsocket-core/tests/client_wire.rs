//! 客户端一侧的线上行为：由原始帧对端扮演服务器。

mod support;

use std::sync::Arc;
use std::time::Duration;

use rsocket_core::{
    ConnectionConfig, ConnectionStatus, DefaultResponder, ErrorCode, Frame, Payload,
    RSocketClient, RSocketError, ServerTransport,
};
use rsocket_flowable::test_util::TestSubscriber;
use support::{RawPeer, WAIT, memory_transport};

async fn connect() -> (RSocketClient, RawPeer) {
    let (client_transport, mut server_transport) = memory_transport();
    server_transport.listen().await.expect("listen");
    let client = RSocketClient::connect(
        &client_transport,
        ConnectionConfig::default(),
        Arc::new(DefaultResponder),
    )
    .await
    .expect("connect");
    let mut peer = RawPeer::from_connection(server_transport.accept().await.expect("accept"));
    match peer.recv().await {
        Some(Frame::Setup(setup)) => {
            assert_eq!(setup.major_version, 1);
            assert!(!setup.lease);
        }
        other => panic!("expected SETUP, got {other:?}"),
    }
    (client, peer)
}

#[tokio::test(flavor = "multi_thread")]
async fn late_payload_after_cancel_is_dropped() {
    let (client, mut peer) = connect().await;
    let requester = client.requester();

    let cancellable = requester
        .request_response(Payload::from("slow"))
        .subscribe_fn(|_| panic!("no value after cancel"), |_| panic!("no error after cancel"));
    match peer.recv_skipping_keepalive().await {
        Some(Frame::RequestResponse { stream_id: 1, .. }) => {}
        other => panic!("unexpected frame: {other:?}"),
    }

    cancellable.cancel();
    assert_eq!(
        peer.recv_skipping_keepalive().await,
        Some(Frame::Cancel { stream_id: 1 })
    );

    // 取消之后到达的应答被静默丢弃，连接保持可用。
    peer.send(Frame::next(1, Payload::from("too late"), true)).await;
    let reply = requester.request_response(Payload::from("next")).into_future();
    match peer.recv_skipping_keepalive().await {
        Some(Frame::RequestResponse { stream_id: 3, .. }) => {}
        other => panic!("unexpected frame: {other:?}"),
    }
    peer.send(Frame::next(3, Payload::from("fresh"), true)).await;
    let reply = tokio::time::timeout(WAIT, reply)
        .await
        .expect("reply in time")
        .expect("reply");
    assert_eq!(reply.data_utf8(), Some("fresh"));
    assert_eq!(client.current_status(), ConnectionStatus::Connected);
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_demand_is_forwarded_as_request_n() {
    let (client, mut peer) = connect().await;
    let subscriber = TestSubscriber::<Payload, RSocketError>::new(2);
    client
        .requester()
        .request_stream(Payload::from("ticks"))
        .subscribe(subscriber.clone());

    match peer.recv_skipping_keepalive().await {
        Some(Frame::RequestStream {
            stream_id: 1,
            initial_n: 2,
            ..
        }) => {}
        other => panic!("unexpected frame: {other:?}"),
    }
    peer.send(Frame::next(1, Payload::from("a"), false)).await;
    peer.send(Frame::next(1, Payload::from("b"), false)).await;
    assert!(subscriber.await_items(2, WAIT).await);

    subscriber.request(3);
    assert_eq!(
        peer.recv_skipping_keepalive().await,
        Some(Frame::RequestN { stream_id: 1, n: 3 })
    );
    peer.send(Frame::next(1, Payload::from("c"), true)).await;
    assert!(subscriber.await_terminal(WAIT).await);
    let items: Vec<_> = subscriber.items().iter().map(support::text).collect();
    assert_eq!(items, ["a", "b", "c"]);
    assert!(subscriber.is_complete());
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_error_from_peer_fails_inflight_streams() {
    let (client, mut peer) = connect().await;
    let subscriber = TestSubscriber::<Payload, RSocketError>::new(1);
    client
        .requester()
        .request_stream(Payload::from("ticks"))
        .subscribe(subscriber.clone());
    assert!(matches!(
        peer.recv_skipping_keepalive().await,
        Some(Frame::RequestStream { stream_id: 1, .. })
    ));

    peer.send(Frame::error(0, ErrorCode::ConnectionError, "going away"))
        .await;
    assert!(subscriber.await_terminal(WAIT).await);
    assert!(subscriber.error().is_some());

    let mut status = client.status();
    let terminal = tokio::time::timeout(WAIT, status.wait_for(ConnectionStatus::is_terminal))
        .await
        .expect("terminal in time")
        .expect("status")
        .clone();
    assert!(matches!(terminal, ConnectionStatus::Error(_)));
    assert!(client.requester().is_closed());

    let rejected = client
        .requester()
        .request_response(Payload::from("after"))
        .into_future()
        .await;
    assert!(rejected.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn client_sends_keepalive_at_the_configured_interval() {
    let (client_transport, mut server_transport) = memory_transport();
    server_transport.listen().await.expect("listen");
    let config = ConnectionConfig::default()
        .with_keepalive(Duration::from_millis(50), Duration::from_secs(10));
    let _client = RSocketClient::connect(&client_transport, config, Arc::new(DefaultResponder))
        .await
        .expect("connect");
    let mut peer = RawPeer::from_connection(server_transport.accept().await.expect("accept"));
    assert!(matches!(peer.recv().await, Some(Frame::Setup(_))));
    assert!(matches!(
        peer.recv().await,
        Some(Frame::Keepalive { respond: true, .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn close_sends_connection_close() {
    let (client, mut peer) = connect().await;
    client.close().await;
    assert_eq!(
        peer.recv_skipping_keepalive().await,
        Some(Frame::error(0, ErrorCode::ConnectionClose, "connection closed"))
    );
    assert_eq!(peer.recv().await, None);
    assert_eq!(client.current_status(), ConnectionStatus::Closed);
}
