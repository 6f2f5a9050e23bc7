//! 回显客户端：`echo_client [addr]`，缺省连接 `127.0.0.1:8080`。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rsocket_core::{ConnectionConfig, Payload, RSocketClient, RSocketError};
use rsocket_examples::{EchoResponder, ExampleError, init_tracing};
use rsocket_flowable::{Flowable, Subscriber, Subscription};
use rsocket_transport_tcp::TcpClientTransport;
use tokio::sync::oneshot;
use tracing::{error, info};

const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        error!(error = %err, "echo client failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ExampleError> {
    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDR.to_owned())
        .parse()?;
    let transport =
        TcpClientTransport::new(addr).with_connect_timeout(Some(Duration::from_secs(5)));
    let client = RSocketClient::builder()
        .with_config(ConnectionConfig::default())
        .with_setup_payload(Payload::from("echo-client"))
        .with_responder(Arc::new(EchoResponder))
        .connect(&transport)
        .await?;
    let requester = client.requester();

    requester.fire_and_forget(Payload::from("hello"))?;
    requester.metadata_push("client-ready")?;

    let reply = requester
        .request_response(Payload::from("ping"))
        .into_future()
        .await?;
    info!(reply = reply.data_utf8().unwrap_or_default(), "request/response");

    let streamed = collect(requester.request_stream(Payload::from("tick:5"))).await?;
    info!(items = ?streamed, "request/stream");

    let input = Flowable::just(["a", "b", "c"].map(Payload::from));
    let echoed = collect(requester.request_channel(input)).await?;
    info!(items = ?echoed, "request/channel");

    client.close().await;
    Ok(())
}

/// 以每次请求一个元素的节奏消费序列。
async fn collect(
    flowable: Flowable<Payload, RSocketError>,
) -> Result<Vec<String>, ExampleError> {
    let (done, finished) = oneshot::channel();
    flowable.subscribe(OneByOne {
        items: Vec::new(),
        subscription: None,
        done: Some(done),
    });
    let items = finished.await.map_err(|_| ExampleError::StreamDropped)??;
    Ok(items)
}

struct OneByOne {
    items: Vec<String>,
    subscription: Option<Arc<dyn Subscription>>,
    done: Option<oneshot::Sender<Result<Vec<String>, RSocketError>>>,
}

impl Subscriber<Payload, RSocketError> for OneByOne {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        subscription.request(1);
        self.subscription = Some(subscription);
    }

    fn on_next(&mut self, item: Payload) {
        self.items.push(item.data_utf8().unwrap_or_default().to_owned());
        if let Some(subscription) = &self.subscription {
            subscription.request(1);
        }
    }

    fn on_complete(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(Ok(std::mem::take(&mut self.items)));
        }
    }

    fn on_error(&mut self, error: RSocketError) {
        if let Some(done) = self.done.take() {
            let _ = done.send(Err(error));
        }
    }
}
