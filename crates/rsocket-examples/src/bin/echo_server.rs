//! 回显服务器：`echo_server [config.toml]`。
//!
//! 未指定配置文件时读取环境变量 `RSOCKET_DEMO_CONFIG`，两者都缺省则监听 `0.0.0.0:8080`。

use std::path::PathBuf;
use std::sync::Arc;

use rsocket_core::{RSocketError, RSocketServer, Requester, Responder, SetupInfo};
use rsocket_examples::{DemoConfig, EchoResponder, ExampleError, init_tracing};
use rsocket_transport_tcp::TcpServerTransport;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        error!(error = %err, "echo server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ExampleError> {
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = DemoConfig::load(path.as_deref())?;

    let transport =
        TcpServerTransport::new(config.server.bind_addr).with_socket_config(config.tcp.clone());
    let server = RSocketServer::new(
        transport,
        config.server.clone(),
        |setup: &SetupInfo, _: Requester| -> Result<Arc<dyn Responder>, RSocketError> {
            info!(
                data_mime_type = %setup.data_mime_type,
                keepalive_ms = setup.keepalive_interval.as_millis() as u64,
                "accepting client"
            );
            Ok(Arc::new(EchoResponder))
        },
    );
    server.start().await?;

    tokio::signal::ctrl_c().await.map_err(ExampleError::Signal)?;
    info!(connections = server.connection_count(), "shutting down");
    server.stop().await?;
    Ok(())
}
