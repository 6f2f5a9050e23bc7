//! 最小服务器：`simple_server [config.toml]`，处理器为 [`SimpleResponder`]。
//!
//! 配置查找顺序与 `echo_server` 相同：命令行路径、环境变量 `RSOCKET_DEMO_CONFIG`、缺省值。

use std::path::PathBuf;
use std::sync::Arc;

use rsocket_core::{RSocketError, RSocketServer, Requester, Responder, SetupInfo};
use rsocket_examples::{DemoConfig, ExampleError, SimpleResponder, init_tracing};
use rsocket_transport_tcp::TcpServerTransport;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        error!(error = %err, "simple server failed");
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
        |_: &SetupInfo, _: Requester| -> Result<Arc<dyn Responder>, RSocketError> {
            Ok(Arc::new(SimpleResponder))
        },
    );
    server.start().await?;
    info!(bind_addr = %config.server.bind_addr, "server started");

    tokio::signal::ctrl_c().await.map_err(ExampleError::Signal)?;
    server.stop().await?;
    info!("exit");
    Ok(())
}
