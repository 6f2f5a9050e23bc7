#![doc = r#"
# rsocket-examples

## 设计动机（Why）
- 演示如何把 `rsocket-core` 与 `rsocket-transport-tcp` 组装成可运行的服务端与客户端；
- 三个二进制共享本库中的配置加载、日志初始化、错误类型与处理器。

## 使用方式（How）
- `simple_server [config.toml]`：最小服务器，只有 fire-and-forget 与 request/stream 成功；
- `echo_server [config.toml]`：监听配置中的 `server.bind_addr`，Ctrl-C 后优雅停止；
- `echo_client [addr]`：依次演示四种交互模型与 metadata push；
- 日志级别由 `RUST_LOG` 控制，缺省为 `info`。
"#]

mod config;
mod echo;
mod error;
mod simple;

pub use config::{CONFIG_ENV, DemoConfig, DemoConfigError};
pub use echo::EchoResponder;
pub use error::ExampleError;
pub use simple::SimpleResponder;

use tracing_subscriber::EnvFilter;

/// 安装全局 `fmt` 订阅者；重复调用时保留先安装的订阅者。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
