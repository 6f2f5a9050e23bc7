use std::path::{Path, PathBuf};

use rsocket_core::{ConfigError, ServerConfig};
use rsocket_transport_tcp::TcpSocketConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 未通过命令行给出配置路径时读取的环境变量。
pub const CONFIG_ENV: &str = "RSOCKET_DEMO_CONFIG";

/// 示例程序的配置文件。
///
/// ```toml
/// [server]
/// bind_addr = "127.0.0.1:7878"
/// shutdown_timeout_ms = 2000
///
/// [server.connection]
/// keepalive_interval_ms = 10000
/// max_lifetime_ms = 30000
///
/// [tcp]
/// nodelay = true
/// linger_ms = 1000
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub server: ServerConfig,
    pub tcp: TcpSocketConfig,
}

#[derive(Debug, Error)]
pub enum DemoConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

impl DemoConfig {
    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(raw: &str) -> Result<Self, DemoConfigError> {
        Self::parse(raw, Path::new("<inline>"))
    }

    /// 读取配置文件；`path` 为 `None` 时依次尝试 [`CONFIG_ENV`] 与缺省值。
    pub fn load(path: Option<&Path>) -> Result<Self, DemoConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) => PathBuf::from(path),
                None => return Ok(Self::default()),
            },
        };
        let raw = std::fs::read_to_string(&path).map_err(|source| DemoConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&raw, &path)
    }

    fn parse(raw: &str, path: &Path) -> Result<Self, DemoConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| DemoConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.server.validate()?;
        Ok(config)
    }
}
