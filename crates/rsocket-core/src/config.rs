//! 连接与服务器配置。
//!
//! # 教案式说明
//! - **来源 (What)**：所有结构都实现 `serde::Deserialize` 并以 `#[serde(default)]` 补齐缺省字段，
//!   可由 [`ServerConfig::from_toml_str`] 从 TOML 文本加载，也可用 `with_*` 链式构造；
//! - **校验 (How)**：`validate` 在连接建立前拒绝无法在线上表达的取值（如超过 24 位的帧长），
//!   把错误前移到启动阶段。

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{MAX_FRAME_LEN, MAX_STREAM_ID};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// 配置加载或校验失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// 单条连接的协议参数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// 客户端发送 KEEPALIVE 的间隔。
    pub keepalive_interval_ms: u32,
    /// 超过该时长未收到任何帧即判定连接失活。
    pub max_lifetime_ms: u32,
    /// 单帧（不含长度前缀）的最大字节数，不超过 16 777 215。
    pub max_frame_size: usize,
    /// 分片重组后单个载荷的最大字节数。
    pub max_reassembly_size: usize,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: 20_000,
            max_lifetime_ms: 90_000,
            max_frame_size: MAX_FRAME_LEN,
            max_reassembly_size: 16 * 1024 * 1024,
            metadata_mime_type: DEFAULT_MIME_TYPE.to_owned(),
            data_mime_type: DEFAULT_MIME_TYPE.to_owned(),
        }
    }
}

impl ConnectionConfig {
    pub fn with_keepalive(mut self, interval: Duration, max_lifetime: Duration) -> Self {
        self.keepalive_interval_ms = duration_to_ms(interval);
        self.max_lifetime_ms = duration_to_ms(max_lifetime);
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_max_reassembly_size(mut self, max_reassembly_size: usize) -> Self {
        self.max_reassembly_size = max_reassembly_size;
        self
    }

    pub fn with_mime_types(
        mut self,
        metadata_mime_type: impl Into<String>,
        data_mime_type: impl Into<String>,
    ) -> Self {
        self.metadata_mime_type = metadata_mime_type.into();
        self.data_mime_type = data_mime_type.into();
        self
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.keepalive_interval_ms))
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(u64::from(self.max_lifetime_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_interval_ms == 0 || self.keepalive_interval_ms > MAX_STREAM_ID {
            return Err(ConfigError::invalid(
                "keepalive_interval_ms",
                "must be within 1..=2147483647",
            ));
        }
        if self.max_lifetime_ms == 0 || self.max_lifetime_ms > MAX_STREAM_ID {
            return Err(ConfigError::invalid(
                "max_lifetime_ms",
                "must be within 1..=2147483647",
            ));
        }
        if self.max_lifetime_ms < self.keepalive_interval_ms {
            return Err(ConfigError::invalid(
                "max_lifetime_ms",
                "must not be shorter than keepalive_interval_ms",
            ));
        }
        if self.max_frame_size < 64 || self.max_frame_size > MAX_FRAME_LEN {
            return Err(ConfigError::invalid(
                "max_frame_size",
                format!("must be within 64..={MAX_FRAME_LEN}"),
            ));
        }
        if self.max_reassembly_size < self.max_frame_size {
            return Err(ConfigError::invalid(
                "max_reassembly_size",
                "must not be smaller than max_frame_size",
            ));
        }
        for (field, mime) in [
            ("metadata_mime_type", &self.metadata_mime_type),
            ("data_mime_type", &self.data_mime_type),
        ] {
            if mime.is_empty() || mime.len() > usize::from(u8::MAX) || !mime.is_ascii() {
                return Err(ConfigError::invalid(field, "must be 1..=255 ASCII characters"));
            }
        }
        Ok(())
    }
}

/// 服务器配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub connection: ConnectionConfig,
    /// `stop` 等待连接收尾的上限。
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            connection: ConnectionConfig::default(),
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl ServerConfig {
    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()
    }
}

fn duration_to_ms(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.keepalive_interval(), Duration::from_secs(20));
        assert_eq!(config.connection.max_lifetime(), Duration::from_secs(90));
        assert_eq!(config.connection.max_frame_size, 16_777_215);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = ServerConfig::from_toml_str(
            r#"
            bind_addr = "127.0.0.1:7878"

            [connection]
            keepalive_interval_ms = 500
            max_lifetime_ms = 1500
            "#,
        )
        .expect("valid config");
        assert_eq!(config.bind_addr, "127.0.0.1:7878".parse().expect("addr"));
        assert_eq!(config.connection.keepalive_interval_ms, 500);
        assert_eq!(config.connection.data_mime_type, DEFAULT_MIME_TYPE);
        assert_eq!(config.shutdown_timeout_ms, 5_000);
    }

    #[test]
    fn rejects_values_the_wire_cannot_carry() {
        let too_large = ConnectionConfig::default().with_max_frame_size(MAX_FRAME_LEN + 1);
        assert!(matches!(
            too_large.validate(),
            Err(ConfigError::Invalid { field: "max_frame_size", .. })
        ));

        let bad_mime = ConnectionConfig::default().with_mime_types("", "text/plain");
        assert!(bad_mime.validate().is_err());

        assert!(matches!(
            ServerConfig::from_toml_str("bind_addr = 12"),
            Err(ConfigError::Parse(_))
        ));
    }
}
