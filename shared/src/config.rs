use anyhow::{Context, Result};
use config::{Config, Environment, File};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::notification::Thresholds;
use crate::types::BrokerRole;

// Broker 传输方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportKind {
    pub fn is_websocket(&self) -> bool {
        matches!(self, TransportKind::Ws | TransportKind::Wss)
    }

    fn scheme(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "mqtt",
            TransportKind::Tls => "mqtts",
            TransportKind::Ws => "ws",
            TransportKind::Wss => "wss",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

// 单个 broker 的连接配置，加载后不可变
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    pub client_id_prefix: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_ws_path() -> String {
    "/mqtt".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    3
}

fn default_keep_alive_secs() -> u64 {
    60
}

impl BrokerConfig {
    /// 本地 broker：WebSocket 9001，无认证
    pub fn local_default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9001,
            transport: TransportKind::Ws,
            ws_path: default_ws_path(),
            credentials: None,
            client_id_prefix: "local_".to_string(),
            connect_timeout_secs: default_connect_timeout_secs(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }

    /// 云端 broker：TLS 8883，凭据需通过配置提供
    pub fn cloud_default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            transport: TransportKind::Tls,
            ws_path: default_ws_path(),
            credentials: None,
            client_id_prefix: "cloud_".to_string(),
            connect_timeout_secs: default_connect_timeout_secs(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// WebSocket 传输的完整 URL
    pub fn websocket_url(&self) -> Option<String> {
        if !self.transport.is_websocket() {
            return None;
        }
        let path = if self.ws_path.starts_with('/') {
            self.ws_path.clone()
        } else {
            format!("/{}", self.ws_path)
        };
        Some(format!("{}://{}:{}{}", self.transport.scheme(), self.host, self.port, path))
    }

    pub fn endpoint(&self) -> String {
        self.websocket_url()
            .unwrap_or_else(|| format!("{}://{}:{}", self.transport.scheme(), self.host, self.port))
    }
}

// 重试节奏：每轮 max_attempts 次，间隔 interval，耗尽后暂停 pause 再开始新一轮
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub pause_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval_ms: 3000,
            pause_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeedConfig {
    pub history_limit: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { history_limit: 200 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub device_id: String,
    pub local: BrokerConfig,
    pub cloud: BrokerConfig,
    pub retry: RetryConfig,
    pub thresholds: Thresholds,
    pub feed: FeedConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_id: "esp32-001".to_string(),
            local: BrokerConfig::local_default(),
            cloud: BrokerConfig::cloud_default(),
            retry: RetryConfig::default(),
            thresholds: Thresholds::default(),
            feed: FeedConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn broker(&self, role: BrokerRole) -> &BrokerConfig {
        match role {
            BrokerRole::Local => &self.local,
            BrokerRole::Cloud => &self.cloud,
        }
    }
}

pub fn load_config() -> Result<AppConfig> {
    // 加载 .env 文件
    dotenv().ok();

    let environment = env::var("ENV").unwrap_or_else(|_| "development".to_string());
    let settings = Config::builder()
        // 内置默认值，文件与环境变量只需覆盖部分字段
        .add_source(builtin_defaults()?)
        // 添加默认配置文件
        .add_source(File::with_name("config/default").required(false))
        // 添加环境特定配置文件
        .add_source(File::with_name(&format!("config/{}", environment)).required(false))
        // 添加环境变量，APP_ 前缀，嵌套字段用 __ 分隔（APP_LOCAL__HOST）
        .add_source(app_environment())
        .build()
        .context("failed to assemble configuration sources")?;

    finish(settings)
}

/// 从指定文件加载配置（环境变量仍可覆盖）
pub fn load_config_from(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    let settings = Config::builder()
        .add_source(builtin_defaults()?)
        .add_source(File::from(path))
        .add_source(app_environment())
        .build()
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;

    finish(settings)
}

fn builtin_defaults() -> Result<Config> {
    Config::try_from(&AppConfig::default()).context("failed to encode built-in configuration defaults")
}

fn app_environment() -> Environment {
    Environment::with_prefix("APP")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn finish(settings: Config) -> Result<AppConfig> {
    // 构建配置
    let config: AppConfig = settings
        .try_deserialize()
        .context("configuration does not match the expected layout")?;

    // 验证必要配置
    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.device_id.trim().is_empty() {
        return Err(anyhow::anyhow!("Device ID cannot be empty"));
    }

    if config.device_id.contains(['#', '+', '/']) {
        return Err(anyhow::anyhow!(
            "Device ID {:?} must not contain '#', '+' or '/'",
            config.device_id
        ));
    }

    for role in BrokerRole::ALL {
        let broker = config.broker(role);
        if broker.host.trim().is_empty() {
            return Err(anyhow::anyhow!("{} broker host cannot be empty", role));
        }
        if broker.port == 0 {
            return Err(anyhow::anyhow!("{} broker port cannot be zero", role));
        }
    }

    if config.retry.max_attempts == 0 {
        return Err(anyhow::anyhow!("Retry max_attempts must be at least 1"));
    }

    Ok(())
}
