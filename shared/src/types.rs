use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::mqtt::MqttError;

// Broker 角色：本地 broker 与云端备用 broker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum BrokerRole {
    Local,
    Cloud,
}

impl BrokerRole {
    /// 按连接优先级排列（先本地，后云端）
    pub const ALL: [BrokerRole; 2] = [BrokerRole::Local, BrokerRole::Cloud];

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerRole::Local => "local",
            BrokerRole::Cloud => "cloud",
        }
    }

    pub fn other(self) -> Self {
        match self {
            BrokerRole::Local => BrokerRole::Cloud,
            BrokerRole::Cloud => BrokerRole::Local,
        }
    }
}

impl fmt::Display for BrokerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// 单条物理连接的状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

// 两条连接的聚合状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub local: ConnectionState,
    pub cloud: ConnectionState,
}

impl ConnectionStatus {
    pub fn new(local: ConnectionState, cloud: ConnectionState) -> Self {
        Self { local, cloud }
    }

    pub fn state(&self, role: BrokerRole) -> ConnectionState {
        match role {
            BrokerRole::Local => self.local,
            BrokerRole::Cloud => self.cloud,
        }
    }

    /// 任意一条连接处于 Connected 即视为已连接
    pub fn is_connected(&self) -> bool {
        self.local == ConnectionState::Connected || self.cloud == ConnectionState::Connected
    }

    /// 本地优先
    pub fn connection_type(&self) -> Option<BrokerRole> {
        BrokerRole::ALL
            .into_iter()
            .find(|role| self.state(*role) == ConnectionState::Connected)
    }
}

// 可下发给设备的命令类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Light,
    Fan,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Light => "light",
            CommandKind::Fan => "fan",
        }
    }
}

impl FromStr for CommandKind {
    type Err = MqttError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(CommandKind::Light),
            "fan" => Ok(CommandKind::Fan),
            other => Err(MqttError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
