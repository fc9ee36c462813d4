use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::types::BrokerRole;
use crate::utils::{iso_timestamp, now_utc};

/// 主题模板中的设备 ID 占位符
pub const DEVICE_ID_PLACEHOLDER: &str = "{device_id}";

// 设备主题模板（与设备端约定的线上协议）
pub mod templates {
    pub const TELEMETRY: &str = "state/telemetry/{device_id}";
    pub const ALL_TELEMETRY: &str = "state/telemetry/#";
    pub const COMMAND_LIGHT: &str = "command/{device_id}/light";
    pub const COMMAND_FAN: &str = "command/{device_id}/fan";
    pub const ALL_COMMANDS: &str = "command/#";
    pub const RESULT: &str = "result/{device_id}";
    pub const ALL_RESULTS: &str = "result/#";
    pub const ALERT: &str = "alert/{device_id}";
    pub const ALL_ALERTS: &str = "alert/#";
    pub const EVERYTHING: &str = "#";
}

/// 用具体设备 ID 替换模板占位符
pub fn render_topic(template: &str, device_id: &str) -> String {
    template.replace(DEVICE_ID_PLACEHOLDER, device_id)
}

// 主题分类，决定消息进入哪个列表以及通知规则
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TopicClass {
    Telemetry,
    Command,
    Result,
    Alert,
}

impl TopicClass {
    /// 按主题前缀分类，适用于通配符订阅收到的任意主题
    pub fn classify(topic: &str) -> Option<Self> {
        let mut levels = topic.split('/');
        match (levels.next(), levels.next()) {
            (Some("state"), Some("telemetry")) => Some(TopicClass::Telemetry),
            (Some("command"), Some(_)) => Some(TopicClass::Command),
            (Some("result"), Some(_)) => Some(TopicClass::Result),
            (Some("alert"), Some(_)) => Some(TopicClass::Alert),
            _ => None,
        }
    }
}

// 设备相关主题
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MqttTopic {
    Telemetry(String),    // state/telemetry/{device_id}
    CommandLight(String), // command/{device_id}/light
    CommandFan(String),   // command/{device_id}/fan
    Result(String),       // result/{device_id}
    Alert(String),        // alert/{device_id}
}

impl MqttTopic {
    /// 某个设备需要关注的全部主题
    pub fn for_device(device_id: &str) -> [MqttTopic; 5] {
        [
            MqttTopic::Telemetry(device_id.to_string()),
            MqttTopic::CommandLight(device_id.to_string()),
            MqttTopic::CommandFan(device_id.to_string()),
            MqttTopic::Result(device_id.to_string()),
            MqttTopic::Alert(device_id.to_string()),
        ]
    }

    pub fn template(&self) -> &'static str {
        match self {
            MqttTopic::Telemetry(_) => templates::TELEMETRY,
            MqttTopic::CommandLight(_) => templates::COMMAND_LIGHT,
            MqttTopic::CommandFan(_) => templates::COMMAND_FAN,
            MqttTopic::Result(_) => templates::RESULT,
            MqttTopic::Alert(_) => templates::ALERT,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            MqttTopic::Telemetry(device_id)
            | MqttTopic::CommandLight(device_id)
            | MqttTopic::CommandFan(device_id)
            | MqttTopic::Result(device_id)
            | MqttTopic::Alert(device_id) => device_id,
        }
    }

    pub fn class(&self) -> TopicClass {
        match self {
            MqttTopic::Telemetry(_) => TopicClass::Telemetry,
            MqttTopic::CommandLight(_) | MqttTopic::CommandFan(_) => TopicClass::Command,
            MqttTopic::Result(_) => TopicClass::Result,
            MqttTopic::Alert(_) => TopicClass::Alert,
        }
    }

    /// 从主题字符串解析
    pub fn from_string(topic: &str) -> Option<Self> {
        let parts: Vec<&str> = topic.split('/').collect();

        let parsed = match parts.as_slice() {
            ["state", "telemetry", device_id] => Some(MqttTopic::Telemetry(device_id.to_string())),
            ["command", device_id, "light"] => Some(MqttTopic::CommandLight(device_id.to_string())),
            ["command", device_id, "fan"] => Some(MqttTopic::CommandFan(device_id.to_string())),
            ["result", device_id] => Some(MqttTopic::Result(device_id.to_string())),
            ["alert", device_id] => Some(MqttTopic::Alert(device_id.to_string())),
            _ => None,
        };

        parsed.filter(|topic| !topic.device_id().is_empty())
    }
}

impl fmt::Display for MqttTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_topic(self.template(), self.device_id()))
    }
}

// 主题过滤器，支持 `+`（单层）与 `#`（末尾多层）通配符
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    topic_pattern: String,
}

impl TopicFilter {
    pub fn new(topic_pattern: impl Into<String>) -> Result<Self, MqttError> {
        let topic_pattern = topic_pattern.into();
        validate_filter(&topic_pattern)?;
        Ok(Self { topic_pattern })
    }

    pub fn as_str(&self) -> &str {
        &self.topic_pattern
    }

    pub fn has_wildcards(&self) -> bool {
        self.topic_pattern.split('/').any(|level| level == "+" || level == "#")
    }

    /// `+` 恰好匹配一层，`#` 匹配末尾的一层或多层
    pub fn matches(&self, topic: &str) -> bool {
        // `$` 开头的系统主题不参与首层通配
        if topic.starts_with('$') && self.topic_pattern.starts_with(['+', '#']) {
            return false;
        }

        let mut pattern = self.topic_pattern.split('/');
        let mut levels = topic.split('/');

        loop {
            match (pattern.next(), levels.next()) {
                (Some("#"), Some(_)) => return true,
                (Some("+"), Some(_)) => continue,
                (Some(expected), Some(level)) if expected == level => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }

    pub fn everything() -> Self {
        Self { topic_pattern: templates::EVERYTHING.to_string() }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.topic_pattern)
    }
}

fn validate_filter(pattern: &str) -> Result<(), MqttError> {
    if pattern.is_empty() {
        return Err(MqttError::InvalidTopic("topic filter cannot be empty".to_string()));
    }
    if pattern.contains('\0') {
        return Err(MqttError::InvalidTopic(format!("{:?} contains a NUL character", pattern)));
    }

    let levels: Vec<&str> = pattern.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != levels.len() - 1) {
            return Err(MqttError::InvalidTopic(format!(
                "{}: '#' must occupy the whole last level",
                pattern
            )));
        }
        if level.contains('+') && *level != "+" {
            return Err(MqttError::InvalidTopic(format!(
                "{}: '+' must occupy a whole level",
                pattern
            )));
        }
    }

    Ok(())
}

/// 发布用主题不允许包含通配符
pub fn validate_publish_topic(topic: &str) -> Result<(), MqttError> {
    if topic.is_empty() || topic.contains(['+', '#', '\0']) {
        return Err(MqttError::InvalidTopic(format!("{:?} is not a valid publish topic", topic)));
    }
    Ok(())
}

/// 非 JSON 消息的标题
pub const INFO_TITLE: &str = "Nuevo mensaje";

// 无法解析为 JSON 时的纯文本包装
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub body: String,
    pub timestamp: String,
}

impl InfoPayload {
    pub fn wrap(text: impl Into<String>, at: &DateTime<Utc>) -> Self {
        Self {
            kind: "info".to_string(),
            title: INFO_TITLE.to_string(),
            body: text.into(),
            timestamp: iso_timestamp(at),
        }
    }
}

// 入站消息负载
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    Structured(Value),
    Info(InfoPayload),
}

impl MessagePayload {
    /// 优先解析 JSON；失败时降级为 info 文本，从不丢弃
    pub fn parse(raw: &[u8], received_at: &DateTime<Utc>) -> Self {
        let text = String::from_utf8_lossy(raw);
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => MessagePayload::Structured(value),
            Err(e) => {
                tracing::debug!("Payload is not JSON ({}), wrapping as info message", e);
                MessagePayload::Info(InfoPayload::wrap(text.into_owned(), received_at))
            }
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, MessagePayload::Structured(_))
    }

    pub fn to_value(&self) -> Value {
        match self {
            MessagePayload::Structured(value) => value.clone(),
            MessagePayload::Info(info) => serde_json::json!({
                "type": info.kind,
                "title": info.title,
                "body": info.body,
                "timestamp": info.timestamp,
            }),
        }
    }
}

// 入站消息（瞬态，由回调消费，核心不保留）
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: MessagePayload,
    pub source: BrokerRole,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, raw: &[u8], source: BrokerRole) -> Self {
        let received_at = now_utc();
        Self {
            topic: topic.into(),
            payload: MessagePayload::parse(raw, &received_at),
            source,
            received_at,
        }
    }

    pub fn class(&self) -> Option<TopicClass> {
        TopicClass::classify(&self.topic)
    }
}

// 下发命令的负载：{"value": ...}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub value: Value,
}

/// 将出站消息序列化为 JSON 字节
pub fn encode_payload<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, MqttError> {
    Ok(serde_json::to_vec(message)?)
}

// MQTT 错误类型
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown command type: {0}")]
    UnknownCommand(String),

    #[error("MQTT manager is not running")]
    ManagerStopped,
}

// 连接错误：握手失败或超时，触发备用 broker 与有限重试
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("{role} broker did not acknowledge the connection within {timeout:?}")]
    Timeout { role: BrokerRole, timeout: Duration },

    #[error("{role} broker handshake failed: {reason}")]
    Handshake { role: BrokerRole, reason: String },

    #[error("{role} connection attempt was cancelled")]
    Cancelled { role: BrokerRole },

    #[error("Unable to reach either the local or the cloud broker")]
    AllBrokersUnreachable,

    #[error("MQTT manager is not running")]
    ManagerStopped,
}
