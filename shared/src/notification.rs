use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::mqtt::TopicClass;

pub const TELEMETRY_TITLE: &str = "⚠️ Alerta de Telemetría";
pub const FACE_DETECTION_TITLE: &str = "👥 Detección de Personas";
pub const DEVICE_ALERT_TITLE: &str = "🚨 Alerta de Dispositivo";
pub const CONNECTION_LOST_TITLE: &str = "Error de conexión";
pub const CONNECTION_LOST_BODY: &str = "No se pudo establecer conexión con el servidor MQTT";

// 缺失字段在通知正文中的占位
const MISSING: &str = "-";

// 遥测告警阈值（严格大于才触发）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    pub temperature: f64,
    pub humidity: f64,
    pub light: f64,
    pub sound: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            temperature: 30.0,
            humidity: 80.0,
            light: 1000.0,
            sound: 80.0,
        }
    }
}

// 面向用户的本地通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationDecision {
    Suppress,
    Notify(Notification),
}

impl NotificationDecision {
    pub fn into_notification(self) -> Option<Notification> {
        match self {
            NotificationDecision::Suppress => None,
            NotificationDecision::Notify(notification) => Some(notification),
        }
    }
}

/// 将入站负载转换为通知决策的纯函数集合
#[derive(Debug, Clone, Default)]
pub struct NotificationPolicy {
    thresholds: Thresholds,
}

impl NotificationPolicy {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn evaluate(&self, device_id: &str, class: TopicClass, payload: &Value) -> NotificationDecision {
        match class {
            TopicClass::Telemetry => self.telemetry(device_id, payload),
            TopicClass::Result => face_detection(device_id, payload),
            TopicClass::Alert => device_alert(device_id, payload),
            TopicClass::Command => NotificationDecision::Suppress,
        }
    }

    fn telemetry(&self, device_id: &str, payload: &Value) -> NotificationDecision {
        let limits = [
            ("temperature", self.thresholds.temperature),
            ("humidity", self.thresholds.humidity),
            ("light", self.thresholds.light),
            ("sound", self.thresholds.sound),
        ];
        let exceeded = limits
            .iter()
            .any(|(field, limit)| numeric_field(payload, field).is_some_and(|value| value > *limit));
        if !exceeded {
            return NotificationDecision::Suppress;
        }

        let body = format!(
            "Dispositivo {}: Temperatura: {}°C, Humedad: {}%, Luz: {}lx, Sonido: {}dB",
            device_id,
            display_field(payload, "temperature"),
            display_field(payload, "humidity"),
            display_field(payload, "light"),
            display_field(payload, "sound"),
        );

        NotificationDecision::Notify(Notification {
            title: TELEMETRY_TITLE.to_string(),
            body,
            data: notification_data("telemetry", device_id, payload),
        })
    }
}

fn face_detection(device_id: &str, payload: &Value) -> NotificationDecision {
    if !numeric_field(payload, "faces").is_some_and(|faces| faces > 0.0) {
        return NotificationDecision::Suppress;
    }

    let body = format!(
        "Dispositivo {}: {} persona(s) detectada(s) con {}% de confianza",
        device_id,
        display_field(payload, "faces"),
        display_field(payload, "confidence"),
    );

    NotificationDecision::Notify(Notification {
        title: FACE_DETECTION_TITLE.to_string(),
        body,
        data: notification_data("face_detection", device_id, payload),
    })
}

fn device_alert(device_id: &str, payload: &Value) -> NotificationDecision {
    // info 包装的非 JSON 告警没有 message，退回到 body
    let message = ["message", "body"]
        .iter()
        .find_map(|field| payload.get(*field).map(display_value))
        .unwrap_or_else(|| display_value(payload));

    NotificationDecision::Notify(Notification {
        title: DEVICE_ALERT_TITLE.to_string(),
        body: format!("Dispositivo {}: {}", device_id, message),
        data: notification_data("device_alert", device_id, payload),
    })
}

/// 两个 broker 都无法连接时的一次性提示
pub fn connection_lost_notification() -> Notification {
    Notification {
        title: CONNECTION_LOST_TITLE.to_string(),
        body: CONNECTION_LOST_BODY.to_string(),
        data: serde_json::json!({ "type": "connection_error" }),
    }
}

// {type, deviceId} 之上叠加负载字段，同名时负载优先
fn notification_data(kind: &str, device_id: &str, payload: &Value) -> Value {
    let mut data = Map::new();
    data.insert("type".to_string(), Value::String(kind.to_string()));
    data.insert("deviceId".to_string(), Value::String(device_id.to_string()));

    match payload {
        Value::Object(fields) => {
            for (key, value) in fields {
                data.insert(key.clone(), value.clone());
            }
        }
        Value::Null => {}
        other => {
            data.insert("value".to_string(), other.clone());
        }
    }

    Value::Object(data)
}

// 数值或数字字符串
fn numeric_field(payload: &Value, field: &str) -> Option<f64> {
    match payload.get(field)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn display_field(payload: &Value, field: &str) -> String {
    payload
        .get(field)
        .map(display_value)
        .unwrap_or_else(|| MISSING.to_string())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => MISSING.to_string(),
        // 整数值的浮点数不带小数部分（35.0 -> 35）
        Value::Number(number) => match number.as_f64() {
            Some(float) if number.is_f64() && float.fract() == 0.0 && float.abs() < 1e15 => {
                format!("{}", float as i64)
            }
            _ => number.to_string(),
        },
        other => other.to_string(),
    }
}
