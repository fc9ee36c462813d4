use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

// 时间工具函数
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// ISO-8601，毫秒精度，UTC 以 `Z` 结尾（例如 `2024-05-01T12:30:00.000Z`）
pub fn iso_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// 客户端 ID：前缀 + 8 位随机十六进制
pub fn generate_client_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}{}", prefix, &suffix[..8])
}

// 字符串工具函数
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }

    let keep = max_len.saturating_sub(3);
    let truncated: String = s.chars().take(keep).collect();
    format!("{}...", truncated)
}
