pub mod types;
pub mod config;
pub mod utils;
pub mod mqtt;
pub mod notification;

// 重新导出常用内容，方便服务 crate 直接 use notifs_shared::Xxx
pub use crate::types::*;
pub use crate::config::*;
pub use crate::utils::*;
pub use crate::mqtt::*;
pub use crate::notification::*;
