// 双 broker MQTT 连接管理
pub mod connection;
pub mod link;
pub mod manager;
pub mod retry;
pub mod subscriptions;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::BrokerConnection;
pub use link::{BrokerLink, Connector, LinkError, LinkEvent, LinkEventSink, RumqttConnector};
pub use manager::{DualBrokerManager, ManagerEvent, MqttManagerHandle};
pub use retry::{RetrySchedule, RetryStep};
pub use subscriptions::{MessageCallback, SubscriptionId, SubscriptionRegistry};
