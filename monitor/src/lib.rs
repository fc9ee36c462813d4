pub mod feed;
pub mod mqtt;
pub mod notifier;

pub use feed::{DeviceFeed, FeedEntry, FeedMessages, FeedSnapshot};
pub use mqtt::{
    BrokerLink, Connector, DualBrokerManager, ManagerEvent, MqttManagerHandle, RumqttConnector,
    SubscriptionId,
};
pub use notifier::{Notifier, TracingNotifier};
